use clap::Parser;
use log::{error, info};
use server::config::PredictionConfig;
use server::network::{Server, ServerMessage};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Simulation ticks per second
    #[arg(short, long, default_value = "60")]
    tick_rate: u32,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "32")]
    max_clients: usize,

    /// States kept per character
    #[arg(long, default_value_t = shared::HISTORY_CAPACITY)]
    history_capacity: usize,

    /// Milliseconds between state broadcasts
    #[arg(long, default_value_t = shared::REPLICATION_INTERVAL_MS)]
    replication_interval: u64,

    /// Milliseconds remote characters are displayed in the past
    #[arg(long, default_value_t = shared::RENDER_DELAY_MS)]
    render_delay: u64,

    /// Milliseconds an input may be stamped ahead of the server clock
    #[arg(long, default_value_t = shared::MAX_INPUT_OVERFLOW_MS)]
    max_input_overflow: u64,

    /// Milliseconds of input silence before a character is advanced idle
    #[arg(long, default_value_t = shared::MAX_INPUT_UNDERFLOW_MS)]
    max_input_underflow: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = PredictionConfig {
        history_capacity: args.history_capacity,
        replication_interval_ms: args.replication_interval,
        render_delay_ms: args.render_delay,
        max_input_overflow_ms: args.max_input_overflow,
        max_input_underflow_ms: args.max_input_underflow,
    };
    config.validate()?;

    let tick_rate = args.tick_rate.max(1);
    let tick_duration = Duration::from_secs_f64(1.0 / tick_rate as f64);
    let address = format!("{}:{}", args.host, args.port);

    info!("Starting server at {} Hz", tick_rate);
    info!(
        "History {} states, replication every {} ms, render delay {} ms",
        config.history_capacity, config.replication_interval_ms, config.render_delay_ms
    );

    let mut server = Server::new(&address, tick_duration, args.max_clients, config).await?;

    let shutdown = server.shutdown_sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            if shutdown.send(ServerMessage::Shutdown).is_err() {
                error!("Server loop already stopped");
            }
        }
    });

    server.run().await?;

    Ok(())
}
