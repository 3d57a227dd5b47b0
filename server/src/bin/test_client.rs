//! Scripted UDP client for poking a running server by hand.
//!
//! Connects, wanders its character around with random inputs, fires an item
//! along +x every second and prints what comes back.

use bincode::{deserialize, serialize};
use clap::Parser;
use nalgebra::{UnitQuaternion, Vector3};
use rand::Rng;
use shared::{ActionFlags, CharacterMoveInput, Packet, PROTOCOL_VERSION};
use std::f32::consts::PI;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Seconds to keep sending inputs
    #[arg(short, long, default_value = "10")]
    duration: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);
    let server_addr = args.server.parse::<SocketAddr>()?;

    let connect = serialize(&Packet::Connect {
        client_version: PROTOCOL_VERSION,
    })?;
    println!("Sending connection request to {}", server_addr);
    socket.send_to(&connect, server_addr).await?;

    let mut buf = [0u8; 4096];
    let (len, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await??;
    let (client_id, entity_id, accepted_at) = match deserialize::<Packet>(&buf[..len])? {
        Packet::Connected {
            client_id,
            entity_id,
            server_time,
        } => (client_id, entity_id, server_time),
        other => {
            println!("Expected Connected but got: {:?}", other);
            return Ok(());
        }
    };
    println!(
        "Connected as client {} controlling entity#{} at server time {} ms",
        client_id, entity_id, accepted_at
    );

    // Timestamps are on the server clock: its time at acceptance plus our elapsed time
    let started = Instant::now();
    let server_now = || accepted_at + started.elapsed().as_millis() as u64;
    let mut rng = rand::thread_rng();
    let mut sequence = 0u32;
    let mut last_use = Instant::now();

    while started.elapsed() < Duration::from_secs(args.duration) {
        sequence += 1;
        let input = CharacterMoveInput {
            sequence,
            time: server_now(),
            movement: Vector3::new(rng.gen_range(-1.0..=1.0), 0.0, rng.gen_range(-1.0..=1.0)),
            look_rotation: UnitQuaternion::from_euler_angles(0.0, rng.gen_range(-PI..PI), 0.0),
            actions: ActionFlags {
                jump: rng.gen_bool(0.05),
                run: rng.gen_bool(0.3),
            },
        };
        socket
            .send_to(&serialize(&Packet::from_input(&input))?, server_addr)
            .await?;

        if last_use.elapsed() >= Duration::from_secs(1) {
            last_use = Instant::now();
            let use_item = Packet::UseItemInDirection {
                item: 1,
                direction: [1.0, 0.0, 0.0],
                client_time: server_now(),
            };
            socket.send_to(&serialize(&use_item)?, server_addr).await?;
        }

        while let Ok(Ok((len, _))) =
            timeout(Duration::from_millis(1), socket.recv_from(&mut buf)).await
        {
            match deserialize::<Packet>(&buf[..len]) {
                Ok(Packet::CharacterStates { server_time, states }) => {
                    println!("States at {} ms: {} characters", server_time, states.len());
                    for state in states {
                        println!(
                            "  entity#{} t={} seq={} pos={:?}",
                            state.entity_id, state.time, state.sequence, state.position
                        );
                    }
                }
                Ok(Packet::UseItemResult { item, hit_entity }) => {
                    println!("Item {} hit {:?}", item, hit_entity);
                }
                Ok(other) => println!("Unexpected packet: {:?}", other),
                Err(e) => println!("Failed to deserialize packet: {}", e),
            }
        }

        sleep(Duration::from_millis(16)).await;
    }

    socket.send_to(&serialize(&Packet::Disconnect)?, server_addr).await?;
    println!("Test client finished");

    Ok(())
}
