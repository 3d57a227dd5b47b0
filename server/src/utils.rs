use std::time::Instant;

/// Monotonic server clock reporting milliseconds since the server started.
///
/// Every server-side timestamp (history samples, replication deadlines,
/// render times) comes from one of these so they share an epoch.
#[derive(Debug, Clone, Copy)]
pub struct ServerClock {
    started: Instant,
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    // Current time in milliseconds
    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clock_starts_near_zero() {
        let clock = ServerClock::new();
        assert!(clock.now_ms() < 1_000);
    }

    #[test]
    fn test_clock_is_monotonic() {
        let clock = ServerClock::new();
        let first = clock.now_ms();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now_ms() >= first + 2);
    }
}
