use tokio::time::Instant;

/// Monotonic time source for the event loop.
///
/// All deadlines in the receiver are expressed as [Instant]s or as whole
///  milliseconds since the clock's epoch; wall-clock time never enters the
///  core. Using `tokio::time::Instant` means tests started with a paused
///  runtime can drive every timer deterministically.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Milliseconds since the clock was created. Monotonic; starts near zero,
    ///  so a value of 0 can safely mean "never" in per-connection bookkeeping.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_now_ms_advances_with_tokio_time() {
        let clock = Clock::new();
        assert_eq!(clock.now_ms(), 0);

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now_ms(), 250);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(clock.now_ms(), 2250);
    }
}
