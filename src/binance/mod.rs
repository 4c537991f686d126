// =============================================================================
// Binance UM-Futures gateway
// =============================================================================

pub mod client;
pub mod error;
pub mod models;

use std::time::Duration;

/// Exponential backoff for connection-level failures.
///
/// Starts at 500 ms, multiplies by 1.5 per failure, clamps at 10 s. Any
/// successful call resets it to the floor.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

const BACKOFF_FLOOR: Duration = Duration::from_millis(500);
const BACKOFF_CEILING: Duration = Duration::from_secs(10);

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: BACKOFF_FLOOR,
        }
    }

    /// Delay to wait before the next attempt; grows the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = self.current.mul_f64(1.5);
        self.current = grown.min(BACKOFF_CEILING);
        delay
    }

    /// Reset after a successful call.
    pub fn reset(&mut self) {
        self.current = BACKOFF_FLOOR;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_clamps() {
        let mut b = Backoff::new();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_millis(750));

        for _ in 0..20 {
            b.next_delay();
        }
        assert_eq!(b.current(), Duration::from_secs(10));
    }

    #[test]
    fn backoff_resets_to_floor() {
        let mut b = Backoff::new();
        for _ in 0..5 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(500));
    }
}
