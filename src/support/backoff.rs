//! Reconnect backoff
//!
//! Exponential delay with a hard cap, used between WebSocket reconnect
//! attempts when the template enables `reconnectExponentialDelay`.

use std::time::Duration;

const BACKOFF_MULTIPLIER: f64 = 2.0;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(300);

/// Delay before reconnect attempt number `retry_count` (1-based).
pub fn exponential_delay(retry_count: u32, initial: Duration) -> Duration {
    // Exponent clamped so the f64 math cannot overflow before the cap kicks in.
    let exponent = retry_count.saturating_sub(1).min(32) as i32;
    let scaled = initial.as_secs_f64() * BACKOFF_MULTIPLIER.powi(exponent);
    Duration::from_secs_f64(scaled.min(MAX_RECONNECT_DELAY.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_retry() {
        let base = Duration::from_secs(30);
        assert_eq!(exponential_delay(1, base), Duration::from_secs(30));
        assert_eq!(exponential_delay(2, base), Duration::from_secs(60));
        assert_eq!(exponential_delay(3, base), Duration::from_secs(120));
    }

    #[test]
    fn caps_at_max() {
        let base = Duration::from_secs(30);
        assert_eq!(exponential_delay(20, base), MAX_RECONNECT_DELAY);
    }
}
