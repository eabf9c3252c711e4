//! Retry delay computation.

use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_millis(1000);
const MAX_DELAY: Duration = Duration::from_millis(60_000);
const MULTIPLIER: u32 = 2;

/// Delay to wait before retrying a job that has failed `attempts_so_far`
/// times: `base * multiplier^(attempts_so_far - 1)`, capped at 60 seconds.
///
/// The first failure (attempts_so_far = 1) yields 1s, then 2s, 4s, 8s, and so
/// on. Growth saturates at the cap no matter how many attempts follow.
pub fn backoff(attempts_so_far: u32) -> Duration {
    let exponent = attempts_so_far.saturating_sub(1);
    let factor = MULTIPLIER.checked_pow(exponent);
    let delay = factor.and_then(|f| BASE_DELAY.checked_mul(f));
    delay.map_or(MAX_DELAY, |d| d.min(MAX_DELAY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_one_second() {
        assert_eq!(backoff(1), Duration::from_millis(1000));
        assert_eq!(backoff(2), Duration::from_millis(2000));
        assert_eq!(backoff(3), Duration::from_millis(4000));
        assert_eq!(backoff(4), Duration::from_millis(8000));
    }

    #[test]
    fn caps_at_sixty_seconds() {
        // 1000 * 2^6 = 64000 > 60000
        assert_eq!(backoff(7), Duration::from_millis(60_000));
        assert_eq!(backoff(100), Duration::from_millis(60_000));
        assert_eq!(backoff(u32::MAX), Duration::from_millis(60_000));
    }

    #[test]
    fn is_monotonic() {
        for n in 1..128 {
            assert!(backoff(n) <= backoff(n + 1), "backoff({n}) > backoff({})", n + 1);
        }
    }

    #[test]
    fn zero_attempts_behaves_like_one() {
        // Not reachable from the dispatcher, but the function is total.
        assert_eq!(backoff(0), Duration::from_millis(1000));
    }
}
