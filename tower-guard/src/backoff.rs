//! Backoff functions for the retry stage.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Maps a retry attempt number (starting at 1) to the delay before that attempt.
#[derive(Clone)]
pub struct Backoff(Arc<dyn Fn(u32) -> Duration + Send + Sync>);

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Backoff").finish_non_exhaustive()
    }
}

impl Default for Backoff {
    /// 50ms with ±10% jitter.
    fn default() -> Self {
        Self::uniform_random(Duration::from_millis(50), 0.10)
    }
}

impl Backoff {
    pub fn new(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        (self.0)(attempt)
    }

    /// The same delay before every attempt.
    pub fn constant(delay: Duration) -> Self {
        Self::new(move |_| delay)
    }

    /// `base` scaled by a uniformly random factor in `[1 - jitter, 1 + jitter]`.
    pub fn uniform_random(base: Duration, jitter: f64) -> Self {
        let jitter = jitter.clamp(0.0, 1.0);
        Self::new(move |_| {
            let multiplier = jitter * (rand::random::<f64>() - 0.5) * 2.0;
            Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + multiplier))
                .unwrap_or(Duration::MAX)
        })
    }

    /// `step * attempt`.
    pub fn linear(step: Duration) -> Self {
        Self::new(move |attempt| step.saturating_mul(attempt))
    }

    /// `base * 2^(attempt - 1)`, capped at `max`.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::new(move |attempt| {
            let shift = attempt.saturating_sub(1).min(31);
            base.saturating_mul(1 << shift).min(max)
        })
    }
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_ge;
    use more_asserts::assert_le;

    use super::*;

    #[test]
    fn huge_delays_saturate() {
        let jittered = Backoff::uniform_random(Duration::MAX, 1.0);
        let exponential = Backoff::exponential(Duration::MAX, Duration::MAX);
        for attempt in [1, 2, 40, u32::MAX] {
            assert_ge!(jittered.delay(attempt), Duration::ZERO);
            assert_eq!(exponential.delay(attempt), Duration::MAX);
        }
        assert_eq!(Backoff::linear(Duration::MAX).delay(u32::MAX), Duration::MAX);
    }

    #[test]
    fn uniform_random_stays_within_jitter() {
        let backoff = Backoff::uniform_random(Duration::from_millis(100), 0.10);
        for attempt in 1..200 {
            let delay = backoff.delay(attempt);
            assert_ge!(delay, Duration::from_millis(90));
            assert_le!(delay, Duration::from_millis(110));
        }
    }

    #[test]
    fn exponential_doubles_up_to_max() {
        let backoff = Backoff::exponential(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(20));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(4), Duration::from_millis(50));
        assert_eq!(backoff.delay(60), Duration::from_millis(50));
    }

    #[test]
    fn linear_and_constant() {
        assert_eq!(
            Backoff::linear(Duration::from_millis(5)).delay(3),
            Duration::from_millis(15)
        );
        assert_eq!(
            Backoff::constant(Duration::from_millis(7)).delay(9),
            Duration::from_millis(7)
        );
    }
}
