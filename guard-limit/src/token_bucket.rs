use std::fmt;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;

use super::Reason;
use super::Strategy;
use super::nanos;

/// A token bucket that refills `quantum` tokens every `fill_interval`, up to `capacity`.
///
/// Refill is computed from the clock on every call, in whole ticks since the bucket was
/// created, so an idle bucket saturates at `capacity` and never beyond it.
pub struct TokenBucket {
    clock: Clock,
    anchor: Instant,
    fill_interval: u64,
    capacity: usize,
    quantum: usize,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    available: usize,
    latest_tick: u64,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("fill_interval", &Duration::from_nanos(self.fill_interval))
            .field("capacity", &self.capacity)
            .field("quantum", &self.quantum)
            .finish_non_exhaustive()
    }
}

impl Strategy for TokenBucket {
    fn process(&self) -> ControlFlow<Reason> {
        let retry_after = self.take(1);
        if retry_after.is_zero() {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(Reason::Overloaded { retry_after })
        }
    }
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// # Arguments
    ///
    /// * `fill_interval` - How often `quantum` tokens are added. Clamped to at least 1ns.
    /// * `capacity` - The maximum number of tokens the bucket holds.
    /// * `quantum` - Tokens added per interval.
    pub fn new(fill_interval: Duration, capacity: NonZeroUsize, quantum: NonZeroUsize) -> Self {
        Self::with_clock(Clock::new(), fill_interval, capacity, quantum)
    }

    /// Creates a full bucket which reads time from `clock`.
    pub fn with_clock(
        clock: Clock,
        fill_interval: Duration,
        capacity: NonZeroUsize,
        quantum: NonZeroUsize,
    ) -> Self {
        let anchor = clock.now();
        Self {
            clock,
            anchor,
            fill_interval: nanos(fill_interval).max(1),
            capacity: capacity.get(),
            quantum: quantum.get(),
            state: Mutex::new(State {
                available: capacity.get(),
                latest_tick: 0,
            }),
        }
    }

    /// Takes `count` tokens if they are available.
    ///
    /// Returns `Duration::ZERO` when the tokens were taken. Otherwise nothing is taken and
    /// the returned duration is how long until `count` tokens will be available. A request
    /// for more than `capacity` tokens can never succeed and returns `Duration::MAX`.
    pub fn take(&self, count: usize) -> Duration {
        if count == 0 {
            return Duration::ZERO;
        }
        if count > self.capacity {
            return Duration::MAX;
        }

        let now = self.elapsed();
        let tick = now / self.fill_interval;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.adjust(&mut state, tick);

        if state.available >= count {
            state.available -= count;
            return Duration::ZERO;
        }

        let missing = count - state.available;
        let ticks = missing.div_ceil(self.quantum) as u64;
        let ready_at = state
            .latest_tick
            .saturating_add(ticks)
            .saturating_mul(self.fill_interval);
        Duration::from_nanos(ready_at.saturating_sub(now).max(1))
    }

    /// Tokens currently available, after applying any pending refill.
    pub fn available(&self) -> usize {
        let tick = self.elapsed() / self.fill_interval;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.adjust(&mut state, tick);
        state.available
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn elapsed(&self) -> u64 {
        nanos(self.clock.now().saturating_duration_since(self.anchor))
    }

    fn adjust(&self, state: &mut State, tick: u64) {
        if tick <= state.latest_tick {
            return;
        }
        if state.available < self.capacity {
            let ticks = usize::try_from(tick - state.latest_tick).unwrap_or(usize::MAX);
            let added = ticks.saturating_mul(self.quantum);
            state.available = state.available.saturating_add(added).min(self.capacity);
        }
        state.latest_tick = tick;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use more_asserts::assert_gt;
    use more_asserts::assert_le;

    use super::*;

    fn bucket(capacity: usize, quantum: usize) -> (TokenBucket, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let bucket = TokenBucket::with_clock(
            clock,
            Duration::from_millis(100),
            NonZeroUsize::new(capacity).unwrap(),
            NonZeroUsize::new(quantum).unwrap(),
        );
        (bucket, mock)
    }

    #[test]
    fn it_enforces_limits_starting_full() {
        let (rl, mock) = bucket(2, 1);

        // 1. Should be able to burst up to capacity immediately
        assert_eq!(rl.process(), ControlFlow::Continue(()));
        assert_eq!(rl.process(), ControlFlow::Continue(()));

        // 2. Third request should fail (exhausted)
        assert!(matches!(rl.process(), ControlFlow::Break(..)));

        // 3. Wait for one refill interval
        mock.increment(Duration::from_millis(100));

        // 4. Should have 1 new token
        assert_eq!(rl.process(), ControlFlow::Continue(()));
        assert!(matches!(rl.process(), ControlFlow::Break(..)));
    }

    #[test]
    fn drain_yields_positive_waits_after_capacity() {
        let (rl, _mock) = bucket(5, 1);

        for _ in 0..5 {
            assert_eq!(rl.take(1), Duration::ZERO);
        }
        for _ in 0..5 {
            let wait = rl.take(1);
            assert_gt!(wait, Duration::ZERO);
            assert_le!(wait, Duration::from_millis(100));
        }
        assert_eq!(rl.available(), 0);
    }

    #[test]
    fn idle_bucket_saturates_at_capacity() {
        let (rl, mock) = bucket(3, 2);

        for _ in 0..3 {
            assert_eq!(rl.take(1), Duration::ZERO);
        }

        mock.increment(Duration::from_secs(10));

        assert_eq!(rl.available(), 3);
        assert_eq!(rl.take(1), Duration::ZERO);
        assert_eq!(rl.available(), 2);
    }

    #[test]
    fn wait_accounts_for_partial_interval() {
        let (rl, mock) = bucket(1, 1);

        assert_eq!(rl.take(1), Duration::ZERO);
        mock.increment(Duration::from_millis(30));

        // Token arrives at the 100ms tick, 70ms from now.
        assert_eq!(rl.take(1), Duration::from_millis(70));

        mock.increment(Duration::from_millis(70));
        assert_eq!(rl.take(1), Duration::ZERO);
    }

    #[test]
    fn multi_token_wait_spans_several_ticks() {
        let (rl, _mock) = bucket(4, 1);

        assert_eq!(rl.take(4), Duration::ZERO);
        assert_eq!(rl.take(3), Duration::from_millis(300));
        // Nothing was debited by the failed take.
        assert_eq!(rl.available(), 0);
        assert_eq!(rl.take(5), Duration::MAX);
        assert_eq!(rl.take(0), Duration::ZERO);
    }

    #[test]
    fn quantum_refills_several_tokens_per_tick() {
        let (rl, mock) = bucket(10, 4);

        assert_eq!(rl.take(10), Duration::ZERO);
        mock.increment(Duration::from_millis(100));
        assert_eq!(rl.available(), 4);
        mock.increment(Duration::from_millis(250));
        assert_eq!(rl.available(), 10);
    }

    #[tokio::test]
    async fn test_actual_concurrency() {
        let capacity = 100;
        let rl = Arc::new(TokenBucket::new(
            Duration::from_secs(60),
            NonZeroUsize::new(capacity).unwrap(),
            NonZeroUsize::new(1).unwrap(),
        ));

        let mut handles = vec![];
        for _ in 0..capacity + 10 {
            let rl_clone = Arc::clone(&rl);
            handles.push(tokio::spawn(async move { rl_clone.process() }));
        }

        let results = futures::future::join_all(handles).await;
        let success_count = results
            .into_iter()
            .filter(|r| matches!(r, Ok(ControlFlow::Continue(()))))
            .count();

        assert_eq!(success_count, capacity);
    }
}
