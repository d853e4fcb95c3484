use std::fmt;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;

use super::Reason;
use super::Strategy;
use super::nanos;

/// A simple window-based limiter.
///
/// Admits up to `max_count` requests per `interval`. Windows are consecutive `interval`-long
/// spans starting at construction; the count resets when a request lands in a later window.
/// Decisions are synchronous: a rejected request is refused, not queued.
///
/// The window number and the count used in it share one atomic word, so a reset and an
/// admission can never interleave. Counts above `u32::MAX` per window are clamped to it.
pub struct FixedWindow {
    clock: Clock,
    capacity: u64,
    /// Low 32 bits of the window number in the high half, requests admitted in the low half.
    state: AtomicU64,
    interval: u64,
    anchor: Instant,
}

const COUNT_BITS: u32 = 32;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

fn pack(window: u64, used: u64) -> u64 {
    (window << COUNT_BITS) | (used & COUNT_MASK)
}

fn unpack(state: u64) -> (u64, u64) {
    (state >> COUNT_BITS, state & COUNT_MASK)
}

impl fmt::Debug for FixedWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedWindow")
            .field("capacity", &self.capacity)
            .field("interval", &Duration::from_nanos(self.interval))
            .finish_non_exhaustive()
    }
}

impl Strategy for FixedWindow {
    fn process(&self) -> ControlFlow<Reason> {
        let now = nanos(self.clock.now().saturating_duration_since(self.anchor));
        let window = now / self.interval;
        let tag = window & COUNT_MASK;

        let admitted = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                let (current, used) = unpack(state);
                let used = if current == tag { used } else { 0 };
                (used < self.capacity).then(|| pack(tag, used + 1))
            });

        match admitted {
            Ok(_) => ControlFlow::Continue(()),
            Err(_) => {
                let ends = window.saturating_add(1).saturating_mul(self.interval);
                ControlFlow::Break(Reason::Overloaded {
                    retry_after: Duration::from_nanos(ends.saturating_sub(now)),
                })
            }
        }
    }

    fn waits(&self) -> bool {
        false
    }
}

impl FixedWindow {
    /// Creates a new `FixedWindow` strategy.
    ///
    /// # Arguments
    ///
    /// * `interval` - The duration of the fixed time window.
    /// * `max_count` - The maximum number of requests allowed within a single window.
    pub fn new(interval: Duration, max_count: NonZeroUsize) -> Self {
        Self::with_clock(Clock::new(), interval, max_count)
    }

    /// Creates a new `FixedWindow` which reads time from `clock`.
    pub fn with_clock(clock: Clock, interval: Duration, max_count: NonZeroUsize) -> Self {
        let anchor = clock.now();
        let capacity = u64::try_from(max_count.get()).unwrap_or(u64::MAX).min(COUNT_MASK);
        Self {
            clock,
            capacity,
            state: AtomicU64::new(pack(0, 0)),
            interval: nanos(interval).max(1),
            anchor,
        }
    }

    /// Admits or refuses one request right now.
    pub fn allowed(&self) -> bool {
        self.process().is_continue()
    }
}
