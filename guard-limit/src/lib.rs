//! # guard-limit
//!
//! `guard-limit` provides the admission strategies used by the `tower-guard` rate limiting
//! stage.
//!
//! ## Core Philosophy
//!
//! A strategy never blocks. It either admits the request right now or tells the caller how
//! long to wait before asking again. Whether to wait, and what to race that wait against, is
//! the caller's decision.
//!
//! ## Key Concepts
//!
//! * **Lazy Evaluation**: Tokens and windows are recalculated at the moment of the request,
//!   eliminating the need for background worker threads or timers.
//! * **Injectable Clock**: Every strategy reads time from a [`quanta::Clock`], so tests can
//!   drive it with [`quanta::Clock::mock`].
//! * **Strategy Trait**: A unified interface for different limiting algorithms.
//!
//! ## Example
//!
//! ```rust
//! use guard_limit::Strategy;
//! use guard_limit::TokenBucket;
//! use std::num::NonZeroUsize;
//! use std::time::Duration;
//!
//! let capacity = NonZeroUsize::new(100).unwrap();
//! let quantum = NonZeroUsize::new(10).unwrap();
//! let bucket = TokenBucket::new(Duration::from_millis(100), capacity, quantum);
//!
//! if bucket.process().is_continue() {
//!     // Request allowed
//! }
//! ```

use std::fmt::Debug;
use std::ops::ControlFlow;
use std::time::Duration;

mod fixed_window;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use token_bucket::TokenBucket;

/// Reasons why a request might be rejected by a strategy.
#[derive(Debug, PartialEq)]
pub enum Reason {
    Overloaded { retry_after: Duration },
}

/// The core trait for all rate-limiting algorithms.
///
/// Strategies must be `Send` and `Sync` to allow sharing across thread boundaries
/// via `Arc`.
pub trait Strategy: Debug {
    /// Attempts to admit a single request.
    ///
    /// This method never blocks.
    ///
    /// # Errors
    ///
    /// Returns `Reason` if the rate limit has been reached.
    fn process(&self) -> ControlFlow<Reason>;

    /// Whether a rejected request should wait for `retry_after` and try again,
    /// or be refused on the spot.
    fn waits(&self) -> bool {
        true
    }
}

pub(crate) fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
