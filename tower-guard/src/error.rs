use std::time::Duration;

use crate::context::ContextError;
use crate::status::Code;

/// Conditions raised by the middleware stages themselves.
///
/// Every variant converts into a [`Status`](crate::Status) which keeps it as its cause, so
/// callers can tell a throttled call from a rate limited one even though both surface as
/// `ResourceExhausted`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GuardError {
    /// The call context handed to a stage was cancelled or passed its deadline.
    #[error(transparent)]
    Context(ContextError),

    /// A single retry attempt ran out of its per-attempt timeout.
    ///
    /// The retry stage absorbs this and moves on to the next attempt; callers only see it
    /// when it was the last attempt.
    #[error("retry attempt deadline exceeded")]
    AttemptDeadlineExceeded,

    /// The request was rejected due to rate limiting.
    #[error("rate limited")]
    RateLimited {
        /// The duration to wait before retrying.
        retry_after: Duration,
    },

    /// The throttle refused the call.
    #[error(transparent)]
    Throttled(ThrottleReason),

    /// The handler panicked. The string is the panic payload.
    #[error("panic error: {0}")]
    Panicked(String),
}

/// Why the throttle refused a call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThrottleReason {
    /// The call waited in the backlog longer than the backlog timeout.
    #[error("concurrent call limit exceeded")]
    BacklogTimeout,

    /// The call context ended while the call was queued.
    #[error("{0} while queued")]
    Context(ContextError),
}

impl ThrottleReason {
    pub(crate) fn code(&self) -> Code {
        match self {
            ThrottleReason::BacklogTimeout => Code::ResourceExhausted,
            ThrottleReason::Context(ContextError::Cancelled) => Code::Cancelled,
            ThrottleReason::Context(ContextError::DeadlineExceeded) => Code::DeadlineExceeded,
        }
    }
}

/// Invalid construction-time configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A count or interval that must be positive was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{0} is too large")]
    TooLarge(&'static str),

    #[error("error reporting DSN is empty")]
    EmptyDsn,

    #[error("histogram buckets must be non-empty and strictly increasing")]
    Buckets,

    #[error("{0:?} cannot prefix metric names")]
    MetricName(String),
}
