use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::debug;

use crate::context::CallContext;
use crate::error::ConfigError;
use crate::error::GuardError;
use crate::error::ThrottleReason;
use crate::interceptor::Interceptor;
use crate::interceptor::Request;
use crate::service::Next;
use crate::status::Status;

/// Bounds the number of calls in flight.
///
/// At most `limit` calls run at once. Up to `backlog_limit` more may wait for a slot, each
/// for at most `backlog_timeout`. Anything beyond that is refused.
#[derive(Debug, Clone)]
pub struct Throttle {
    active: Arc<Semaphore>,
    backlog: Arc<Semaphore>,
    limit: usize,
    backlog_limit: usize,
    backlog_timeout: Duration,
    rejected: Counter<u64>,
}

/// The slots held by an admitted call. Dropping it frees both.
#[derive(Debug)]
pub struct Admission {
    _active: OwnedSemaphorePermit,
    _backlog: OwnedSemaphorePermit,
}

impl Throttle {
    pub fn new(
        limit: usize,
        backlog_limit: usize,
        backlog_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::Zero("throttle limit"));
        }
        let total = limit
            .checked_add(backlog_limit)
            .filter(|total| *total <= Semaphore::MAX_PERMITS)
            .ok_or(ConfigError::TooLarge("throttle backlog"))?;
        let meter = global::meter("tower_guard");
        Ok(Self {
            active: Arc::new(Semaphore::new(limit)),
            backlog: Arc::new(Semaphore::new(total)),
            limit,
            backlog_limit,
            backlog_timeout,
            rejected: meter.u64_counter("throttle.rejected").build(),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn backlog_limit(&self) -> usize {
        self.backlog_limit
    }

    /// Free execution slots.
    pub fn available(&self) -> usize {
        self.active.available_permits()
    }

    /// Free slots across execution and backlog.
    pub fn backlog_available(&self) -> usize {
        self.backlog.available_permits()
    }

    /// Waits for an execution slot on behalf of the call `ctx`.
    pub async fn acquire(&self, ctx: &CallContext) -> Result<Admission, ThrottleReason> {
        let backlog = tokio::select! {
            biased;
            err = ctx.done() => return Err(self.reject(ThrottleReason::Context(err))),
            permit = Arc::clone(&self.backlog).acquire_owned() => permit,
        };
        // The semaphores are never closed.
        let Ok(backlog) = backlog else {
            return Err(self.reject(ThrottleReason::BacklogTimeout));
        };

        let active = tokio::select! {
            biased;
            err = ctx.done() => return Err(self.reject(ThrottleReason::Context(err))),
            permit = Arc::clone(&self.active).acquire_owned() => permit,
            _ = sleep(self.backlog_timeout) => {
                return Err(self.reject(ThrottleReason::BacklogTimeout));
            }
        };
        let Ok(active) = active else {
            return Err(self.reject(ThrottleReason::BacklogTimeout));
        };

        Ok(Admission {
            _active: active,
            _backlog: backlog,
        })
    }

    fn reject(&self, reason: ThrottleReason) -> ThrottleReason {
        let kind = match &reason {
            ThrottleReason::BacklogTimeout => "backlog_timeout",
            ThrottleReason::Context(_) => "context",
        };
        self.rejected.add(1, &[KeyValue::new("reason", kind)]);
        reason
    }
}

impl<T, U> Interceptor<T, U> for Throttle
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn intercept(
        self: Arc<Self>,
        request: Request<T>,
        next: Next<T, U>,
    ) -> BoxFuture<'static, Result<U, Status>> {
        Box::pin(async move {
            let admission = match self.acquire(request.ctx()).await {
                Ok(admission) => admission,
                Err(reason) => {
                    debug!(method = %request.info().method(), %reason, "call throttled");
                    return Err(GuardError::Throttled(reason).into());
                }
            };
            let response = next.run(request).await;
            drop(admission);
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextError;

    #[test]
    fn zero_limit_is_rejected() {
        assert!(matches!(
            Throttle::new(0, 4, Duration::from_secs(1)),
            Err(ConfigError::Zero(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn admissions_hold_both_slots() {
        let throttle = Throttle::new(1, 1, Duration::from_millis(50)).unwrap();
        let ctx = CallContext::new();

        let first = throttle.acquire(&ctx).await.unwrap();
        assert_eq!(throttle.available(), 0);
        assert_eq!(throttle.backlog_available(), 1);

        // The second caller takes the backlog slot and times out there.
        let err = throttle.acquire(&ctx).await.unwrap_err();
        assert_eq!(err, ThrottleReason::BacklogTimeout);
        assert_eq!(throttle.backlog_available(), 1);

        drop(first);
        assert_eq!(throttle.available(), 1);
        assert_eq!(throttle.backlog_available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_context_fails_without_a_slot() {
        let throttle = Throttle::new(1, 0, Duration::from_secs(1)).unwrap();
        let _held = throttle.acquire(&CallContext::new()).await.unwrap();

        let ctx = CallContext::new();
        ctx.cancel();
        let err = throttle.acquire(&ctx).await.unwrap_err();
        assert_eq!(err, ThrottleReason::Context(ContextError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_call_sees_its_deadline() {
        let throttle = Throttle::new(1, 1, Duration::from_secs(10)).unwrap();
        let _held = throttle.acquire(&CallContext::new()).await.unwrap();

        let ctx = CallContext::new().with_timeout(Duration::from_millis(20));
        let err = throttle.acquire(&ctx).await.unwrap_err();
        assert_eq!(err, ThrottleReason::Context(ContextError::DeadlineExceeded));
        assert_eq!(throttle.backlog_available(), 1);
    }
}
