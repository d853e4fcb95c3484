use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use guard_limit::FixedWindow;
use guard_limit::Reason;
use guard_limit::Strategy;
use guard_limit::TokenBucket;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tokio::time::sleep;
use tracing::debug;

use crate::context::CallContext;
use crate::error::GuardError;
use crate::interceptor::Interceptor;
use crate::interceptor::Request;
use crate::service::Next;
use crate::status::Status;

#[derive(Clone, Debug)]
struct RateLimitMetrics {
    delayed: Counter<u64>,
    rejected: Counter<u64>,
    strategy: [KeyValue; 1],
}

/// Server-side admission by rate.
///
/// Each call asks the strategy for one permit. Strategies that wait (the token bucket)
/// delay the call until a permit is due, racing that delay against the call context.
/// Strategies that don't (the fixed window) refuse it with `ResourceExhausted`.
///
/// Strategies read a [`quanta::Clock`] while the delay sleeps on tokio's timer. When tokio
/// time is paused, build the strategy with a mock clock and advance both together.
#[derive(Debug, Clone)]
pub struct RateLimit {
    limiter: Arc<dyn Strategy + Send + Sync>,
    instruments: RateLimitMetrics,
}

impl RateLimit {
    pub fn new(limiter: Arc<dyn Strategy + Send + Sync>) -> Self {
        let meter = global::meter("tower_guard");
        let instruments = RateLimitMetrics {
            delayed: meter.u64_counter("rate_limit.delayed").build(),
            rejected: meter.u64_counter("rate_limit.rejected").build(),
            strategy: [KeyValue::new("strategy", format!("{limiter:?}"))],
        };
        Self {
            limiter,
            instruments,
        }
    }

    /// A token bucket holding `capacity` tokens, refilled by `quantum` every `fill_interval`.
    pub fn token_bucket(
        fill_interval: Duration,
        capacity: NonZeroUsize,
        quantum: NonZeroUsize,
    ) -> Self {
        Self::new(Arc::new(TokenBucket::new(fill_interval, capacity, quantum)))
    }

    /// At most `max_count` calls per `interval`.
    pub fn fixed_window(interval: Duration, max_count: NonZeroUsize) -> Self {
        Self::new(Arc::new(FixedWindow::new(interval, max_count)))
    }

    /// Waits until the strategy admits the call, or fails.
    pub async fn admit(&self, ctx: &CallContext, method: &str) -> Result<(), Status> {
        loop {
            let ControlFlow::Break(Reason::Overloaded { retry_after }) = self.limiter.process()
            else {
                return Ok(());
            };

            if !self.limiter.waits() {
                self.instruments
                    .rejected
                    .add(1, &self.instruments.strategy);
                debug!(%method, ?retry_after, "call rate limited");
                return Err(GuardError::RateLimited { retry_after }.into());
            }

            self.instruments
                .delayed
                .add(1, &self.instruments.strategy);
            debug!(%method, ?retry_after, "waiting for rate limit permit");
            tokio::select! {
                biased;
                err = ctx.done() => return Err(GuardError::Context(err).into()),
                _ = sleep(retry_after) => {}
            }
        }
    }
}

impl<T, U> Interceptor<T, U> for RateLimit
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
            self.admit(request.ctx(), request.info().method()).await?;
            next.run(request).await
        })
    }
}
