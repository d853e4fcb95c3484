use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tokio::time::sleep;
use tracing::debug;
use tracing::warn;

use crate::backoff::Backoff;
use crate::context::CallContext;
use crate::error::GuardError;
use crate::interceptor::Interceptor;
use crate::interceptor::Request;
use crate::service::Next;
use crate::status::Code;
use crate::status::Status;

/// Metadata key carrying the retry attempt number to the server.
pub const ATTEMPT_METADATA_KEY: &str = "x-retry-attempt";

/// Codes retried when no others are configured.
pub const DEFAULT_RETRIABLE_CODES: [Code; 2] = [Code::ResourceExhausted, Code::Unavailable];

/// How a failed call is retried.
///
/// The default policy is disabled (`max == 0`). Enable it with [`with_max`](Self::with_max)
/// or per call with [`RetryOption::Max`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max: u32,
    per_call_timeout: Option<Duration>,
    include_header: bool,
    codes: Vec<Code>,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max: 0,
            per_call_timeout: None,
            include_header: true,
            codes: DEFAULT_RETRIABLE_CODES.to_vec(),
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of attempts, the first one included. `0` disables retries.
    pub fn with_max(mut self, max: u32) -> Self {
        self.max = max;
        self
    }

    /// Bound each attempt by its own timeout, on top of the call's deadline.
    pub fn with_per_call_timeout(mut self, timeout: Duration) -> Self {
        self.per_call_timeout = Some(timeout);
        self
    }

    /// Whether retries carry the attempt number in [`ATTEMPT_METADATA_KEY`].
    pub fn with_include_header(mut self, include: bool) -> Self {
        self.include_header = include;
        self
    }

    pub fn with_codes(mut self, codes: impl IntoIterator<Item = Code>) -> Self {
        self.codes = codes.into_iter().collect();
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn per_call_timeout(&self) -> Option<Duration> {
        self.per_call_timeout
    }

    pub fn codes(&self) -> &[Code] {
        &self.codes
    }

    pub fn is_retriable(&self, code: Code) -> bool {
        !code.is_context() && self.codes.contains(&code)
    }

    /// Applies `options` to a copy of this policy. Without options, this policy is reused.
    pub fn merge(&self, options: &[RetryOption]) -> Cow<'_, RetryPolicy> {
        if options.is_empty() {
            return Cow::Borrowed(self);
        }
        let mut merged = self.clone();
        for option in options {
            option.apply(&mut merged);
        }
        Cow::Owned(merged)
    }
}

/// A retry setting that overrides the interceptor's policy for one call.
#[derive(Debug, Clone)]
pub enum RetryOption {
    Disable,
    Max(u32),
    Backoff(Backoff),
    Codes(Vec<Code>),
    PerRetryTimeout(Duration),
    IncludeHeader(bool),
}

impl RetryOption {
    fn apply(&self, policy: &mut RetryPolicy) {
        match self {
            RetryOption::Disable => policy.max = 0,
            RetryOption::Max(max) => policy.max = *max,
            RetryOption::Backoff(backoff) => policy.backoff = backoff.clone(),
            RetryOption::Codes(codes) => policy.codes = codes.clone(),
            RetryOption::PerRetryTimeout(timeout) => policy.per_call_timeout = Some(*timeout),
            RetryOption::IncludeHeader(include) => policy.include_header = *include,
        }
    }
}

/// Client-side interceptor that re-issues failed calls according to a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Retry {
    policy: RetryPolicy,
    attempts: Counter<u64>,
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        let meter = global::meter("tower_guard");
        Self {
            policy,
            attempts: meter.u64_counter("retry.attempts").build(),
        }
    }

    /// The default policy with `options` applied.
    pub fn with_options(options: &[RetryOption]) -> Self {
        Self::new(RetryPolicy::default().merge(options).into_owned())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn run<T, U>(&self, mut request: Request<T>, next: Next<T, U>) -> Result<U, Status>
    where
        T: Clone + Send + 'static,
        U: Send + 'static,
    {
        let overrides = request.take_retry_options();
        let policy = self.policy.merge(&overrides);
        if policy.max == 0 {
            return next.run(request).await;
        }

        let parent = request.ctx().clone();
        let method = request.info().method().to_owned();
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                self.attempts.add(1, &[KeyValue::new("method", method.clone())]);
            }
            wait_backoff(attempt, &parent, &policy).await?;

            let ctx = attempt_context(&parent, &policy, attempt);
            let dispatch = next.clone().run(request.clone().with_context(ctx.clone()));
            let err = match ctx.run(dispatch).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(status)) => status,
                Err(ctx_err) => Status::from(ctx_err),
            };

            warn!(%method, attempt, error = %err, "call attempt failed");

            let err = if err.code().is_context() {
                if let Some(parent_err) = parent.err() {
                    debug!(%method, attempt, error = %parent_err, "parent context ended");
                    return Err(parent_err.into());
                }
                debug!(%method, attempt, "attempt context ended; retrying");
                Status::from(GuardError::AttemptDeadlineExceeded)
            } else if policy.is_retriable(err.code()) {
                err
            } else {
                return Err(err);
            };

            attempt += 1;
            if attempt >= policy.max {
                return Err(err);
            }
        }
    }
}

impl<T, U> Interceptor<T, U> for Retry
where
    T: Clone + Send + Sync + 'static,
    U: Send + 'static,
{
    fn intercept(
        self: Arc<Self>,
        request: Request<T>,
        next: Next<T, U>,
    ) -> BoxFuture<'static, Result<U, Status>> {
        Box::pin(async move { self.run(request, next).await })
    }
}

/// Waits out the backoff before `attempt`, giving up as soon as `parent` ends.
async fn wait_backoff(
    attempt: u32,
    parent: &CallContext,
    policy: &RetryPolicy,
) -> Result<(), Status> {
    if let Some(err) = parent.err() {
        return Err(err.into());
    }
    if attempt == 0 {
        return Ok(());
    }
    let wait = policy.backoff.delay(attempt);
    if wait.is_zero() {
        return Ok(());
    }
    debug!(attempt, backoff = ?wait, "backing off before retry");
    tokio::select! {
        biased;
        err = parent.done() => Err(err.into()),
        _ = sleep(wait) => Ok(()),
    }
}

fn attempt_context(parent: &CallContext, policy: &RetryPolicy, attempt: u32) -> CallContext {
    let ctx = match policy.per_call_timeout {
        Some(timeout) => parent.with_timeout(timeout),
        None => parent.child(),
    };
    if attempt > 0 && policy.include_header {
        ctx.set_metadata(ATTEMPT_METADATA_KEY, attempt.to_string())
    } else {
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_leaves_the_base_untouched() {
        let base = RetryPolicy::new().with_max(2);

        let merged = base.merge(&[
            RetryOption::Max(5),
            RetryOption::Codes(vec![Code::Aborted]),
            RetryOption::PerRetryTimeout(Duration::from_millis(10)),
        ]);

        assert_eq!(merged.max(), 5);
        assert_eq!(merged.codes(), &[Code::Aborted]);
        assert_eq!(merged.per_call_timeout(), Some(Duration::from_millis(10)));
        assert_eq!(base.max(), 2);
        assert_eq!(base.codes(), &DEFAULT_RETRIABLE_CODES);
        assert!(matches!(base.merge(&[]), Cow::Borrowed(_)));
        assert_eq!(base.merge(&[RetryOption::Disable]).max(), 0);
    }

    #[test]
    fn context_codes_are_never_retriable_by_code() {
        let policy = RetryPolicy::new().with_codes([Code::DeadlineExceeded, Code::Unavailable]);
        assert!(policy.is_retriable(Code::Unavailable));
        assert!(!policy.is_retriable(Code::DeadlineExceeded));
        assert!(!policy.is_retriable(Code::Internal));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_context_caps_to_parent_and_tags_retries() {
        let parent = CallContext::new().with_timeout(Duration::from_millis(20));
        let policy = RetryPolicy::new()
            .with_max(3)
            .with_per_call_timeout(Duration::from_secs(5));

        let first = attempt_context(&parent, &policy, 0);
        assert_eq!(first.deadline(), parent.deadline());
        assert_eq!(first.get_metadata(ATTEMPT_METADATA_KEY), None);

        let second = attempt_context(&parent, &policy, 2);
        assert_eq!(second.get_metadata(ATTEMPT_METADATA_KEY), Some("2"));

        let quiet = attempt_context(&parent, &policy.clone().with_include_header(false), 2);
        assert_eq!(quiet.get_metadata(ATTEMPT_METADATA_KEY), None);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_per_call_timeout_adds_no_deadline() {
        let policy = RetryPolicy::new()
            .with_max(2)
            .with_per_call_timeout(Duration::MAX);

        let free = attempt_context(&CallContext::new(), &policy, 1);
        assert_eq!(free.deadline(), None);

        let parent = CallContext::new().with_timeout(Duration::from_millis(20));
        let capped = attempt_context(&parent, &policy, 1);
        assert_eq!(capped.deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_wait_yields_to_parent_deadline() {
        let parent = CallContext::new().with_timeout(Duration::from_millis(10));
        let policy = RetryPolicy::new()
            .with_max(3)
            .with_backoff(Backoff::constant(Duration::from_secs(60)));

        let err = wait_backoff(1, &parent, &policy).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(tokio::time::Instant::now() < parent.deadline().unwrap() + Duration::from_secs(1));
    }
}
