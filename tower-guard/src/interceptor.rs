use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::CallContext;
use crate::retry::RetryOption;
use crate::service::Next;
use crate::status::Status;

/// Identity of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    method: Arc<str>,
    target: Option<Arc<str>>,
}

impl CallInfo {
    /// A call received by a server for `method`.
    pub fn server(method: impl Into<Arc<str>>) -> Self {
        Self {
            method: method.into(),
            target: None,
        }
    }

    /// A call issued by a client for `method` over the connection to `target`.
    pub fn client(method: impl Into<Arc<str>>, target: impl Into<Arc<str>>) -> Self {
        Self {
            method: method.into(),
            target: Some(target.into()),
        }
    }

    /// The fully-qualified method name, e.g. `/greeter.Greeter/SayHello`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The connection target of a client call.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn is_client(&self) -> bool {
        self.target.is_some()
    }
}

impl fmt::Display for CallInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "{}{}", target, self.method),
            None => f.write_str(&self.method),
        }
    }
}

/// A unary call travelling through a chain: context, identity, message and call options.
#[derive(Debug, Clone)]
pub struct Request<T> {
    ctx: CallContext,
    info: CallInfo,
    message: T,
    retry: Vec<RetryOption>,
}

impl<T> Request<T> {
    pub fn new(ctx: CallContext, info: CallInfo, message: T) -> Self {
        Self {
            ctx,
            info,
            message,
            retry: Vec::new(),
        }
    }

    pub fn ctx(&self) -> &CallContext {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut CallContext {
        &mut self.ctx
    }

    /// Replaces the call context, typically with one derived from the current one.
    pub fn with_context(mut self, ctx: CallContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Shorthand for setting one metadata entry on the call context.
    pub fn with_context_metadata(mut self, key: &str, value: impl AsRef<[u8]>) -> Self {
        self.ctx.metadata_mut().insert(key, value);
        self
    }

    pub fn info(&self) -> &CallInfo {
        &self.info
    }

    pub fn message(&self) -> &T {
        &self.message
    }

    pub fn into_message(self) -> T {
        self.message
    }

    /// Per-call overrides for the retry stage.
    pub fn with_retry_options(mut self, options: impl IntoIterator<Item = RetryOption>) -> Self {
        self.retry.extend(options);
        self
    }

    pub fn retry_options(&self) -> &[RetryOption] {
        &self.retry
    }

    /// Removes the per-call retry overrides so they are not seen by stages further in.
    pub(crate) fn take_retry_options(&mut self) -> Vec<RetryOption> {
        std::mem::take(&mut self.retry)
    }
}

/// One stage of a chain.
///
/// An interceptor receives the request and the remainder of the chain as `next`, and
/// decides whether, when and how often `next` runs. Interceptors are built once and shared
/// by every call, so per-call state lives in the returned future.
pub trait Interceptor<T, U>: Send + Sync + 'static {
    fn intercept(
        self: Arc<Self>,
        request: Request<T>,
        next: Next<T, U>,
    ) -> BoxFuture<'static, Result<U, Status>>;
}

/// An interceptor built from a closure. See [`interceptor_fn`].
#[derive(Clone)]
pub struct InterceptorFn<F> {
    f: F,
}

/// Returns an [`Interceptor`] that calls `f` with the request and the rest of the chain.
///
/// ```rust
/// use tower_guard::interceptor_fn;
/// use tower_guard::Next;
/// use tower_guard::Request;
///
/// let tagging = interceptor_fn(|request: Request<String>, next: Next<String, String>| async move {
///     let request = request.with_context_metadata("x-tagged", "yes");
///     next.run(request).await
/// });
/// # let _ = tagging;
/// ```
pub fn interceptor_fn<F>(f: F) -> InterceptorFn<F> {
    InterceptorFn { f }
}

impl<F, Fut, T, U> Interceptor<T, U> for InterceptorFn<F>
where
    F: Fn(Request<T>, Next<T, U>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U, Status>> + Send + 'static,
{
    fn intercept(
        self: Arc<Self>,
        request: Request<T>,
        next: Next<T, U>,
    ) -> BoxFuture<'static, Result<U, Status>> {
        Box::pin((self.f)(request, next))
    }
}

impl<F> fmt::Debug for InterceptorFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorFn")
            .field("f", &std::any::type_name::<F>())
            .finish()
    }
}
