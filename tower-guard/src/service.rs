use std::fmt;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use futures::future::BoxFuture;
use tower::Service;
use tower::ServiceExt;
use tower::util::BoxCloneSyncService;

use crate::interceptor::Interceptor;
use crate::interceptor::Request;
use crate::status::Status;

/// A composed, type-erased call handler: the product of folding a chain around a terminal
/// service.
pub type Handler<T, U> = BoxCloneSyncService<Request<T>, U, Status>;

/// The remainder of a chain, handed to each [`Interceptor`].
pub struct Next<T, U> {
    inner: Handler<T, U>,
}

// Manually implement Clone so `T` and `U` need not be `Clone`
impl<T, U> Clone for Next<T, U> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, U> fmt::Debug for Next<T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

impl<T, U> Next<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// Wraps any service as the rest of a chain.
    pub fn new<S>(service: S) -> Self
    where
        S: Service<Request<T>, Response = U, Error = Status> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
    {
        Self {
            inner: BoxCloneSyncService::new(service),
        }
    }

    pub fn from_handler(inner: Handler<T, U>) -> Self {
        Self { inner }
    }

    /// Runs the rest of the chain for `request`. Each call dispatches exactly once.
    pub async fn run(self, request: Request<T>) -> Result<U, Status> {
        self.inner.oneshot(request).await
    }

    pub fn into_handler(self) -> Handler<T, U> {
        self.inner
    }
}

/// A service that runs one interceptor in front of the rest of the chain.
pub struct Intercepted<T, U> {
    interceptor: Arc<dyn Interceptor<T, U>>,
    next: Next<T, U>,
}

impl<T, U> Clone for Intercepted<T, U> {
    fn clone(&self) -> Self {
        Self {
            interceptor: Arc::clone(&self.interceptor),
            next: self.next.clone(),
        }
    }
}

impl<T, U> Intercepted<T, U> {
    pub fn new(interceptor: Arc<dyn Interceptor<T, U>>, next: Next<T, U>) -> Self {
        Self { interceptor, next }
    }
}

impl<T, U> Service<Request<T>> for Intercepted<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    type Response = U;
    type Error = Status;
    type Future = BoxFuture<'static, Result<U, Status>>;

    // Admission decisions need the call context, so they happen in `call`, not here.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<T>) -> Self::Future {
        Arc::clone(&self.interceptor).intercept(request, self.next.clone())
    }
}
