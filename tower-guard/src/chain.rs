use std::fmt;
use std::sync::Arc;

use tower::Service;
use tower::ServiceExt;
use tower::util::BoxCloneSyncService;

use crate::context::CallContext;
use crate::interceptor::CallInfo;
use crate::interceptor::Interceptor;
use crate::interceptor::Request;
use crate::service::Handler;
use crate::service::Intercepted;
use crate::service::Next;
use crate::status::Status;

/// An ordered list of interceptors.
///
/// The first interceptor added is the outermost: it runs first and sees the result last.
/// Building a handler folds the list around a terminal service, from the last interceptor
/// outward, and never changes the list itself, so one chain can build any number of
/// handlers.
pub struct Chain<T, U> {
    interceptors: Vec<Arc<dyn Interceptor<T, U>>>,
}

impl<T, U> Default for Chain<T, U> {
    fn default() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }
}

impl<T, U> Clone for Chain<T, U> {
    fn clone(&self) -> Self {
        Self {
            interceptors: self.interceptors.clone(),
        }
    }
}

impl<T, U> fmt::Debug for Chain<T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

impl<T, U> Chain<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// Create a new empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor; it runs inside every interceptor added before it.
    pub fn with(mut self, interceptor: impl Interceptor<T, U>) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Append a shared interceptor.
    pub fn with_shared(mut self, interceptor: Arc<dyn Interceptor<T, U>>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Builds the server-side handler: the chain wrapped around the service `handler`.
    pub fn server<S>(&self, handler: S) -> Handler<T, U>
    where
        S: Service<Request<T>, Response = U, Error = Status> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
    {
        self.fold(BoxCloneSyncService::new(handler))
    }

    /// Builds a client for the connection `target`: the chain wrapped around `invoker`,
    /// the service that actually puts calls on the wire.
    pub fn client<S>(&self, target: impl Into<Arc<str>>, invoker: S) -> Client<T, U>
    where
        S: Service<Request<T>, Response = U, Error = Status> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
    {
        Client {
            target: target.into(),
            handler: self.fold(BoxCloneSyncService::new(invoker)),
        }
    }

    fn fold(&self, terminal: Handler<T, U>) -> Handler<T, U> {
        let mut handler = terminal;
        for interceptor in self.interceptors.iter().rev() {
            let next = Next::from_handler(handler);
            handler = BoxCloneSyncService::new(Intercepted::new(Arc::clone(interceptor), next));
        }
        handler
    }
}

/// The client side of a chain, bound to one connection target.
pub struct Client<T, U> {
    target: Arc<str>,
    handler: Handler<T, U>,
}

impl<T, U> Clone for Client<T, U> {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
            handler: self.handler.clone(),
        }
    }
}

impl<T, U> fmt::Debug for Client<T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl<T, U> Client<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Invokes `method` with `message` through the chain.
    pub async fn invoke(
        &self,
        ctx: CallContext,
        method: impl Into<Arc<str>>,
        message: T,
    ) -> Result<U, Status> {
        let info = CallInfo::client(method, Arc::clone(&self.target));
        self.call(Request::new(ctx, info, message)).await
    }

    /// Sends a fully built request, e.g. one carrying per-call retry options.
    pub async fn call(&self, request: Request<T>) -> Result<U, Status> {
        self.handler.clone().oneshot(request).await
    }
}
