use std::fmt;
use std::sync::Arc;

use tower::Layer;
use tower::Service;

use crate::interceptor::Interceptor;
use crate::interceptor::Request;
use crate::service::Intercepted;
use crate::service::Next;
use crate::status::Status;

/// Applies an [`Interceptor`] as a `tower` layer.
///
/// This lets any interceptor sit in a `tower::ServiceBuilder` stack next to ordinary
/// layers. [`Chain`](crate::Chain) uses the same wrapping internally.
pub struct InterceptorLayer<T, U> {
    interceptor: Arc<dyn Interceptor<T, U>>,
}

// Note: Deriving Clone would require `T: Clone` and `U: Clone`.
// We'll just implement it explicitly.
impl<T, U> Clone for InterceptorLayer<T, U> {
    fn clone(&self) -> Self {
        Self {
            interceptor: Arc::clone(&self.interceptor),
        }
    }
}

impl<T, U> fmt::Debug for InterceptorLayer<T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorLayer").finish_non_exhaustive()
    }
}

impl<T, U> InterceptorLayer<T, U> {
    /// Create an InterceptorLayer
    pub fn new(interceptor: impl Interceptor<T, U>) -> Self {
        Self {
            interceptor: Arc::new(interceptor),
        }
    }

    /// Create an InterceptorLayer around an already shared interceptor.
    pub fn shared(interceptor: Arc<dyn Interceptor<T, U>>) -> Self {
        Self { interceptor }
    }
}

impl<T, U, S> Layer<S> for InterceptorLayer<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
    S: Service<Request<T>, Response = U, Error = Status> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = Intercepted<T, U>;

    fn layer(&self, service: S) -> Self::Service {
        Intercepted::new(Arc::clone(&self.interceptor), Next::new(service))
    }
}
