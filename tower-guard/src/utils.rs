use std::sync::Arc;

use guard_limit::Strategy;
use tower::ServiceBuilder;
use tower::layer::util::Stack;

use crate::Interceptor;
use crate::InterceptorLayer;
use crate::RateLimit;
use crate::Recovery;
use crate::Throttle;

/// Service Builder Extension for putting interceptors into a tower::ServiceBuilder.
pub trait ServiceBuilderExt<L> {
    /// Add any interceptor as a layer
    fn intercept<T, U>(
        self,
        interceptor: impl Interceptor<T, U>,
    ) -> ServiceBuilder<Stack<InterceptorLayer<T, U>, L>>;

    /// Add a rate limit layer driven by `limiter`
    fn guard_rate_limit<T, U>(
        self,
        limiter: Arc<dyn Strategy + Send + Sync + 'static>,
    ) -> ServiceBuilder<Stack<InterceptorLayer<T, U>, L>>
    where
        T: Send + 'static,
        U: Send + 'static;

    /// Add a concurrency throttle layer
    fn guard_throttle<T, U>(
        self,
        throttle: Throttle,
    ) -> ServiceBuilder<Stack<InterceptorLayer<T, U>, L>>
    where
        T: Send + 'static,
        U: Send + 'static;

    /// Add a panic recovery layer
    fn guard_recovery<T, U>(
        self,
        recovery: Recovery,
    ) -> ServiceBuilder<Stack<InterceptorLayer<T, U>, L>>
    where
        T: Send + 'static,
        U: Send + 'static;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn intercept<T, U>(
        self,
        interceptor: impl Interceptor<T, U>,
    ) -> ServiceBuilder<Stack<InterceptorLayer<T, U>, L>> {
        self.layer(InterceptorLayer::new(interceptor))
    }

    fn guard_rate_limit<T, U>(
        self,
        limiter: Arc<dyn Strategy + Send + Sync + 'static>,
    ) -> ServiceBuilder<Stack<InterceptorLayer<T, U>, L>>
    where
        T: Send + 'static,
        U: Send + 'static,
    {
        self.intercept(RateLimit::new(limiter))
    }

    fn guard_throttle<T, U>(
        self,
        throttle: Throttle,
    ) -> ServiceBuilder<Stack<InterceptorLayer<T, U>, L>>
    where
        T: Send + 'static,
        U: Send + 'static,
    {
        self.intercept(throttle)
    }

    fn guard_recovery<T, U>(
        self,
        recovery: Recovery,
    ) -> ServiceBuilder<Stack<InterceptorLayer<T, U>, L>>
    where
        T: Send + 'static,
        U: Send + 'static,
    {
        self.intercept(recovery)
    }
}
