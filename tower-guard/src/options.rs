//! Builders for the standard server and client chains.
//!
//! A server chain always starts with [`Recovery`] and [`Logging`]. [`Monitoring`] joins right
//! after recovery when a monitor is configured, and the rate limit and throttle stages are
//! appended, in that order, when configured. A client chain holds the [`Retry`] stage.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tower::Service;

use crate::chain::Chain;
use crate::chain::Client;
use crate::error::ConfigError;
use crate::interceptor::Request;
use crate::logging::Logging;
use crate::monitor::Monitor;
use crate::monitor::MonitorConfig;
use crate::monitor::Monitoring;
use crate::rate_limit::RateLimit;
use crate::recovery::Recovery;
use crate::retry::Retry;
use crate::retry::RetryPolicy;
use crate::service::Handler;
use crate::status::Status;
use crate::throttle::Throttle;

fn non_zero(value: usize, what: &'static str) -> Result<NonZeroUsize, ConfigError> {
    NonZeroUsize::new(value).ok_or(ConfigError::Zero(what))
}

fn non_zero_interval(value: Duration, what: &'static str) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        Err(ConfigError::Zero(what))
    } else {
        Ok(value)
    }
}

/// Which rate limiting strategy to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitConfig {
    /// Calls wait for a token; see [`RateLimit::token_bucket`].
    TokenBucket {
        fill_interval: Duration,
        capacity: usize,
        quantum: usize,
    },
    /// Calls over the window's quota are refused; see [`RateLimit::fixed_window`].
    FixedWindow { interval: Duration, max_count: usize },
}

impl RateLimitConfig {
    pub fn build(&self) -> Result<RateLimit, ConfigError> {
        match *self {
            RateLimitConfig::TokenBucket {
                fill_interval,
                capacity,
                quantum,
            } => Ok(RateLimit::token_bucket(
                non_zero_interval(fill_interval, "fill interval")?,
                non_zero(capacity, "capacity")?,
                non_zero(quantum, "quantum")?,
            )),
            RateLimitConfig::FixedWindow {
                interval,
                max_count,
            } => Ok(RateLimit::fixed_window(
                non_zero_interval(interval, "interval")?,
                non_zero(max_count, "max count")?,
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub limit: usize,
    pub backlog_limit: usize,
    pub backlog_timeout: Duration,
}

impl ThrottleConfig {
    pub fn build(&self) -> Result<Throttle, ConfigError> {
        Throttle::new(self.limit, self.backlog_limit, self.backlog_timeout)
    }
}

/// Which stages a server chain carries.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    monitor: Option<MonitorConfig>,
    rate_limit: Option<RateLimitConfig>,
    throttle: Option<ThrottleConfig>,
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report metrics and errors under `application`, labelled with `port`.
    pub fn monitor(
        self,
        application: impl Into<String>,
        port: u16,
        dsn: impl Into<String>,
    ) -> Self {
        self.with_monitor_config(MonitorConfig::new(application, port, dsn))
    }

    pub fn with_monitor_config(mut self, config: MonitorConfig) -> Self {
        self.monitor = Some(config);
        self
    }

    pub fn token_bucket(
        mut self,
        fill_interval: Duration,
        capacity: usize,
        quantum: usize,
    ) -> Self {
        self.rate_limit = Some(RateLimitConfig::TokenBucket {
            fill_interval,
            capacity,
            quantum,
        });
        self
    }

    pub fn fixed_window(mut self, interval: Duration, max_count: usize) -> Self {
        self.rate_limit = Some(RateLimitConfig::FixedWindow {
            interval,
            max_count,
        });
        self
    }

    pub fn throttle(
        mut self,
        limit: usize,
        backlog_limit: usize,
        backlog_timeout: Duration,
    ) -> Self {
        self.throttle = Some(ThrottleConfig {
            limit,
            backlog_limit,
            backlog_timeout,
        });
        self
    }

    /// Builds the chain, logging messages with their `Debug` output.
    pub fn build<T, U>(&self) -> Result<ServerStack<T, U>, ConfigError>
    where
        T: fmt::Debug + Send + 'static,
        U: fmt::Debug + Send + 'static,
    {
        self.build_with_logging(Logging::debug())
    }

    pub fn build_with_logging<T, U>(
        &self,
        logging: Logging<T, U>,
    ) -> Result<ServerStack<T, U>, ConfigError>
    where
        T: Send + 'static,
        U: Send + 'static,
    {
        let monitor = self
            .monitor
            .as_ref()
            .map(Monitor::new)
            .transpose()?
            .map(Arc::new);

        let mut chain = Chain::new();
        chain = match &monitor {
            Some(monitor) => chain
                .with(Recovery::new().with_monitor(Arc::clone(monitor)))
                .with(Monitoring::new(Arc::clone(monitor))),
            None => chain.with(Recovery::new()),
        };
        chain = chain.with(logging);
        if let Some(rate_limit) = &self.rate_limit {
            chain = chain.with(rate_limit.build()?);
        }
        if let Some(throttle) = &self.throttle {
            chain = chain.with(throttle.build()?);
        }

        Ok(ServerStack { chain, monitor })
    }
}

/// A built server chain together with the monitor it reports to.
pub struct ServerStack<T, U> {
    chain: Chain<T, U>,
    monitor: Option<Arc<Monitor>>,
}

impl<T, U> fmt::Debug for ServerStack<T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerStack")
            .field("chain", &self.chain)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl<T, U> ServerStack<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// Wraps the application's `handler` in the chain.
    pub fn handler<S>(&self, handler: S) -> Handler<T, U>
    where
        S: Service<Request<T>, Response = U, Error = Status> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
    {
        self.chain.server(handler)
    }

    pub fn chain(&self) -> &Chain<T, U> {
        &self.chain
    }

    pub fn monitor(&self) -> Option<&Arc<Monitor>> {
        self.monitor.as_ref()
    }
}

/// Which stages a client chain carries.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    retry: RetryPolicy,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn build<T, U>(&self) -> Chain<T, U>
    where
        T: Clone + Send + Sync + 'static,
        U: Send + 'static,
    {
        Chain::new().with(Retry::new(self.retry.clone()))
    }

    /// A client for `target` whose calls go out through `invoker`.
    pub fn dial<T, U, S>(&self, target: impl Into<Arc<str>>, invoker: S) -> Client<T, U>
    where
        T: Clone + Send + Sync + 'static,
        U: Send + 'static,
        S: Service<Request<T>, Response = U, Error = Status> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
    {
        self.build().client(target, invoker)
    }
}
