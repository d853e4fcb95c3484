//! # Tower Guard
//!
//! `tower-guard` wraps unary RPC handlers and clients in chains of interceptors built on
//! [Tower](https://github.com/tower-rs/tower) services.
//!
//! ## Chains
//! A [`Chain`] is an ordered list of [`Interceptor`]s folded around a terminal service. The
//! first interceptor added runs first and sees the result last. Each interceptor receives
//! the request together with [`Next`], the rest of the chain, and decides whether, when
//! and how often it runs.
//!
//! ## Stages
//! - [`Retry`]: client-side re-issue of failed calls with backoff, per-attempt timeouts and
//!   an `x-retry-attempt` header.
//! - [`RateLimit`]: admission through a [`guard_limit::Strategy`]; the token bucket makes
//!   calls wait, the fixed window refuses them.
//! - [`Throttle`]: a bound on calls in flight with a time-limited backlog.
//! - [`Recovery`]: turns handler panics into `Internal` statuses.
//! - [`Monitoring`] and [`Logging`]: per-method metrics, error reporting and call logs.
//!
//! Every wait a stage performs also watches the [`CallContext`], so cancellation and
//! deadlines are honoured at once. [`ServerOptions`] and [`ClientOptions`] assemble the
//! usual chains.
//!
//! ## Feature Flags
//!
//! - `axum`: Enables the `/metrics` endpoint in [`server`] and `IntoResponse` for
//!   [`Status`].

mod backoff;
mod chain;
mod context;
mod error;
mod interceptor;
mod layer;
mod logging;
mod metadata;
mod metrics;
mod monitor;
mod options;
mod rate_limit;
mod recovery;
mod retry;
mod service;
mod status;
mod throttle;
mod utils;

#[cfg(feature = "axum")]
pub mod server;


pub use backoff::Backoff;
pub use chain::Chain;
pub use chain::Client;
pub use context::CallContext;
pub use context::ContextError;
pub use error::ConfigError;
pub use error::GuardError;
pub use error::ThrottleReason;
pub use interceptor::CallInfo;
pub use interceptor::Interceptor;
pub use interceptor::InterceptorFn;
pub use interceptor::Request;
pub use interceptor::interceptor_fn;
pub use layer::InterceptorLayer;
pub use logging::Formatter;
pub use logging::Logging;
pub use logging::marshal;
pub use metadata::BINARY_SUFFIX;
pub use metadata::Metadata;
pub use metrics::ExportError;
pub use metrics::MetricsRegistry;
pub use monitor::DEFAULT_BUCKETS;
pub use monitor::ErrorReporter;
pub use monitor::Monitor;
pub use monitor::MonitorConfig;
pub use monitor::Monitoring;
pub use monitor::ReportError;
pub use monitor::TracingReporter;
pub use options::ClientOptions;
pub use options::RateLimitConfig;
pub use options::ServerOptions;
pub use options::ServerStack;
pub use options::ThrottleConfig;
pub use rate_limit::RateLimit;
pub use recovery::CatchPanic;
pub use recovery::CaughtPanic;
pub use recovery::MAX_STACK_SIZE;
pub use recovery::Recovery;
pub use recovery::panic_message;
pub use retry::ATTEMPT_METADATA_KEY;
pub use retry::DEFAULT_RETRIABLE_CODES;
pub use retry::Retry;
pub use retry::RetryOption;
pub use retry::RetryPolicy;
pub use service::Handler;
pub use service::Intercepted;
pub use service::Next;
pub use status::Code;
pub use status::Status;
pub use throttle::Admission;
pub use throttle::Throttle;
pub use utils::ServiceBuilderExt;
