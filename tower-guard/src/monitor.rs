use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use tokio::time::Instant;
use tracing::error;
use tracing::warn;

use crate::error::ConfigError;
use crate::interceptor::Interceptor;
use crate::interceptor::Request;
use crate::metrics::MetricsRegistry;
use crate::metrics::namespace;
use crate::metrics::validate_buckets;
use crate::service::Next;
use crate::status::Status;

/// Latency buckets in milliseconds.
pub const DEFAULT_BUCKETS: [f64; 12] = [
    10.0, 20.0, 30.0, 50.0, 80.0, 100.0, 200.0, 300.0, 500.0, 1000.0, 2000.0, 3000.0,
];

/// Identifies the process in metrics and error reports.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    application: String,
    port: u16,
    dsn: String,
    buckets: Vec<f64>,
}

impl MonitorConfig {
    /// `application` namespaces the metrics, `port` becomes the `process` label, and `dsn`
    /// addresses the error reporting sink.
    pub fn new(application: impl Into<String>, port: u16, dsn: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            port,
            dsn: dsn.into(),
            buckets: DEFAULT_BUCKETS.to_vec(),
        }
    }

    /// Override the latency histogram buckets.
    pub fn with_buckets(mut self, buckets: impl Into<Vec<f64>>) -> Self {
        self.buckets = buckets.into();
        self
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    pub fn buckets(&self) -> &[f64] {
        &self.buckets
    }
}

/// The error reporting sink could not take a report.
#[derive(Debug, thiserror::Error)]
#[error("error report failed: {0}")]
pub struct ReportError(pub String);

/// Receives every error observed by a [`Monitor`].
pub trait ErrorReporter: Send + Sync + 'static {
    fn report(&self, method: &str, status: &Status) -> Result<(), ReportError>;
}

/// Reports errors as `tracing` events tagged with the sink's DSN.
#[derive(Debug, Clone)]
pub struct TracingReporter {
    dsn: Arc<str>,
}

impl TracingReporter {
    pub fn new(dsn: &str) -> Result<Self, ConfigError> {
        if dsn.trim().is_empty() {
            return Err(ConfigError::EmptyDsn);
        }
        Ok(Self { dsn: dsn.into() })
    }
}

impl ErrorReporter for TracingReporter {
    fn report(&self, method: &str, status: &Status) -> Result<(), ReportError> {
        error!(
            dsn = %self.dsn,
            %method,
            code = %status.code(),
            message = status.message(),
            "call error reported"
        );
        Ok(())
    }
}

/// Per-method request, error and latency metrics plus error reporting.
pub struct Monitor {
    registry: MetricsRegistry,
    requests: Counter<u64>,
    errors: Counter<u64>,
    latency: Histogram<f64>,
    constant: [KeyValue; 2],
    reporter: Arc<dyn ErrorReporter>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("registry", &self.registry)
            .field("constant", &self.constant)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    /// Creates the monitor's instruments in a fresh registry and reports through a
    /// [`TracingReporter`].
    pub fn new(config: &MonitorConfig) -> Result<Self, ConfigError> {
        Self::with_registry(config, MetricsRegistry::new())
    }

    /// Creates the monitor's instruments in `registry`, which may be shared with monitors of
    /// other applications.
    pub fn with_registry(
        config: &MonitorConfig,
        registry: MetricsRegistry,
    ) -> Result<Self, ConfigError> {
        let reporter = TracingReporter::new(&config.dsn)?;
        validate_buckets(&config.buckets)?;
        let namespace = namespace(&config.application)?;
        let meter = registry.meter();

        let requests = meter
            .u64_counter(format!("{namespace}_requests_total"))
            .with_description("Total request counts")
            .build();
        let errors = meter
            .u64_counter(format!("{namespace}_error_total"))
            .with_description("Total error counts")
            .build();
        let latency = meter
            .f64_histogram(format!("{namespace}_response_latency_millisecond"))
            .with_description("Response latency (millisecond)")
            .with_unit("ms")
            .with_boundaries(config.buckets.clone())
            .build();

        Ok(Self {
            registry,
            requests,
            errors,
            latency,
            constant: [
                KeyValue::new("method", "rpc"),
                KeyValue::new("process", config.port.to_string()),
            ],
            reporter: Arc::new(reporter),
        })
    }

    /// Replace the error reporter.
    pub fn with_reporter(mut self, reporter: impl ErrorReporter) -> Self {
        self.reporter = Arc::new(reporter);
        self
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    fn labels(&self, method: &str) -> [KeyValue; 3] {
        let [rpc, process] = self.constant.clone();
        [rpc, process, KeyValue::new("endpoint", method.to_owned())]
    }

    pub fn record_request(&self, method: &str) {
        self.requests.add(1, &self.labels(method));
    }

    /// Records the latency of a successful call.
    pub fn observe(&self, method: &str, latency_ms: f64) {
        self.latency.record(latency_ms, &self.labels(method));
    }

    /// Counts a failed call and hands it to the error reporter.
    pub fn observe_error(&self, method: &str, status: &Status) {
        self.errors.add(1, &self.labels(method));
        if let Err(err) = self.reporter.report(method, status) {
            warn!(%method, %err, "failed to report error");
        }
    }
}

/// Server-side interceptor feeding a [`Monitor`].
#[derive(Debug, Clone)]
pub struct Monitoring {
    monitor: Arc<Monitor>,
}

impl Monitoring {
    pub fn new(monitor: Arc<Monitor>) -> Self {
        Self { monitor }
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }
}

impl<T, U> Interceptor<T, U> for Monitoring
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
            let method = request.info().method().to_owned();
            self.monitor.record_request(&method);
            let start = Instant::now();
            let response = next.run(request).await;
            match &response {
                Ok(_) => {
                    let elapsed = start.elapsed();
                    self.monitor.observe(&method, elapsed.as_secs_f64() * 1000.0);
                }
                Err(status) => self.monitor.observe_error(&method, status),
            }
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::status::Code;

    #[derive(Default)]
    struct Recording(Mutex<Vec<(String, Code)>>);

    impl ErrorReporter for Arc<Recording> {
        fn report(&self, method: &str, status: &Status) -> Result<(), ReportError> {
            self.0.lock().unwrap().push((method.to_owned(), status.code()));
            Err(ReportError("sink offline".into()))
        }
    }

    #[test]
    fn empty_dsn_is_rejected() {
        let err = Monitor::new(&MonitorConfig::new("app", 8080, "  ")).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyDsn));
    }

    #[test]
    fn unusable_application_name_is_rejected() {
        let err = Monitor::new(&MonitorConfig::new("1st", 8080, "memory://")).unwrap_err();
        assert!(matches!(err, ConfigError::MetricName(_)));
    }

    #[test]
    fn metrics_carry_namespace_and_labels() {
        let monitor = Monitor::new(&MonitorConfig::new("greeter", 9000, "memory://")).unwrap();
        monitor.record_request("/greeter.Greeter/SayHello");
        monitor.observe("/greeter.Greeter/SayHello", 42.0);

        let text = monitor.registry().render().unwrap();
        assert!(text.contains(
            "greeter_requests_total{endpoint=\"/greeter.Greeter/SayHello\",method=\"rpc\",process=\"9000\"} 1"
        ));
        assert!(text.contains(
            "greeter_response_latency_millisecond_bucket{endpoint=\"/greeter.Greeter/SayHello\",method=\"rpc\",process=\"9000\",le=\"50\"} 1"
        ));
        assert!(text.contains(
            "greeter_response_latency_millisecond_bucket{endpoint=\"/greeter.Greeter/SayHello\",method=\"rpc\",process=\"9000\",le=\"30\"} 0"
        ));
    }

    #[test]
    fn reporter_failure_is_swallowed() {
        let reports = Arc::new(Recording::default());
        let monitor = Monitor::new(&MonitorConfig::new("app", 1, "memory://"))
            .unwrap()
            .with_reporter(Arc::clone(&reports));

        monitor.observe_error("/m", &Status::unavailable("down"));

        let text = monitor.registry().render().unwrap();
        assert!(text.contains("app_error_total{endpoint=\"/m\",method=\"rpc\",process=\"1\"} 1"));
        assert_eq!(
            *reports.0.lock().unwrap(),
            vec![("/m".to_owned(), Code::Unavailable)]
        );
    }

    #[test]
    fn custom_buckets() {
        let config = MonitorConfig::new("app", 1, "memory://").with_buckets([1.0, 2.0]);
        let monitor = Monitor::new(&config).unwrap();
        monitor.observe("/m", 1.5);

        let text = monitor.registry().render().unwrap();
        let series = "app_response_latency_millisecond_bucket{endpoint=\"/m\",method=\"rpc\",process=\"1\"";
        assert!(text.contains(&format!("{series},le=\"1\"}} 0")));
        assert!(text.contains(&format!("{series},le=\"2\"}} 1")));
        assert!(!text.contains(&format!("{series},le=\"10\"}}")));

        let bad = MonitorConfig::new("app", 1, "memory://").with_buckets([2.0, 1.0]);
        assert!(matches!(Monitor::new(&bad), Err(ConfigError::Buckets)));
    }

    #[test]
    fn monitors_share_a_registry() {
        let registry = MetricsRegistry::new();
        let first =
            Monitor::with_registry(&MonitorConfig::new("first", 1, "memory://"), registry.clone())
                .unwrap();
        let second =
            Monitor::with_registry(&MonitorConfig::new("second", 2, "memory://"), registry.clone())
                .unwrap();
        first.record_request("/m");
        second.record_request("/m");

        let text = registry.render().unwrap();
        assert!(text.contains("first_requests_total{endpoint=\"/m\",method=\"rpc\",process=\"1\"} 1"));
        assert!(text.contains("second_requests_total{endpoint=\"/m\",method=\"rpc\",process=\"2\"} 1"));
    }
}
