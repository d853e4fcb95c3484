//! Prometheus text exposition of a [`Monitor`](crate::Monitor)'s instruments.
//!
//! Every [`MetricsRegistry`] owns its own `opentelemetry_sdk` meter provider instead of
//! installing a global one, so several monitors (and tests) can coexist in one process. The
//! provider's reader pushes each collection to an exporter that keeps only the latest
//! rendering.

use std::fmt;
use std::fmt::Write;
use std::future::Future;
use std::future::ready;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::Meter;
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::metrics::PeriodicReader;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::metrics::Temporality;
use opentelemetry_sdk::metrics::data::AggregatedMetrics;
use opentelemetry_sdk::metrics::data::MetricData;
use opentelemetry_sdk::metrics::data::ResourceMetrics;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;

use crate::error::ConfigError;

const METER_NAME: &str = "tower_guard";
const MAX_NAMESPACE_LEN: usize = 200;

/// Collecting the registry's instruments failed.
#[derive(Debug, thiserror::Error)]
#[error("metrics collection failed: {0}")]
pub struct ExportError(String);

/// Turns an application name into a metric name prefix.
///
/// Characters outside `[A-Za-z0-9_]` become `_`. The result must start with a letter, as
/// OpenTelemetry drops instruments whose names do not.
pub(crate) fn namespace(application: &str) -> Result<String, ConfigError> {
    let name: String = application
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) || name.len() > MAX_NAMESPACE_LEN {
        return Err(ConfigError::MetricName(application.to_owned()));
    }
    Ok(name)
}

/// Bucket boundaries must be non-empty, finite and strictly increasing.
pub(crate) fn validate_buckets(buckets: &[f64]) -> Result<(), ConfigError> {
    let ordered = buckets.windows(2).all(|pair| pair[0] < pair[1]);
    if buckets.is_empty() || !ordered || buckets.iter().any(|b| !b.is_finite()) {
        return Err(ConfigError::Buckets);
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
struct Exposition {
    latest: Arc<Mutex<String>>,
}

impl PushMetricExporter for Exposition {
    fn export(&self, metrics: &ResourceMetrics) -> impl Future<Output = OTelSdkResult> + Send {
        let text = render(metrics);
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = text;
        ready(Ok(()))
    }

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        Ok(())
    }

    fn temporality(&self) -> Temporality {
        Temporality::Cumulative
    }
}

/// A meter provider whose instruments can be rendered for `GET /metrics`.
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    provider: SdkMeterProvider,
    exposition: Exposition,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let exposition = Exposition::default();
        let reader = PeriodicReader::builder(exposition.clone()).build();
        let provider = SdkMeterProvider::builder().with_reader(reader).build();
        Self {
            provider,
            exposition,
        }
    }

    /// The meter instruments are created from. Instruments built from any other meter are
    /// not rendered.
    pub fn meter(&self) -> Meter {
        self.provider.meter(METER_NAME)
    }

    /// Collects every instrument now and renders it in the Prometheus text format.
    pub fn render(&self) -> Result<String, ExportError> {
        self.provider
            .force_flush()
            .map_err(|err| ExportError(err.to_string()))?;
        Ok(self
            .exposition
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

fn render(metrics: &ResourceMetrics) -> String {
    let mut out = String::new();
    for scope in metrics.scope_metrics() {
        for metric in scope.metrics() {
            let name = metric.name();
            match metric.data() {
                AggregatedMetrics::U64(MetricData::Sum(sum)) => {
                    write_header(&mut out, name, metric.description(), "counter");
                    for point in sum.data_points() {
                        let labels = labels(point.attributes());
                        write_sample(&mut out, name, &labels, None, point.value());
                    }
                }
                AggregatedMetrics::F64(MetricData::Histogram(histogram)) => {
                    write_header(&mut out, name, metric.description(), "histogram");
                    let bucket = format!("{name}_bucket");
                    for point in histogram.data_points() {
                        let labels = labels(point.attributes());
                        let mut cumulative = 0_u64;
                        for (bound, count) in point.bounds().zip(point.bucket_counts()) {
                            cumulative += count;
                            let le = bound.to_string();
                            write_sample(&mut out, &bucket, &labels, Some(&le), cumulative);
                        }
                        write_sample(&mut out, &bucket, &labels, Some("+Inf"), point.count());
                        write_sample(&mut out, &format!("{name}_sum"), &labels, None, point.sum());
                        let count = format!("{name}_count");
                        write_sample(&mut out, &count, &labels, None, point.count());
                    }
                }
                // Monitors only record u64 counters and f64 histograms.
                _ => {}
            }
        }
    }
    out
}

/// Label pairs sorted by name.
fn labels<'a>(attributes: impl Iterator<Item = &'a KeyValue>) -> Vec<(String, String)> {
    let mut labels: Vec<(String, String)> = attributes
        .map(|kv| (kv.key.as_str().to_owned(), kv.value.as_str().into_owned()))
        .collect();
    labels.sort();
    labels
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    if !help.is_empty() {
        let _ = writeln!(out, "# HELP {name} {}", help.replace('\n', " "));
    }
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn write_sample(
    out: &mut String,
    name: &str,
    labels: &[(String, String)],
    le: Option<&str>,
    value: impl fmt::Display,
) {
    let mut pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape(v)))
        .collect();
    if let Some(le) = le {
        pairs.push(format!("le=\"{le}\""));
    }
    if pairs.is_empty() {
        let _ = writeln!(out, "{name} {value}");
    } else {
        let _ = writeln!(out, "{name}{{{}}} {value}", pairs.join(","));
    }
}
