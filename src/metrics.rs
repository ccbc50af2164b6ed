/// Metric recording backends.
///
/// A `MetricsSink` records one named numeric value per call. The interceptor
/// never retries or awaits these calls; a sink that talks to a remote service
/// owns its own timeouts.
use std::sync::{Arc, Mutex, PoisonError};

/// Errors produced by metric sinks.
#[derive(Debug)]
pub enum MetricsError {
    /// Transport-level failure talking to the tracking server.
    Http(reqwest::Error),
    /// The tracking server answered with a non-success status.
    Status { code: u16, body: String },
    /// The sink is missing settings it needs (run id, tracking uri).
    Config(String),
    /// The sink refused the metric.
    Rejected(String),
}

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsError::Http(e) => write!(f, "tracking request failed: {e}"),
            MetricsError::Status { code, body } => {
                write!(f, "tracking server returned {code}: {body}")
            }
            MetricsError::Config(msg) => write!(f, "metrics sink misconfigured: {msg}"),
            MetricsError::Rejected(msg) => write!(f, "metric rejected: {msg}"),
        }
    }
}

impl std::error::Error for MetricsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MetricsError::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for MetricsError {
    fn from(e: reqwest::Error) -> Self {
        MetricsError::Http(e)
    }
}

/// Records named numeric metrics.
pub trait MetricsSink: Send + Sync {
    /// Record `value` under `name`. Fire-and-forget from the caller's side.
    fn record(&self, name: &str, value: f64) -> Result<(), MetricsError>;
}

impl<S: MetricsSink + ?Sized> MetricsSink for Box<S> {
    fn record(&self, name: &str, value: f64) -> Result<(), MetricsError> {
        (**self).record(name, value)
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for Arc<S> {
    fn record(&self, name: &str, value: f64) -> Result<(), MetricsError> {
        (**self).record(name, value)
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for &S {
    fn record(&self, name: &str, value: f64) -> Result<(), MetricsError> {
        (**self).record(name, value)
    }
}

/// Emits each metric as a structured `tracing` event instead of sending it anywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, name: &str, value: f64) -> Result<(), MetricsError> {
        tracing::info!(target: "flairflow::metrics", metric = name, value, "metric recorded");
        Ok(())
    }
}

/// Captures every recorded metric in memory, in call order.
///
/// Optionally fails on one metric name to exercise error propagation.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<(String, f64)>>,
    fail_on: Option<String>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that rejects any metric called `name` (and records nothing for it).
    pub fn failing_on(name: impl Into<String>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_on: Some(name.into()),
        }
    }

    pub fn records(&self) -> Vec<(String, f64)> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.records().into_iter().map(|(name, _)| name).collect()
    }

    /// Last value recorded under `name`, if any.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.records()
            .into_iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetricsSink for RecordingSink {
    fn record(&self, name: &str, value: f64) -> Result<(), MetricsError> {
        if self.fail_on.as_deref() == Some(name) {
            return Err(MetricsError::Rejected(format!("{name} is not accepted")));
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), value));
        Ok(())
    }
}
