/// MLflow tracking backend.
///
/// Sends each metric with the REST `runs/log-metric` call against an existing
/// run. The run is owned by whoever started the experiment; this sink only
/// needs its id.
use crate::config::TrackingConfig;
use crate::metrics::{MetricsError, MetricsSink};
use serde::Serialize;
use std::time::Duration;

const LOG_METRIC_PATH: &str = "/api/2.0/mlflow/runs/log-metric";

/// Environment variables consulted when the config leaves a field unset.
pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";
pub const RUN_ID_ENV: &str = "MLFLOW_RUN_ID";

#[derive(Debug, Serialize, PartialEq)]
struct LogMetricRequest<'a> {
    run_id: &'a str,
    key: &'a str,
    value: f64,
    timestamp: i64,
    step: i64,
}

/// Records metrics against one MLflow run.
#[derive(Debug)]
pub struct MlflowSink {
    client: reqwest::blocking::Client,
    endpoint: String,
    run_id: String,
}

impl MlflowSink {
    pub fn new(
        tracking_uri: &str,
        run_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, MetricsError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: log_metric_endpoint(tracking_uri),
            run_id: run_id.into(),
        })
    }

    /// Build from config, falling back to `MLFLOW_TRACKING_URI` / `MLFLOW_RUN_ID`.
    pub fn from_config(config: &TrackingConfig) -> Result<Self, MetricsError> {
        let uri = resolve(config.uri.as_deref(), TRACKING_URI_ENV).ok_or_else(|| {
            MetricsError::Config(format!(
                "no tracking uri: set [tracking] uri or {TRACKING_URI_ENV}"
            ))
        })?;
        let run_id = resolve(config.run_id.as_deref(), RUN_ID_ENV).ok_or_else(|| {
            MetricsError::Config(format!("no run id: set [tracking] run_id or {RUN_ID_ENV}"))
        })?;
        Self::new(&uri, run_id, Duration::from_secs(config.timeout_secs))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

fn resolve(configured: Option<&str>, env_var: &str) -> Option<String> {
    let non_blank = |value: &String| !value.trim().is_empty();
    configured
        .map(str::to_string)
        .filter(non_blank)
        .or_else(|| std::env::var(env_var).ok().filter(non_blank))
}

fn log_metric_endpoint(tracking_uri: &str) -> String {
    format!("{}{}", tracking_uri.trim_end_matches('/'), LOG_METRIC_PATH)
}

impl MetricsSink for MlflowSink {
    fn record(&self, name: &str, value: f64) -> Result<(), MetricsError> {
        let body = LogMetricRequest {
            run_id: &self.run_id,
            key: name,
            value,
            timestamp: chrono::Utc::now().timestamp_millis(),
            step: 0,
        };
        let response = self.client.post(&self.endpoint).json(&body).send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            tracing::warn!(metric = name, status = status.as_u16(), "mlflow rejected metric");
            return Err(MetricsError::Status {
                code: status.as_u16(),
                body,
            });
        }
        tracing::debug!(metric = name, value, "metric sent to mlflow");
        Ok(())
    }
}
