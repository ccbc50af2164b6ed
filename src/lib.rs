//! Intercept Flair training logs, parse the metrics out of them, and forward
//! them to an experiment tracker.

pub mod bridge;
pub mod config;
pub mod interceptor;
pub mod logging;
pub mod metrics;
pub mod observer;
pub mod parser;
pub mod replay;
pub mod signals;
pub mod tracking;

pub use interceptor::{with_sink, InterceptingSink, SinkGuard};
pub use observer::{ForwardingObserver, MetricsObserver, NullObserver};
pub use parser::{LineParser, MetricEvent};
