/// Per-event hooks invoked by the interceptor.
///
/// Every hook defaults to a no-op, so an observer only overrides the kinds it
/// cares about. `on_event` routes a parsed event to its hook.
use crate::metrics::{MetricsError, MetricsSink};
use crate::parser::MetricEvent;

pub trait MetricsObserver: Send + Sync {
    fn on_epoch(
        &self,
        _epoch_num: u64,
        _train_loss: f64,
        _train_lr: f64,
    ) -> Result<(), MetricsError> {
        Ok(())
    }

    fn on_dev(&self, _dev_loss: f64, _dev_score: f64) -> Result<(), MetricsError> {
        Ok(())
    }

    fn on_f1_micro(&self, _f1_micro: f64) -> Result<(), MetricsError> {
        Ok(())
    }

    fn on_f1_macro(&self, _f1_macro: f64) -> Result<(), MetricsError> {
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn on_label(
        &self,
        _label: &str,
        _tp: u64,
        _fp: u64,
        _fn: u64,
        _precision: f64,
        _recall: f64,
        _f1: f64,
    ) -> Result<(), MetricsError> {
        Ok(())
    }

    /// Dispatch one event to the matching hook.
    fn on_event(&self, event: &MetricEvent) -> Result<(), MetricsError> {
        match event {
            MetricEvent::Epoch {
                epoch_num,
                train_loss,
                train_lr,
            } => self.on_epoch(*epoch_num, *train_loss, *train_lr),
            MetricEvent::Dev {
                dev_loss,
                dev_score,
            } => self.on_dev(*dev_loss, *dev_score),
            MetricEvent::F1Micro { f1_micro } => self.on_f1_micro(*f1_micro),
            MetricEvent::F1Macro { f1_macro } => self.on_f1_macro(*f1_macro),
            MetricEvent::Label {
                label,
                tp,
                fp,
                fn_,
                precision,
                recall,
                f1,
            } => self.on_label(label, *tp, *fp, *fn_, *precision, *recall, *f1),
        }
    }
}

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl MetricsObserver for NullObserver {}

/// Forwards each event field to a `MetricsSink`, one `record` call per field.
///
/// Label rows are namespaced by the label: `PER_tp`, `PER_precision`, ...
#[derive(Debug)]
pub struct ForwardingObserver<S> {
    sink: S,
}

impl<S: MetricsSink> ForwardingObserver<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl<S: MetricsSink> MetricsObserver for ForwardingObserver<S> {
    fn on_epoch(
        &self,
        epoch_num: u64,
        train_loss: f64,
        train_lr: f64,
    ) -> Result<(), MetricsError> {
        self.sink.record("epoch_num", epoch_num as f64)?;
        self.sink.record("train_loss", train_loss)?;
        self.sink.record("train_lr", train_lr)
    }

    fn on_dev(&self, dev_loss: f64, dev_score: f64) -> Result<(), MetricsError> {
        self.sink.record("dev_loss", dev_loss)?;
        self.sink.record("dev_score", dev_score)
    }

    fn on_f1_micro(&self, f1_micro: f64) -> Result<(), MetricsError> {
        self.sink.record("f1_micro", f1_micro)
    }

    fn on_f1_macro(&self, f1_macro: f64) -> Result<(), MetricsError> {
        self.sink.record("f1_macro", f1_macro)
    }

    #[allow(clippy::too_many_arguments)]
    fn on_label(
        &self,
        label: &str,
        tp: u64,
        fp: u64,
        fn_: u64,
        precision: f64,
        recall: f64,
        f1: f64,
    ) -> Result<(), MetricsError> {
        self.sink.record(&format!("{label}_tp"), tp as f64)?;
        self.sink.record(&format!("{label}_fp"), fp as f64)?;
        self.sink.record(&format!("{label}_fn"), fn_ as f64)?;
        self.sink.record(&format!("{label}_precision"), precision)?;
        self.sink.record(&format!("{label}_recall"), recall)?;
        self.sink.record(&format!("{label}_f1"), f1)
    }
}
