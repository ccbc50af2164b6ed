/// Route `tracing` events into the logger registry.
///
/// With this layer installed, `tracing::info!(target: "flair", "...")` from
/// in-process training code reaches whatever sinks are attached to the
/// `flair` logger, exactly as if it had been logged on the registry directly.
use crate::logging::LoggerRegistry;
use std::cell::Cell;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

thread_local! {
    // Set while a bridged record is being delivered, so sinks that emit
    // tracing events of their own are not fed back into the registry.
    static IN_BRIDGE: Cell<bool> = const { Cell::new(false) };
}

/// Layer that forwards each event's `message` to the logger named by its target.
#[derive(Clone)]
pub struct LoggerBridgeLayer {
    registry: LoggerRegistry,
    dropped: Arc<AtomicU64>,
}

impl LoggerBridgeLayer {
    pub fn new(registry: LoggerRegistry) -> Self {
        Self {
            registry,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records a sink refused. A layer has nowhere to return errors to.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for LoggerBridgeLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if IN_BRIDGE.with(Cell::get) {
            return;
        }

        let meta = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        IN_BRIDGE.with(|flag| flag.set(true));
        let result = self
            .registry
            .logger(meta.target())
            .log(*meta.level(), &visitor.message);
        IN_BRIDGE.with(|flag| flag.set(false));

        if result.is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::InterceptingSink;
    use crate::metrics::RecordingSink;
    use crate::observer::ForwardingObserver;
    use tracing_subscriber::prelude::*;

    #[test]
    fn test_tracing_events_reach_attached_sink() {
        let registry = LoggerRegistry::new();
        let layer = LoggerBridgeLayer::new(registry.clone());
        let subscriber = tracing_subscriber::registry().with(layer);

        let sink = Arc::new(InterceptingSink::new(ForwardingObserver::new(
            RecordingSink::new(),
        )));
        let _guard = sink.attach_to(&registry.logger("flair")).unwrap();

        tracing::subscriber::with_default(subscriber, || {
            let epoch = 4;
            tracing::info!(target: "flair", "EPOCH {} done: loss {} - lr {}", epoch, 0.25, 0.1);
            tracing::info!(target: "flair::trainers", "DEV : loss 0.2 - score 0.9");
            tracing::debug!(target: "flair", "EPOCH 9 done: loss 0.1 - lr 0.1");
            tracing::info!(target: "unrelated", "EPOCH 8 done: loss 0.1 - lr 0.1");
        });

        let recorder = sink.observer().sink();
        assert_eq!(
            recorder.names(),
            vec!["epoch_num", "train_loss", "train_lr", "dev_loss", "dev_score"]
        );
        assert_eq!(recorder.value("epoch_num"), Some(4.0));
        assert_eq!(
            sink.contents(),
            "EPOCH 4 done: loss 0.25 - lr 0.1\nDEV : loss 0.2 - score 0.9\n"
        );
    }

    #[test]
    fn test_sink_errors_are_counted() {
        let registry = LoggerRegistry::new();
        let layer = LoggerBridgeLayer::new(registry.clone());
        let counter = layer.clone();
        let subscriber = tracing_subscriber::registry().with(layer);

        let sink = Arc::new(InterceptingSink::new(ForwardingObserver::new(
            RecordingSink::failing_on("f1_micro"),
        )));
        let _guard = sink.attach_to(&registry.logger("flair")).unwrap();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "flair", "- F1-score (micro) 0.91");
            tracing::info!(target: "flair", "- F1-score (macro) 0.87");
        });

        assert_eq!(counter.dropped(), 1);
        assert_eq!(sink.observer().sink().names(), vec!["f1_macro"]);
    }

    #[test]
    fn test_visitor_takes_message_field_only() {
        let registry = LoggerRegistry::new();
        let subscriber =
            tracing_subscriber::registry().with(LoggerBridgeLayer::new(registry.clone()));
        let sink = Arc::new(InterceptingSink::new(crate::observer::NullObserver));
        let _guard = sink.attach_to(&registry.logger("flair")).unwrap();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "flair", epoch = 3, "plain message");
        });
        assert_eq!(sink.contents(), "plain message\n");
    }
}
