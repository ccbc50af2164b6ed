//! Log interception: a sink that parses Flair log text and dispatches metric hooks.
//!
//! The sink registers with a named logger for the lifetime of a [`SinkGuard`].
//! Each write is parsed, every resulting event is handed to the observer in
//! order, and the original text is then passed through to an inner writer, so
//! other consumers of the same stream see it unchanged.
//!
//! ```no_run
//! use flairflow::interceptor::with_sink;
//! use flairflow::metrics::TracingSink;
//! use flairflow::observer::ForwardingObserver;
//!
//! let scoped = with_sink("flair", ForwardingObserver::new(TracingSink), |logger| {
//!     logger.info("EPOCH 1 done: loss 0.5 - lr 0.1")
//! })
//! .unwrap();
//! assert!(scoped.value.is_ok());
//! ```

use crate::logging::{self, Formatter, ListenerHandle, LogSink, Logger, SinkError};
use crate::observer::MetricsObserver;
use crate::parser::LineParser;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::Level;

/// Severity threshold the sink registers with.
pub const ATTACH_THRESHOLD: Level = Level::INFO;

/// Write target that parses, dispatches, then passes text through to `W`.
pub struct InterceptingSink<O, W = Vec<u8>> {
    parser: LineParser,
    observer: O,
    inner: Mutex<W>,
    attached: Arc<AtomicBool>,
}

impl<O: MetricsObserver> InterceptingSink<O> {
    /// A sink that buffers pass-through text in memory.
    pub fn new(observer: O) -> Self {
        Self::with_writer(observer, Vec::new())
    }

    /// Everything passed through so far, lossily decoded.
    pub fn contents(&self) -> String {
        let buffer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl<O: MetricsObserver, W: Write + Send> InterceptingSink<O, W> {
    pub fn with_writer(observer: O, writer: W) -> Self {
        Self {
            parser: LineParser::new(),
            observer,
            inner: Mutex::new(writer),
            attached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the rule table used for parsing.
    pub fn with_parser(mut self, parser: LineParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Handle one write from the logging subsystem.
    ///
    /// `text` may be a partial line, one line, or several lines. Hooks run
    /// synchronously in event order; a hook error aborts the write and is
    /// returned. A detached sink only passes text through.
    pub fn consume(&self, text: &str) -> Result<(), SinkError> {
        if self.is_attached() {
            for event in self.parser.parse(text) {
                tracing::trace!(kind = %event.kind(), "dispatching metric event");
                self.observer.on_event(&event)?;
            }
        }

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.write_all(text.as_bytes())?;
        inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<O, W> InterceptingSink<O, W>
where
    O: MetricsObserver + 'static,
    W: Write + Send + 'static,
{
    /// Attach to a logger on the process-wide registry.
    pub fn attach(self: &Arc<Self>, logger_name: &str) -> Result<SinkGuard, SinkError> {
        self.attach_to(&logging::get_logger(logger_name))
    }

    /// Register with `logger` at INFO and above, message text only.
    ///
    /// One attachment at a time: attaching an already attached sink fails
    /// with [`SinkError::AlreadyAttached`].
    pub fn attach_to(self: &Arc<Self>, logger: &Logger) -> Result<SinkGuard, SinkError> {
        if self
            .attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SinkError::AlreadyAttached {
                logger: logger.name().to_string(),
            });
        }

        let sink: Arc<dyn LogSink> = Arc::clone(self) as Arc<dyn LogSink>;
        let handle = logger.add_sink(sink, Formatter::MessageOnly, ATTACH_THRESHOLD);
        tracing::debug!(logger = logger.name(), ?handle, "interceptor attached");

        Ok(SinkGuard {
            logger: logger.clone(),
            handle: Some(handle),
            attached: Arc::clone(&self.attached),
        })
    }
}

impl<O, W> LogSink for InterceptingSink<O, W>
where
    O: MetricsObserver,
    W: Write + Send,
{
    fn write(&self, text: &str) -> Result<(), SinkError> {
        self.consume(text)
    }
}

/// Keeps an interceptor registered; detaches on `detach()` or drop.
///
/// Drop runs on every exit path, including `?` returns and panics, so the
/// registration never outlives the scope that created it.
#[must_use = "dropping the guard detaches the sink immediately"]
pub struct SinkGuard {
    logger: Logger,
    handle: Option<ListenerHandle>,
    attached: Arc<AtomicBool>,
}

impl SinkGuard {
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn handle(&self) -> Option<ListenerHandle> {
        self.handle
    }

    /// Detach now instead of at end of scope.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // Stop dispatch before unregistering so in-flight writes see a detached sink.
        self.attached.store(false, Ordering::Release);
        let removed = self.logger.remove_sink(handle);
        tracing::debug!(
            logger = self.logger.name(),
            ?handle,
            removed,
            "interceptor detached"
        );
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SinkGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkGuard")
            .field("logger", &self.logger.name())
            .field("handle", &self.handle)
            .finish()
    }
}

/// Result of a [`with_sink`] scope.
#[derive(Debug)]
pub struct Scoped<T> {
    /// What the body returned.
    pub value: T,
    /// Text the sink passed through while attached.
    pub passthrough: String,
}

/// Attach an interceptor to `logger_name` on the process-wide registry, run
/// `body`, and detach on the way out.
pub fn with_sink<O, T>(
    logger_name: &str,
    observer: O,
    body: impl FnOnce(&Logger) -> T,
) -> Result<Scoped<T>, SinkError>
where
    O: MetricsObserver + 'static,
{
    with_sink_on(&logging::get_logger(logger_name), observer, body)
}

/// [`with_sink`] against an explicit logger.
pub fn with_sink_on<O, T>(
    logger: &Logger,
    observer: O,
    body: impl FnOnce(&Logger) -> T,
) -> Result<Scoped<T>, SinkError>
where
    O: MetricsObserver + 'static,
{
    let sink = Arc::new(InterceptingSink::new(observer));
    let guard = sink.attach_to(logger)?;
    let value = body(logger);
    guard.detach();
    Ok(Scoped {
        value,
        passthrough: sink.contents(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LoggerRegistry;
    use crate::metrics::{MetricsError, RecordingSink};
    use crate::observer::{ForwardingObserver, NullObserver};
    use std::sync::atomic::AtomicUsize;

    /// Counts hook invocations per kind.
    #[derive(Default)]
    struct CountingObserver {
        epochs: AtomicUsize,
        devs: AtomicUsize,
        f1: AtomicUsize,
        labels: AtomicUsize,
    }

    impl CountingObserver {
        fn total(&self) -> usize {
            self.epochs.load(Ordering::SeqCst)
                + self.devs.load(Ordering::SeqCst)
                + self.f1.load(Ordering::SeqCst)
                + self.labels.load(Ordering::SeqCst)
        }
    }

    impl MetricsObserver for CountingObserver {
        fn on_epoch(&self, _: u64, _: f64, _: f64) -> Result<(), MetricsError> {
            self.epochs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_dev(&self, _: f64, _: f64) -> Result<(), MetricsError> {
            self.devs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_f1_micro(&self, _: f64) -> Result<(), MetricsError> {
            self.f1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_f1_macro(&self, _: f64) -> Result<(), MetricsError> {
            self.f1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_label(
            &self,
            _: &str,
            _: u64,
            _: u64,
            _: u64,
            _: f64,
            _: f64,
            _: f64,
        ) -> Result<(), MetricsError> {
            self.labels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn forwarding() -> Arc<InterceptingSink<ForwardingObserver<RecordingSink>>> {
        Arc::new(InterceptingSink::new(ForwardingObserver::new(
            RecordingSink::new(),
        )))
    }

    #[test]
    fn test_attach_then_detach_restores_sink_set() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let before = logger.handles();

        let sink = Arc::new(InterceptingSink::new(NullObserver));
        let guard = sink.attach_to(&logger).unwrap();
        assert!(sink.is_attached());
        assert_eq!(logger.sink_count(), before.len() + 1);

        guard.detach();
        assert!(!sink.is_attached());
        assert_eq!(logger.handles(), before);
    }

    #[test]
    fn test_guard_drop_detaches() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let sink = Arc::new(InterceptingSink::new(NullObserver));
        {
            let _guard = sink.attach_to(&logger).unwrap();
            assert_eq!(logger.sink_count(), 1);
        }
        assert_eq!(logger.sink_count(), 0);
        assert!(!sink.is_attached());
    }

    #[test]
    fn test_guard_detaches_on_panic() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let sink = Arc::new(InterceptingSink::new(NullObserver));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = sink.attach_to(&logger).unwrap();
            panic!("training crashed");
        }));
        assert!(result.is_err());
        assert_eq!(logger.sink_count(), 0);
    }

    #[test]
    fn test_double_attach_is_rejected() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let sink = Arc::new(InterceptingSink::new(NullObserver));
        let _guard = sink.attach_to(&logger).unwrap();
        let err = sink.attach_to(&logger).unwrap_err();
        assert!(matches!(err, SinkError::AlreadyAttached { .. }));
        assert_eq!(logger.sink_count(), 1);
    }

    #[test]
    fn test_reattach_gets_fresh_handle() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let sink = Arc::new(InterceptingSink::new(NullObserver));

        let first = sink.attach_to(&logger).unwrap();
        let first_handle = first.handle();
        first.detach();
        let second = sink.attach_to(&logger).unwrap();
        assert_ne!(second.handle(), first_handle);
        assert_eq!(logger.sink_count(), 1);
    }

    #[test]
    fn test_no_matches_invokes_no_hooks() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let sink = Arc::new(InterceptingSink::new(CountingObserver::default()));
        let _guard = sink.attach_to(&logger).unwrap();

        logger.info("Model training base path: resources/taggers").unwrap();
        logger.info("----------------------------------").unwrap();
        assert_eq!(sink.observer().total(), 0);
    }

    #[test]
    fn test_logged_lines_dispatch_and_pass_through() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let sink = Arc::new(InterceptingSink::new(CountingObserver::default()));
        let _guard = sink.attach_to(&logger).unwrap();

        logger.info("EPOCH 1 done: loss 0.9 - lr 0.1").unwrap();
        logger.info("DEV : loss 0.31 - score 0.88").unwrap();
        logger
            .info("- F1-score (micro) 0.91\n- F1-score (macro) 0.87")
            .unwrap();

        let observer = sink.observer();
        assert_eq!(observer.epochs.load(Ordering::SeqCst), 1);
        assert_eq!(observer.devs.load(Ordering::SeqCst), 1);
        assert_eq!(observer.f1.load(Ordering::SeqCst), 2);
        assert_eq!(
            sink.contents(),
            "EPOCH 1 done: loss 0.9 - lr 0.1\n\
             DEV : loss 0.31 - score 0.88\n\
             - F1-score (micro) 0.91\n\
             - F1-score (macro) 0.87\n"
        );
    }

    #[test]
    fn test_debug_records_below_threshold_are_ignored() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let sink = Arc::new(InterceptingSink::new(CountingObserver::default()));
        let _guard = sink.attach_to(&logger).unwrap();

        logger
            .log(Level::DEBUG, "EPOCH 1 done: loss 0.9 - lr 0.1")
            .unwrap();
        assert_eq!(sink.observer().total(), 0);
        assert_eq!(sink.contents(), "");
    }

    #[test]
    fn test_writes_after_detach_reach_no_hook() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let sink = Arc::new(InterceptingSink::new(CountingObserver::default()));
        let guard = sink.attach_to(&logger).unwrap();
        guard.detach();

        logger.info("EPOCH 1 done: loss 0.9 - lr 0.1").unwrap();
        // writing straight into the orphaned sink dispatches nothing either
        sink.write("EPOCH 2 done: loss 0.8 - lr 0.1\n").unwrap();
        assert_eq!(sink.observer().total(), 0);
    }

    #[test]
    fn test_forwarding_epoch_records_three_metrics() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let sink = forwarding();
        let _guard = sink.attach_to(&logger).unwrap();

        logger.info("EPOCH 3 done: loss 0.452 - lr 0.05").unwrap();
        assert_eq!(
            sink.observer().sink().records(),
            vec![
                ("epoch_num".to_string(), 3.0),
                ("train_loss".to_string(), 0.452),
                ("train_lr".to_string(), 0.05),
            ]
        );
    }

    #[test]
    fn test_consume_handles_multi_line_chunk_in_order() {
        let sink = forwarding();
        let _guard = sink.attach_to(&LoggerRegistry::new().logger("flair")).unwrap();

        sink.consume("EPOCH 1 done: loss 0.9 - lr 0.1\nEPOCH 2 done: loss 0.7 - lr 0.05\n")
            .unwrap();
        let records = sink.observer().sink().records();
        let epochs: Vec<f64> = records
            .iter()
            .filter(|(name, _)| name == "epoch_num")
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(epochs, vec![1.0, 2.0]);
    }

    #[test]
    fn test_hook_failure_propagates_to_log_call() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let sink = Arc::new(InterceptingSink::new(ForwardingObserver::new(
            RecordingSink::failing_on("dev_score"),
        )));
        let _guard = sink.attach_to(&logger).unwrap();

        let err = logger.info("DEV : loss 0.31 - score 0.88").unwrap_err();
        assert!(matches!(err, SinkError::Metrics(_)));
        assert_eq!(sink.observer().sink().names(), vec!["dev_loss"]);
    }

    #[test]
    fn test_malformed_match_does_not_fail_write() {
        let sink = forwarding();
        let _guard = sink.attach_to(&LoggerRegistry::new().logger("flair")).unwrap();
        sink.consume("- F1-score (micro) 0..9\n- F1-score (macro) 0.87\n")
            .unwrap();
        assert_eq!(sink.observer().sink().names(), vec!["f1_macro"]);
    }

    #[test]
    fn test_custom_writer_receives_pass_through() {
        let sink = InterceptingSink::with_writer(NullObserver, Vec::new());
        sink.consume("partial li").unwrap();
        sink.consume("ne\n").unwrap();
        assert_eq!(sink.into_inner(), b"partial line\n".to_vec());
    }

    #[test]
    fn test_with_sink_on_detaches_and_returns_passthrough() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");

        let scoped = with_sink_on(&logger, CountingObserver::default(), |logger| {
            logger.info("EPOCH 1 done: loss 0.9 - lr 0.1").unwrap();
            logger.sink_count()
        })
        .unwrap();
        assert_eq!(scoped.value, 1);
        assert_eq!(scoped.passthrough, "EPOCH 1 done: loss 0.9 - lr 0.1\n");
        assert_eq!(logger.sink_count(), 0);
    }

    #[test]
    fn test_with_sink_global_registry() {
        let name = "flairflow-test::with_sink_global";
        let scoped = with_sink(name, NullObserver, |logger| {
            logger.info("DEV : loss 0.1 - score 0.9").unwrap();
        })
        .unwrap();
        assert_eq!(scoped.passthrough, "DEV : loss 0.1 - score 0.9\n");
        assert_eq!(logging::get_logger(name).sink_count(), 0);
    }
}
