/// Named-logger registry: the upstream logging subsystem sinks attach to.
///
/// Loggers are addressed by `::`-separated names. A record logged on
/// `flair::trainers` is delivered to the sinks of `flair::trainers` and then
/// to those of `flair`, each filtered by the sink's own threshold.
use crate::metrics::MetricsError;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};
use tracing::Level;

/// Errors a sink can return from a write.
#[derive(Debug)]
pub enum SinkError {
    /// A metrics hook failed while dispatching a parsed event.
    Metrics(MetricsError),
    /// The pass-through writer failed.
    Io(std::io::Error),
    /// The sink is already registered with a logger.
    AlreadyAttached { logger: String },
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Metrics(e) => write!(f, "metric dispatch failed: {e}"),
            SinkError::Io(e) => write!(f, "pass-through write failed: {e}"),
            SinkError::AlreadyAttached { logger } => {
                write!(f, "sink is already attached to logger `{logger}`")
            }
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Metrics(e) => Some(e),
            SinkError::Io(e) => Some(e),
            SinkError::AlreadyAttached { .. } => None,
        }
    }
}

impl From<MetricsError> for SinkError {
    fn from(e: MetricsError) -> Self {
        SinkError::Metrics(e)
    }
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e)
    }
}

/// A destination for formatted log text.
pub trait LogSink: Send + Sync {
    /// Receives exactly the text of one formatted record.
    fn write(&self, text: &str) -> Result<(), SinkError>;
}

/// Identifies one sink registration; needed to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// One log record as handed to a formatter.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub logger: &'a str,
    pub level: Level,
    pub message: &'a str,
}

/// How a record is rendered before it reaches a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Formatter {
    /// The raw message, newline-terminated.
    #[default]
    MessageOnly,
    /// `LEVEL logger: message`, newline-terminated.
    LevelPrefixed,
}

impl Formatter {
    pub fn format(&self, record: &Record<'_>) -> String {
        match self {
            Formatter::MessageOnly => format!("{}\n", record.message),
            Formatter::LevelPrefixed => {
                format!("{} {}: {}\n", record.level, record.logger, record.message)
            }
        }
    }
}

struct Registration {
    handle: ListenerHandle,
    sink: Arc<dyn LogSink>,
    formatter: Formatter,
    threshold: Level,
}

#[derive(Default)]
struct RegistryState {
    loggers: HashMap<String, Vec<Registration>>,
    next_id: u64,
}

/// A set of named loggers and their sinks.
///
/// Cloning shares the same underlying registry.
#[derive(Clone, Default)]
pub struct LoggerRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl LoggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logger(&self, name: &str) -> Logger {
        Logger {
            name: name.to_string(),
            registry: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Registrations are only pushed or removed whole, so a poisoned
        // lock still guards consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

static GLOBAL_REGISTRY: LazyLock<LoggerRegistry> = LazyLock::new(LoggerRegistry::new);

/// The process-wide registry.
pub fn registry() -> &'static LoggerRegistry {
    &GLOBAL_REGISTRY
}

/// Look up a logger on the process-wide registry.
pub fn get_logger(name: &str) -> Logger {
    GLOBAL_REGISTRY.logger(name)
}

/// `a::b::c` -> `a::b::c`, `a::b`, `a`
fn lineage(name: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(name);
    std::iter::from_fn(move || {
        let current = next?;
        next = current.rfind("::").map(|idx| &current[..idx]);
        Some(current)
    })
}

/// Handle to one named logger.
#[derive(Clone)]
pub struct Logger {
    name: String,
    registry: LoggerRegistry,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").field("name", &self.name).finish()
    }
}

impl Logger {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `sink` to receive records at `threshold` or more severe.
    pub fn add_sink(
        &self,
        sink: Arc<dyn LogSink>,
        formatter: Formatter,
        threshold: Level,
    ) -> ListenerHandle {
        let mut state = self.registry.lock();
        state.next_id += 1;
        let handle = ListenerHandle(state.next_id);
        state
            .loggers
            .entry(self.name.clone())
            .or_default()
            .push(Registration {
                handle,
                sink,
                formatter,
                threshold,
            });
        handle
    }

    /// Remove a registration. Returns `false` if the handle was not registered here.
    pub fn remove_sink(&self, handle: ListenerHandle) -> bool {
        let mut state = self.registry.lock();
        let Some(registrations) = state.loggers.get_mut(&self.name) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.handle != handle);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            state.loggers.remove(&self.name);
        }
        removed
    }

    /// Sinks registered directly on this logger (ancestors not counted).
    pub fn sink_count(&self) -> usize {
        self.registry
            .lock()
            .loggers
            .get(&self.name)
            .map_or(0, Vec::len)
    }

    pub fn handles(&self) -> Vec<ListenerHandle> {
        self.registry
            .lock()
            .loggers
            .get(&self.name)
            .map(|regs| regs.iter().map(|r| r.handle).collect())
            .unwrap_or_default()
    }

    /// Deliver a record to every admitting sink on this logger and its ancestors.
    ///
    /// Sinks run outside the registry lock. The first sink error stops delivery
    /// and is returned to the caller.
    pub fn log(&self, level: Level, message: &str) -> Result<(), SinkError> {
        let targets: Vec<(Arc<dyn LogSink>, Formatter)> = {
            let state = self.registry.lock();
            lineage(&self.name)
                .filter_map(|name| state.loggers.get(name))
                .flatten()
                // more severe levels compare lower
                .filter(|r| level <= r.threshold)
                .map(|r| (Arc::clone(&r.sink), r.formatter))
                .collect()
        };

        let record = Record {
            logger: &self.name,
            level,
            message,
        };
        for (sink, formatter) in targets {
            sink.write(&formatter.format(&record))?;
        }
        Ok(())
    }

    pub fn info(&self, message: &str) -> Result<(), SinkError> {
        self.log(Level::INFO, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl Collect {
        fn texts(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    impl LogSink for Collect {
        fn write(&self, text: &str) -> Result<(), SinkError> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    struct Failing;

    impl LogSink for Failing {
        fn write(&self, _text: &str) -> Result<(), SinkError> {
            Err(SinkError::Metrics(MetricsError::Rejected("nope".into())))
        }
    }

    #[test]
    fn test_lineage() {
        let names: Vec<&str> = lineage("flair::trainers::trainer").collect();
        assert_eq!(names, vec!["flair::trainers::trainer", "flair::trainers", "flair"]);
        assert_eq!(lineage("flair").collect::<Vec<_>>(), vec!["flair"]);
    }

    #[test]
    fn test_add_and_remove_restores_sink_set() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let other = Arc::new(Collect::default());
        let existing = logger.add_sink(other, Formatter::MessageOnly, Level::INFO);
        assert_eq!(logger.handles(), vec![existing]);

        let handle = logger.add_sink(
            Arc::new(Collect::default()),
            Formatter::MessageOnly,
            Level::INFO,
        );
        assert_eq!(logger.sink_count(), 2);
        assert!(logger.remove_sink(handle));
        assert_eq!(logger.handles(), vec![existing]);
    }

    #[test]
    fn test_remove_unknown_handle_is_noop() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let handle = logger.add_sink(
            Arc::new(Collect::default()),
            Formatter::MessageOnly,
            Level::INFO,
        );
        assert!(logger.remove_sink(handle));
        assert!(!logger.remove_sink(handle));
        assert!(!registry.logger("other").remove_sink(handle));
    }

    #[test]
    fn test_threshold_filters_verbose_records() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        let sink = Arc::new(Collect::default());
        logger.add_sink(sink.clone(), Formatter::MessageOnly, Level::INFO);

        logger.log(Level::DEBUG, "debug detail").unwrap();
        logger.log(Level::INFO, "info line").unwrap();
        logger.log(Level::WARN, "warn line").unwrap();
        assert_eq!(sink.texts(), vec!["info line\n", "warn line\n"]);
    }

    #[test]
    fn test_child_records_propagate_to_parent() {
        let registry = LoggerRegistry::new();
        let parent_sink = Arc::new(Collect::default());
        registry
            .logger("flair")
            .add_sink(parent_sink.clone(), Formatter::MessageOnly, Level::INFO);

        registry
            .logger("flair::trainers")
            .info("EPOCH 1 done: loss 0.5 - lr 0.1")
            .unwrap();
        registry.logger("flairish").info("not a child").unwrap();
        assert_eq!(parent_sink.texts(), vec!["EPOCH 1 done: loss 0.5 - lr 0.1\n"]);
    }

    #[test]
    fn test_level_prefixed_formatter() {
        let record = Record {
            logger: "flair",
            level: Level::WARN,
            message: "careful",
        };
        assert_eq!(Formatter::LevelPrefixed.format(&record), "WARN flair: careful\n");
        assert_eq!(Formatter::MessageOnly.format(&record), "careful\n");
    }

    #[test]
    fn test_first_sink_error_is_returned() {
        let registry = LoggerRegistry::new();
        let logger = registry.logger("flair");
        logger.add_sink(Arc::new(Failing), Formatter::MessageOnly, Level::INFO);
        let after = Arc::new(Collect::default());
        logger.add_sink(after.clone(), Formatter::MessageOnly, Level::INFO);

        assert!(matches!(logger.info("x"), Err(SinkError::Metrics(_))));
        assert!(after.texts().is_empty());
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = LoggerRegistry::new();
        let b = LoggerRegistry::new();
        a.logger("flair").add_sink(
            Arc::new(Collect::default()),
            Formatter::MessageOnly,
            Level::INFO,
        );
        assert_eq!(a.logger("flair").sink_count(), 1);
        assert_eq!(b.logger("flair").sink_count(), 0);
    }
}
