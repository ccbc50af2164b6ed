/// Feed lines of a Flair training log into a named logger.
///
/// `replay` reads a finished log (file or stdin) to its end. `follow` tails a
/// log that is still being written, polling for growth until shutdown.
use crate::logging::{Logger, SinkError};
use crate::signals::ShutdownFlag;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// What to do when a sink rejects a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Stop and return the error.
    #[default]
    Abort,
    /// Log a warning, count the failure, keep going.
    Skip,
}

/// Counters for one replay or follow run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    pub lines: u64,
    pub bytes: u64,
    /// Lines a sink rejected under [`ErrorPolicy::Skip`].
    pub failed: u64,
}

#[derive(Debug)]
pub enum ReplayError {
    Io(std::io::Error),
    Sink(SinkError),
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayError::Io(e) => write!(f, "failed to read training log: {e}"),
            ReplayError::Sink(e) => write!(f, "log sink failed: {e}"),
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReplayError::Io(e) => Some(e),
            ReplayError::Sink(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for ReplayError {
    fn from(e: std::io::Error) -> Self {
        ReplayError::Io(e)
    }
}

impl From<SinkError> for ReplayError {
    fn from(e: SinkError) -> Self {
        ReplayError::Sink(e)
    }
}

/// Options for [`follow`].
#[derive(Debug, Clone, Copy)]
pub struct FollowOptions {
    pub poll_interval: Duration,
    pub from_end: bool,
}

impl Default for FollowOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            from_end: false,
        }
    }
}

struct LineFeed<'a> {
    logger: &'a Logger,
    level: Level,
    policy: ErrorPolicy,
    stats: ReplayStats,
}

impl LineFeed<'_> {
    /// Log one raw line (newline included, if any).
    fn deliver(&mut self, raw: &[u8]) -> Result<(), ReplayError> {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(&['\n', '\r'][..]);
        self.stats.lines += 1;
        self.stats.bytes += raw.len() as u64;

        match self.logger.log(self.level, line) {
            Ok(()) => Ok(()),
            Err(e) if self.policy == ErrorPolicy::Skip => {
                tracing::warn!(error = %e, line = self.stats.lines, "sink rejected log line");
                self.stats.failed += 1;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Log every line of `reader` on `logger` at `level`, until end of input or
/// `shutdown`.
///
/// The flag is checked between lines. A read that is blocked waiting for
/// input (a terminal on stdin) only sees it once that read returns.
/// Invalid UTF-8 is replaced rather than treated as an error.
pub fn replay<R: BufRead>(
    mut reader: R,
    logger: &Logger,
    level: Level,
    policy: ErrorPolicy,
    shutdown: &ShutdownFlag,
) -> Result<ReplayStats, ReplayError> {
    let mut feed = LineFeed {
        logger,
        level,
        policy,
        stats: ReplayStats::default(),
    };
    let mut buf = Vec::new();
    loop {
        if shutdown.is_triggered() {
            tracing::info!(lines = feed.stats.lines, "shutdown requested, stopping replay");
            break;
        }
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        feed.deliver(&buf)?;
    }
    tracing::debug!(lines = feed.stats.lines, bytes = feed.stats.bytes, "replay finished");
    Ok(feed.stats)
}

/// Tail `path`, logging each complete line as it appears, until `shutdown`.
///
/// On shutdown everything already written is drained and a trailing partial
/// line is delivered as-is. A file that shrinks is assumed truncated and is
/// read again from the start.
pub fn follow(
    path: &Path,
    logger: &Logger,
    level: Level,
    policy: ErrorPolicy,
    options: FollowOptions,
    shutdown: &ShutdownFlag,
) -> Result<ReplayStats, ReplayError> {
    let mut file = File::open(path)?;
    let mut position = if options.from_end {
        file.seek(SeekFrom::End(0))?
    } else {
        0
    };
    let mut reader = BufReader::new(file);
    let mut feed = LineFeed {
        logger,
        level,
        policy,
        stats: ReplayStats::default(),
    };
    let mut pending = Vec::new();

    tracing::info!(path = %path.display(), from_end = options.from_end, "following training log");
    loop {
        // Sampled before draining: anything written before the trigger is read.
        let stop = shutdown.is_triggered();

        loop {
            let read = reader.read_until(b'\n', &mut pending)?;
            if read == 0 {
                break;
            }
            position += read as u64;
            if pending.ends_with(b"\n") {
                feed.deliver(&pending)?;
                pending.clear();
            }
        }

        if stop {
            if !pending.is_empty() {
                feed.deliver(&pending)?;
            }
            break;
        }

        let len = std::fs::metadata(path)?.len();
        if len < position {
            tracing::info!(
                path = %path.display(),
                len,
                position,
                "training log truncated, rereading"
            );
            reader.seek(SeekFrom::Start(0))?;
            position = 0;
            pending.clear();
        }

        std::thread::sleep(options.poll_interval);
    }

    tracing::debug!(lines = feed.stats.lines, bytes = feed.stats.bytes, "follow finished");
    Ok(feed.stats)
}
