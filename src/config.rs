use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;

/// Top-level configuration loaded from flairflow.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct FlairflowConfig {
    pub logger: LoggerConfig,
    pub tracking: TrackingConfig,
    pub follow: FollowConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Logger the interceptor attaches to.
    pub name: String,
    /// Level replayed log lines are logged at.
    pub level: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub uri: Option<String>,
    pub run_id: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FollowConfig {
    pub poll_interval_ms: u64,
    /// Start at the end of the file instead of replaying what is already there.
    pub from_end: bool,
}

/// Errors loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: toml::de::Error },
    InvalidLevel(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
            ConfigError::InvalidLevel(level) => write!(f, "unknown log level `{level}`"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidLevel(_) => None,
        }
    }
}

impl FlairflowConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

impl LoggerConfig {
    pub fn level(&self) -> Result<Level, ConfigError> {
        Level::from_str(self.level.trim())
            .map_err(|_| ConfigError::InvalidLevel(self.level.clone()))
    }
}

// --- Default implementations ---

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            name: "flair".to_string(),
            level: "info".to_string(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            uri: None,
            run_id: None,
            timeout_secs: 10,
        }
    }
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            from_end: false,
        }
    }
}
