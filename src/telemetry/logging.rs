//! Logging configuration and subscriber initialization.
//!
//! JSON output for hosts that collect logs, pretty output for the CLI.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event.
    #[default]
    Json,
    /// Human-readable multi-line events.
    Pretty,
    /// Single-line human-readable events.
    Compact,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
            Self::Compact => "compact",
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive, e.g. "info" or "pocket_llm=debug".
    pub level: String,
    /// Log file. Stderr when unset.
    pub output_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            output_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),
    #[error("Failed to open log file: {0}")]
    FileOpen(String),
    #[error("Subscriber already initialized")]
    AlreadyInitialized,
}

/// Install the global subscriber. Call once at startup; later calls fail
/// with [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter =
        EnvFilter::try_new(&config.level).map_err(|e| LogError::InvalidFilter(e.to_string()))?;

    let file = match &config.output_path {
        Some(path) => Some(std::fs::File::create(path).map_err(|e| LogError::FileOpen(e.to_string()))?),
        None => None,
    };
    let registry = tracing_subscriber::registry().with(filter);

    let result = match (config.format, file) {
        (LogFormat::Json, Some(f)) => registry
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(f)))
            .try_init(),
        (LogFormat::Json, None) => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        (LogFormat::Pretty, Some(f)) => registry
            .with(fmt::layer().pretty().with_ansi(false).with_writer(std::sync::Mutex::new(f)))
            .try_init(),
        (LogFormat::Pretty, None) => registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
        (LogFormat::Compact, Some(f)) => registry
            .with(fmt::layer().compact().with_ansi(false).with_writer(std::sync::Mutex::new(f)))
            .try_init(),
        (LogFormat::Compact, None) => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
    };
    result.map_err(|_| LogError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_format_names() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" pretty "), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("compact"), Some(LogFormat::Compact));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn invalid_filter_is_rejected_before_install() {
        let cfg = LogConfig {
            level: "pocket_llm=notalevel".into(),
            ..Default::default()
        };
        assert!(matches!(init_logging(&cfg), Err(LogError::InvalidFilter(_))));
    }
}
