//! Error types for the chatwatch-core crate.

use thiserror::Error;

/// Errors raised by the monitoring engine.
///
/// Only [`MonitorError::Configuration`] is fatal. Everything else is handled
/// per cycle or per message by the loops that drive the engine.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Invalid or incomplete configuration, detected before any loop starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Upstream fetch for a channel failed or timed out.
    #[error("failed to fetch messages for {channel}: {reason}")]
    Fetch { channel: String, reason: String },

    /// A single message could not be classified.
    #[error("classification failed for {message_id}: {reason}")]
    Classification { message_id: String, reason: String },

    /// A sink rejected or never acknowledged a notification.
    #[error("notification delivery via {sink} failed: {reason}")]
    Delivery { sink: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("schema migration failed: {0}")]
    Migration(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MonitorError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub fn fetch(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    pub fn delivery(sink: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Delivery {
            sink: sink.into(),
            reason: reason.into(),
        }
    }

    /// Fatal errors abort the process; everything else is retried next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for MonitorError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(format!("invalid TOML: {}", err))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = MonitorError::fetch("C123", "timed out");
        assert_eq!(err.to_string(), "failed to fetch messages for C123: timed out");
    }

    #[test]
    fn test_only_configuration_is_fatal() {
        assert!(MonitorError::configuration("missing token").is_fatal());
        assert!(!MonitorError::fetch("C1", "boom").is_fatal());
        assert!(!MonitorError::delivery("webhook", "500").is_fatal());
    }

    #[test]
    fn test_toml_error_maps_to_configuration() {
        let parsed = toml::from_str::<toml::Value>("not = [valid");
        let err: MonitorError = parsed.unwrap_err().into();
        assert!(err.is_fatal());
    }
}
