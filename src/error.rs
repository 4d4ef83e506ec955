//! Error types for fleet-warmer

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handshake for {device} did not complete within {timeout:?}")]
    HandshakeTimeout { device: String, timeout: Duration },

    #[error("Device not connected: {0}")]
    NotConnected(String),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Lock-style failures that teardown logs and swallows
    pub fn is_resource_busy(&self) -> bool {
        matches!(self, Error::ResourceBusy(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotConnected("browser_123".to_string());
        assert!(err.to_string().contains("browser_123"));
    }

    #[test]
    fn test_handshake_timeout_display() {
        let err = Error::HandshakeTimeout {
            device: "browser_1".to_string(),
            timeout: Duration::from_secs(60),
        };
        let msg = err.to_string();
        assert!(msg.contains("browser_1"));
        assert!(msg.contains("60s"));
    }

    #[test]
    fn test_error_from_sqlite() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::StorageUnavailable(_)));
    }

    #[test]
    fn test_resource_busy() {
        assert!(Error::ResourceBusy("EBUSY".to_string()).is_resource_busy());
        assert!(!Error::Transport("boom".to_string()).is_resource_busy());
    }
}
