//! Sigmesh Error Types

use thiserror::Error;

/// Result type alias for Sigmesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Sigmesh error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Parsing errors
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    // Key errors
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    // Signaling errors
    #[error("Handshake failed with status {status}, link: {url}")]
    Handshake { status: u16, url: String },

    #[error("Resolve failed with status {status}, link: {url}")]
    Resolve { status: u16, url: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signaling client is closed")]
    Closed,

    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Peer resolution timed out after {0:?}")]
    ResolutionTimeout(std::time::Duration),

    #[error("No CNAME record carries a public key for {0}")]
    NoCnamePubkey(String),

    // Collaborator errors
    #[error("Tunnel engine error: {0}")]
    Engine(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::ResolutionTimeout(_) | Error::Io(_) => true,
            Error::Handshake { status, .. } | Error::Resolve { status, .. } => *status == 423,
            _ => false,
        }
    }

    /// Check if this error was caused by bad input rather than the network
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::Parse(_)
                | Error::Url(_)
                | Error::UnsupportedScheme(_)
                | Error::InvalidPublicKey(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_retry_classification() {
        assert!(Error::ResolutionTimeout(Duration::from_secs(60)).is_retryable());
        assert!(Error::Handshake { status: 423, url: "https://relay".into() }.is_retryable());
        assert!(!Error::Handshake { status: 500, url: "https://relay".into() }.is_retryable());
        assert!(!Error::InvalidPublicKey("short".into()).is_retryable());
    }

    #[test]
    fn test_input_errors() {
        assert!(Error::UnsupportedScheme("ftp".into()).is_input_error());
        assert!(!Error::Closed.is_input_error());
    }
}
