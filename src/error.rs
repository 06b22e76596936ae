//! WolfMeta Error Types

use thiserror::Error;

/// Result type alias for WolfMeta operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMeta error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Membership errors
    #[error("Member not found: {0}")]
    MemberNotFound(String),

    #[error("Member {0} is already registered with a different id")]
    DuplicateMember(String),

    #[error("Invalid member: {0}")]
    InvalidMember(String),

    #[error("No leader available")]
    NoLeader,

    // Consensus store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Lease {0} expired or revoked")]
    LeaseExpired(u64),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Bootstrap errors
    #[error("Node {name} failed to start: {reason}")]
    StartupFailure { name: String, reason: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::NoLeader | Error::Network(_)
        )
    }

    /// Check if this error means the requested entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::MemberNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout("list members".into()).is_retryable());
        assert!(Error::NoLeader.is_retryable());
        assert!(!Error::MemberNotFound("pd1".into()).is_retryable());
        assert!(!Error::Store("boom".into()).is_retryable());
    }

    #[test]
    fn test_timeout_is_not_not_found() {
        assert!(!Error::Timeout("delete member".into()).is_not_found());
        assert!(Error::MemberNotFound("pd1".into()).is_not_found());
    }
}
