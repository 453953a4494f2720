//! Node error types.
//!
//! Request-path failures are returned as values. [`NewSessionError`] keeps
//! the retryable/terminal split so a distributor can decide whether to try
//! another node.

use thiserror::Error;

use gridnode_core::{Capabilities, SessionId};

/// Errors from operations on existing sessions.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("no such session: {0}")]
    NoSuchSession(SessionId),

    #[error("managed downloads are not enabled for session {0}")]
    DownloadsNotEnabled(SessionId),

    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("command failed: {0}")]
    Command(String),
}

pub type NodeResult<T> = Result<T, NodeError>;

/// Why a new session could not be started on this node.
#[derive(Debug, Error)]
pub enum NewSessionError {
    #[error("max session count reached ({0})")]
    MaxSessionsReached(usize),

    #[error("node is draining")]
    Draining,

    #[error("no free slot matches capabilities {0}")]
    NoSlotMatched(Capabilities),

    #[error("could not start session: {message}")]
    SessionNotCreated { message: String, retryable: bool },

    #[error("node failure: {0}")]
    Filesystem(#[from] std::io::Error),
}

impl NewSessionError {
    /// A terminal session-start failure.
    pub fn not_created(message: impl Into<String>) -> Self {
        Self::SessionNotCreated {
            message: message.into(),
            retryable: false,
        }
    }

    /// A session-start failure another node (or a later attempt) may not hit.
    pub fn retry(message: impl Into<String>) -> Self {
        Self::SessionNotCreated {
            message: message.into(),
            retryable: true,
        }
    }

    /// Whether the distributor should route the request elsewhere.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MaxSessionsReached(_) | Self::Draining | Self::NoSlotMatched(_) => true,
            Self::SessionNotCreated { retryable, .. } => *retryable,
            Self::Filesystem(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_are_retryable() {
        assert!(NewSessionError::MaxSessionsReached(2).is_retryable());
        assert!(NewSessionError::Draining.is_retryable());
        assert!(NewSessionError::NoSlotMatched(Capabilities::new()).is_retryable());
    }

    #[test]
    fn factory_errors_follow_their_flag() {
        assert!(!NewSessionError::not_created("driver crashed").is_retryable());
        assert!(NewSessionError::retry("slot busy").is_retryable());
    }

    #[test]
    fn filesystem_errors_are_terminal() {
        let err = NewSessionError::from(std::io::Error::other("disk full"));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("disk full"));
    }
}
