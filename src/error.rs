//! Error types for the adapter layer

use crate::handle::Handle;

/// Result type alias using the adapter [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while creating or driving adapters
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Credential material could not be loaded or parsed
    #[error("Credential error: {0}")]
    Credential(String),

    /// A dedicated event-loop thread could not be started
    #[error("Thread start failed: {0}")]
    ThreadStart(String),

    /// Operation issued against an object in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Handle does not refer to a live adapter
    #[error("Unknown handle: {0}")]
    UnknownHandle(Handle),

    /// Peer connection construction or operation error
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    /// Data channel construction or operation error
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// ICE candidate could not be parsed
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// Stream-transport construction or operation error
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::Credential(_))
    }

    /// Check if this error is fatal for the owning object's construction
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ThreadStart(_) | Error::Credential(_) | Error::InvalidConfig(_)
        )
    }

    /// Check if this error refers to a stale or foreign handle
    pub fn is_unknown_handle(&self) -> bool {
        matches!(self, Error::UnknownHandle(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("bad port range".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: bad port range");
    }

    #[test]
    fn test_error_is_config_error() {
        assert!(Error::InvalidConfig("x".to_string()).is_config_error());
        assert!(Error::Credential("x".to_string()).is_config_error());
        assert!(!Error::Transport("x".to_string()).is_config_error());
    }

    #[test]
    fn test_error_is_fatal() {
        assert!(Error::ThreadStart("x".to_string()).is_fatal());
        assert!(!Error::InvalidState("x".to_string()).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io(_)));
    }
}
