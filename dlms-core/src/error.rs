use std::fmt;
use thiserror::Error;

/// Sub-kind of a command submitted in a state that does not allow it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrongState {
    /// SNRM while the link is not disconnected
    NotDisconnected,
    /// DISC or data while the link is not connected
    NotConnected,
    /// The command is reserved to the other side of the link
    NotAllowed,
}

impl fmt::Display for WrongState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WrongState::NotDisconnected => "not disconnected",
            WrongState::NotConnected => "not connected",
            WrongState::NotAllowed => "not allowed",
        };
        f.write_str(s)
    }
}

/// Main error type for DLMS client operations
#[derive(Error, Debug)]
pub enum DlmsError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout")]
    Timeout,

    #[error("request timeout")]
    RequestTimeout,

    #[error("block receive timeout")]
    BlockTimeout,

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Malformed segment: {0}")]
    MalformedSegment(String),

    #[error("Wrong state: {0}")]
    WrongState(WrongState),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Association rejected, result: {result}, diagnostic: {diagnostic}")]
    AssociationRejected { result: u8, diagnostic: u8 },

    #[error("Connection closed")]
    ConnectionClosed,
}

impl DlmsError {
    /// Shorthand for an `UnexpectedEof` transport error
    pub fn eof(msg: &str) -> Self {
        DlmsError::Connection(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            msg.to_string(),
        ))
    }

    /// True for errors that mean the underlying byte stream is unusable
    pub fn is_fatal(&self) -> bool {
        matches!(self, DlmsError::Connection(_) | DlmsError::ConnectionClosed)
    }
}

/// Result type alias for DLMS operations
pub type DlmsResult<T> = Result<T, DlmsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_state_display() {
        let err = DlmsError::WrongState(WrongState::NotDisconnected);
        assert_eq!(err.to_string(), "Wrong state: not disconnected");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(DlmsError::eof("gone").is_fatal());
        assert!(DlmsError::ConnectionClosed.is_fatal());
        assert!(!DlmsError::MalformedSegment("fcs".into()).is_fatal());
        assert!(!DlmsError::RequestTimeout.is_fatal());
    }

    #[test]
    fn test_association_rejected_message() {
        let err = DlmsError::AssociationRejected { result: 1, diagnostic: 13 };
        assert_eq!(err.to_string(), "Association rejected, result: 1, diagnostic: 13");
    }
}
