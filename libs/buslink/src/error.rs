//! Bus Link Error Types
//!
//! Core error types for the shared-bus transport.

use thiserror::Error;

/// Result type for buslink operations
pub type Result<T> = std::result::Result<T, BusLinkError>;

/// Errors produced while parsing or building wire records
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The byte where the start code belongs held something else
    #[error("Bad start code: expected 0x55, found 0x{found:02X}")]
    BadStartCode { found: u8 },

    /// Declared length outside the accepted window
    #[error("Bad frame length: {length}")]
    BadLength { length: u16 },

    /// A command that cannot be rendered to bytes
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// IO errors surfaced through the codec
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(err.to_string())
    }
}

/// Shared-bus transport errors
#[derive(Debug, Error, Clone)]
pub enum BusLinkError {
    /// Frame encode/decode errors
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Subscription errors
    #[error("Subscription error: {0}")]
    Subscription(String),
}

// Helper methods for creating errors
impl BusLinkError {
    pub fn connection(msg: impl Into<String>) -> Self {
        BusLinkError::Connection(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        BusLinkError::Io(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        BusLinkError::Timeout(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        BusLinkError::Config(msg.into())
    }

    pub fn subscription(msg: impl Into<String>) -> Self {
        BusLinkError::Subscription(msg.into())
    }

    /// Check if this error indicates a need for reconnection
    pub fn needs_reconnect(&self) -> bool {
        match self {
            BusLinkError::Io(msg) => {
                msg.contains("Broken pipe")
                    || msg.contains("Connection reset")
                    || msg.contains("Connection refused")
                    || msg.contains("Connection aborted")
                    || msg.contains("Network is unreachable")
            },
            BusLinkError::Connection(_) => true,
            BusLinkError::NotConnected => true,
            _ => false,
        }
    }
}
