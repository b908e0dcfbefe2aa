//! Service error types

use buslink::BusLinkError;
use thiserror::Error;

/// Result type for bussrv operations
pub type Result<T> = std::result::Result<T, BusSrvError>;

/// Errors raised by the device service
#[derive(Debug, Error)]
pub enum BusSrvError {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Device construction or operation errors
    #[error("Device error: {0}")]
    Device(String),

    /// Errors surfaced from the shared-bus transport
    #[error(transparent)]
    BusLink(#[from] BusLinkError),
}

impl BusSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        BusSrvError::Config(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        BusSrvError::Device(msg.into())
    }
}
