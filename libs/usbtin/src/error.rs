//! USBtin Error Types

use thiserror::Error;

use crate::transport::TransportError;

/// Result type for usbtin operations
pub type Result<T> = std::result::Result<T, UsbtinError>;

/// Errors surfaced by the device engine
#[derive(Debug, Error, Clone)]
pub enum UsbtinError {
    /// Handshake with the adapter failed
    #[error("Connect error: {0}")]
    Connect(String),

    /// No terminator within the transaction timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Adapter answered a command with BELL
    #[error("Device rejected command: {0}")]
    DeviceRejected(String),

    /// Transport failure
    #[error("Device IO error: {0}")]
    DeviceIo(String),

    #[error("Too many filter chains: {count} (maximum is 2)")]
    TooManyFilterChains { count: usize },

    #[error("Filter chain too long for slot {slot}: {len} filters (maximum is {max})")]
    FilterChainTooLong { slot: usize, len: usize, max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Empty command or command with an embedded terminator
    #[error("Invalid command: {0:?}")]
    InvalidCommand(String),

    #[error("Invalid baud rate: {0}")]
    InvalidBaudRate(u32),

    /// Operation not allowed in the current connection state
    #[error("Invalid state: {operation} not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Frame kept being NAKed past the configured retry limit
    #[error("Link broken: {0}")]
    LinkBroken(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<TransportError> for UsbtinError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(msg) => UsbtinError::Timeout(msg),
            other => UsbtinError::DeviceIo(other.to_string()),
        }
    }
}

impl From<figment::Error> for UsbtinError {
    fn from(err: figment::Error) -> Self {
        UsbtinError::Config(err.to_string())
    }
}

impl UsbtinError {
    pub fn connect(msg: impl Into<String>) -> Self {
        UsbtinError::Connect(msg.into())
    }

    pub fn device_io(msg: impl Into<String>) -> Self {
        UsbtinError::DeviceIo(msg.into())
    }

    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        UsbtinError::InvalidFrame(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        UsbtinError::Config(msg.into())
    }

    /// Wrap a handshake step failure, keeping the cause in the message
    pub fn during_connect(step: &str, cause: UsbtinError) -> Self {
        match cause {
            UsbtinError::Connect(_) => cause,
            other => UsbtinError::Connect(format!("{step}: {other}")),
        }
    }
}
