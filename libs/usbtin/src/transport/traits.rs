//! Transport Layer Traits
//!
//! Byte-oriented link between the protocol engine and the adapter. The
//! engine only needs timed reads, writes and a buffer purge; everything
//! serial-specific lives in the implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Transport layer error types
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Receive operation failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Timeout occurred
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

impl TransportError {
    /// Whether this error is a plain read/write timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Connection state for transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Transport is disconnected
    Disconnected,
    /// Transport is attempting to connect
    Connecting,
    /// Transport is connected and ready
    Connected,
    /// Transport has encountered an error
    Error,
}

/// Transport statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Number of connection attempts
    pub connection_attempts: u64,
    /// Number of successful connections
    pub successful_connections: u64,
    /// Number of failed connections
    pub failed_connections: u64,
    /// Number of disconnections
    pub disconnections: u64,
    /// Number of buffer purges
    pub purges: u64,
    /// Last successful connection time
    pub last_connection: Option<SystemTime>,
    /// Transport uptime
    pub uptime: Duration,
    /// Current connection state
    pub connection_state: ConnectionState,
}

impl TransportStats {
    pub fn new() -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            connection_attempts: 0,
            successful_connections: 0,
            failed_connections: 0,
            disconnections: 0,
            purges: 0,
            last_connection: None,
            uptime: Duration::new(0, 0),
            connection_state: ConnectionState::Disconnected,
        }
    }

    pub fn record_connection_attempt(&mut self) {
        self.connection_attempts += 1;
        self.connection_state = ConnectionState::Connecting;
    }

    pub fn record_successful_connection(&mut self) {
        self.successful_connections += 1;
        self.last_connection = Some(SystemTime::now());
        self.connection_state = ConnectionState::Connected;
    }

    pub fn record_failed_connection(&mut self) {
        self.failed_connections += 1;
        self.connection_state = ConnectionState::Error;
    }

    pub fn record_disconnection(&mut self) {
        self.disconnections += 1;
        self.connection_state = ConnectionState::Disconnected;
    }

    pub fn record_bytes_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn record_bytes_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    pub fn record_purge(&mut self) {
        self.purges += 1;
    }
}

impl Default for TransportStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport configuration trait
pub trait TransportConfig: Send + Sync + fmt::Debug + Clone {
    /// Get configuration name/identifier
    fn name(&self) -> &str;

    /// Validate configuration parameters
    fn validate(&self) -> std::result::Result<(), TransportError>;

    /// Default timeout for a single read
    fn timeout(&self) -> Duration;
}

/// Core transport trait used by the command channel and the dispatcher
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Get transport type identifier
    fn transport_type(&self) -> &str;

    /// Get human-readable transport name
    fn name(&self) -> &str;

    /// Open and configure the underlying link
    async fn connect(&mut self) -> std::result::Result<(), TransportError>;

    /// Close the underlying link. Closing an already closed link is not an error.
    async fn disconnect(&mut self) -> std::result::Result<(), TransportError>;

    /// Write all of `data` to the link
    ///
    /// # Returns
    ///
    /// `Ok(bytes_sent)` if successful, `Err` otherwise
    async fn send(&mut self, data: &[u8]) -> std::result::Result<usize, TransportError>;

    /// Read whatever is available into `buffer`
    ///
    /// # Arguments
    ///
    /// * `buffer` - Buffer to store received data
    /// * `timeout` - Optional timeout; `None` uses the configured read timeout
    ///
    /// # Returns
    ///
    /// `Ok(bytes_received)` (possibly 0 when nothing is pending),
    /// `Err(TransportError::Timeout)` when the timeout expires
    async fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
    ) -> std::result::Result<usize, TransportError>;

    /// Discard pending input and output
    async fn purge(&mut self) -> std::result::Result<(), TransportError>;

    async fn is_connected(&self) -> bool;

    async fn connection_state(&self) -> ConnectionState;

    async fn stats(&self) -> TransportStats;

    /// Close the transport and clean up resources
    async fn close(&mut self) -> std::result::Result<(), TransportError> {
        self.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_stats() {
        let mut stats = TransportStats::new();
        assert_eq!(stats.connection_attempts, 0);
        assert_eq!(stats.connection_state, ConnectionState::Disconnected);

        stats.record_connection_attempt();
        assert_eq!(stats.connection_attempts, 1);
        assert_eq!(stats.connection_state, ConnectionState::Connecting);

        stats.record_successful_connection();
        assert_eq!(stats.successful_connections, 1);
        assert_eq!(stats.connection_state, ConnectionState::Connected);
        assert!(stats.last_connection.is_some());

        stats.record_bytes_sent(100);
        stats.record_bytes_received(50);
        stats.record_purge();
        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.bytes_received, 50);
        assert_eq!(stats.purges, 1);

        stats.record_disconnection();
        assert_eq!(stats.disconnections, 1);
        assert_eq!(stats.connection_state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_transport_error() {
        let error = TransportError::ConnectionFailed("Test error".to_string());
        assert!(error.to_string().contains("Connection failed"));
        assert!(error.to_string().contains("Test error"));
        assert!(!error.is_timeout());
        assert!(TransportError::Timeout("read".to_string()).is_timeout());
    }
}
