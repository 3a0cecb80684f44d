//! Mock Transport for Testing
//!
//! Scripted stand-in for the adapter. Writes are recorded and can trigger
//! canned replies; unsolicited bytes (received frames, ACK lines, BELL) are
//! pushed through a [`MockHandle`] that stays usable after the transport has
//! been moved into a device.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use tracing::debug;

use super::traits::{ConnectionState, Transport, TransportConfig, TransportError, TransportStats};

/// Mock transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockTransportConfig {
    /// Transport name for identification
    pub name: String,
    /// Default read timeout when the caller passes none
    pub timeout: Duration,
    /// Whether connections should fail
    pub should_fail_connection: bool,
}

impl Default for MockTransportConfig {
    fn default() -> Self {
        Self {
            name: "Mock Transport".to_string(),
            timeout: Duration::from_millis(200),
            should_fail_connection: false,
        }
    }
}

impl TransportConfig for MockTransportConfig {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<(), TransportError> {
        if self.name.is_empty() {
            return Err(TransportError::ConfigError(
                "Name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug)]
struct MockTransportState {
    connected: bool,
    /// Bytes waiting to be read
    receive_buffer: VecDeque<u8>,
    /// History of writes, one entry per `send`
    sent_data: Vec<Vec<u8>>,
    /// Canned replies keyed on the exact bytes of a write
    replies: Vec<(Vec<u8>, Vec<u8>)>,
    /// Reply to writes without a canned reply
    default_reply: Option<Vec<u8>>,
    should_fail_connection: bool,
    should_fail_send: bool,
    should_fail_receive: bool,
    stats: TransportStats,
}

impl MockTransportState {
    fn new(config: &MockTransportConfig) -> Self {
        Self {
            connected: false,
            receive_buffer: VecDeque::new(),
            sent_data: Vec::new(),
            replies: Vec::new(),
            default_reply: None,
            should_fail_connection: config.should_fail_connection,
            should_fail_send: false,
            should_fail_receive: false,
            stats: TransportStats::new(),
        }
    }
}

/// Mock transport implementation
#[derive(Debug)]
pub struct MockTransport {
    config: MockTransportConfig,
    state: Arc<RwLock<MockTransportState>>,
    start_time: SystemTime,
}

/// Test-side handle onto a [`MockTransport`]'s shared state
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<RwLock<MockTransportState>>,
}

impl MockTransport {
    pub fn new(config: MockTransportConfig) -> Result<Self, TransportError> {
        config.validate()?;

        let state = MockTransportState::new(&config);
        Ok(Self {
            config,
            state: Arc::new(RwLock::new(state)),
            start_time: SystemTime::now(),
        })
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl MockHandle {
    /// Queue bytes as if the adapter had sent them
    pub async fn push_receive_data(&self, data: &[u8]) {
        self.state.write().await.receive_buffer.extend(data.iter().copied());
    }

    /// Answer every write equal to `request` with `reply`
    pub async fn reply_to(&self, request: &[u8], reply: &[u8]) {
        self.state
            .write()
            .await
            .replies
            .push((request.to_vec(), reply.to_vec()));
    }

    /// Answer every other write with `reply`, or stay silent with `None`
    pub async fn set_default_reply(&self, reply: Option<&[u8]>) {
        self.state.write().await.default_reply = reply.map(<[u8]>::to_vec);
    }

    /// Script the replies a healthy adapter gives during the handshake
    pub async fn script_handshake(&self, firmware: &str, hardware: &str, serial: &str) {
        self.reply_to(b"C\r", b"\r").await;
        self.reply_to(b"v\r", format!("v{firmware}\r").as_bytes()).await;
        self.reply_to(b"V\r", format!("V{hardware}\r").as_bytes()).await;
        self.reply_to(b"N\r", format!("N{serial}\r").as_bytes()).await;
        self.reply_to(b"W2d00\r", b"\r").await;
    }

    pub async fn sent_data(&self) -> Vec<Vec<u8>> {
        self.state.read().await.sent_data.clone()
    }

    /// Sent data decoded as text, one entry per write
    pub async fn sent_lines(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .sent_data
            .iter()
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .collect()
    }

    pub async fn clear_sent_data(&self) {
        self.state.write().await.sent_data.clear();
    }

    pub async fn pending_receive_len(&self) -> usize {
        self.state.read().await.receive_buffer.len()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    pub async fn set_connection_failure(&self, should_fail: bool) {
        self.state.write().await.should_fail_connection = should_fail;
    }

    pub async fn set_send_failure(&self, should_fail: bool) {
        self.state.write().await.should_fail_send = should_fail;
    }

    pub async fn set_receive_failure(&self, should_fail: bool) {
        self.state.write().await.should_fail_receive = should_fail;
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> &str {
        "mock"
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.write().await;
        state.stats.record_connection_attempt();

        if state.should_fail_connection {
            state.stats.record_failed_connection();
            return Err(TransportError::ConnectionFailed(
                "Mock connection failure".to_string(),
            ));
        }

        state.connected = true;
        state.stats.record_successful_connection();
        debug!("Mock transport connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.write().await;
        if state.connected {
            state.connected = false;
            state.stats.record_disconnection();
            debug!("Mock transport disconnected");
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.write().await;

        if !state.connected {
            return Err(TransportError::SendFailed("Not connected".to_string()));
        }

        if state.should_fail_send {
            state.stats.connection_state = ConnectionState::Error;
            return Err(TransportError::SendFailed("Mock send failure".to_string()));
        }

        state.sent_data.push(data.to_vec());
        state.stats.record_bytes_sent(data.len());

        let reply = state
            .replies
            .iter()
            .find(|(request, _)| request.as_slice() == data)
            .map(|(_, reply)| reply.clone())
            .or_else(|| state.default_reply.clone());
        if let Some(reply) = reply {
            state.receive_buffer.extend(reply);
        }

        Ok(data.len())
    }

    async fn receive(
        &mut self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, TransportError> {
        let deadline = tokio::time::Instant::now() + timeout.unwrap_or(self.config.timeout);

        loop {
            {
                let mut state = self.state.write().await;

                if !state.connected {
                    return Err(TransportError::ReceiveFailed("Not connected".to_string()));
                }

                if state.should_fail_receive {
                    state.stats.connection_state = ConnectionState::Error;
                    return Err(TransportError::ReceiveFailed(
                        "Mock receive failure".to_string(),
                    ));
                }

                if !state.receive_buffer.is_empty() {
                    let count = buffer.len().min(state.receive_buffer.len());
                    for (slot, byte) in buffer.iter_mut().zip(state.receive_buffer.drain(..count)) {
                        *slot = byte;
                    }
                    state.stats.record_bytes_received(count);
                    return Ok(count);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::Timeout("Mock receive timed out".to_string()));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn purge(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.write().await;
        state.receive_buffer.clear();
        state.stats.record_purge();
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.read().await.connected
    }

    async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.stats.connection_state
    }

    async fn stats(&self) -> TransportStats {
        let mut stats = self.state.read().await.stats.clone();
        if let Ok(elapsed) = self.start_time.elapsed() {
            stats.uptime = elapsed;
        }
        stats
    }
}
