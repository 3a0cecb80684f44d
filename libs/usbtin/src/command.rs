//! Synchronous Command Transactions
//!
//! A transaction writes one command line and reads the reply byte by byte
//! until the terminator (accepted) or BELL (rejected). Only used while no
//! dispatcher owns the inbound stream.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::{BELL, TERMINATOR};
use crate::error::{Result, UsbtinError};
use crate::filter::RegisterWrite;
use crate::transport::Transport;

/// Default bound on a whole transaction
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// How a reply ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyEnd {
    Terminator,
    Bell,
}

/// Request/response channel over a borrowed transport
#[derive(Debug, Clone, Copy)]
pub struct CommandChannel {
    timeout: Duration,
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl CommandChannel {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `cmd` and return the reply without its terminator
    ///
    /// # Errors
    ///
    /// * `InvalidCommand` - `cmd` is empty or contains a terminator
    /// * `DeviceRejected` - the adapter answered with BELL
    /// * `Timeout` - no terminator within the transaction timeout
    /// * `DeviceIo` - the transport failed
    pub async fn transmit(&self, transport: &mut dyn Transport, cmd: &str) -> Result<String> {
        if cmd.is_empty() || cmd.bytes().any(|b| b == TERMINATOR) {
            return Err(UsbtinError::InvalidCommand(cmd.to_string()));
        }

        let deadline = Instant::now() + self.timeout;

        let mut line = Vec::with_capacity(cmd.len() + 1);
        line.extend_from_slice(cmd.as_bytes());
        line.push(TERMINATOR);
        transport.send(&line).await?;
        debug!(command = cmd, "Command sent");

        let (reply, end) = self.read_reply(transport, deadline, cmd).await?;
        match end {
            ReplyEnd::Terminator => {
                debug!(command = cmd, reply = %reply, "Command accepted");
                Ok(reply)
            }
            ReplyEnd::Bell => {
                warn!(command = cmd, "Command rejected");
                Err(UsbtinError::DeviceRejected(cmd.to_string()))
            }
        }
    }

    /// Write one MCP2515 register
    pub async fn write_register(
        &self,
        transport: &mut dyn Transport,
        write: RegisterWrite,
    ) -> Result<()> {
        self.transmit(transport, &write.command()).await.map(|_| ())
    }

    /// Read until the adapter goes quiet with either terminator or BELL
    pub async fn wait_for_idle(&self, transport: &mut dyn Transport) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        self.read_reply(transport, deadline, "idle").await.map(|_| ())
    }

    async fn read_reply(
        &self,
        transport: &mut dyn Transport,
        deadline: Instant,
        cmd: &str,
    ) -> Result<(String, ReplyEnd)> {
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(UsbtinError::Timeout(format!(
                    "no reply to {cmd:?} within {:?}",
                    self.timeout
                )));
            }

            let count = match transport.receive(&mut byte, Some(remaining)).await {
                Ok(count) => count,
                Err(e) if e.is_timeout() => {
                    return Err(UsbtinError::Timeout(format!(
                        "no reply to {cmd:?} within {:?}",
                        self.timeout
                    )))
                }
                Err(e) => return Err(e.into()),
            };
            if count == 0 {
                tokio::task::yield_now().await;
                continue;
            }

            match byte[0] {
                TERMINATOR => {
                    return Ok((String::from_utf8_lossy(&reply).into_owned(), ReplyEnd::Terminator))
                }
                BELL => return Ok((String::from_utf8_lossy(&reply).into_owned(), ReplyEnd::Bell)),
                other => reply.push(other),
            }
        }
    }
}
