//! USBtin Device
//!
//! Owns the connection state machine:
//!
//! ```text
//!   Disconnected ──connect──▶ Handshaking ──ok──▶ Connected ──open_channel──▶ ChannelOpen
//!        ▲                        │                  │  ▲                          │
//!        │                        └──fail────────────┘  └───────close_channel──────┘
//!        └─────────────────────────disconnect (from any state)──────────────────────┘
//! ```
//!
//! While `Connected` the device talks to the adapter through synchronous
//! command transactions. `open_channel` hands the inbound stream to an
//! [`InboundDispatcher`] task; from then on outbound frames go through the
//! [`TxQueue`] and no further commands are issued until the channel closes.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bit_timing::BaudSetting;
use crate::codec::TERMINATOR;
use crate::command::CommandChannel;
use crate::config::DeviceConfig;
use crate::dispatcher::{CanFrameListener, InboundDispatcher, ListenerId, ListenerRegistry};
use crate::error::{Result, UsbtinError};
use crate::filter::{self, FilterChain, RegisterWrite};
use crate::frame::CanFrame;
use crate::transport::{self, SerialTransport, SharedTransport, Transport, TransportStats};
use crate::tx_queue::TxQueue;

/// MCP2515 error flag register
const EFLG: u8 = 0x2D;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected,
    Handshaking,
    Connected,
    ChannelOpen,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Handshaking => "handshaking",
            DeviceState::Connected => "connected",
            DeviceState::ChannelOpen => "channel open",
        };
        f.write_str(name)
    }
}

/// How the CAN controller joins the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Send and acknowledge frames
    #[default]
    Active,
    /// Receive only, never drive the bus
    ListenOnly,
    /// Internal loopback, nothing reaches the bus
    Loopback,
}

impl OpenMode {
    pub fn command(&self) -> &'static str {
        match self {
            OpenMode::Active => "O",
            OpenMode::ListenOnly => "L",
            OpenMode::Loopback => "l",
        }
    }
}

#[derive(Debug, Default)]
struct Identity {
    firmware: Option<String>,
    hardware: Option<String>,
    serial: Option<String>,
}

#[derive(Debug)]
struct OpenChannel {
    queue: Arc<TxQueue>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A USBtin adapter
#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    state: DeviceState,
    commands: CommandChannel,
    transport: Option<SharedTransport>,
    listeners: Arc<ListenerRegistry>,
    channel: Option<OpenChannel>,
    identity: Identity,
}

impl Default for Device {
    fn default() -> Self {
        Self::new(DeviceConfig::default())
    }
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            commands: CommandChannel::new(config.command_timeout()),
            config,
            state: DeviceState::Disconnected,
            transport: None,
            listeners: Arc::new(ListenerRegistry::new()),
            channel: None,
            identity: Identity::default(),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Cached after connect, cleared when the channel closes
    pub fn firmware_version(&self) -> Option<&str> {
        self.identity.firmware.as_deref()
    }

    pub fn hardware_version(&self) -> Option<&str> {
        self.identity.hardware.as_deref()
    }

    pub fn serial_number(&self) -> Option<&str> {
        self.identity.serial.as_deref()
    }

    /// Open `port` with the configured line settings and run the handshake
    pub async fn connect(&mut self, port: &str) -> Result<()> {
        self.expect_state(DeviceState::Disconnected, "connect")?;

        let transport = SerialTransport::new(self.config.serial.for_port(port))
            .map_err(|e| UsbtinError::connect(format!("{port}: {e}")))?;
        self.connect_with(Box::new(transport)).await
    }

    /// Run the handshake over an already constructed transport
    ///
    /// On failure the transport is closed and the device stays
    /// disconnected.
    pub async fn connect_with(&mut self, mut transport: Box<dyn Transport>) -> Result<()> {
        self.expect_state(DeviceState::Disconnected, "connect")?;
        self.state = DeviceState::Handshaking;
        info!(transport = transport.name(), "Connecting");

        match self.handshake(&mut *transport).await {
            Ok(identity) => {
                info!(
                    firmware = identity.firmware.as_deref().unwrap_or_default(),
                    hardware = identity.hardware.as_deref().unwrap_or_default(),
                    serial = identity.serial.as_deref().unwrap_or_default(),
                    "Connected"
                );
                self.identity = identity;
                self.transport = Some(transport::shared(transport));
                self.state = DeviceState::Connected;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Handshake failed");
                if let Err(close_err) = transport.close().await {
                    warn!(error = %close_err, "Failed to close transport after handshake failure");
                }
                self.state = DeviceState::Disconnected;
                Err(e)
            }
        }
    }

    async fn handshake(&self, transport: &mut dyn Transport) -> Result<Identity> {
        transport
            .connect()
            .await
            .map_err(|e| UsbtinError::connect(e.to_string()))?;

        // leave whatever mode a previous session left the adapter in
        transport
            .send(&[TERMINATOR, b'C', TERMINATOR])
            .await
            .map_err(|e| UsbtinError::during_connect("reset", e.into()))?;
        tokio::time::sleep(self.config.settle_delay()).await;
        transport
            .purge()
            .await
            .map_err(|e| UsbtinError::during_connect("purge", e.into()))?;

        transport
            .send(&[b'C', TERMINATOR])
            .await
            .map_err(|e| UsbtinError::during_connect("close channel", e.into()))?;
        self.commands
            .wait_for_idle(transport)
            .await
            .map_err(|e| UsbtinError::during_connect("close channel", e))?;

        let identity = Identity {
            firmware: Some(self.query(transport, "v", "firmware version").await?),
            hardware: Some(self.query(transport, "V", "hardware version").await?),
            serial: Some(self.query(transport, "N", "serial number").await?),
        };

        self.commands
            .write_register(transport, RegisterWrite::new(EFLG, 0x00))
            .await
            .map_err(|e| UsbtinError::during_connect("clear error flags", e))?;

        Ok(identity)
    }

    /// Identification query; the reply echoes the command letter first
    async fn query(&self, transport: &mut dyn Transport, cmd: &str, what: &str) -> Result<String> {
        let reply = self
            .commands
            .transmit(transport, cmd)
            .await
            .map_err(|e| UsbtinError::during_connect(what, e))?;
        Ok(reply.get(1..).unwrap_or_default().to_string())
    }

    /// Program the acceptance filters; zero chains accepts everything
    pub async fn set_filter(&mut self, chains: &[FilterChain]) -> Result<()> {
        self.expect_state(DeviceState::Connected, "set_filter")?;
        let writes = filter::plan(chains)?;
        let transport = self.shared_transport()?;

        let mut guard = transport.lock().await;
        let transport = &mut **guard;
        Self::discard_stale_input(transport).await?;
        for write in &writes {
            self.commands.write_register(transport, *write).await?;
        }

        info!(chains = chains.len(), writes = writes.len(), "Acceptance filters programmed");
        Ok(())
    }

    /// Set the bit rate and go on the bus
    pub async fn open_channel(&mut self, baud: u32, mode: OpenMode) -> Result<()> {
        self.expect_state(DeviceState::Connected, "open_channel")?;
        let setting = BaudSetting::resolve(self.config.oscillator_hz, baud)?;
        let transport = self.shared_transport()?;

        {
            let mut guard = transport.lock().await;
            let transport = &mut **guard;
            Self::discard_stale_input(transport).await?;
            self.commands.transmit(transport, &setting.command()).await?;
            self.commands.transmit(transport, mode.command()).await?;
        }

        info!(
            requested = baud,
            achieved = setting.achieved_baud(),
            command = %setting,
            mode = ?mode,
            "CAN channel open"
        );

        let queue = Arc::new(TxQueue::new(
            Arc::clone(&transport),
            self.config.nak_retry_limit,
        ));
        let cancel = CancellationToken::new();
        let task = InboundDispatcher::new(Arc::clone(&self.listeners), Arc::clone(&queue)).spawn(
            transport,
            self.config.poll_interval(),
            cancel.clone(),
        );

        self.channel = Some(OpenChannel {
            queue,
            cancel,
            task,
        });
        self.state = DeviceState::ChannelOpen;
        Ok(())
    }

    /// Leave the bus; frames still queued are dropped
    ///
    /// The adapter's reply to the close is consumed here so it cannot be
    /// mistaken for the answer to a later command. A missing reply is only
    /// logged.
    pub async fn close_channel(&mut self) -> Result<()> {
        self.expect_state(DeviceState::ChannelOpen, "close_channel")?;
        self.stop_dispatcher().await;

        self.state = DeviceState::Connected;
        self.identity = Identity::default();

        let transport = self.shared_transport()?;
        let mut guard = transport.lock().await;
        match self.commands.transmit(&mut **guard, "C").await {
            Ok(_) => {}
            Err(UsbtinError::Timeout(reason)) => {
                warn!(reason = %reason, "No reply to channel close");
            }
            Err(e) => return Err(e),
        }

        info!("CAN channel closed");
        Ok(())
    }

    /// Stop everything and release the transport
    ///
    /// The device ends up disconnected even when closing the transport
    /// fails; the failure is still returned.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.stop_dispatcher().await;

        let result = match self.transport.take() {
            Some(transport) => transport.lock().await.close().await,
            None => Ok(()),
        };

        self.state = DeviceState::Disconnected;
        self.identity = Identity::default();

        match result {
            Ok(()) => {
                info!("Disconnected");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to close transport");
                Err(UsbtinError::device_io(e.to_string()))
            }
        }
    }

    /// Queue a frame for transmission
    pub async fn send(&self, frame: CanFrame) -> Result<()> {
        self.expect_state(DeviceState::ChannelOpen, "send")?;
        let channel = self.channel.as_ref().ok_or_else(|| self.state_error("send"))?;
        channel.queue.enqueue(frame).await
    }

    /// Frames waiting for an ACK, including the one in flight
    pub async fn pending_frames(&self) -> usize {
        match &self.channel {
            Some(channel) => channel.queue.len().await,
            None => 0,
        }
    }

    pub fn add_listener<L>(&self, listener: L) -> ListenerId
    where
        L: CanFrameListener + 'static,
    {
        self.listeners.add(Arc::new(listener))
    }

    /// Returns whether the listener was registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub async fn transport_stats(&self) -> Option<TransportStats> {
        match &self.transport {
            Some(transport) => Some(transport.lock().await.stats().await),
            None => None,
        }
    }

    async fn stop_dispatcher(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.cancel.cancel();
            if let Err(e) = channel.task.await {
                warn!(error = %e, "Dispatcher task ended abnormally");
            }
            let dropped = channel.queue.len().await;
            if dropped > 0 {
                debug!(dropped, "Discarding queued frames");
            }
        }
    }

    /// Drop replies nobody waited for, such as the one to a channel close
    async fn discard_stale_input(transport: &mut dyn Transport) -> Result<()> {
        transport
            .purge()
            .await
            .map_err(|e| UsbtinError::device_io(e.to_string()))
    }

    fn shared_transport(&self) -> Result<SharedTransport> {
        self.transport
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| UsbtinError::device_io("transport not attached"))
    }

    fn expect_state(&self, expected: DeviceState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(self.state_error(operation))
        }
    }

    fn state_error(&self, operation: &'static str) -> UsbtinError {
        UsbtinError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(channel) = &self.channel {
            channel.cancel.cancel();
        }
    }
}
