//! USBtin CAN Adapter Library
//!
//! Drives a USBtin (MCP2515 behind a USB virtual serial port) through its
//! ASCII line protocol.
//!
//! # Architecture
//!
//! - **Transport**: async byte link (`tokio-serial`, or a scripted mock)
//! - **Codec**: CAN frames to and from `t/T/r/R` lines
//! - **Bit timing / filters**: MCP2515 register arithmetic
//! - **Command channel**: synchronous request/response while idle
//! - **Dispatcher + TX queue**: inbound line routing and single-flight
//!   transmission once a channel is open
//! - **Device**: connection state machine tying it together
//!
//! ```no_run
//! use usbtin::{CanFrame, Device, DeviceConfig, OpenMode};
//!
//! # async fn run() -> usbtin::Result<()> {
//! let mut device = Device::new(DeviceConfig::default());
//! device.connect("/dev/ttyACM0").await?;
//! device.add_listener(|frame: &CanFrame| println!("{frame}"));
//! device.open_channel(500_000, OpenMode::Active).await?;
//! device.send(CanFrame::new(0x123, vec![0x11, 0x22])?).await?;
//! device.close_channel().await?;
//! device.disconnect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - `test-utils` - exposes [`transport::MockTransport`] to downstream tests

pub mod bit_timing;
pub mod codec;
pub mod command;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod frame;
pub mod logging;
pub mod transport;
pub mod tx_queue;

pub use bit_timing::{BaudSetting, CustomTiming};
pub use command::CommandChannel;
pub use config::DeviceConfig;
pub use device::{Device, DeviceState, OpenMode};
pub use dispatcher::{CanFrameListener, ListenerId};
pub use error::{Result, UsbtinError};
pub use filter::{FilterChain, FilterMask, FilterValue, RegisterWrite};
pub use frame::CanFrame;
pub use logging::{init_logging, LogConfig, LogConfigBuilder, LogFormat};
pub use transport::{SerialTransport, SerialTransportConfig, Transport, TransportError};
