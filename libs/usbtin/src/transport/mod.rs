//! Transport Layer Module
//!
//! Separates the physical link from the protocol engine.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │   Device / CommandChannel / TxQueue / InboundDispatcher │
//! └─────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              Transport Interface (Trait)                │
//! │    connect(), send(), receive(), purge(), close()       │
//! └─────────────────────────────────────────────────────────┘
//!                ┌────────────┴────────────┐
//!                ▼                         ▼
//!        ┌──────────────┐          ┌──────────────┐
//!        │    Serial    │          │     Mock     │
//!        │  Transport   │          │  Transport   │
//!        └──────────────┘          └──────────────┘
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod serial;
pub mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockHandle, MockTransport, MockTransportConfig};
pub use serial::{SerialTransport, SerialTransportConfig};
pub use traits::{ConnectionState, Transport, TransportConfig, TransportError, TransportStats};

use std::sync::Arc;
use tokio::sync::Mutex;

/// Transport shared between the caller side and the dispatcher task
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Wrap a transport for sharing
pub fn shared(transport: Box<dyn Transport>) -> SharedTransport {
    Arc::new(Mutex::new(transport))
}
