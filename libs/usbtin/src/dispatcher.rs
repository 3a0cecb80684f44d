//! Inbound Dispatcher
//!
//! Once a channel is open the adapter speaks unprompted: received frames,
//! transmit ACKs (`z`/`Z`) and NAKs (BELL). The dispatcher owns the inbound
//! byte stream from then on, splits it into lines and routes each one.
//!
//! ```text
//!   transport ──bytes──▶ InboundDispatcher ──t/T/r/R──▶ listeners
//!                               │
//!                               └──z/Z, BELL──▶ TxQueue
//! ```
//!
//! Listeners run synchronously inside the dispatch step. A listener that
//! blocks stalls inbound processing, so keep them short.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{self, BELL, TERMINATOR};
use crate::frame::CanFrame;
use crate::transport::SharedTransport;
use crate::tx_queue::TxQueue;

/// Read chunk size per transport poll
const READ_CHUNK: usize = 64;

/// Receiver of decoded CAN frames
pub trait CanFrameListener: Send + Sync {
    fn on_frame(&self, frame: &CanFrame);
}

impl<F> CanFrameListener for F
where
    F: Fn(&CanFrame) + Send + Sync,
{
    fn on_frame(&self, frame: &CanFrame) {
        self(frame)
    }
}

/// Handle returned by [`ListenerRegistry::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered set of listeners shared by the device and its dispatcher
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn CanFrameListener>)>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn CanFrameListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Returns whether the listener was registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver `frame` to every listener in registration order
    pub fn notify(&self, frame: &CanFrame) {
        // snapshot so listeners may add or remove listeners themselves
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_frame(frame))).is_err() {
                error!(listener = ?id, frame = %frame, "Listener panicked");
            }
        }
    }
}

/// Line splitter and router for the inbound stream
#[derive(Debug)]
pub struct InboundDispatcher {
    buffer: Vec<u8>,
    listeners: Arc<ListenerRegistry>,
    queue: Arc<TxQueue>,
}

impl InboundDispatcher {
    pub fn new(listeners: Arc<ListenerRegistry>, queue: Arc<TxQueue>) -> Self {
        Self {
            buffer: Vec::with_capacity(32),
            listeners,
            queue,
        }
    }

    pub async fn process(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.process_byte(byte).await;
        }
    }

    pub async fn process_byte(&mut self, byte: u8) {
        match byte {
            TERMINATOR => {
                if !self.buffer.is_empty() {
                    let line = String::from_utf8_lossy(&self.buffer).into_owned();
                    self.buffer.clear();
                    self.handle_line(&line).await;
                }
            }
            BELL => {
                if let Err(e) = self.queue.on_nak().await {
                    warn!(error = %e, "NAK handling failed");
                }
            }
            other => self.buffer.push(other),
        }
    }

    async fn handle_line(&self, line: &str) {
        match line.as_bytes().first() {
            Some(b't' | b'T' | b'r' | b'R') => {
                let frame = codec::decode(line);
                debug!(frame = %frame, "Frame received");
                self.listeners.notify(&frame);
            }
            Some(b'z' | b'Z') => {
                if let Err(e) = self.queue.on_ack().await {
                    warn!(error = %e, "ACK handling failed");
                }
            }
            _ => debug!(line, "Ignoring unrecognised line"),
        }
    }

    /// Pump transport bytes through the dispatcher until `cancel` fires
    ///
    /// The transport lock is only held for one bounded read at a time so
    /// writers get a turn every `poll_interval`. A read failure other than
    /// a timeout ends the task and closes the transmit queue.
    pub fn spawn(
        mut self,
        transport: SharedTransport,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Inbound dispatcher started");
            let mut chunk = [0u8; READ_CHUNK];

            loop {
                let read = async {
                    let mut transport = transport.lock().await;
                    transport.receive(&mut chunk, Some(poll_interval)).await
                };

                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = read => result,
                };

                match result {
                    Ok(0) => tokio::task::yield_now().await,
                    Ok(count) => self.process(&chunk[..count]).await,
                    Err(e) if e.is_timeout() => {}
                    Err(e) => {
                        error!(error = %e, "Transport read failed, dispatcher stopping");
                        self.queue.mark_link_down(e.to_string()).await;
                        break;
                    }
                }
            }

            info!("Inbound dispatcher stopped");
        })
    }
}
