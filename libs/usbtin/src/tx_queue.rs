//! Outbound Frame Queue
//!
//! FIFO with at most one frame in flight. The adapter answers every
//! transmitted frame with `z`/`Z` (sent) or BELL (not sent); the head is only
//! removed on the former and retransmitted unchanged on the latter.

use std::collections::VecDeque;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{Result, UsbtinError};
use crate::frame::CanFrame;
use crate::transport::SharedTransport;

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<CanFrame>,
    /// Head has been written and awaits ACK/NAK
    in_flight: bool,
    /// NAKs received for the current head
    naks: u32,
    /// Set once nobody reads ACKs any more
    link_down: Option<String>,
}

/// Single-flight transmit queue
///
/// The state lock is held across every transmit, so an `enqueue` racing
/// with ACK/NAK handling never puts a second frame on the wire. Lock order
/// is queue state, then transport.
#[derive(Debug)]
pub struct TxQueue {
    state: Mutex<QueueState>,
    transport: SharedTransport,
    nak_retry_limit: Option<u32>,
}

impl TxQueue {
    /// `nak_retry_limit` of `None` retransmits forever
    pub fn new(transport: SharedTransport, nak_retry_limit: Option<u32>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            transport,
            nak_retry_limit,
        }
    }

    /// Append `frame`; transmit right away when nothing is in flight
    ///
    /// If that transmission fails the frame is taken off the queue again
    /// and the error returned, leaving the retry to the caller. After
    /// [`mark_link_down`](Self::mark_link_down) every call fails with
    /// `DeviceIo`.
    pub async fn enqueue(&self, frame: CanFrame) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(reason) = &state.link_down {
            return Err(UsbtinError::device_io(format!("link down: {reason}")));
        }
        state.frames.push_back(frame);

        if state.in_flight {
            debug!(queued = state.frames.len(), "Frame queued behind in-flight frame");
            return Ok(());
        }

        if let Err(e) = self.transmit_head(&mut state).await {
            state.frames.pop_back();
            return Err(e);
        }
        Ok(())
    }

    /// Head was sent on the bus: drop it and start the next one
    ///
    /// An ACK with nothing in flight is stray and leaves the queue alone;
    /// the head may never have reached the wire.
    pub async fn on_ack(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        if !state.in_flight {
            debug!(queued = state.frames.len(), "ACK with no frame in flight, ignored");
            return Ok(());
        }

        state.frames.pop_front();
        state.in_flight = false;
        state.naks = 0;

        if state.frames.is_empty() {
            return Ok(());
        }
        self.transmit_head(&mut state).await
    }

    /// Head was refused: send it again, or give up past the retry limit
    pub async fn on_nak(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.in_flight = false;

        if state.frames.is_empty() {
            debug!("NAK with empty transmit queue");
            return Ok(());
        }

        state.naks += 1;
        if let Some(limit) = self.nak_retry_limit {
            if state.naks > limit {
                let dropped = state.frames.pop_front();
                state.naks = 0;
                warn!(frame = ?dropped, limit, "Dropping frame after repeated NAKs");

                if !state.frames.is_empty() {
                    if let Err(e) = self.transmit_head(&mut state).await {
                        warn!(error = %e, "Failed to start next frame");
                    }
                }
                return Err(UsbtinError::LinkBroken(format!(
                    "frame refused {} times",
                    limit + 1
                )));
            }
        }

        debug!(naks = state.naks, "Retransmitting after NAK");
        self.transmit_head(&mut state).await
    }

    /// Refuse further frames; queued ones will never be acknowledged
    pub async fn mark_link_down(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock().await;
        warn!(queued = state.frames.len(), reason = %reason, "Transmit queue closed");
        state.in_flight = false;
        state.link_down = Some(reason);
    }

    pub async fn is_link_down(&self) -> bool {
        self.state.lock().await.link_down.is_some()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.frames.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.frames.is_empty()
    }

    pub async fn in_flight(&self) -> bool {
        self.state.lock().await.in_flight
    }

    async fn transmit_head(&self, state: &mut QueueState) -> Result<()> {
        let Some(head) = state.frames.front() else {
            return Ok(());
        };
        let line = codec::encode_line(head);

        self.transport
            .lock()
            .await
            .send(&line)
            .await
            .map_err(|e| UsbtinError::device_io(e.to_string()))?;

        state.in_flight = true;
        debug!(frame = %head, "Frame transmitted");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::transport::{self, MockHandle, MockTransport, MockTransportConfig, Transport};

    async fn queue(limit: Option<u32>) -> (TxQueue, MockHandle) {
        let mut mock = MockTransport::new(MockTransportConfig::default()).unwrap();
        let handle = mock.handle();
        mock.connect().await.unwrap();
        (TxQueue::new(transport::shared(Box::new(mock)), limit), handle)
    }

    fn frame(id: u32) -> CanFrame {
        CanFrame::new(id, vec![id as u8]).unwrap()
    }

    #[tokio::test]
    async fn test_single_flight() {
        let (queue, handle) = queue(None).await;

        queue.enqueue(frame(0x1)).await.unwrap();
        queue.enqueue(frame(0x2)).await.unwrap();
        queue.enqueue(frame(0x3)).await.unwrap();

        assert_eq!(handle.sent_lines().await, vec!["t001101\r"]);
        assert_eq!(queue.len().await, 3);
        assert!(queue.in_flight().await);
    }

    #[tokio::test]
    async fn test_ack_advances_in_order() {
        let (queue, handle) = queue(None).await;
        for id in 1..=3 {
            queue.enqueue(frame(id)).await.unwrap();
        }

        queue.on_ack().await.unwrap();
        queue.on_ack().await.unwrap();
        assert_eq!(
            handle.sent_lines().await,
            vec!["t001101\r", "t002102\r", "t003103\r"]
        );

        queue.on_ack().await.unwrap();
        assert!(queue.is_empty().await);
        assert!(!queue.in_flight().await);
        assert_eq!(handle.sent_data().await.len(), 3);
    }

    #[tokio::test]
    async fn test_nak_retransmits_head() {
        let (queue, handle) = queue(None).await;
        queue.enqueue(frame(0x1)).await.unwrap();
        queue.enqueue(frame(0x2)).await.unwrap();

        for _ in 0..5 {
            queue.on_nak().await.unwrap();
        }
        let sent = handle.sent_lines().await;
        assert_eq!(sent.len(), 6);
        assert!(sent.iter().all(|line| line == "t001101\r"));
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_ack_nak_on_empty_queue() {
        let (queue, handle) = queue(None).await;
        queue.on_ack().await.unwrap();
        queue.on_nak().await.unwrap();
        assert!(handle.sent_data().await.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_failure_removes_frame() {
        let (queue, handle) = queue(None).await;
        handle.set_send_failure(true).await;

        let err = queue.enqueue(frame(0x1)).await.unwrap_err();
        assert!(matches!(err, UsbtinError::DeviceIo(_)));
        assert!(queue.is_empty().await);
        assert!(!queue.in_flight().await);

        handle.set_send_failure(false).await;
        queue.enqueue(frame(0x2)).await.unwrap();
        assert_eq!(handle.sent_lines().await, vec!["t002102\r"]);
    }

    #[tokio::test]
    async fn test_failed_retransmit_is_kicked_by_next_enqueue() {
        let (queue, handle) = queue(None).await;
        queue.enqueue(frame(0x1)).await.unwrap();
        queue.enqueue(frame(0x2)).await.unwrap();

        handle.set_send_failure(true).await;
        assert!(queue.on_ack().await.is_err());
        assert_eq!(queue.len().await, 1);
        assert!(!queue.in_flight().await);

        handle.set_send_failure(false).await;
        queue.enqueue(frame(0x3)).await.unwrap();
        assert_eq!(
            handle.sent_lines().await,
            vec!["t001101\r", "t002102\r"]
        );
        assert_eq!(queue.len().await, 2);
        assert!(queue.in_flight().await);
    }

    #[tokio::test]
    async fn test_stray_ack_keeps_unsent_head() {
        let (queue, handle) = queue(None).await;
        queue.enqueue(frame(0x1)).await.unwrap();
        queue.enqueue(frame(0x2)).await.unwrap();

        handle.set_send_failure(true).await;
        assert!(queue.on_ack().await.is_err());
        handle.set_send_failure(false).await;

        // frame 2 never went out, so a duplicate ACK must not consume it
        queue.on_ack().await.unwrap();
        assert_eq!(queue.len().await, 1);
        assert!(!queue.in_flight().await);
        assert_eq!(handle.sent_lines().await, vec!["t001101\r"]);

        queue.enqueue(frame(0x3)).await.unwrap();
        assert_eq!(handle.sent_lines().await, vec!["t001101\r", "t002102\r"]);
    }

    #[tokio::test]
    async fn test_enqueue_refused_after_link_down() {
        let (queue, handle) = queue(None).await;
        queue.enqueue(frame(0x1)).await.unwrap();

        queue.mark_link_down("read failed").await;
        assert!(queue.is_link_down().await);

        let err = queue.enqueue(frame(0x2)).await.unwrap_err();
        assert!(matches!(err, UsbtinError::DeviceIo(ref m) if m.contains("read failed")));
        assert_eq!(queue.len().await, 1);
        assert_eq!(handle.sent_lines().await, vec!["t001101\r"]);
    }

    #[tokio::test]
    async fn test_nak_retry_limit() {
        let (queue, handle) = queue(Some(2)).await;
        queue.enqueue(frame(0x1)).await.unwrap();
        queue.enqueue(frame(0x2)).await.unwrap();

        queue.on_nak().await.unwrap();
        queue.on_nak().await.unwrap();
        let err = queue.on_nak().await.unwrap_err();
        assert!(matches!(err, UsbtinError::LinkBroken(_)));

        // the stuck frame is gone and the next one is on the wire
        assert_eq!(queue.len().await, 1);
        let sent = handle.sent_lines().await;
        assert_eq!(sent.len(), 4);
        assert_eq!(sent.last().unwrap(), "t002102\r");
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_keeps_order() {
        let (queue, handle) = queue(None).await;
        let queue = Arc::new(queue);

        for id in 1..=20u32 {
            queue.enqueue(frame(id)).await.unwrap();
        }

        let acker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for _ in 0..20 {
                    queue.on_ack().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        for id in 21..=30u32 {
            queue.enqueue(frame(id)).await.unwrap();
            tokio::task::yield_now().await;
        }
        acker.await.unwrap();

        let sent = handle.sent_lines().await;
        let expected: Vec<String> = (1..=21u32)
            .map(|id| codec::encode(&frame(id)) + "\r")
            .collect();
        assert_eq!(sent, expected);
        assert_eq!(queue.len().await, 10);
    }
}
