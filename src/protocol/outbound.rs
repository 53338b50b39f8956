//! Outbound Queue
//!
//! Every frame a session writes (responses, stream events, broadcasts) goes
//! through one unbounded queue, drained by the connection loop in order.
//! Once closed, the queue silently drops everything.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tracing::error;

use super::wire::{encode, OutboundMessage};

struct OutboundState {
    closed: AtomicBool,
    pending: AtomicUsize,
    close_requested: Notify,
}

/// Sending half of a session's outbound queue.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<String>,
    state: Arc<OutboundState>,
}

/// Receiving half, owned by the connection loop.
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    state: Arc<OutboundState>,
}

/// Outcome of an advisory send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Backlog above the limit
    Backpressured,
    Closed,
}

impl Outbound {
    pub fn channel() -> (Outbound, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(OutboundState {
            closed: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            close_requested: Notify::new(),
        });
        (
            Outbound {
                tx,
                state: Arc::clone(&state),
            },
            OutboundReceiver { rx, state },
        )
    }

    /// Encode and queue a message. Returns `false` if it was dropped.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        match encode(message) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                error!(error = %e, "outbound_encode_failed");
                false
            }
        }
    }

    /// Queue an already encoded frame.
    pub fn send_text(&self, text: String) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(text).is_err() {
            self.state.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Queue unless more than `max_backlog` frames are waiting (0 = no limit).
    pub fn try_send_advisory(&self, text: String, max_backlog: usize) -> Delivery {
        if self.is_closed() {
            return Delivery::Closed;
        }
        if max_backlog > 0 && self.pending() >= max_backlog {
            return Delivery::Backpressured;
        }
        if self.send_text(text) {
            Delivery::Queued
        } else {
            Delivery::Closed
        }
    }

    /// Frames queued but not yet taken by the connection loop.
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::Acquire)
    }

    /// Stop accepting frames. Returns `true` if this call closed the queue.
    pub fn close(&self) -> bool {
        !self.state.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Ask the connection loop to close the transport.
    pub fn request_close(&self) {
        self.state.close_requested.notify_one();
    }

    /// Resolves once [`request_close`](Self::request_close) has been called.
    pub async fn close_requested(&self) {
        self.state.close_requested.notified().await;
    }
}

impl OutboundReceiver {
    /// Next frame to write, in queue order.
    pub async fn recv(&mut self) -> Option<String> {
        let frame = self.rx.recv().await?;
        self.state.pending.fetch_sub(1, Ordering::AcqRel);
        Some(frame)
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<String> {
        let frame = self.rx.try_recv().ok()?;
        self.state.pending.fetch_sub(1, Ordering::AcqRel);
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::ReconnectNotification;
    use std::time::Duration;

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (out, mut rx) = Outbound::channel();
        assert!(out.send_text("a".into()));
        assert!(out.send_text("b".into()));
        assert_eq!(out.pending(), 2);
        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("b"));
        assert_eq!(out.pending(), 0);
    }

    #[tokio::test]
    async fn test_closed_queue_drops_frames() {
        let (out, mut rx) = Outbound::channel();
        assert!(out.close());
        assert!(!out.close());
        assert!(!out.send(&ReconnectNotification.into()));
        assert_eq!(out.try_send_advisory("x".into(), 0), Delivery::Closed);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_advisory_respects_backlog() {
        let (out, _rx) = Outbound::channel();
        assert_eq!(out.try_send_advisory("1".into(), 2), Delivery::Queued);
        assert_eq!(out.try_send_advisory("2".into(), 2), Delivery::Queued);
        assert_eq!(out.try_send_advisory("3".into(), 2), Delivery::Backpressured);
        assert_eq!(out.try_send_advisory("3".into(), 0), Delivery::Queued);
    }

    #[tokio::test]
    async fn test_close_request_is_remembered() {
        let (out, _rx) = Outbound::channel();
        out.request_close();
        tokio::time::timeout(Duration::from_secs(1), out.close_requested())
            .await
            .unwrap();
    }
}
