//! Broadcast Channel
//!
//! Registry of every live session in the process, used to push reconnect
//! notifications straight onto each session's outbound queue. Delivery is
//! advisory: a session with a full backlog is skipped (or asked to close),
//! never awaited.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::outbound::{Delivery, Outbound};
use super::subscriptions::SubscriptionTable;
use super::wire::{encode, OutboundMessage, ReconnectNotification};

struct RegisteredSession {
    outbound: Outbound,
    subscriptions: Arc<SubscriptionTable>,
}

/// Per-session results of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
    /// Sessions asked to close because of backpressure
    pub closed: usize,
}

/// Live sessions, keyed by session id.
pub struct SessionRegistry {
    sessions: DashMap<Uuid, RegisteredSession>,
    max_backpressure: usize,
    close_on_backpressure_limit: bool,
}

impl SessionRegistry {
    pub fn new(max_backpressure: usize, close_on_backpressure_limit: bool) -> Self {
        Self {
            sessions: DashMap::new(),
            max_backpressure,
            close_on_backpressure_limit,
        }
    }

    pub fn register(&self, id: Uuid, outbound: Outbound, subscriptions: Arc<SubscriptionTable>) {
        self.sessions.insert(
            id,
            RegisteredSession {
                outbound,
                subscriptions,
            },
        );
    }

    pub fn deregister(&self, id: &Uuid) -> bool {
        self.sessions.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Active subscriptions across all registered sessions.
    pub fn subscription_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|entry| entry.subscriptions.len())
            .sum()
    }

    /// Queue `notification` on every registered session without waiting.
    pub fn publish(&self, notification: &ReconnectNotification) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let text = match encode(&OutboundMessage::Reconnect(*notification)) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "broadcast_encode_failed");
                return report;
            }
        };

        for entry in &self.sessions {
            match entry
                .outbound
                .try_send_advisory(text.clone(), self.max_backpressure)
            {
                Delivery::Queued => report.delivered += 1,
                Delivery::Closed => report.skipped += 1,
                Delivery::Backpressured if self.close_on_backpressure_limit => {
                    debug!(session_id = %entry.key(), "broadcast_backpressure_close");
                    entry.outbound.request_close();
                    report.closed += 1;
                }
                Delivery::Backpressured => {
                    debug!(session_id = %entry.key(), "broadcast_backpressure_skip");
                    report.skipped += 1;
                }
            }
        }

        info!(
            delivered = report.delivered,
            skipped = report.skipped,
            closed = report.closed,
            "reconnect_broadcast"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &SessionRegistry) -> (Uuid, Outbound, crate::protocol::OutboundReceiver) {
        let (outbound, rx) = Outbound::channel();
        let id = Uuid::new_v4();
        registry.register(id, outbound.clone(), Arc::new(SubscriptionTable::new()));
        (id, outbound, rx)
    }

    #[test]
    fn test_publish_reaches_every_session() {
        let registry = SessionRegistry::new(0, false);
        let mut receivers: Vec<_> = (0..3).map(|_| register(&registry).2).collect();

        let report = registry.publish(&ReconnectNotification);
        assert_eq!(report.delivered, 3);
        for rx in &mut receivers {
            assert_eq!(
                rx.try_recv().as_deref(),
                Some(r#"{"id":null,"method":"reconnect"}"#)
            );
            assert!(rx.try_recv().is_none());
        }
    }

    #[test]
    fn test_deregistered_session_is_not_reached() {
        let registry = SessionRegistry::new(0, false);
        let (id, _out, mut rx) = register(&registry);
        assert!(registry.deregister(&id));
        assert!(!registry.deregister(&id));
        assert_eq!(registry.publish(&ReconnectNotification).delivered, 0);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_backpressured_session_is_skipped_or_closed() {
        let registry = SessionRegistry::new(1, false);
        let (_id, out, _rx) = register(&registry);
        out.send_text("backlog".into());
        let report = registry.publish(&ReconnectNotification);
        assert_eq!(report.skipped, 1);

        let registry = SessionRegistry::new(1, true);
        let (_id, out, _rx) = register(&registry);
        out.send_text("backlog".into());
        let report = registry.publish(&ReconnectNotification);
        assert_eq!(report.closed, 1);
    }
}
