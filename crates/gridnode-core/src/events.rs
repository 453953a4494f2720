//! Node events and the bus they are published on.
//!
//! The node only needs two things from a bus: `publish` and a readiness
//! probe. [`LocalEventBus`] is an in-process implementation over a tokio
//! broadcast channel; a networked bus can implement [`EventBus`] instead.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{NodeId, NodeStatus, SessionId};

/// Why a session left the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Stopped on request (client `DELETE`, or explicit `stop`).
    Stopped,
    /// Idle for longer than the session timeout.
    Timeout,
}

/// Everything a node announces to the grid.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// Periodic status snapshot.
    Heartbeat(NodeStatus),
    /// The node stopped accepting new sessions.
    DrainStarted(NodeId),
    /// The last session present at drain time is gone.
    DrainComplete(NodeId),
    /// A session was removed from the node.
    SessionClosed {
        session_id: SessionId,
        reason: CloseReason,
    },
}

/// Publish side of the grid's event channel.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: NodeEvent);

    /// Whether the bus can currently deliver events.
    fn is_ready(&self) -> bool;
}

/// In-process event bus backed by `tokio::sync::broadcast`.
pub struct LocalEventBus {
    tx: broadcast::Sender<NodeEvent>,
    open: AtomicBool,
}

impl LocalEventBus {
    /// Create a bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            open: AtomicBool::new(true),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    /// Stop delivering events. `is_ready` turns false.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for LocalEventBus {
    fn publish(&self, event: NodeEvent) {
        if !self.is_ready() {
            trace!("event bus closed, dropping event");
            return;
        }
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    fn is_ready(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = LocalEventBus::default();
        let mut rx = bus.subscribe();

        let node_id = NodeId::new();
        bus.publish(NodeEvent::DrainStarted(node_id));

        assert_eq!(rx.recv().await.unwrap(), NodeEvent::DrainStarted(node_id));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = LocalEventBus::new(4);
        bus.publish(NodeEvent::DrainComplete(NodeId::new()));
        assert!(bus.is_ready());
    }

    #[tokio::test]
    async fn closed_bus_drops_events() {
        let bus = LocalEventBus::default();
        let mut rx = bus.subscribe();
        bus.close();

        assert!(!bus.is_ready());
        bus.publish(NodeEvent::DrainStarted(NodeId::new()));
        assert!(rx.try_recv().is_err());
    }
}
