//! Routing fabric: best-effort message dispatch between the controller,
//! the sidecar, and driver-adjacent subscribers.
//!
//! Producers never fail because of missing listeners. Inbound envelopes
//! carry a target tag; subscribers registered under a different target
//! skip the message (the no-match sentinel) so other listeners still
//! receive it.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::types::TabId;

/// Who an envelope is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Controller,
    Sidecar,
}

/// Messages carried by the fabric.
#[derive(Debug, Clone)]
pub enum FabricMessage {
    /// The browser tore down a debugger attachment on its own (tab close,
    /// user intervention). The driver marks itself detached on receipt.
    DebuggerDetached { tab: TabId, reason: String },
    /// Server-initiated session request, relayed by the sidecar.
    StartAutomation {
        goal: String,
        session_id: String,
        max_steps: Option<u32>,
    },
    /// External stop request for the named session.
    StopRequested { session_id: String },
    /// Pass-through hook point for in-page helpers (highlight, read,
    /// simulate, extract). Not interpreted by the core.
    ContentRequest { kind: String, payload: Value },
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub target: RouteTarget,
    pub message: FabricMessage,
}

/// Outcome of a publish. Purely informational; senders are free to
/// ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// At least one matching listener accepted the message.
    Delivered,
    /// No listener matched the target (or all mailboxes were gone).
    NoMatch,
}

struct Subscriber {
    target: RouteTarget,
    tx: mpsc::Sender<Envelope>,
}

/// The dispatch hub. Cheap to clone; all clones share one listener table.
#[derive(Clone)]
pub struct RoutingFabric {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl RoutingFabric {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a listener for one target. Dropping the receiver
    /// unsubscribes lazily on the next publish.
    pub async fn subscribe(&self, target: RouteTarget) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().await.push(Subscriber { target, tx });
        rx
    }

    /// Deliver to every matching listener. Best-effort: full or closed
    /// mailboxes are skipped, and closed ones are pruned.
    pub async fn publish(&self, envelope: Envelope) -> Delivery {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|s| !s.tx.is_closed());

        let mut delivered = false;
        for sub in subscribers.iter() {
            if sub.target != envelope.target {
                // No-match sentinel: skip so later listeners still see it.
                continue;
            }
            match sub.tx.try_send(envelope.clone()) {
                Ok(()) => delivered = true,
                Err(e) => debug!(error = %e, "Fabric listener mailbox unavailable, skipping"),
            }
        }

        if delivered {
            Delivery::Delivered
        } else {
            debug!(target = ?envelope.target, "No fabric listener matched");
            Delivery::NoMatch
        }
    }
}

impl Default for RoutingFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detach(tab: u32) -> Envelope {
        Envelope {
            target: RouteTarget::Controller,
            message: FabricMessage::DebuggerDetached {
                tab: TabId(tab),
                reason: "target_closed".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_publish_without_listeners_is_no_match() {
        let fabric = RoutingFabric::new();
        assert_eq!(fabric.publish(detach(1)).await, Delivery::NoMatch);
    }

    #[tokio::test]
    async fn test_target_filtering() {
        let fabric = RoutingFabric::new();
        let mut controller_rx = fabric.subscribe(RouteTarget::Controller).await;
        let mut sidecar_rx = fabric.subscribe(RouteTarget::Sidecar).await;

        assert_eq!(fabric.publish(detach(7)).await, Delivery::Delivered);

        let received = controller_rx.recv().await.unwrap();
        match received.message {
            FabricMessage::DebuggerDetached { tab, .. } => assert_eq!(tab, TabId(7)),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(sidecar_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_listener_does_not_fail_send() {
        let fabric = RoutingFabric::new();
        let rx = fabric.subscribe(RouteTarget::Controller).await;
        drop(rx);
        assert_eq!(fabric.publish(detach(2)).await, Delivery::NoMatch);
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_matching_listeners() {
        let fabric = RoutingFabric::new();
        let mut rx_a = fabric.subscribe(RouteTarget::Controller).await;
        let mut rx_b = fabric.subscribe(RouteTarget::Controller).await;

        fabric.publish(detach(3)).await;
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }
}
