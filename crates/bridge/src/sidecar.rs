//! Sidecar host for the bridge transport.
//!
//! The transport lives on its own long-lived task so the socket outlives
//! any one session controller, the way an offscreen document outlives a
//! service worker. Controllers talk to it over a local command channel;
//! the same client interface covers direct mode, where the controller
//! owns the sidecar task itself.

use std::collections::VecDeque;
use std::time::Duration;
use tabpilot_core::config::BridgeConfig;
use tabpilot_core::{ConnectionState, Error, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::{BridgeEvent, BridgeTransport};

/// Events buffered for the next subscriber while no controller listens.
const PARKED_EVENT_CAP: usize = 16;

enum SidecarCommand {
    Send(ClientMessage),
    Probe { reply: oneshot::Sender<bool> },
    Subscribe { tx: mpsc::Sender<BridgeEvent> },
    Unsubscribe,
}

enum SidecarEnd {
    Respawn,
    TransportGone,
    Shutdown,
}

/// Controller-side handle to the sidecar.
#[derive(Clone)]
pub struct SidecarClient {
    command_tx: mpsc::Sender<SidecarCommand>,
    config: BridgeConfig,
}

impl SidecarClient {
    /// Queue an application message for the policy server.
    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.command_tx
            .send(SidecarCommand::Send(msg))
            .await
            .map_err(|_| Error::Transport("sidecar is gone".to_string()))
    }

    /// Ask the sidecar whether it is alive, waiting up to `timeout`.
    pub async fn probe(&self, timeout: Duration) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(SidecarCommand::Probe { reply: reply_tx })
            .await
            .is_err()
        {
            return false;
        }
        matches!(tokio::time::timeout(timeout, reply_rx).await, Ok(Ok(true)))
    }

    /// Reconnect handshake: probe with a 500 ms ready wait, then push a
    /// handshake ping, retrying a few times with a short gap.
    pub async fn ensure_ready(&self) -> Result<()> {
        if !self.probe(Duration::from_millis(500)).await {
            warn!("Sidecar did not answer ready probe");
        }
        let mut last_err = None;
        for attempt in 1..=self.config.handshake_retries.max(1) {
            match self.send(ClientMessage::Ping).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(attempt = attempt, error = %e, "Sidecar handshake attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(
                        self.config.handshake_retry_delay_ms,
                    ))
                    .await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Transport("sidecar handshake failed".to_string())))
    }

    /// Become the sidecar's single subscriber. Any events parked while no
    /// controller was listening are flushed first.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<BridgeEvent>> {
        let (tx, rx) = mpsc::channel(64);
        self.command_tx
            .send(SidecarCommand::Subscribe { tx })
            .await
            .map_err(|_| Error::Transport("sidecar is gone".to_string()))?;
        Ok(rx)
    }

    /// Clear the subscriber slot so stray policy actions drop.
    pub async fn unsubscribe(&self) {
        let _ = self.command_tx.send(SidecarCommand::Unsubscribe).await;
    }
}

pub struct SidecarHost {
    config: BridgeConfig,
    command_rx: mpsc::Receiver<SidecarCommand>,
    subscriber: Option<mpsc::Sender<BridgeEvent>>,
    parked: VecDeque<BridgeEvent>,
}

impl SidecarHost {
    /// Spawn the sidecar task. The returned client is cheap to clone and
    /// hand to successive controllers.
    pub fn spawn(
        config: BridgeConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> (SidecarClient, tokio::task::JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(256);
        let host = Self {
            config: config.clone(),
            command_rx,
            subscriber: None,
            parked: VecDeque::new(),
        };
        let handle = tokio::spawn(host.run_loop(shutdown));
        (SidecarClient { command_tx, config }, handle)
    }

    async fn run_loop(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Bridge sidecar started");
        // Messages that outlived a dead transport; handed to the next one.
        let mut carryover: Vec<ClientMessage> = Vec::new();
        loop {
            // One transport incarnation per iteration; a fresh one gets a
            // fresh reconnect budget.
            let (outbound_tx, mut event_rx, transport) =
                BridgeTransport::new(self.config.clone());
            let transport_task = tokio::spawn(transport.run_loop(shutdown.resubscribe()));
            for msg in carryover.drain(..) {
                let _ = outbound_tx.send(msg).await;
            }

            let end = loop {
                tokio::select! {
                    cmd = self.command_rx.recv() => {
                        let Some(cmd) = cmd else { break SidecarEnd::Shutdown };
                        match cmd {
                            SidecarCommand::Send(msg) => {
                                if let Err(failed) = outbound_tx.send(msg).await {
                                    // Transport died; a new session is
                                    // asking, so bring up a fresh one and
                                    // let it deliver the message.
                                    carryover.push(failed.0);
                                    break SidecarEnd::Respawn;
                                }
                            }
                            SidecarCommand::Probe { reply } => { let _ = reply.send(true); }
                            SidecarCommand::Subscribe { tx } => self.set_subscriber(tx).await,
                            SidecarCommand::Unsubscribe => self.subscriber = None,
                        }
                    }
                    event = event_rx.recv() => {
                        match event {
                            Some(event) => self.forward(event).await,
                            // Budget exhausted; park until a command shows
                            // demand for a new transport.
                            None => break SidecarEnd::TransportGone,
                        }
                    }
                    _ = shutdown.recv() => break SidecarEnd::Shutdown,
                }
            };

            transport_task.abort();
            match end {
                SidecarEnd::Respawn => {
                    debug!("Respawning bridge transport on demand");
                }
                SidecarEnd::TransportGone => {
                    match self.wait_for_demand(&mut shutdown).await {
                        Some(msg) => carryover.push(msg),
                        None => {
                            info!("Bridge sidecar shutting down");
                            return;
                        }
                    }
                }
                SidecarEnd::Shutdown => {
                    info!("Bridge sidecar shutting down");
                    return;
                }
            }
        }
    }

    /// Transport is gone. Serve probes/subscriptions from the parked
    /// state and respawn only when someone tries to send again; the
    /// triggering message rides along to the new transport.
    async fn wait_for_demand(
        &mut self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<ClientMessage> {
        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    let cmd = cmd?;
                    match cmd {
                        SidecarCommand::Send(msg) => return Some(msg),
                        SidecarCommand::Probe { reply } => { let _ = reply.send(true); }
                        SidecarCommand::Subscribe { tx } => self.set_subscriber(tx).await,
                        SidecarCommand::Unsubscribe => self.subscriber = None,
                    }
                }
                _ = shutdown.recv() => return None,
            }
        }
    }

    async fn set_subscriber(&mut self, tx: mpsc::Sender<BridgeEvent>) {
        while let Some(event) = self.parked.pop_front() {
            let _ = tx.send(event).await;
        }
        self.subscriber = Some(tx);
    }

    async fn forward(&mut self, event: BridgeEvent) {
        if let Some(tx) = &self.subscriber {
            if tx.send(event.clone()).await.is_ok() {
                return;
            }
            self.subscriber = None;
        }
        self.park(event);
    }

    /// No subscriber. Policy actions are stray and must drop; session
    /// bootstrap messages are parked for the next controller.
    fn park(&mut self, event: BridgeEvent) {
        match &event {
            BridgeEvent::Message(ServerMessage::Action(_)) => {
                debug!("Dropping stray policy action: no session subscribed");
            }
            BridgeEvent::State(ConnectionState::Connecting)
            | BridgeEvent::State(ConnectionState::Connected)
            | BridgeEvent::State(ConnectionState::Disconnected) => {
                // Transient; the next subscriber sees fresh state events.
            }
            _ => {
                if self.parked.len() >= PARKED_EVENT_CAP {
                    self.parked.pop_front();
                }
                self.parked.push_back(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabpilot_core::Action;

    fn host_for_test() -> SidecarHost {
        let (_tx, command_rx) = mpsc::channel(8);
        SidecarHost {
            config: BridgeConfig::default(),
            command_rx,
            subscriber: None,
            parked: VecDeque::new(),
        }
    }

    #[test]
    fn test_stray_actions_drop_without_subscriber() {
        let mut host = host_for_test();
        host.park(BridgeEvent::Message(ServerMessage::Action(Action::wait())));
        assert!(host.parked.is_empty());
    }

    #[test]
    fn test_start_automation_parks_for_next_controller() {
        let mut host = host_for_test();
        host.park(BridgeEvent::Message(ServerMessage::StartAutomation {
            goal: "g".to_string(),
            session_id: "s".to_string(),
            max_steps: None,
        }));
        assert_eq!(host.parked.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_flushes_parked_events() {
        let mut host = host_for_test();
        host.park(BridgeEvent::Message(ServerMessage::ReloadExtension));
        let (tx, mut rx) = mpsc::channel(8);
        host.set_subscriber(tx).await;
        assert!(matches!(
            rx.try_recv(),
            Ok(BridgeEvent::Message(ServerMessage::ReloadExtension))
        ));
    }

    #[tokio::test]
    async fn test_probe_answers_ready() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let config = BridgeConfig {
            // Nothing listening; the transport just backs off in the
            // background while we probe the sidecar itself.
            url: "ws://127.0.0.1:1".to_string(),
            reconnect_base_ms: 50,
            ..BridgeConfig::default()
        };
        let (client, handle) = SidecarHost::spawn(config, shutdown_rx);
        assert!(client.probe(Duration::from_millis(500)).await);
        let _ = shutdown_tx.send(());
        let _ = handle.await;
    }
}
