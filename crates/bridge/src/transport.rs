//! Reconnecting WebSocket transport to the policy server.
//!
//! Owns the socket for its whole life: connects, heartbeats, queues
//! outbound messages while disconnected, and reconnects with exponential
//! backoff until the attempt budget is spent.

use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tabpilot_core::config::BridgeConfig;
use tabpilot_core::ConnectionState;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::protocol::{ClientMessage, ServerMessage};

/// Everything the transport reports upstream.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    State(ConnectionState),
    Message(ServerMessage),
}

enum ConnectionEnd {
    Closed,
    Shutdown,
}

pub struct BridgeTransport {
    config: BridgeConfig,
    outbound_rx: mpsc::Receiver<ClientMessage>,
    event_tx: mpsc::Sender<BridgeEvent>,
    /// Messages accepted while disconnected, drained FIFO on reconnect.
    queue: VecDeque<ClientMessage>,
}

impl BridgeTransport {
    /// Build a transport plus its send handle and event stream.
    pub fn new(
        config: BridgeConfig,
    ) -> (
        mpsc::Sender<ClientMessage>,
        mpsc::Receiver<BridgeEvent>,
        Self,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        (
            outbound_tx,
            event_rx,
            Self {
                config,
                outbound_rx,
                event_tx,
                queue: VecDeque::new(),
            },
        )
    }

    /// Backoff before reconnect attempt `attempt` (1-based).
    fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.config.reconnect_base_ms << (attempt - 1).min(16))
    }

    fn enqueue(&mut self, msg: ClientMessage) {
        if self.queue.len() >= self.config.outbound_queue_cap {
            warn!("Bridge outbound queue full, dropping oldest message");
            self.queue.pop_front();
        }
        self.queue.push_back(msg);
    }

    async fn emit_state(&self, state: ConnectionState) {
        let _ = self.event_tx.send(BridgeEvent::State(state)).await;
    }

    pub async fn run_loop(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut attempt: u32 = 0;
        loop {
            self.emit_state(ConnectionState::Connecting).await;
            match tokio_tungstenite::connect_async(self.config.url.as_str()).await {
                Ok((ws, _)) => {
                    attempt = 0;
                    info!(url = %self.config.url, "Bridge connected");
                    self.emit_state(ConnectionState::Connected).await;
                    let end = self.drive_connection(ws, &mut shutdown).await;
                    self.emit_state(ConnectionState::Disconnected).await;
                    if matches!(end, ConnectionEnd::Shutdown) {
                        return;
                    }
                    // A lost connection schedules the reconnect at the
                    // base delay; further failures double it.
                    attempt = 1;
                    if self
                        .sleep_queueing(self.backoff_delay(attempt), &mut shutdown)
                        .await
                    {
                        return;
                    }
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.max_reconnect_attempts {
                        error!(error = %e, attempts = attempt, "Bridge reconnect budget exhausted");
                        self.emit_state(ConnectionState::Error).await;
                        return;
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(error = %e, attempt = attempt, delay_ms = delay.as_millis() as u64,
                        "Bridge connect failed, backing off");
                    if self.sleep_queueing(delay, &mut shutdown).await {
                        return;
                    }
                }
            }
        }
    }

    /// Back off while still accepting outbound messages into the queue.
    /// Returns true when shutdown fired.
    async fn sleep_queueing(
        &mut self,
        delay: Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                msg = self.outbound_rx.recv() => match msg {
                    Some(msg) => self.enqueue(msg),
                    None => return true,
                },
                _ = shutdown.recv() => return true,
            }
        }
    }

    async fn drive_connection(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> ConnectionEnd {
        let (mut sink, mut stream) = ws.split();

        // Drain anything queued during the outage, oldest first.
        while let Some(msg) = self.queue.pop_front() {
            if let Err(e) = sink.send(Message::Text(msg.to_json())).await {
                warn!(error = %e, "Bridge send failed during drain, requeueing");
                self.queue.push_front(msg);
                return ConnectionEnd::Closed;
            }
        }

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_secs.max(1)));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first ping
        // waits a full interval.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                msg = self.outbound_rx.recv() => {
                    let Some(msg) = msg else { return ConnectionEnd::Shutdown };
                    if let Err(e) = sink.send(Message::Text(msg.to_json())).await {
                        warn!(error = %e, "Bridge send failed, requeueing");
                        self.enqueue(msg);
                        return ConnectionEnd::Closed;
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = sink.send(Message::Text(ClientMessage::Ping.to_json())).await {
                        warn!(error = %e, "Bridge heartbeat failed");
                        return ConnectionEnd::Closed;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text).await,
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Bridge socket closed by server");
                            return ConnectionEnd::Closed;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Bridge read error");
                            return ConnectionEnd::Closed;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        match ServerMessage::parse(text) {
            Ok(ServerMessage::Pong) => {
                // Advisory only; reconnection is driven by socket close.
                debug!("Bridge pong");
            }
            Ok(ServerMessage::Unknown(kind)) => {
                warn!(kind = %kind, "Unknown bridge message kind, ignoring");
            }
            Ok(msg) => {
                let _ = self.event_tx.send(BridgeEvent::Message(msg)).await;
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed bridge frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_with(config: BridgeConfig) -> BridgeTransport {
        let (_tx, _rx, transport) = BridgeTransport::new(config);
        transport
    }

    #[test]
    fn test_backoff_schedule_doubles_from_base() {
        let transport = transport_with(BridgeConfig::default());
        assert_eq!(transport.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(transport.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(transport.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(transport.backoff_delay(4), Duration::from_secs(8));
    }

    #[test]
    fn test_queue_caps_and_drops_oldest() {
        let config = BridgeConfig {
            outbound_queue_cap: 2,
            ..BridgeConfig::default()
        };
        let mut transport = transport_with(config);
        transport.enqueue(ClientMessage::StartSession {
            goal: "first".to_string(),
            model: String::new(),
        });
        transport.enqueue(ClientMessage::Ping);
        transport.enqueue(ClientMessage::Ping);
        assert_eq!(transport.queue.len(), 2);
        // The oldest (start_session) was dropped.
        assert!(matches!(transport.queue.front(), Some(ClientMessage::Ping)));
    }

    #[tokio::test]
    async fn test_connect_send_receive_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Fake policy server: accept one socket, expect a frame, reply
        // with an action.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let frame = ws.next().await.unwrap().unwrap();
            let value: serde_json::Value =
                serde_json::from_str(frame.to_text().unwrap()).unwrap();
            assert_eq!(value["type"], "start_session");
            ws.send(Message::Text(
                r#"{"type":"action","action":"wait","thought":"hold"}"#.to_string(),
            ))
            .await
            .unwrap();
            // Keep the socket open until the client is done.
            let _ = ws.next().await;
        });

        let config = BridgeConfig {
            url: format!("ws://{}", addr),
            ..BridgeConfig::default()
        };
        let (outbound_tx, mut event_rx, transport) = BridgeTransport::new(config);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let transport_task = tokio::spawn(transport.run_loop(shutdown_rx));

        outbound_tx
            .send(ClientMessage::StartSession {
                goal: "test".to_string(),
                model: "m".to_string(),
            })
            .await
            .unwrap();

        let mut saw_connected = false;
        let mut saw_action = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), event_rx.recv()).await
        {
            match event {
                BridgeEvent::State(ConnectionState::Connected) => saw_connected = true,
                BridgeEvent::Message(ServerMessage::Action(action)) => {
                    assert_eq!(action.kind, "wait");
                    saw_action = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_connected && saw_action);

        let _ = shutdown_tx.send(());
        let _ = transport_task.await;
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_reconnect_budget_exhaustion_emits_error() {
        // Nothing listens on this port; 2 fast attempts then error.
        let config = BridgeConfig {
            url: "ws://127.0.0.1:1".to_string(),
            reconnect_base_ms: 10,
            max_reconnect_attempts: 2,
            ..BridgeConfig::default()
        };
        let (_outbound_tx, mut event_rx, transport) = BridgeTransport::new(config);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(transport.run_loop(shutdown_rx));

        let mut saw_error = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(5), event_rx.recv()).await
        {
            if matches!(event, BridgeEvent::State(ConnectionState::Error)) {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
        let _ = task.await;
    }
}
