use std::sync::Arc;
use tabpilot_agent::{SessionController, SessionRequest};
use tabpilot_bridge::{BridgeEvent, ServerMessage, SidecarHost};
use tabpilot_cdp::ChromeEndpoint;
use tabpilot_core::{Config, Paths, RoutingFabric};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Keep the bridge up and serve `start_automation` requests until
/// interrupted. Each request runs as one ordinary session; between
/// sessions we re-take the sidecar's subscriber slot, so requests that
/// arrive mid-session are parked, not lost.
pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;
    let config = Config::load_or_default(&paths)?;

    let endpoint = ChromeEndpoint::new(&config.chrome.debug_host, config.chrome.debug_port);
    endpoint.ensure_available(&config.chrome).await?;

    let (shutdown_tx, _) = broadcast::channel(4);
    let (bridge, sidecar_task) =
        SidecarHost::spawn(config.bridge.clone(), shutdown_tx.subscribe());
    let fabric = RoutingFabric::new();

    let controller = Arc::new(SessionController::new(
        config,
        paths,
        endpoint.clone(),
        bridge.clone(),
        fabric,
    ));

    bridge.ensure_ready().await?;
    info!("Listening for server-initiated sessions (Ctrl-C to quit)");

    loop {
        let mut events = bridge.subscribe().await?;
        let request = loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(BridgeEvent::Message(ServerMessage::StartAutomation {
                            goal,
                            session_id,
                            max_steps,
                        })) => {
                            break SessionRequest {
                                goal,
                                tab: None,
                                session_id: Some(session_id),
                                max_steps,
                            };
                        }
                        Some(BridgeEvent::Message(ServerMessage::ReloadExtension)) => {
                            info!("Server requested a host reload, exiting listen loop");
                            let _ = shutdown_tx.send(());
                            sidecar_task.abort();
                            return Ok(());
                        }
                        Some(_) => {}
                        None => {
                            warn!("Sidecar went away, exiting listen loop");
                            return Ok(());
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, exiting listen loop");
                    let _ = shutdown_tx.send(());
                    sidecar_task.abort();
                    endpoint.shutdown().await;
                    return Ok(());
                }
            }
        };

        info!(goal = %request.goal, "Server-initiated session");
        match controller.run_session(request).await {
            Ok(outcome) => println!("{}", outcome),
            Err(e) => warn!(error = %e, "Server-initiated session failed"),
        }
    }
}
