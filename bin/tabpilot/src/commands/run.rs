use std::sync::Arc;
use tabpilot_agent::{SessionController, SessionRequest};
use tabpilot_bridge::SidecarHost;
use tabpilot_cdp::ChromeEndpoint;
use tabpilot_core::{Config, Paths, RoutingFabric, TabId};
use tokio::sync::broadcast;
use tracing::info;

pub async fn run(
    goal: String,
    url: Option<String>,
    tab: Option<u32>,
    max_steps: Option<u32>,
) -> anyhow::Result<()> {
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
        bridge,
        fabric,
    ));

    // Ctrl-C requests a stop; the in-flight action finishes naturally.
    {
        let controller = controller.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Stop requested, finishing the in-flight step");
                controller.stop_current().await;
            }
        });
    }

    let target_tab = match (&url, tab) {
        (_, Some(tab)) => Some(TabId(tab)),
        (Some(url), None) => Some(endpoint.create_tab(url).await?.tab),
        (None, None) => None,
    };

    let outcome = controller
        .run_session(SessionRequest {
            goal,
            tab: target_tab,
            session_id: None,
            max_steps,
        })
        .await?;
    println!("{}", outcome);

    let _ = shutdown_tx.send(());
    sidecar_task.abort();
    endpoint.shutdown().await;
    Ok(())
}
