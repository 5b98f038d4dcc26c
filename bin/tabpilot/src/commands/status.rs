use tabpilot_cdp::ChromeEndpoint;
use tabpilot_core::{Config, Paths};
use tabpilot_storage::StateStore;

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!("tabpilot status");
    println!("===============");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:  {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "✗ (not found)" }
    );

    let config = Config::load_or_default(&paths)?;
    println!("Bridge:  {}", config.bridge.url);
    println!(
        "Chrome:  {}:{}",
        config.chrome.debug_host, config.chrome.debug_port
    );
    println!("Model:   {}", config.agent.model);
    println!();

    let record = StateStore::new(paths).load();
    println!("Session record:");
    println!("  active:  {}", record.is_active);
    match record.active_tab_id {
        Some(tab) => println!("  tab:     {}", tab),
        None => println!("  tab:     -"),
    }
    match &record.session_id {
        Some(id) => println!("  session: {}", id),
        None => println!("  session: -"),
    }
    if !record.updated_at.is_empty() {
        println!("  updated: {}", record.updated_at);
    }
    if record.may_have_stale_attachment() {
        println!("  note:    next session will clean this tab before attaching");
    }
    println!();

    let endpoint = ChromeEndpoint::new(&config.chrome.debug_host, config.chrome.debug_port);
    match endpoint.list_tabs().await {
        Ok(tabs) => {
            println!("Open tabs:");
            for tab in tabs {
                println!(
                    "  [{}] {} {}",
                    tab.tab.0,
                    if tab.ws_url.is_empty() { "(debugger busy)" } else { "" },
                    tab.url
                );
            }
        }
        Err(_) => println!("Open tabs: DevTools endpoint not reachable"),
    }

    Ok(())
}
