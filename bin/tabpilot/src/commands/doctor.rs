use tabpilot_cdp::{chrome::find_browser_binary, ChromeEndpoint};
use tabpilot_core::{Config, Paths};
use tabpilot_storage::StateStore;

/// Run full environment diagnostics.
pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!();
    println!("🩺 tabpilot doctor — Environment Diagnostics");
    println!("================================");
    println!();

    let mut ok_count = 0u32;
    let mut warn_count = 0u32;
    let mut err_count = 0u32;

    // --- 1. Config ---
    println!("📋 Configuration");
    if paths.config_file().exists() {
        print_ok("Config file exists", &paths.config_file().display().to_string());
        ok_count += 1;
    } else {
        print_warn("Config file not found", "Run `tabpilot onboard` (defaults apply)");
        warn_count += 1;
    }
    let config = Config::load_or_default(&paths)?;
    println!("  Bridge URL: {}", config.bridge.url);
    println!("  Model:      {}", config.agent.model);
    println!();

    // --- 2. Browser ---
    println!("🌐 Browser");
    match find_browser_binary() {
        Some(path) => {
            print_ok("Browser binary found", &path);
            ok_count += 1;
        }
        None => {
            print_warn(
                "No Chrome/Chromium binary found",
                "Only an already-running DevTools endpoint will work",
            );
            warn_count += 1;
        }
    }

    let endpoint = ChromeEndpoint::new(&config.chrome.debug_host, config.chrome.debug_port);
    match endpoint.probe().await {
        Ok(identity) => {
            print_ok("DevTools endpoint reachable", &identity);
            ok_count += 1;
            match endpoint.list_tabs().await {
                Ok(tabs) => {
                    print_ok("Page targets", &format!("{} open", tabs.len()));
                    ok_count += 1;
                    let busy = tabs.iter().filter(|t| t.ws_url.is_empty()).count();
                    if busy > 0 {
                        print_warn(
                            "Tabs with a debugger already attached",
                            &format!("{} (will be cleaned before attach)", busy),
                        );
                        warn_count += 1;
                    }
                }
                Err(e) => {
                    print_err("Failed to list page targets", &e.to_string());
                    err_count += 1;
                }
            }
        }
        Err(e) => {
            print_err("DevTools endpoint not reachable", &e.to_string());
            println!(
                "    Start Chrome with --remote-debugging-port={} or set chrome.launchIfMissing",
                config.chrome.debug_port
            );
            err_count += 1;
        }
    }
    println!();

    // --- 3. Bridge ---
    println!("🔌 Bridge");
    match bridge_tcp_probe(&config.bridge.url).await {
        Ok(addr) => {
            print_ok("Policy server reachable", &addr);
            ok_count += 1;
        }
        Err(e) => {
            print_err("Policy server not reachable", &e);
            err_count += 1;
        }
    }
    println!();

    // --- 4. Session record ---
    println!("🗂  Session record");
    let record = StateStore::new(paths).load();
    if record.is_active {
        print_warn(
            "Record says a session is still active",
            "A previous host may have died mid-session; next start cleans it",
        );
        warn_count += 1;
    } else if record.active_tab_id.is_some() {
        print_ok("Record inactive, tab retained for cleanup", "");
        ok_count += 1;
    } else {
        print_ok("Record clean", "");
        ok_count += 1;
    }
    println!();

    println!(
        "Summary: {} ok, {} warnings, {} errors",
        ok_count, warn_count, err_count
    );
    Ok(())
}

/// Resolve the ws:// URL's host:port and try a plain TCP connect.
async fn bridge_tcp_probe(url: &str) -> Result<String, String> {
    let stripped = url
        .trim_start_matches("ws://")
        .trim_start_matches("wss://");
    let addr = stripped.split('/').next().unwrap_or(stripped).to_string();
    match tokio::time::timeout(
        std::time::Duration::from_secs(3),
        tokio::net::TcpStream::connect(&addr),
    )
    .await
    {
        Ok(Ok(_)) => Ok(addr),
        Ok(Err(e)) => Err(format!("{}: {}", addr, e)),
        Err(_) => Err(format!("{}: connect timed out", addr)),
    }
}

fn print_ok(label: &str, detail: &str) {
    if detail.is_empty() {
        println!("  ✅ {}", label);
    } else {
        println!("  ✅ {} — {}", label, detail);
    }
}

fn print_warn(label: &str, detail: &str) {
    if detail.is_empty() {
        println!("  ⚠️  {}", label);
    } else {
        println!("  ⚠️  {} — {}", label, detail);
    }
}

fn print_err(label: &str, detail: &str) {
    if detail.is_empty() {
        println!("  ❌ {}", label);
    } else {
        println!("  ❌ {} — {}", label, detail);
    }
}
