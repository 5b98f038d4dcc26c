//! DevTools endpoint discovery and tab enumeration.
//!
//! Talks to a browser's HTTP debugging surface (`/json/version`,
//! `/json/list`, `/json/new`, `/json/close`) and hands out stable opaque
//! tab handles for the page targets it finds. Can optionally launch a
//! local Chrome/Chromium when no endpoint is listening.

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tabpilot_core::config::ChromeConfig;
use tabpilot_core::{Error, Result, TabId};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One page target as reported by `/json/list`.
#[derive(Debug, Clone)]
pub struct TabTarget {
    pub tab: TabId,
    pub target_id: String,
    pub url: String,
    pub title: String,
    pub ws_url: String,
}

impl TabTarget {
    /// Tabs the debugger may not attach to (browser-internal surfaces).
    pub fn is_privileged(&self) -> bool {
        self.url.starts_with("chrome://")
            || self.url.starts_with("chrome-extension://")
            || self.url.starts_with("devtools://")
            || self.url.starts_with("edge://")
    }
}

/// Handle to a browser's debugging endpoint. Assigns each `targetId` a
/// stable `TabId` for the lifetime of this process.
pub struct ChromeEndpoint {
    host: String,
    port: u16,
    handles: Mutex<HashMap<String, TabId>>,
    next_handle: AtomicU32,
    /// Browser child process, when we launched it ourselves.
    child: Mutex<Option<Child>>,
}

impl ChromeEndpoint {
    pub fn new(host: &str, port: u16) -> Arc<Self> {
        Arc::new(Self {
            host: host.to_string(),
            port,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            child: Mutex::new(None),
        })
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Probe `/json/version`. Ok means a debuggable browser is listening.
    pub async fn probe(&self) -> Result<String> {
        let url = format!("{}/json/version", self.base_url());
        let resp = reqwest::get(&url)
            .await
            .map_err(|e| Error::Protocol(format!("DevTools endpoint unreachable: {}", e)))?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Bad /json/version reply: {}", e)))?;
        body.get("Browser")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| Error::Protocol("No browser identity in /json/version".to_string()))
    }

    /// Enumerate page targets, assigning handles to new ones.
    pub async fn list_tabs(&self) -> Result<Vec<TabTarget>> {
        let url = format!("{}/json/list", self.base_url());
        let resp = reqwest::get(&url)
            .await
            .map_err(|e| Error::Protocol(format!("Failed to list targets: {}", e)))?;
        let targets: Vec<Value> = resp
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Bad /json/list reply: {}", e)))?;

        let mut handles = self.handles.lock().await;
        let mut tabs = Vec::new();
        for target in &targets {
            if target.get("type").and_then(|v| v.as_str()) != Some("page") {
                continue;
            }
            let target_id = match target.get("id").and_then(|v| v.as_str()) {
                Some(id) => id.to_string(),
                None => continue,
            };
            let ws_url = match target.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
                Some(ws) => ws.to_string(),
                // A target without a ws URL already has a debugger attached.
                None => String::new(),
            };
            let tab = *handles.entry(target_id.clone()).or_insert_with(|| {
                TabId(self.next_handle.fetch_add(1, Ordering::SeqCst))
            });
            tabs.push(TabTarget {
                tab,
                target_id,
                url: target
                    .get("url")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                title: target
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                ws_url,
            });
        }
        Ok(tabs)
    }

    /// Resolve a previously assigned handle back to its current target.
    pub async fn find_tab(&self, tab: TabId) -> Result<Option<TabTarget>> {
        let tabs = self.list_tabs().await?;
        Ok(tabs.into_iter().find(|t| t.tab == tab))
    }

    /// Open a new tab via `/json/new` and return its handle.
    pub async fn create_tab(&self, url: &str) -> Result<TabTarget> {
        let client = reqwest::Client::new();
        // The URL rides in the query string; reserved characters in it
        // (&, #, spaces) must not reach the endpoint raw.
        let endpoint = format!("{}/json/new?{}", self.base_url(), encode_query(url));
        let resp = client
            .put(&endpoint)
            .send()
            .await
            .map_err(|e| Error::Protocol(format!("Failed to create tab: {}", e)))?;
        let target: Value = resp
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Bad /json/new reply: {}", e)))?;
        let target_id = target
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Protocol("No target id in /json/new reply".to_string()))?
            .to_string();

        let mut handles = self.handles.lock().await;
        let tab = *handles
            .entry(target_id.clone())
            .or_insert_with(|| TabId(self.next_handle.fetch_add(1, Ordering::SeqCst)));
        Ok(TabTarget {
            tab,
            target_id,
            url: target
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or(url)
                .to_string(),
            title: String::new(),
            ws_url: target
                .get("webSocketDebuggerUrl")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// Close a tab via `/json/close`.
    pub async fn close_tab(&self, tab: TabId) -> Result<()> {
        let target = self
            .find_tab(tab)
            .await?
            .ok_or_else(|| Error::Session(format!("{} no longer exists", tab)))?;
        let url = format!("{}/json/close/{}", self.base_url(), target.target_id);
        reqwest::get(&url)
            .await
            .map_err(|e| Error::Protocol(format!("Failed to close tab: {}", e)))?;
        Ok(())
    }

    /// Probe the endpoint, launching a local browser when allowed.
    pub async fn ensure_available(self: &Arc<Self>, config: &ChromeConfig) -> Result<()> {
        if self.probe().await.is_ok() {
            return Ok(());
        }
        if !config.launch_if_missing {
            return Err(Error::Protocol(format!(
                "No DevTools endpoint on {}:{} and launchIfMissing is off",
                self.host, self.port
            )));
        }
        self.launch(config).await
    }

    async fn launch(self: &Arc<Self>, config: &ChromeConfig) -> Result<()> {
        let binary = config
            .binary
            .clone()
            .or_else(find_browser_binary)
            .ok_or_else(|| {
                Error::Config("No Chrome/Chromium binary found. Set chrome.binary.".to_string())
            })?;

        let user_data_dir = tabpilot_core::Paths::new().browser_dir().join("profile");
        std::fs::create_dir_all(&user_data_dir)
            .map_err(|e| Error::Config(format!("Failed to create user data dir: {}", e)))?;

        let args = build_browser_args(config, self.port, &user_data_dir);

        info!(port = self.port, headless = config.headless, "Launching browser");

        let child = Command::new(&binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Config(format!("Failed to launch {}: {}", binary, e)))?;
        *self.child.lock().await = Some(child);

        // Poll /json/version until the endpoint answers.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(15);
        loop {
            if self.probe().await.is_ok() {
                debug!("DevTools endpoint ready");
                return Ok(());
            }
            if std::time::Instant::now() > deadline {
                return Err(Error::Timeout(format!(
                    "Browser did not expose DevTools on port {} within 15s",
                    self.port
                )));
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    /// Kill a browser we launched. No-op when attached to an external one.
    pub async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
    }
}

/// Percent-encode a URL for the `/json/new` query string. Everything
/// outside the RFC 3986 unreserved set is escaped.
fn encode_query(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    for byte in url.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Flags that turn a stock Chromium into a quiet automation profile: no
/// first-run chrome, no background churn, nothing competing for the
/// debugger.
const AUTOMATION_FLAGS: &[&str] = &[
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-background-networking",
    "--disable-default-apps",
    "--disable-extensions",
    "--disable-sync",
    "--mute-audio",
    "--password-store=basic",
];

/// Assemble the launch command line from the endpoint's port and the
/// operator's [`ChromeConfig`].
fn build_browser_args(config: &ChromeConfig, debug_port: u16, user_data_dir: &Path) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", debug_port),
        format!("--user-data-dir={}", user_data_dir.display()),
    ];
    args.extend(AUTOMATION_FLAGS.iter().map(|f| f.to_string()));
    if config.headless {
        args.push("--headless=new".to_string());
    }
    args.push(format!(
        "--window-size={},{}",
        config.window_width, config.window_height
    ));
    args.extend(config.extra_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

/// Locate a Chromium-family binary: PATH lookups first, then the
/// platform's conventional install locations.
pub fn find_browser_binary() -> Option<String> {
    const PATH_NAMES: &[&str] = &[
        "google-chrome",
        "google-chrome-stable",
        "chromium",
        "chromium-browser",
        "brave-browser",
    ];
    for name in PATH_NAMES {
        if which::which(name).is_ok() {
            return Some((*name).to_string());
        }
    }

    let install_paths: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };
    install_paths
        .iter()
        .find(|p| Path::new(p).exists())
        .map(|p| (*p).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_query_passes_unreserved() {
        assert_eq!(encode_query("abc-123_~."), "abc-123_~.");
    }

    #[test]
    fn test_encode_query_escapes_reserved() {
        assert_eq!(
            encode_query("https://example.com/search?q=a&b=c"),
            "https%3A%2F%2Fexample.com%2Fsearch%3Fq%3Da%26b%3Dc"
        );
        assert_eq!(encode_query("a b#c"), "a%20b%23c");
    }

    #[test]
    fn test_build_browser_args_follows_config() {
        let config = ChromeConfig::default();
        let args = build_browser_args(&config, 9222, Path::new("/tmp/profile"));
        assert!(args.contains(&"--remote-debugging-port=9222".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--window-size=1280,720".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("about:blank"));

        let config = ChromeConfig {
            headless: false,
            window_width: 1920,
            window_height: 1080,
            extra_args: vec!["--lang=en-US".to_string()],
            ..ChromeConfig::default()
        };
        let args = build_browser_args(&config, 1, Path::new("/p"));
        assert!(!args.iter().any(|a| a.starts_with("--headless")));
        assert!(args.contains(&"--window-size=1920,1080".to_string()));
        assert!(args.contains(&"--lang=en-US".to_string()));
    }

    #[test]
    fn test_privileged_tab_detection() {
        let mut target = TabTarget {
            tab: TabId(1),
            target_id: "t".to_string(),
            url: "chrome://settings/".to_string(),
            title: String::new(),
            ws_url: String::new(),
        };
        assert!(target.is_privileged());
        target.url = "https://example.test/".to_string();
        assert!(!target.is_privileged());
    }
}
