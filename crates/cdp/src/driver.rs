//! Per-tab debugger driver.
//!
//! Wraps one CDP attachment and exposes the higher-level operations the
//! agent loop executes: navigation, scrolling, screenshots, JS
//! evaluation, coordinate clicks, selector-resolved clicks with layered
//! fallbacks, and atomic text insertion. Every operation is failable and
//! reports recoverable failures as values; nothing here panics on a
//! misbehaving page.

use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tabpilot_core::{
    ClickMethod, Envelope, Error, FabricMessage, InteractiveElement, Result, RouteTarget,
    RoutingFabric, TabId,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::chrome::ChromeEndpoint;
use crate::client::CdpClient;
use crate::elements;

/// Settle delay after focusing before typing.
const FOCUS_SETTLE_MS: u64 = 100;
/// Settle delay after a successful click.
const CLICK_SETTLE_MS: u64 = 200;
/// Console lines retained per tab.
const CONSOLE_TAIL: usize = 100;

/// Process-wide record of which tab currently holds the debugger.
/// The host permits one attachment per tab, and this control plane runs
/// one session at a time, so claiming while any attachment exists fails.
#[derive(Clone, Default)]
pub struct AttachmentRegistry {
    tabs: Arc<StdMutex<HashSet<TabId>>>,
}

impl AttachmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, tab: TabId) -> Result<()> {
        let mut tabs = self.tabs.lock().expect("attachment registry poisoned");
        if let Some(existing) = tabs.iter().next() {
            return Err(Error::Attachment(format!(
                "another debugger attachment exists on {}",
                existing
            )));
        }
        tabs.insert(tab);
        Ok(())
    }

    pub fn release(&self, tab: TabId) {
        self.tabs.lock().expect("attachment registry poisoned").remove(&tab);
    }

    pub fn is_attached(&self, tab: TabId) -> bool {
        self.tabs.lock().expect("attachment registry poisoned").contains(&tab)
    }
}

/// `{url, title, documentNodeId}` as one page-state fetch.
#[derive(Debug, Clone)]
pub struct PageState {
    pub url: String,
    pub title: String,
    pub document_node_id: i64,
}

pub struct TabDriver {
    tab: TabId,
    endpoint: Arc<ChromeEndpoint>,
    registry: AttachmentRegistry,
    fabric: RoutingFabric,
    client: Option<CdpClient>,
    console_logs: Arc<Mutex<VecDeque<String>>>,
    console_task: Option<tokio::task::JoinHandle<()>>,
    detach_task: Option<tokio::task::JoinHandle<()>>,
}

impl TabDriver {
    pub fn new(
        tab: TabId,
        endpoint: Arc<ChromeEndpoint>,
        registry: AttachmentRegistry,
        fabric: RoutingFabric,
    ) -> Self {
        Self {
            tab,
            endpoint,
            registry,
            fabric,
            client: None,
            console_logs: Arc::new(Mutex::new(VecDeque::new())),
            console_task: None,
            detach_task: None,
        }
    }

    pub fn tab(&self) -> TabId {
        self.tab
    }

    pub fn is_attached(&self) -> bool {
        self.client.as_ref().map(|c| c.is_alive()).unwrap_or(false)
    }

    fn client(&self) -> Result<&CdpClient> {
        match &self.client {
            Some(client) if client.is_alive() => Ok(client),
            _ => Err(Error::Protocol("not attached".to_string())),
        }
    }

    /// Attach the debugger and enable the DOM, Page, Runtime and Network
    /// domains. Idempotent: attaching an attached driver issues no second
    /// protocol call.
    pub async fn attach(&mut self) -> Result<()> {
        if self.is_attached() {
            return Ok(());
        }
        // A dead client still owns the registry slot; drop it first.
        if self.client.is_some() {
            self.mark_detached();
        }

        self.registry.claim(self.tab)?;

        let attach_result = self.attach_inner().await;
        if attach_result.is_err() {
            self.registry.release(self.tab);
            self.client = None;
        }
        attach_result
    }

    async fn attach_inner(&mut self) -> Result<()> {
        let target = self
            .endpoint
            .find_tab(self.tab)
            .await?
            .ok_or_else(|| Error::Session(format!("{} no longer exists", self.tab)))?;
        if target.ws_url.is_empty() {
            return Err(Error::Attachment(format!(
                "{} already has a debugger attached",
                self.tab
            )));
        }

        let client = CdpClient::connect(&target.ws_url).await?;
        for domain in ["DOM", "Page", "Runtime", "Network"] {
            client.enable_domain(domain).await?;
        }

        // Console tail: bounded buffer fed by the event stream.
        if client.enable_domain("Console").await.is_ok() {
            let mut events = client.subscribe_event("Console.messageAdded").await;
            let logs = self.console_logs.clone();
            self.console_task = Some(tokio::spawn(async move {
                while let Some(params) = events.recv().await {
                    let message = params.get("message").cloned().unwrap_or(Value::Null);
                    let level = message
                        .get("level")
                        .and_then(|v| v.as_str())
                        .unwrap_or("log");
                    let text = message.get("text").and_then(|v| v.as_str()).unwrap_or("");
                    push_console_line(&logs, format!("[{}] {}", level, text)).await;
                }
            }));
        }

        // A browser-initiated detach (tab close, user hitting the infobar)
        // surfaces through the routing fabric; the session loop marks the
        // driver detached on receipt. Deliberate detaches abort this
        // watcher first, so only the browser's own teardown publishes.
        let mut detach_events = client.subscribe_event("Inspector.detached").await;
        let mut closed = client.closed_signal();
        let fabric = self.fabric.clone();
        let tab = self.tab;
        self.detach_task = Some(tokio::spawn(async move {
            let reason = tokio::select! {
                params = detach_events.recv() => params
                    .as_ref()
                    .and_then(|p| p.get("reason"))
                    .and_then(|r| r.as_str())
                    .unwrap_or("target detached")
                    .to_string(),
                _ = async {
                    while !*closed.borrow() {
                        if closed.changed().await.is_err() {
                            break;
                        }
                    }
                } => "connection closed".to_string(),
            };
            warn!(tab = %tab, reason = %reason, "Browser tore down the debugger attachment");
            fabric
                .publish(Envelope {
                    target: RouteTarget::Controller,
                    message: FabricMessage::DebuggerDetached { tab, reason },
                })
                .await;
        }));

        self.client = Some(client);
        info!(tab = %self.tab, url = %target.url, "Debugger attached");
        Ok(())
    }

    /// Release the attachment. Idempotent and safe after a
    /// browser-initiated detach: closing the socket is the release.
    pub async fn detach(&mut self) -> Result<()> {
        if self.client.is_none() {
            return Ok(());
        }
        self.mark_detached();
        info!(tab = %self.tab, "Debugger detached");
        Ok(())
    }

    /// The browser tore the attachment down on its own (tab closed, user
    /// hit the infobar). No protocol calls; the attachment is already gone.
    pub fn mark_detached(&mut self) {
        if let Some(task) = self.detach_task.take() {
            task.abort();
        }
        if let Some(task) = self.console_task.take() {
            task.abort();
        }
        self.client = None;
        self.registry.release(self.tab);
    }

    /// Raw passthrough. Fails when not attached.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.client()?.send_command(method, params).await
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        let result = self
            .send("Page.navigate", json!({ "url": url }))
            .await?;
        if let Some(err) = result.get("errorText").and_then(|v| v.as_str()) {
            if !err.is_empty() {
                return Err(Error::Protocol(format!("navigation failed: {}", err)));
            }
        }
        Ok(())
    }

    pub async fn scroll(&self, dx: f64, dy: f64) -> Result<()> {
        self.send(
            "Input.dispatchMouseEvent",
            json!({
                "type": "mouseWheel",
                "x": 640,
                "y": 360,
                "deltaX": dx,
                "deltaY": dy,
            }),
        )
        .await?;
        Ok(())
    }

    /// Capture the viewport. Quality applies to jpeg/webp only; the agent
    /// loop passes 30, direct callers default to 80.
    pub async fn capture_screenshot(&self, format: &str, quality: Option<u32>) -> Result<String> {
        let mut params = json!({
            "format": format,
            "captureBeyondViewport": false,
        });
        if format != "png" {
            params["quality"] = json!(quality.unwrap_or(80));
        }
        let result = self.send("Page.captureScreenshot", params).await?;
        result
            .get("data")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| Error::Protocol("No screenshot data returned".to_string()))
    }

    /// Combined DOM-document fetch and tab metadata.
    pub async fn page_state(&self) -> Result<PageState> {
        let doc = self
            .send("DOM.getDocument", json!({ "depth": 0 }))
            .await?;
        let root = doc
            .get("root")
            .ok_or_else(|| Error::Protocol("DOM.getDocument returned no root".to_string()))?;
        let document_node_id = root.get("nodeId").and_then(|v| v.as_i64()).unwrap_or(0);
        let url = root
            .get("documentURL")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let title = self
            .endpoint
            .find_tab(self.tab)
            .await?
            .map(|t| t.title)
            .unwrap_or_default();
        Ok(PageState {
            url,
            title,
            document_node_id,
        })
    }

    /// Evaluate JS in page context with await-promise and return-by-value.
    /// A protocol failure and a JavaScript exception come back as
    /// different error kinds.
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let result = self
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("JavaScript exception");
            return Err(Error::Evaluation(text.to_string()));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Synthetic left click at viewport coordinates.
    pub async fn click(&self, x: f64, y: f64) -> Result<()> {
        for event_type in ["mousePressed", "mouseReleased"] {
            self.send(
                "Input.dispatchMouseEvent",
                json!({
                    "type": event_type,
                    "x": x,
                    "y": y,
                    "button": "left",
                    "clickCount": 1,
                }),
            )
            .await?;
        }
        Ok(())
    }

    /// Insert text atomically. Per-character key dispatch double-types on
    /// some platforms, so this always goes through `Input.insertText`.
    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.send("Input.insertText", json!({ "text": text })).await?;
        Ok(())
    }

    /// Press and release a named key.
    pub async fn press_key(&self, key: &str, modifiers: i64) -> Result<()> {
        let (code, virtual_key) = match key {
            "Enter" => ("Enter", Some(13)),
            "Tab" => ("Tab", Some(9)),
            "Backspace" => ("Backspace", Some(8)),
            other => (other, None),
        };
        for event_type in ["keyDown", "keyUp"] {
            let mut params = json!({
                "type": event_type,
                "key": key,
                "code": code,
            });
            if modifiers != 0 {
                params["modifiers"] = json!(modifiers);
            }
            if let Some(vk) = virtual_key {
                params["windowsVirtualKeyCode"] = json!(vk);
            }
            if event_type == "keyDown" && key == "Enter" {
                params["text"] = json!("\r");
            }
            self.send("Input.dispatchKeyEvent", params).await?;
        }
        Ok(())
    }

    /// Selector-resolved click with layered fallbacks:
    /// 1. invalid-selector guard with `:contains(...)` text fallback;
    /// 2. coordinate click at the scrolled-to centre;
    /// 3. JS `element.click()`;
    /// 4. focus + Enter.
    /// `method` hints jump the ladder: `js` enters at 3, `focus` at 4.
    pub async fn click_element(&self, selector: &str, method: ClickMethod) -> Result<()> {
        let mut last_error: Option<Error> = None;

        if method == ClickMethod::Auto {
            // 1. Invalid-selector guard.
            if elements::is_invalid_selector(selector) {
                return match elements::contains_text(selector) {
                    Some(text) => self.click_by_text(&text).await,
                    None => Err(Error::Selector(format!("invalid selector: {}", selector))),
                };
            }

            // 2. Coordinate click.
            match self.coordinate_click(selector).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    debug!(selector = %selector, "Element not clickable by coordinates, trying JS");
                }
                Err(e) => {
                    debug!(selector = %selector, error = %e, "Coordinate click failed, trying JS");
                    last_error = Some(e);
                }
            }
        }

        if method != ClickMethod::Focus {
            // 3. JavaScript fallback.
            match self.evaluate(&elements::js_click_expression(selector)).await {
                Ok(Value::Bool(true)) => {
                    tokio::time::sleep(Duration::from_millis(CLICK_SETTLE_MS)).await;
                    return Ok(());
                }
                Ok(_) => {
                    last_error =
                        Some(Error::Selector(format!("no element matches {}", selector)));
                }
                Err(e) => {
                    debug!(selector = %selector, error = %e, "JS click failed, trying focus");
                    last_error = Some(e);
                }
            }
        }

        // 4. Focus-and-Enter fallback.
        match self.evaluate(&elements::focus_expression(selector)).await {
            Ok(Value::Bool(true)) => {
                self.press_key("Enter", 0).await?;
                return Ok(());
            }
            Ok(_) => {
                last_error = Some(Error::Selector(format!("no element matches {}", selector)));
            }
            Err(e) => last_error = Some(e),
        }

        Err(last_error
            .unwrap_or_else(|| Error::Selector(format!("click failed for {}", selector))))
    }

    /// Coordinate-click layer. Ok(false) means the element exists but has
    /// no clickable on-screen rectangle.
    async fn coordinate_click(&self, selector: &str) -> Result<bool> {
        let rect = self.evaluate(&elements::locate_expression(selector)).await?;
        if rect.get("found").and_then(|v| v.as_bool()) != Some(true) {
            return Err(Error::Selector(format!("no element matches {}", selector)));
        }
        let x = rect.get("x").and_then(|v| v.as_f64()).unwrap_or(-1.0);
        let y = rect.get("y").and_then(|v| v.as_f64()).unwrap_or(-1.0);
        let width = rect.get("width").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let height = rect.get("height").and_then(|v| v.as_f64()).unwrap_or(0.0);

        if width <= 0.0 || height <= 0.0 || !(0.0..=2000.0).contains(&x) || !(0.0..=2000.0).contains(&y)
        {
            return Ok(false);
        }

        // Let the scroll-into-view settle before dispatching.
        tokio::time::sleep(Duration::from_millis(FOCUS_SETTLE_MS)).await;
        self.click(x, y).await?;
        tokio::time::sleep(Duration::from_millis(CLICK_SETTLE_MS)).await;
        Ok(true)
    }

    /// Text fallback for jQuery-style selectors: click the centre of the
    /// first anchor or button whose label contains the quoted text.
    async fn click_by_text(&self, text: &str) -> Result<()> {
        let rect = self
            .evaluate(&elements::text_fallback_expression(text))
            .await?;
        if rect.get("found").and_then(|v| v.as_bool()) != Some(true) {
            return Err(Error::Selector(format!(
                "invalid selector and no element with text '{}'",
                text
            )));
        }
        let x = rect.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let y = rect.get("y").and_then(|v| v.as_f64()).unwrap_or(0.0);
        tokio::time::sleep(Duration::from_millis(FOCUS_SETTLE_MS)).await;
        self.click(x, y).await?;
        tokio::time::sleep(Duration::from_millis(CLICK_SETTLE_MS)).await;
        Ok(())
    }

    /// Clear a field down to empty: JS value reset with framework events,
    /// select-all (both Meta+A and Control+A) plus Backspace, then a
    /// verify-and-force pass for stubborn controlled inputs.
    pub async fn clear_field(&self, selector: &str) -> Result<()> {
        self.evaluate(&elements::clear_value_expression(selector))
            .await?;

        // Modifiers: 2 = Control, 4 = Meta.
        for modifiers in [4, 2] {
            self.press_key("a", modifiers).await?;
        }
        self.press_key("Backspace", 0).await?;

        let remaining = self
            .evaluate(&elements::value_length_expression(selector))
            .await?;
        if remaining.as_i64().unwrap_or(0) > 0 {
            warn!(selector = %selector, "Field still non-empty after clear, forcing");
            self.evaluate(&elements::clear_value_expression(selector))
                .await?;
        }
        Ok(())
    }

    /// Focus the field, clear whatever is in it, then insert `text`.
    pub async fn type_in_element(&self, selector: &str, text: &str) -> Result<()> {
        if let Err(e) = self.click_element(selector, ClickMethod::Auto).await {
            debug!(selector = %selector, error = %e, "Click-to-focus failed, focusing directly");
            match self.evaluate(&elements::focus_expression(selector)).await {
                Ok(Value::Bool(true)) => {}
                _ => return Err(e),
            }
        }
        tokio::time::sleep(Duration::from_millis(FOCUS_SETTLE_MS)).await;

        self.clear_field(selector).await?;
        self.type_text(text).await
    }

    /// Enumerate visible interactive elements, capped at 30.
    pub async fn clickable_elements(&self) -> Result<Vec<InteractiveElement>> {
        let raw = self.evaluate(&elements::enumerate_expression()).await?;
        Ok(elements::parse_elements(&raw))
    }

    /// Most recent console lines (up to 100).
    pub async fn console_tail(&self) -> Vec<String> {
        self.console_logs.lock().await.iter().cloned().collect()
    }
}

impl Drop for TabDriver {
    fn drop(&mut self) {
        if let Some(task) = self.detach_task.take() {
            task.abort();
        }
        if let Some(task) = self.console_task.take() {
            task.abort();
        }
    }
}

async fn push_console_line(logs: &Arc<Mutex<VecDeque<String>>>, line: String) {
    let mut logs = logs.lock().await;
    if logs.len() >= CONSOLE_TAIL {
        logs.pop_front();
    }
    logs.push_back(line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_claim_conflicts() {
        let registry = AttachmentRegistry::new();
        registry.claim(TabId(1)).unwrap();
        assert!(registry.is_attached(TabId(1)));
        // A second claim fails even for a different tab: one attachment
        // per process.
        assert!(registry.claim(TabId(2)).is_err());
        assert!(registry.claim(TabId(1)).is_err());
        registry.release(TabId(1));
        registry.claim(TabId(2)).unwrap();
    }

    #[test]
    fn test_registry_release_is_idempotent() {
        let registry = AttachmentRegistry::new();
        registry.claim(TabId(3)).unwrap();
        registry.release(TabId(3));
        registry.release(TabId(3));
        assert!(!registry.is_attached(TabId(3)));
    }

    #[tokio::test]
    async fn test_detach_unattached_is_noop() {
        let endpoint = ChromeEndpoint::new("127.0.0.1", 0);
        let mut driver = TabDriver::new(
            TabId(1),
            endpoint,
            AttachmentRegistry::new(),
            RoutingFabric::new(),
        );
        assert!(!driver.is_attached());
        driver.detach().await.unwrap();
        driver.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_fail_when_not_attached() {
        let endpoint = ChromeEndpoint::new("127.0.0.1", 0);
        let driver = TabDriver::new(
            TabId(1),
            endpoint,
            AttachmentRegistry::new(),
            RoutingFabric::new(),
        );
        let err = driver.send("Page.enable", serde_json::json!({})).await;
        assert!(matches!(err, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_console_tail_bounded() {
        let logs = Arc::new(Mutex::new(VecDeque::new()));
        for i in 0..150 {
            push_console_line(&logs, format!("line {}", i)).await;
        }
        let logs = logs.lock().await;
        assert_eq!(logs.len(), CONSOLE_TAIL);
        assert_eq!(logs.front().unwrap(), "line 50");
        assert_eq!(logs.back().unwrap(), "line 149");
    }
}
