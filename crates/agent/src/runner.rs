//! The observation/action cycle for one session.
//!
//! Single writer: this loop is the only code that mutates its session.
//! Failures stay values all the way around the cycle; the policy sees
//! them in the next observation's `last_action_error` and gets to adapt.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tabpilot_bridge::{BridgeEvent, ClientMessage, ServerMessage, SidecarClient};
use tabpilot_cdp::TabDriver;
use tabpilot_core::config::AgentConfig;
use tabpilot_core::{
    Action, ActionRecord, ClickMethod, Envelope, Error, FabricMessage, Observation, Result,
};
use tabpilot_storage::TranscriptStore;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::session::Session;

/// Injected into `last_action_error` after three successful clicks that
/// never changed the URL.
pub const CLICK_NO_NAV_ERROR: &str = "CLICK DID NOT NAVIGATE: the last 3 clicks reported success \
     but the page URL never changed. Use a different selector, try submit, or navigate directly \
     to the target URL.";

static SUBMIT_HINT: Lazy<Regex> = Lazy::new(|| Regex::new("btn|button|submit|search").unwrap());

/// How the loop ended; the controller turns this into the one completion
/// message per session.
#[derive(Debug, Clone)]
pub enum LoopEnd {
    Done { summary: String },
    MaxSteps,
    Stopped,
    Failed { reason: String },
}

/// Adaptive rewriting of repeated actions: a second identical click is
/// retried through `element.click()`, a third on a submit-looking
/// selector becomes an Enter press.
#[derive(Default)]
pub struct LoopBreak {
    last: Option<(String, String)>,
    consecutive: u32,
}

impl LoopBreak {
    pub fn apply(&mut self, action: &mut Action) {
        let key = (
            action.kind.clone(),
            action.selector.clone().unwrap_or_default(),
        );
        if self.last.as_ref() == Some(&key) {
            self.consecutive += 1;
        } else {
            self.consecutive = 1;
            self.last = Some(key);
        }

        if action.kind != "click" {
            return;
        }
        if self.consecutive >= 3 {
            let selector = action.selector.as_deref().unwrap_or_default().to_lowercase();
            if SUBMIT_HINT.is_match(&selector) {
                debug!(selector = %selector, "Loop-break: converting repeated click to submit");
                action.kind = "submit".to_string();
                return;
            }
        }
        if self.consecutive >= 2 {
            debug!("Loop-break: repeated click, forcing JS click method");
            action.click_method = ClickMethod::Js;
        }
    }
}

/// Tracks successful clicks that fail to move the page.
#[derive(Default)]
pub struct NavWatch {
    strikes: u32,
}

impl NavWatch {
    /// Call after each successful click. Returns the error to inject once
    /// the strike budget is spent.
    pub fn observe(&mut self, url_before: &str, url_after: &str) -> Option<&'static str> {
        if url_before == url_after {
            self.strikes += 1;
            if self.strikes >= 3 {
                return Some(CLICK_NO_NAV_ERROR);
            }
        } else {
            self.strikes = 0;
        }
        None
    }

    pub fn reset(&mut self) {
        self.strikes = 0;
    }
}

enum Received {
    Action(Action),
    End(LoopEnd),
}

pub struct AgentLoop<'a> {
    driver: &'a mut TabDriver,
    bridge: &'a SidecarClient,
    events: &'a mut mpsc::Receiver<BridgeEvent>,
    fabric_rx: &'a mut mpsc::Receiver<Envelope>,
    session: &'a mut Session,
    transcripts: &'a TranscriptStore,
    config: &'a AgentConfig,
    escalation: LoopBreak,
    nav: NavWatch,
    last_error: String,
}

impl<'a> AgentLoop<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: &'a mut TabDriver,
        bridge: &'a SidecarClient,
        events: &'a mut mpsc::Receiver<BridgeEvent>,
        fabric_rx: &'a mut mpsc::Receiver<Envelope>,
        session: &'a mut Session,
        transcripts: &'a TranscriptStore,
        config: &'a AgentConfig,
    ) -> Self {
        Self {
            driver,
            bridge,
            events,
            fabric_rx,
            session,
            transcripts,
            config,
            escalation: LoopBreak::default(),
            nav: NavWatch::default(),
            last_error: String::new(),
        }
    }

    pub async fn run(mut self) -> LoopEnd {
        loop {
            self.drain_fabric();
            if self.session.stop.is_stopped() {
                // A stopped session never emits another observation.
                return LoopEnd::Stopped;
            }
            if !self.driver.is_attached() {
                return LoopEnd::Failed {
                    reason: "debugger detached".to_string(),
                };
            }

            let step = self.session.next_step();
            let observation = match self.build_observation(step).await {
                Ok(observation) => observation,
                Err(e) => {
                    return LoopEnd::Failed {
                        reason: format!("observation failed: {}", e),
                    }
                }
            };
            let url_before = observation.url.clone();

            if self
                .bridge
                .send(ClientMessage::Observation {
                    session_id: self.session.id.clone(),
                    step_number: step,
                    observation: Box::new(observation),
                })
                .await
                .is_err()
            {
                return LoopEnd::Failed {
                    reason: "transport lost".to_string(),
                };
            }

            let mut action = match self.await_action().await {
                Received::Action(action) => action,
                Received::End(end) => return end,
            };

            if action.is_done() {
                let summary = action
                    .thought
                    .or(action.text)
                    .unwrap_or_else(|| "goal reported complete".to_string());
                let summary = tabpilot_core::safe_truncate(&summary, 200).to_string();
                return LoopEnd::Done { summary };
            }

            self.drain_fabric();
            if self.session.stop.is_stopped() {
                return LoopEnd::Stopped;
            }

            self.escalation.apply(&mut action);
            if let Some(thought) = &action.thought {
                info!(step = step, kind = %action.kind, thought = %thought, "Executing action");
            }

            let error = match self.execute(&action).await {
                Ok(()) => None,
                Err(e) => Some(e.to_string()),
            };
            let success = error.is_none();

            let url_after = self.settled_url(&action, success, &url_before).await;
            let record = ActionRecord {
                kind: action.kind.clone(),
                selector: action.selector.clone().unwrap_or_default(),
                success,
                url_after: url_after.clone(),
                error: error.clone(),
                step,
            };
            if let Err(e) = self.transcripts.append(&self.session.id, &record) {
                debug!(error = %e, "Transcript append failed");
            }
            self.session.record(record);
            self.last_error = error.unwrap_or_default();

            if action.kind == "click" && success {
                if let Some(inject) = self.nav.observe(&url_before, &url_after) {
                    warn!(strikes = 3, "Clicks are not navigating, nudging the policy");
                    self.last_error = inject.to_string();
                }
            } else if action.kind == "navigate" && success {
                self.nav.reset();
            }

            if step >= self.session.max_steps {
                return LoopEnd::MaxSteps;
            }
        }
    }

    /// Apply pending fabric messages between suspension points.
    fn drain_fabric(&mut self) {
        while let Ok(envelope) = self.fabric_rx.try_recv() {
            match envelope.message {
                FabricMessage::DebuggerDetached { tab, reason } if tab == self.session.tab => {
                    warn!(tab = %tab, reason = %reason, "Browser detached the debugger");
                    self.driver.mark_detached();
                }
                FabricMessage::StopRequested { session_id }
                    if session_id.is_empty() || session_id == self.session.id =>
                {
                    self.session.stop.stop();
                }
                FabricMessage::ContentRequest { kind, .. } => {
                    debug!(kind = %kind, "Content-script request ignored by the loop");
                }
                _ => {}
            }
        }
    }

    async fn build_observation(&mut self, step: u32) -> Result<Observation> {
        let state = self.driver.page_state().await?;
        let screenshot = self
            .driver
            .capture_screenshot("jpeg", Some(self.config.screenshot_quality))
            .await?;
        let mut elements = self.driver.clickable_elements().await.unwrap_or_default();
        elements.truncate(self.config.max_elements);

        Ok(Observation {
            task: self.session.goal.clone(),
            url: state.url,
            title: state.title,
            screenshot,
            elements,
            console_logs: self.driver.console_tail().await,
            action_history: self.session.recent_actions(self.config.history_suffix),
            progress_notes: format!(
                "step {}/{}, {} actions executed",
                step,
                self.session.max_steps,
                self.session.action_count()
            ),
            original_goal: self.session.goal.clone(),
            last_action_error: self.last_error.clone(),
        })
    }

    /// Wait for the policy's reply. There is at most one in-flight policy
    /// call per session, and no timeout: reconnection is the transport's
    /// job and queued observations are delivered after it.
    async fn await_action(&mut self) -> Received {
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        return Received::End(LoopEnd::Failed {
                            reason: "bridge event stream closed".to_string(),
                        });
                    };
                    match event {
                        BridgeEvent::State(tabpilot_core::ConnectionState::Error) => {
                            return Received::End(LoopEnd::Failed {
                                reason: "transport lost".to_string(),
                            });
                        }
                        BridgeEvent::State(state) => {
                            debug!(state = ?state, "Bridge state change mid-step");
                        }
                        BridgeEvent::Message(ServerMessage::Action(action)) => {
                            return Received::Action(action);
                        }
                        BridgeEvent::Message(ServerMessage::Status { session_id, status, message }) => {
                            debug!(status = %status, message = %message, "Session status from server");
                            self.session.adopt_server_id(&session_id);
                        }
                        BridgeEvent::Message(ServerMessage::Error { error }) => {
                            return Received::End(LoopEnd::Failed { reason: error });
                        }
                        BridgeEvent::Message(ServerMessage::ReloadExtension) => {
                            warn!("Server requested a host reload mid-session, stopping");
                            self.session.stop.stop();
                            return Received::End(LoopEnd::Stopped);
                        }
                        BridgeEvent::Message(other) => {
                            debug!(message = ?other, "Ignoring non-step bridge message mid-session");
                        }
                    }
                }
                envelope = self.fabric_rx.recv() => {
                    let Some(envelope) = envelope else { continue };
                    match envelope.message {
                        FabricMessage::DebuggerDetached { tab, reason } if tab == self.session.tab => {
                            self.driver.mark_detached();
                            return Received::End(LoopEnd::Failed {
                                reason: format!("debugger detached: {}", reason),
                            });
                        }
                        FabricMessage::StopRequested { session_id }
                            if session_id.is_empty() || session_id == self.session.id =>
                        {
                            self.session.stop.stop();
                            return Received::End(LoopEnd::Stopped);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn execute(&mut self, action: &Action) -> Result<()> {
        match action.kind.as_str() {
            "click" => {
                let selector = require_selector(action)?;
                self.driver.click_element(selector, action.click_method).await
            }
            "type" | "input" | "search" => {
                let text = action
                    .text
                    .as_deref()
                    .ok_or_else(|| Error::Session(format!("{} requires text", action.kind)))?;
                match action.selector.as_deref() {
                    Some(selector) if !selector.is_empty() => {
                        self.driver.type_in_element(selector, text).await
                    }
                    _ => self.driver.type_text(text).await,
                }
            }
            "press" => {
                let key = action.text.as_deref().unwrap_or("Enter");
                self.driver.press_key(key, 0).await
            }
            "submit" | "enter" => self.driver.press_key("Enter", 0).await,
            "scroll" => {
                let dy = match action.direction {
                    Some(tabpilot_core::ScrollDirection::Up) => -400.0,
                    _ => 400.0,
                };
                self.driver.scroll(0.0, dy).await
            }
            "navigate" => {
                let url = action
                    .url
                    .as_deref()
                    .ok_or_else(|| Error::Session("navigate requires a url".to_string()))?;
                self.driver.navigate(url).await
            }
            "wait" => {
                tokio::time::sleep(Duration::from_millis(1000)).await;
                Ok(())
            }
            "screenshot" => {
                self.driver
                    .capture_screenshot("jpeg", Some(self.config.screenshot_quality))
                    .await?;
                Ok(())
            }
            "clear_input" => {
                let selector = require_selector(action)?;
                self.driver.clear_field(selector).await
            }
            // Normalization already degraded unknown kinds to wait.
            other => {
                warn!(kind = %other, "Executor saw unnormalized action kind, waiting");
                tokio::time::sleep(Duration::from_millis(1000)).await;
                Ok(())
            }
        }
    }

    /// Post-action URL for the record. Clicks get the configured settling
    /// delay before the comparison read.
    async fn settled_url(&self, action: &Action, success: bool, url_before: &str) -> String {
        if success && action.kind == "click" {
            tokio::time::sleep(Duration::from_millis(self.config.post_click_delay_ms)).await;
        }
        match self.driver.page_state().await {
            Ok(state) => state.url,
            Err(_) => url_before.to_string(),
        }
    }
}

fn require_selector(action: &Action) -> Result<&str> {
    action
        .selector
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Selector(format!("{} requires a selector", action.kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn click(selector: &str) -> Action {
        Action::from_value(&json!({"action": "click", "selector": selector}))
    }

    #[test]
    fn test_escalation_second_click_goes_js() {
        let mut escalation = LoopBreak::default();
        let mut first = click("button.go");
        escalation.apply(&mut first);
        assert_eq!(first.click_method, ClickMethod::Auto);

        let mut second = click("button.go");
        escalation.apply(&mut second);
        assert_eq!(second.click_method, ClickMethod::Js);
        assert_eq!(second.kind, "click");
    }

    #[test]
    fn test_escalation_third_click_on_submitish_selector_becomes_submit() {
        let mut escalation = LoopBreak::default();
        for _ in 0..2 {
            escalation.apply(&mut click("button.go"));
        }
        let mut third = click("button.go");
        escalation.apply(&mut third);
        assert_eq!(third.kind, "submit");
    }

    #[test]
    fn test_escalation_third_click_on_plain_selector_stays_js() {
        let mut escalation = LoopBreak::default();
        for _ in 0..2 {
            escalation.apply(&mut click("a.next-page"));
        }
        let mut third = click("a.next-page");
        escalation.apply(&mut third);
        assert_eq!(third.kind, "click");
        assert_eq!(third.click_method, ClickMethod::Js);
    }

    #[test]
    fn test_escalation_resets_on_different_action() {
        let mut escalation = LoopBreak::default();
        escalation.apply(&mut click("button.go"));
        let mut other = Action::from_value(&json!({"action": "scroll"}));
        escalation.apply(&mut other);
        let mut again = click("button.go");
        escalation.apply(&mut again);
        assert_eq!(again.click_method, ClickMethod::Auto);
    }

    #[test]
    fn test_nav_watch_three_strikes() {
        let mut nav = NavWatch::default();
        let url = "https://example.test/";
        assert!(nav.observe(url, url).is_none());
        assert!(nav.observe(url, url).is_none());
        let inject = nav.observe(url, url);
        assert_eq!(inject, Some(CLICK_NO_NAV_ERROR));
    }

    #[test]
    fn test_nav_watch_resets_on_navigation() {
        let mut nav = NavWatch::default();
        let url = "https://example.test/";
        nav.observe(url, url);
        nav.observe(url, url);
        assert!(nav.observe(url, "https://example.test/next").is_none());
        assert!(nav.observe(url, url).is_none());
    }

    #[test]
    fn test_require_selector() {
        assert!(require_selector(&click("#go")).is_ok());
        let empty = Action::from_value(&json!({"action": "click"}));
        assert!(matches!(require_selector(&empty), Err(Error::Selector(_))));
    }
}
