//! Session controller.
//!
//! Owns the per-tab session lifecycle:
//!
//! ```text
//! IDLE ──start──▶ CLEANING ──▶ ATTACHING ──▶ RUNNING ──▶ CLEANING ──▶ IDLE
//! ```
//!
//! Every path that touches attachment ownership (start, stop,
//! host-restart reconciliation) runs under one cleanup mutex; skipping
//! that serialization is where "another debugger attached" failures come
//! from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabpilot_bridge::{ClientMessage, SidecarClient};
use tabpilot_cdp::{AttachmentRegistry, ChromeEndpoint, TabDriver, TabTarget};
use tabpilot_core::{
    Config, Envelope, Error, FabricMessage, Paths, Result, RouteTarget, RoutingFabric, TabId,
};
use tabpilot_storage::{StateStore, TranscriptStore};
use tracing::{debug, info, warn};

use crate::runner::{AgentLoop, LoopEnd};
use crate::session::{Session, StopFlag};

/// Polled boolean guarding all attachment-ownership changes.
#[derive(Clone)]
pub struct CleanupMutex {
    busy: Arc<AtomicBool>,
    poll: Duration,
}

pub struct CleanupGuard {
    busy: Arc<AtomicBool>,
}

impl CleanupMutex {
    pub fn new(poll_ms: u64) -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
            poll: Duration::from_millis(poll_ms.max(1)),
        }
    }

    /// Wait-loop acquisition; concurrent requests queue up on the poll
    /// interval.
    pub async fn acquire(&self) -> CleanupGuard {
        loop {
            if self
                .busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return CleanupGuard {
                    busy: self.busy.clone(),
                };
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// What a session run is asked to do.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub goal: String,
    /// Preferred tab; a missing or privileged one is replaced by a fresh
    /// tab.
    pub tab: Option<TabId>,
    /// Set for server-initiated sessions, which arrive with their id.
    pub session_id: Option<String>,
    pub max_steps: Option<u32>,
}

/// The one completion message a session produces.
#[derive(Debug, Clone)]
pub enum SessionOutcome {
    Done { summary: String },
    MaxSteps { steps: u32 },
    Stopped,
    Failed { reason: String },
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done { summary } => write!(f, "done: {}", summary),
            Self::MaxSteps { steps } => write!(f, "stopped after reaching the {}-step limit", steps),
            Self::Stopped => write!(f, "stopped by request"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

pub struct SessionController {
    config: Config,
    endpoint: Arc<ChromeEndpoint>,
    registry: AttachmentRegistry,
    bridge: SidecarClient,
    store: StateStore,
    transcripts: TranscriptStore,
    fabric: RoutingFabric,
    cleanup: CleanupMutex,
    current_stop: std::sync::Mutex<Option<StopFlag>>,
}

impl SessionController {
    pub fn new(
        config: Config,
        paths: Paths,
        endpoint: Arc<ChromeEndpoint>,
        bridge: SidecarClient,
        fabric: RoutingFabric,
    ) -> Self {
        let cleanup = CleanupMutex::new(config.session.cleanup_poll_ms);
        Self {
            config,
            endpoint,
            registry: AttachmentRegistry::new(),
            bridge,
            store: StateStore::new(paths.clone()),
            transcripts: TranscriptStore::new(paths),
            fabric,
            cleanup,
            current_stop: std::sync::Mutex::new(None),
        }
    }

    /// Request a stop of whatever session is running. The in-flight
    /// command finishes naturally; the loop exits at its next check.
    pub async fn stop_current(&self) {
        if let Some(stop) = self
            .current_stop
            .lock()
            .expect("stop slot poisoned")
            .clone()
        {
            stop.stop();
        }
        self.fabric
            .publish(Envelope {
                target: RouteTarget::Controller,
                message: FabricMessage::StopRequested {
                    session_id: String::new(),
                },
            })
            .await;
    }

    /// Run one goal-scoped session start to finish.
    pub async fn run_session(&self, request: SessionRequest) -> Result<SessionOutcome> {
        let max_steps = request.max_steps.unwrap_or(self.config.agent.max_steps);

        // ── CLEANING (entry) + ATTACHING, serialized ─────────────────
        let guard = self.cleanup.acquire().await;

        let record = self.store.load();
        if record.may_have_stale_attachment() {
            info!(
                tab = ?record.active_tab_id,
                "Previous incarnation may still hold an attachment, cleaning first"
            );
        }
        let mut cleanup_targets: Vec<TabId> = Vec::new();
        cleanup_targets.extend(request.tab);
        if let Some(tab) = record.active_tab() {
            if !cleanup_targets.contains(&tab) {
                cleanup_targets.push(tab);
            }
        }
        for tab in cleanup_targets {
            self.release_tab(tab).await?;
        }

        let (target, created) = self.resolve_target(request.tab).await?;
        let mut driver = TabDriver::new(
            target.tab,
            self.endpoint.clone(),
            self.registry.clone(),
            self.fabric.clone(),
        );
        if let Err(e) = driver.attach().await {
            if created {
                // Don't leave the tab we just opened orphaned.
                let _ = self.endpoint.close_tab(target.tab).await;
            }
            return Err(e);
        }

        let mut session = Session::new(&request.goal, target.tab, max_steps);
        if let Some(id) = &request.session_id {
            session.adopt_server_id(id);
        }
        self.store.activate(target.tab, &session.id)?;
        *self.current_stop.lock().expect("stop slot poisoned") = Some(session.stop.clone());
        drop(guard);

        if created {
            self.wait_for_load(&driver).await;
        }

        // ── RUNNING ──────────────────────────────────────────────────
        let end = self.run_attached(&mut driver, &mut session, request.session_id.is_none()).await;

        // ── CLEANING (exit) ──────────────────────────────────────────
        let guard = self.cleanup.acquire().await;
        session.stop.stop();
        let _ = self
            .bridge
            .send(ClientMessage::StopSession {
                session_id: session.id.clone(),
            })
            .await;
        // Clear the action-handler slot so stray policy actions drop.
        self.bridge.unsubscribe().await;
        driver.detach().await?;
        // isActive goes false but the tab id stays: the next session still
        // needs to know which tab to clean.
        self.store.deactivate()?;
        tokio::time::sleep(Duration::from_millis(self.config.session.exit_wait_ms)).await;
        drop(guard);
        *self.current_stop.lock().expect("stop slot poisoned") = None;

        let outcome = match end {
            LoopEnd::Done { summary } => SessionOutcome::Done { summary },
            LoopEnd::MaxSteps => SessionOutcome::MaxSteps { steps: session.step },
            LoopEnd::Stopped => SessionOutcome::Stopped,
            LoopEnd::Failed { reason } => SessionOutcome::Failed { reason },
        };
        info!(session = %session.id, steps = session.step, outcome = %outcome, "Session finished");
        Ok(outcome)
    }

    async fn run_attached(
        &self,
        driver: &mut TabDriver,
        session: &mut Session,
        announce: bool,
    ) -> LoopEnd {
        if let Err(e) = self.bridge.ensure_ready().await {
            return LoopEnd::Failed {
                reason: format!("transport lost: {}", e),
            };
        }
        let mut events = match self.bridge.subscribe().await {
            Ok(events) => events,
            Err(e) => {
                return LoopEnd::Failed {
                    reason: format!("transport lost: {}", e),
                }
            }
        };
        if announce {
            if let Err(e) = self
                .bridge
                .send(ClientMessage::StartSession {
                    goal: session.goal.clone(),
                    model: self.config.agent.model.clone(),
                })
                .await
            {
                return LoopEnd::Failed {
                    reason: format!("transport lost: {}", e),
                };
            }
        }

        if let Err(e) = self.transcripts.begin(&session.id, &session.goal) {
            debug!(error = %e, "Transcript begin failed");
        }

        let mut fabric_rx = self.fabric.subscribe(RouteTarget::Controller).await;
        AgentLoop::new(
            driver,
            &self.bridge,
            &mut events,
            &mut fabric_rx,
            session,
            &self.transcripts,
            &self.config.agent,
        )
        .run()
        .await
    }

    /// Make sure nothing is attached to `tab` before we take it. A page
    /// target without a WebSocket URL still has a debugger on it; wait for
    /// the browser to release, bounded by polling.
    async fn release_tab(&self, tab: TabId) -> Result<()> {
        // Reconcile any claim leaked by a torn-down session in this
        // process; releasing an unclaimed tab is a no-op.
        self.registry.release(tab);

        let Some(target) = self.endpoint.find_tab(tab).await? else {
            debug!(tab = %tab, "Stale tab is gone, nothing to clean");
            let _ = self.store.clear_tab();
            return Ok(());
        };
        if !target.ws_url.is_empty() {
            return Ok(());
        }

        let wait = Duration::from_millis(self.config.session.cleanup_wait_ms);
        for attempt in 1..=3u32 {
            info!(tab = %tab, attempt = attempt, "Waiting for browser to release the debugger");
            tokio::time::sleep(wait).await;
            match self.endpoint.find_tab(tab).await? {
                None => return Ok(()),
                Some(target) if !target.ws_url.is_empty() => return Ok(()),
                Some(_) => {}
            }
        }
        Err(Error::Attachment(format!(
            "debugger on {} was not released",
            tab
        )))
    }

    /// Pick the tab to drive: the requested one when it is usable, an
    /// existing ordinary page otherwise, a fresh tab as the last resort.
    async fn resolve_target(&self, requested: Option<TabId>) -> Result<(TabTarget, bool)> {
        if let Some(tab) = requested {
            match self.endpoint.find_tab(tab).await? {
                Some(target) if !target.is_privileged() => return Ok((target, false)),
                Some(target) => {
                    info!(url = %target.url, "Requested tab is privileged, creating a fresh one")
                }
                None => info!(tab = %tab, "Requested tab is gone, creating a fresh one"),
            }
        } else if let Some(target) = self
            .endpoint
            .list_tabs()
            .await?
            .into_iter()
            .find(|t| !t.is_privileged() && !t.ws_url.is_empty())
        {
            return Ok((target, false));
        }
        let target = self.endpoint.create_tab("about:blank").await?;
        Ok((target, true))
    }

    /// Wait for a freshly created tab to finish loading, capped at the
    /// configured ceiling. The timeout is recoverable; we proceed anyway.
    async fn wait_for_load(&self, driver: &TabDriver) {
        let cap = Duration::from_secs(self.config.chrome.tab_load_timeout_secs);
        let deadline = tokio::time::Instant::now() + cap;
        loop {
            match driver.evaluate("document.readyState").await {
                Ok(state) if state.as_str() == Some("complete") => return,
                Ok(_) => {}
                Err(e) => debug!(error = %e, "readyState probe failed while loading"),
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(cap_secs = cap.as_secs(), "Tab load wait hit the cap, proceeding");
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_mutex_serializes() {
        let mutex = CleanupMutex::new(5);
        let active = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let mutex = mutex.clone();
            let active = active.clone();
            let overlapped = overlapped.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = mutex.acquire().await;
                if active.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.store(false, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cleanup_guard_releases_on_drop() {
        let mutex = CleanupMutex::new(1);
        {
            let _guard = mutex.acquire().await;
        }
        // Immediately reacquirable.
        let _guard = tokio::time::timeout(Duration::from_millis(100), mutex.acquire())
            .await
            .expect("mutex was not released");
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(
            SessionOutcome::Done {
                summary: "found it".to_string()
            }
            .to_string(),
            "done: found it"
        );
        assert_eq!(
            SessionOutcome::MaxSteps { steps: 15 }.to_string(),
            "stopped after reaching the 15-step limit"
        );
        assert_eq!(SessionOutcome::Stopped.to_string(), "stopped by request");
    }
}
