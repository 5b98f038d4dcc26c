use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tabpilot_core::{ActionRecord, TabId};

/// Most-recent action records retained per session.
const ACTION_LOG_CAP: usize = 50;

/// Cancellation signal shared between the session's owning task and
/// whoever requests a stop. Checked before each observation and before
/// each action; an in-flight command finishes naturally.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One goal-scoped automation run.
pub struct Session {
    pub id: String,
    pub goal: String,
    pub tab: TabId,
    pub step: u32,
    pub max_steps: u32,
    pub stop: StopFlag,
    pub started_at: chrono::DateTime<chrono::Utc>,
    action_log: VecDeque<ActionRecord>,
}

impl Session {
    pub fn new(goal: &str, tab: TabId, max_steps: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal: goal.to_string(),
            tab,
            step: 0,
            max_steps,
            stop: StopFlag::new(),
            started_at: chrono::Utc::now(),
            action_log: VecDeque::new(),
        }
    }

    /// Adopt the id the policy server assigned on its first status reply.
    pub fn adopt_server_id(&mut self, session_id: &str) {
        if !session_id.is_empty() && self.id != session_id {
            self.id = session_id.to_string();
        }
    }

    /// Advance to the next step. Step numbers are 1-based and strictly
    /// increasing.
    pub fn next_step(&mut self) -> u32 {
        self.step += 1;
        self.step
    }

    /// Append one record per attempted action, dropping the oldest past
    /// the cap.
    pub fn record(&mut self, record: ActionRecord) {
        if self.action_log.len() >= ACTION_LOG_CAP {
            self.action_log.pop_front();
        }
        self.action_log.push_back(record);
    }

    /// Most-recent suffix of the action log.
    pub fn recent_actions(&self, n: usize) -> Vec<ActionRecord> {
        self.action_log
            .iter()
            .rev()
            .take(n)
            .rev()
            .cloned()
            .collect()
    }

    pub fn action_count(&self) -> usize {
        self.action_log.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: u32) -> ActionRecord {
        ActionRecord {
            kind: "click".to_string(),
            selector: String::new(),
            success: true,
            url_after: String::new(),
            error: None,
            step,
        }
    }

    #[test]
    fn test_step_counter_monotonic() {
        let mut session = Session::new("goal", TabId(1), 15);
        assert_eq!(session.next_step(), 1);
        assert_eq!(session.next_step(), 2);
        assert_eq!(session.step, 2);
    }

    #[test]
    fn test_action_log_bounded_to_suffix() {
        let mut session = Session::new("goal", TabId(1), 15);
        for i in 1..=60 {
            session.record(record(i));
        }
        assert_eq!(session.action_count(), 50);
        let recent = session.recent_actions(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].step, 56);
        assert_eq!(recent[4].step, 60);
    }

    #[test]
    fn test_recent_actions_short_log() {
        let mut session = Session::new("goal", TabId(1), 15);
        session.record(record(1));
        assert_eq!(session.recent_actions(5).len(), 1);
    }

    #[test]
    fn test_adopt_server_id() {
        let mut session = Session::new("goal", TabId(1), 15);
        let original = session.id.clone();
        session.adopt_server_id("");
        assert_eq!(session.id, original);
        session.adopt_server_id("srv-42");
        assert_eq!(session.id, "srv-42");
    }

    #[test]
    fn test_stop_flag_is_shared() {
        let session = Session::new("goal", TabId(1), 15);
        let handle = session.stop.clone();
        assert!(!session.stop.is_stopped());
        handle.stop();
        assert!(session.stop.is_stopped());
    }
}
