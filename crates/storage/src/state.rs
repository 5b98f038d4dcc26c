//! Cross-incarnation session state.
//!
//! One record under the well-known `sessionState` key. A restarted host
//! reads it to learn that a debugger attachment from the previous
//! incarnation may still be live on some tab and must be torn down before
//! a new one is created.

use serde::{Deserialize, Serialize};
use tabpilot_core::{Paths, Result, TabId};
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub active_tab_id: Option<u32>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub updated_at: String,
}

impl SessionRecord {
    /// Whether the previous incarnation may still hold an attachment.
    pub fn may_have_stale_attachment(&self) -> bool {
        self.is_active || self.active_tab_id.is_some()
    }

    pub fn active_tab(&self) -> Option<TabId> {
        self.active_tab_id.map(TabId)
    }
}

pub struct StateStore {
    paths: Paths,
}

impl StateStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    /// Load the record. A missing or unreadable file is an inactive
    /// record, not an error.
    pub fn load(&self) -> SessionRecord {
        let path = self.paths.state_file();
        if !path.exists() {
            return SessionRecord::default();
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Corrupt session record, treating as inactive");
                    SessionRecord::default()
                }
            },
            Err(e) => {
                warn!(error = %e, "Unreadable session record, treating as inactive");
                SessionRecord::default()
            }
        }
    }

    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let path = self.paths.state_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    /// Record attachment ownership. Called in the same logical step as the
    /// attach itself.
    pub fn activate(&self, tab: TabId, session_id: &str) -> Result<()> {
        self.save(&SessionRecord {
            active_tab_id: Some(tab.0),
            session_id: Some(session_id.to_string()),
            is_active: true,
            updated_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Clear the active flag but retain the tab id: the next session
    /// still needs to know which tab to clean.
    pub fn deactivate(&self) -> Result<()> {
        let mut record = self.load();
        record.is_active = false;
        record.session_id = None;
        record.updated_at = chrono::Utc::now().to_rfc3339();
        self.save(&record)
    }

    /// Forget the tab too, once a later session has verified it clean.
    pub fn clear_tab(&self) -> Result<()> {
        let mut record = self.load();
        record.active_tab_id = None;
        record.updated_at = chrono::Utc::now().to_rfc3339();
        self.save(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(Paths::with_base(dir.path().to_path_buf()));
        (dir, store)
    }

    #[test]
    fn test_missing_file_is_inactive() {
        let (_dir, store) = store();
        let record = store.load();
        assert!(!record.is_active);
        assert!(!record.may_have_stale_attachment());
    }

    #[test]
    fn test_activate_then_deactivate_retains_tab() {
        let (_dir, store) = store();
        store.activate(TabId(12), "sess-1").unwrap();

        let record = store.load();
        assert!(record.is_active);
        assert_eq!(record.active_tab(), Some(TabId(12)));
        assert_eq!(record.session_id.as_deref(), Some("sess-1"));

        store.deactivate().unwrap();
        let record = store.load();
        assert!(!record.is_active);
        // The tab id survives deactivation so the next session can still
        // find the tab to clean.
        assert_eq!(record.active_tab(), Some(TabId(12)));
        assert!(record.may_have_stale_attachment());
    }

    #[test]
    fn test_clear_tab_forgets_everything() {
        let (_dir, store) = store();
        store.activate(TabId(5), "sess-2").unwrap();
        store.deactivate().unwrap();
        store.clear_tab().unwrap();
        assert!(!store.load().may_have_stale_attachment());
    }

    #[test]
    fn test_corrupt_record_treated_as_inactive() {
        let (dir, store) = store();
        std::fs::write(
            Paths::with_base(dir.path().to_path_buf()).state_file(),
            "{{{not json",
        )
        .unwrap();
        let record = store.load();
        assert!(!record.is_active);
    }
}
