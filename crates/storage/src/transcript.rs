use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use tabpilot_core::{ActionRecord, Paths, Result};
use tracing::debug;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "_type")]
enum TranscriptLine {
    #[serde(rename = "metadata")]
    Metadata {
        goal: String,
        created_at: String,
    },
    #[serde(untagged)]
    Record(ActionRecord),
}

/// Append-only per-session transcript of executed actions, one JSON line
/// per record.
pub struct TranscriptStore {
    paths: Paths,
}

impl TranscriptStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    /// Create the transcript with its metadata header.
    pub fn begin(&self, session_id: &str, goal: &str) -> Result<()> {
        let path = self.paths.session_file(session_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        let metadata = TranscriptLine::Metadata {
            goal: goal.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        writeln!(file, "{}", serde_json::to_string(&metadata)?)?;
        Ok(())
    }

    pub fn append(&self, session_id: &str, record: &ActionRecord) -> Result<()> {
        let path = self.paths.session_file(session_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    /// Read back the records, skipping the header and anything that does
    /// not parse.
    pub fn load(&self, session_id: &str) -> Result<Vec<ActionRecord>> {
        let path = self.paths.session_file(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptLine>(&line) {
                Ok(TranscriptLine::Record(record)) => records.push(record),
                Ok(TranscriptLine::Metadata { .. }) => {}
                Err(e) => debug!(error = %e, "Skipping unparseable transcript line"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: u32, success: bool) -> ActionRecord {
        ActionRecord {
            kind: "click".to_string(),
            selector: "#go".to_string(),
            success,
            url_after: "https://example.test/".to_string(),
            error: (!success).then(|| "no element".to_string()),
            step,
        }
    }

    #[test]
    fn test_begin_append_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(Paths::with_base(dir.path().to_path_buf()));

        store.begin("sess-1", "search the docs").unwrap();
        store.append("sess-1", &record(1, true)).unwrap();
        store.append("sess-1", &record(2, false)).unwrap();

        let records = store.load("sess-1").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].step, 1);
        assert!(records[0].success);
        assert_eq!(records[1].error.as_deref(), Some("no element"));
    }

    #[test]
    fn test_load_missing_transcript_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(Paths::with_base(dir.path().to_path_buf()));
        assert!(store.load("nope").unwrap().is_empty());
    }
}
