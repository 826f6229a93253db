//! Audit log for pipeline runs.
//!
//! Stage operations record [`PipelineEvent`]s in memory while they run and
//! append them to a JSONL file when they finish, so the file is a complete,
//! ordered history of every batch and item transition.
//!
//! # Example
//!
//! ```
//! use plp_events::EventLog;
//! use plp_types::{BatchStatus, EventType, PipelineEvent, Stage};
//!
//! let mut log = EventLog::new();
//! log.record(PipelineEvent::batch(
//!     1,
//!     EventType::StageStarted {
//!         stage: Stage::Collection,
//!         from: BatchStatus::Open,
//!     },
//! ));
//! assert_eq!(log.events_for_batch(1).len(), 1);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use plp_types::{BatchId, PipelineEvent};

/// Default events file name
pub const EVENTS_FILE: &str = "events.jsonl";

/// Events file path for a state directory
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// Append-only event log.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<PipelineEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: PipelineEvent) {
        self.events.push(event);
    }

    /// Append all recorded events to `path` as JSON lines.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);
        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;

        Ok(())
    }

    /// Read every event from a JSONL file. A missing file is an empty log.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut events = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: PipelineEvent = serde_json::from_str(&line).with_context(|| {
                format!("failed to parse event on line {} of {}", idx + 1, path.display())
            })?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn events_for_batch(&self, batch_id: BatchId) -> Vec<&PipelineEvent> {
        self.events.iter().filter(|e| e.batch_id == batch_id).collect()
    }

    pub fn events_for_order(&self, order_ref: &str) -> Vec<&PipelineEvent> {
        self.events
            .iter()
            .filter(|e| e.order_ref.as_deref() == Some(order_ref))
            .collect()
    }

    pub fn all_events(&self) -> &[PipelineEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plp_types::{BatchStatus, ErrorClass, EventType, ItemStatus, Stage};
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn started(batch_id: BatchId) -> PipelineEvent {
        PipelineEvent::batch(
            batch_id,
            EventType::StageStarted {
                stage: Stage::Submission,
                from: BatchStatus::CollectingData,
            },
        )
    }

    #[test]
    fn new_event_log_is_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn filters_by_batch_and_order() {
        let mut log = EventLog::new();
        log.record(started(1));
        log.record(started(2));
        log.record(PipelineEvent::item(
            1,
            "o-1",
            EventType::ItemSucceeded {
                stage: Stage::Submission,
                status: ItemStatus::SubmitCreated,
            },
        ));

        assert_eq!(log.events_for_batch(1).len(), 2);
        assert_eq!(log.events_for_batch(2).len(), 1);
        assert_eq!(log.events_for_order("o-1").len(), 1);
        assert!(log.events_for_order("o-2").is_empty());
    }

    #[test]
    fn write_appends_jsonl_lines() {
        let td = tempdir().expect("tempdir");
        let path = events_path(&td.path().join("state"));

        let mut first = EventLog::new();
        first.record(started(1));
        first.write_to_file(&path).expect("write first");

        let mut second = EventLog::new();
        second.record(started(2));
        second.write_to_file(&path).expect("write second");

        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content.lines().count(), 2);

        let loaded = EventLog::read_from_file(&path).expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.all_events()[1].batch_id, 2);
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let td = tempdir().expect("tempdir");
        let loaded = EventLog::read_from_file(&td.path().join("nope.jsonl")).expect("read");
        assert!(loaded.is_empty());
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(EVENTS_FILE);
        let good = serde_json::to_string(&started(1)).expect("serialize");
        fs::write(&path, format!("{good}\n\nnot json\n")).expect("write");

        let err = EventLog::read_from_file(&path).expect_err("malformed");
        assert!(format!("{err:#}").contains("line 3"));
    }

    #[test]
    fn clear_drops_recorded_events() {
        let mut log = EventLog::new();
        log.record(started(1));
        log.clear();
        assert!(log.is_empty());
    }

    proptest! {
        #[test]
        fn failure_messages_survive_the_file(message in "[ -~]{0,64}", batch_id in 1u64..1000) {
            let td = tempdir().expect("tempdir");
            let path = td.path().join(EVENTS_FILE);

            let mut log = EventLog::new();
            log.record(PipelineEvent::item(
                batch_id,
                "o-1",
                EventType::ItemFailed {
                    stage: Stage::LabelRequest,
                    class: ErrorClass::Retryable,
                    message: message.clone(),
                },
            ));
            log.write_to_file(&path).expect("write");

            let loaded = EventLog::read_from_file(&path).expect("read");
            prop_assert_eq!(loaded.all_events(), log.all_events());
        }
    }
}
