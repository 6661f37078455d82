//! Acquisition run log — persisted JSON timeline of every action taken
//! during a pass.
//!
//! Each run produces a single `{DATA_DIR}/clipper-runs/{run_id}.json` file
//! containing an ordered list of events with timestamps. Fire-and-forget
//! observability: nothing on the correctness path reads it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::orchestrator::RunStats;

// ---------------------------------------------------------------------------
// data_dir helper
// ---------------------------------------------------------------------------

/// Root data directory, controlled by `DATA_DIR` env var (default: `"data"`).
pub fn data_dir() -> PathBuf {
    PathBuf::from(std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()))
}

// ---------------------------------------------------------------------------
// RunLog
// ---------------------------------------------------------------------------

pub struct RunLog {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    events: Vec<RunEvent>,
    seq: u32,
}

/// Shared handle: the orchestrator, bypass engine and queue all append from
/// concurrent tasks.
pub type SharedRunLog = Arc<Mutex<RunLog>>;

#[derive(Serialize)]
struct RunEvent {
    seq: u32,
    ts: DateTime<Utc>,
    #[serde(flatten)]
    kind: EventKind,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    SourceStarted {
        source_id: Uuid,
        url: String,
    },
    SourceCompleted {
        source_id: Uuid,
        success: bool,
        articles_added: u32,
        articles_skipped: u32,
    },
    ProtectionDetected {
        url: String,
        protection: String,
        vendor: Option<String>,
    },
    BypassFinished {
        url: String,
        success: bool,
        attempts: u32,
        confidence: f64,
    },
    LinksDiscovered {
        url: String,
        extracted: u32,
        accepted: u32,
    },
    ValidationFailed {
        url: String,
        confidence: f64,
        issues: Vec<String>,
    },
    ArticleAdded {
        article_id: Uuid,
        url: String,
        title: String,
        content_hash: String,
    },
    ArticleSkipped {
        url: String,
        reason: String,
    },
    QueueEnqueued {
        article_id: Uuid,
        priority: i32,
        depth: usize,
    },
    ClassificationStored {
        article_id: Uuid,
        is_flagged: bool,
        score: f64,
    },
    ClassificationDeadLettered {
        article_id: Uuid,
        attempts: u32,
        last_error: String,
    },
}

impl RunLog {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            events: Vec::new(),
            seq: 0,
        }
    }

    /// A fresh shared log with a random run id.
    pub fn shared() -> SharedRunLog {
        Arc::new(Mutex::new(Self::new(Uuid::new_v4().to_string())))
    }

    pub fn log(&mut self, kind: EventKind) {
        self.events.push(RunEvent {
            seq: self.seq,
            ts: Utc::now(),
            kind,
        });
        self.seq += 1;
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Serialize the timeline to JSON and write it to disk. Returns the file
    /// path on success.
    pub fn save(&self, stats: &RunStats) -> Result<PathBuf> {
        let dir = data_dir().join("clipper-runs");
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.json", self.run_id));

        let output = SerializedRunLog {
            run_id: &self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            stats,
            events: &self.events,
        };

        std::fs::write(&path, serde_json::to_string_pretty(&output)?)?;
        info!(path = %path.display(), events = self.events.len(), "Run log saved");

        Ok(path)
    }
}

/// Append to a shared log without letting observability failures reach the
/// caller.
pub fn log_event(log: &SharedRunLog, kind: EventKind) {
    if let Ok(mut guard) = log.lock() {
        guard.log(kind);
    }
}

#[derive(Serialize)]
struct SerializedRunLog<'a> {
    run_id: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    stats: &'a RunStats,
    events: &'a [RunEvent],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_sequenced() {
        let mut log = RunLog::new("test-run");
        log.log(EventKind::ArticleSkipped {
            url: "https://a.com/x".to_string(),
            reason: "duplicate".to_string(),
        });
        log.log(EventKind::QueueEnqueued {
            article_id: Uuid::new_v4(),
            priority: 1,
            depth: 1,
        });
        assert_eq!(log.event_count(), 2);
        assert_eq!(log.events[0].seq, 0);
        assert_eq!(log.events[1].seq, 1);
    }

    #[test]
    fn event_kind_serializes_snake_case_tag() {
        let kind = EventKind::ProtectionDetected {
            url: "https://a.com".to_string(),
            protection: "cloudflare".to_string(),
            vendor: Some("cloudflare".to_string()),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "protection_detected");
    }
}
