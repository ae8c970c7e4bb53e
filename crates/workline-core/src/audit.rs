use crate::error::Result;
use crate::io;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

/// One committed mutation, as recorded in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub diff: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        actor: impl Into<String>,
        diff: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            actor: actor.into(),
            diff,
        }
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Append-only JSON-lines log. Never rewritten; one line per committed
/// transaction event.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            path: paths::audit_log_path(&root.into()),
        }
    }

    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        io::append_line(&self.path, &serde_json::to_string(event)?)
    }

    /// Full event history, oldest first. Lines that fail to parse are
    /// returned as errors rather than skipped; the log is never rewritten,
    /// so a bad line means outside interference.
    pub fn read_all(&self) -> Result<Vec<AuditEvent>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| Ok(serde_json::from_str(l)?))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn append_accumulates_events() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(&AuditEvent::new(
            "create",
            "work_item",
            "FEA-001",
            "alice",
            serde_json::json!({"title": "First"}),
        ))
        .unwrap();
        log.append(&AuditEvent::new(
            "transition",
            "work_item",
            "FEA-001",
            "alice",
            serde_json::json!({"from": "planning", "to": "design"}),
        ))
        .unwrap();

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "create");
        assert_eq!(events[1].action, "transition");
        assert_eq!(events[1].diff["to"], "design");
    }

    #[test]
    fn one_line_per_event() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(&AuditEvent::new(
            "delete",
            "work_item",
            "FEA-001",
            "admin",
            serde_json::json!({"tombstone": true}),
        ))
        .unwrap();
        let content = std::fs::read_to_string(paths::audit_log_path(dir.path())).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        assert!(log.read_all().unwrap().is_empty());
    }
}
