use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// WorkflowId
// ---------------------------------------------------------------------------

/// Human-sortable workflow identifier: `wf-<yyyymmdd>-<hhmmss>-<rand5>`.
///
/// Lexicographic order equals creation order down to the second; the random
/// suffix disambiguates workflows created within the same second.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// Generate a fresh id from the current UTC time.
    pub fn generate() -> Self {
        let now = Utc::now();
        let mut rng = rand::thread_rng();
        let suffix: String = (0..5)
            .map(|_| {
                let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
                chars[rng.gen_range(0..chars.len())] as char
            })
            .collect();
        Self(format!("wf-{}-{}", now.format("%Y%m%d-%H%M%S"), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for WorkflowId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for WorkflowId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

/// Task identifier, assigned by the plan phase (e.g. `task-01`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_id_format() {
        let id = WorkflowId::generate();
        let s = id.as_str();
        assert!(s.starts_with("wf-"), "unexpected prefix: {s}");
        // wf-yyyymmdd-hhmmss-xxxxx
        let parts: Vec<&str> = s.split('-').collect();
        assert_eq!(parts.len(), 4, "unexpected shape: {s}");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 5);
    }

    #[test]
    fn workflow_ids_sort_by_creation() {
        // Same-second ids differ only in the random suffix; ids from
        // different seconds must order by timestamp.
        let a = WorkflowId::from("wf-20250101-000000-aaaaa");
        let b = WorkflowId::from("wf-20250101-000001-aaaaa");
        assert!(a < b);
    }

    #[test]
    fn task_id_roundtrip() {
        let id = TaskId::new("task-01");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"task-01\"");
        let back: TaskId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
