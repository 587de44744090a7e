use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HunkStatus {
    Pending,
    Approved,
    Rejected,
}

/// Addressable, independently approvable unit of a proposed file edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hunk {
    pub hunk_id: String,
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    pub content: String,
    pub status: HunkStatus,
}

impl Hunk {
    pub fn new(old_start: u32, old_lines: u32, new_start: u32, new_lines: u32, content: impl Into<String>) -> Self {
        Self {
            hunk_id: Uuid::new_v4().to_string(),
            old_start,
            old_lines,
            new_start,
            new_lines,
            content: content.into(),
            status: HunkStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    Pending,
    Approved,
    Rejected,
    Applied,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diff {
    pub id: String,
    pub file_path: String,
    pub hunks: Vec<Hunk>,
    pub status: DiffStatus,
}

impl Diff {
    pub fn new(file_path: impl Into<String>, hunks: Vec<Hunk>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_path: file_path.into(),
            hunks,
            status: DiffStatus::Pending,
        }
    }

    pub fn has_pending_hunks(&self) -> bool {
        self.hunks.iter().any(|h| h.status == HunkStatus::Pending)
    }

    /// Non-terminal status is a pure function of hunk statuses. `Applied`
    /// and `RolledBack` are terminal and set only by the review flow.
    pub fn derived_status(&self) -> DiffStatus {
        if matches!(self.status, DiffStatus::Applied | DiffStatus::RolledBack) {
            return self.status;
        }
        if self.has_pending_hunks() {
            return DiffStatus::Pending;
        }
        let any_approved = self.hunks.iter().any(|h| h.status == HunkStatus::Approved);
        let any_rejected = self.hunks.iter().any(|h| h.status == HunkStatus::Rejected);
        if !any_approved && any_rejected {
            DiffStatus::Rejected
        } else {
            DiffStatus::Approved
        }
    }
}
