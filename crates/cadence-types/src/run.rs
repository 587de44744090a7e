use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::Actor;
use crate::state::WorkflowState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A single top-level invocation of the orchestrator. Owns its events,
/// checkpoints, and sessions by foreign key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub working_directory: String,
    pub status: RunStatus,
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(project_id: impl Into<String>, working_directory: impl Into<String>, config: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            working_directory: working_directory.into(),
            status: RunStatus::Running,
            config,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Point-in-time capture of a run. Immutable once written; restoration
/// rehydrates the workflow state and captured fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub state: WorkflowState,
    pub opaque_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Checkpoint {
    pub fn new(run_id: impl Into<String>, state: WorkflowState, opaque_data: Value, description: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            timestamp: Utc::now(),
            state,
            opaque_data,
            description,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One transcript entry. Agents see a read-only view of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            actor: None,
            created_at: Utc::now(),
        }
    }

    pub fn from_actor(actor: Actor, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            actor: Some(actor),
            ..Self::new(role, content)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub run_id: String,
    pub title: String,
    #[serde(default)]
    pub transcript: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(run_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            title: title.into(),
            transcript: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_starts_running_with_fresh_timestamps() {
        let run = Run::new("proj-1", "/tmp/work", json!({"approvalMode": "balanced"}));
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.completed_at.is_none());
        assert_eq!(run.created_at, run.updated_at);
    }

    #[test]
    fn message_tags_actor_when_built_from_one() {
        let msg = Message::from_actor(Actor::QaAgent, MessageRole::Assistant, "tests passed");
        assert_eq!(msg.actor, Some(Actor::QaAgent));
        assert_eq!(msg.role, MessageRole::Assistant);
    }
}
