use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::WorkflowState;

/// Wire version carried by every envelope.
pub const EVENT_VERSION: &str = "v1";

/// Logical originator of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    User,
    PlanAgent,
    BuilderAgent,
    QaAgent,
    ReviewAgent,
    RefactorAgent,
    System,
}

impl Actor {
    pub fn as_str(self) -> &'static str {
        match self {
            Actor::User => "user",
            Actor::PlanAgent => "plan_agent",
            Actor::BuilderAgent => "builder_agent",
            Actor::QaAgent => "qa_agent",
            Actor::ReviewAgent => "review_agent",
            Actor::RefactorAgent => "refactor_agent",
            Actor::System => "system",
        }
    }
}

/// Closed set of event discriminants. The parser boundary maps dotted wire
/// names onto these variants; everything downstream matches on the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "turn.start")]
    TurnStart,
    #[serde(rename = "turn.end")]
    TurnEnd,
    #[serde(rename = "agent.start")]
    AgentStart,
    #[serde(rename = "agent.stop")]
    AgentStop,
    #[serde(rename = "model.call")]
    ModelCall,
    #[serde(rename = "model.result")]
    ModelResult,
    #[serde(rename = "tool.call")]
    ToolCall,
    #[serde(rename = "tool.result")]
    ToolResult,
    #[serde(rename = "diff.proposed")]
    DiffProposed,
    #[serde(rename = "diff.approved")]
    DiffApproved,
    #[serde(rename = "diff.rejected")]
    DiffRejected,
    #[serde(rename = "diff.applied")]
    DiffApplied,
    #[serde(rename = "diff.rolled_back")]
    DiffRolledBack,
    #[serde(rename = "diff.hunk.approved")]
    DiffHunkApproved,
    #[serde(rename = "diff.hunk.rejected")]
    DiffHunkRejected,
    #[serde(rename = "policy.warn")]
    PolicyWarn,
    #[serde(rename = "policy.block")]
    PolicyBlock,
    #[serde(rename = "test.run")]
    TestRun,
    #[serde(rename = "test.result")]
    TestResult,
    #[serde(rename = "checkpoint.saved")]
    CheckpointSaved,
    #[serde(rename = "checkpoint.restored")]
    CheckpointRestored,
    #[serde(rename = "state.transition")]
    StateTransition,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "user.input")]
    UserInput,
    #[serde(rename = "user.approval")]
    UserApproval,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TurnStart => "turn.start",
            EventType::TurnEnd => "turn.end",
            EventType::AgentStart => "agent.start",
            EventType::AgentStop => "agent.stop",
            EventType::ModelCall => "model.call",
            EventType::ModelResult => "model.result",
            EventType::ToolCall => "tool.call",
            EventType::ToolResult => "tool.result",
            EventType::DiffProposed => "diff.proposed",
            EventType::DiffApproved => "diff.approved",
            EventType::DiffRejected => "diff.rejected",
            EventType::DiffApplied => "diff.applied",
            EventType::DiffRolledBack => "diff.rolled_back",
            EventType::DiffHunkApproved => "diff.hunk.approved",
            EventType::DiffHunkRejected => "diff.hunk.rejected",
            EventType::PolicyWarn => "policy.warn",
            EventType::PolicyBlock => "policy.block",
            EventType::TestRun => "test.run",
            EventType::TestResult => "test.result",
            EventType::CheckpointSaved => "checkpoint.saved",
            EventType::CheckpointRestored => "checkpoint.restored",
            EventType::StateTransition => "state.transition",
            EventType::Error => "error",
            EventType::UserInput => "user.input",
            EventType::UserApproval => "user.approval",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Masking coarseness applied to an emitted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactionLevel {
    None,
    Partial,
    Strict,
}

/// Immutable event record. Every field is populated at emission; the bus
/// escalates `redaction_level` to `strict` when the raw payload carried
/// sensitive material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_version: String,
    pub run_id: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub state: WorkflowState,
    pub actor: Actor,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub correlation_id: String,
    pub payload: Value,
    pub redaction_level: RedactionLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPayload {
    pub tool_name: String,
    pub arguments: Value,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPayload {
    pub tool_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyEventPayload {
    pub rule: String,
    pub message: String,
    /// `<operation>:<tool>` of the gated call.
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunPayload {
    pub framework: String,
    pub test_pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultPayload {
    pub passed: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransitionPayload {
    pub from: WorkflowState,
    pub to: WorkflowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}
