use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::WorkflowState;

/// Side-effect class of a tool. Tools should declare this explicitly;
/// name-based inference survives only for undeclared legacy tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOperation {
    Read,
    Write,
    Delete,
    Exec,
}

impl ToolOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolOperation::Read => "read",
            ToolOperation::Write => "write",
            ToolOperation::Delete => "delete",
            ToolOperation::Exec => "exec",
        }
    }
}

/// Registered tool metadata. The handler itself lives behind the `Tool`
/// contract in the tools crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-schema describing the argument record.
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<ToolOperation>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub allow_in_fast_mode: bool,
}

/// What a handler returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: Value::Null,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            metadata: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Blocked,
    NeedsInput,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Block,
    NeedsApproval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub decision: PolicyDecision,
    pub reason: String,
}

/// Final shape every tool invocation resolves to. The pipeline never
/// propagates handler errors as Rust errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    pub status: ToolStatus,
    pub tool_name: String,
    pub message: String,
    pub policy: PolicyOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolOutcome>,
}

/// How eagerly the pipeline auto-allows operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    Strict,
    Balanced,
    Fast,
}

impl Default for ApprovalMode {
    fn default() -> Self {
        ApprovalMode::Balanced
    }
}

/// Context a tool request executes under.
#[derive(Debug, Clone)]
pub struct ToolExecutionContext {
    pub state: WorkflowState,
    pub approval_mode: ApprovalMode,
    pub working_directory: String,
    pub user_approved: bool,
    /// Operation override when the definition left it undeclared.
    pub operation: Option<ToolOperation>,
}
