use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Approve,
    Revise,
    Ask,
    Deny,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Approve => "approve",
            Intent::Revise => "revise",
            Intent::Ask => "ask",
            Intent::Deny => "deny",
        }
    }
}

/// Deterministic conflict resolution when several intents score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    DenyOverApprove,
    ApproveOverDeny,
    Strict,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::DenyOverApprove
    }
}

/// Pure classification value; no lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentResult {
    pub intent: Intent,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicting_intents: Vec<Intent>,
}
