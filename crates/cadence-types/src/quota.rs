use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardLimitBehavior {
    Block,
    Degrade,
    Queue,
}

impl Default for HardLimitBehavior {
    fn default() -> Self {
        HardLimitBehavior::Block
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimits {
    pub tokens_per_month: u64,
    pub requests_per_day: u64,
}

/// Usage snapshot handed to the resolver by metric producers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub tokens_used: u64,
    pub requests_today: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaAction {
    Allow,
    Warn,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResultType {
    Allow,
    Warn,
    NeedsInput,
    Degraded,
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTicket {
    pub eta_minutes: u64,
    pub queued_at: DateTime<Utc>,
}

/// Outcome of a quota check at the plan boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaDecision {
    pub allowed: bool,
    pub action: QuotaAction,
    pub result_type: QuotaResultType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueTicket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_action: Option<String>,
}

impl QuotaDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            action: QuotaAction::Allow,
            result_type: QuotaResultType::Allow,
            degraded_profile: None,
            queue: None,
            warning: None,
            recommended_action: None,
        }
    }
}
