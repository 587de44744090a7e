use chrono::Utc;

use cadence_types::{
    HardLimitBehavior, QueueTicket, QuotaAction, QuotaDecision, QuotaLimits, QuotaResultType,
    QuotaUsage,
};

const DEFAULT_SOFT_LIMIT_PERCENT: u8 = 80;

/// Block/degrade/queue contract applied at the plan boundary. Pure
/// decision logic; usage snapshots arrive from opaque metric producers.
#[derive(Debug, Clone)]
pub struct QuotaResolver {
    limits: QuotaLimits,
    behavior: HardLimitBehavior,
    queue_eta_minutes: u64,
    soft_limit_percent: u8,
}

impl QuotaResolver {
    pub fn new(limits: QuotaLimits, behavior: HardLimitBehavior, queue_eta_minutes: u64) -> Self {
        Self {
            limits,
            behavior,
            queue_eta_minutes,
            soft_limit_percent: DEFAULT_SOFT_LIMIT_PERCENT,
        }
    }

    pub fn with_soft_limit_percent(mut self, percent: u8) -> Self {
        self.soft_limit_percent = percent;
        self
    }

    pub fn check(&self, usage: QuotaUsage, tokens_needed: u64) -> QuotaDecision {
        let hard_exceeded = usage.tokens_used >= self.limits.tokens_per_month
            || usage.tokens_used + tokens_needed > self.limits.tokens_per_month
            || usage.requests_today >= self.limits.requests_per_day;

        if hard_exceeded {
            return match self.behavior {
                HardLimitBehavior::Block => QuotaDecision {
                    allowed: false,
                    action: QuotaAction::Block,
                    result_type: QuotaResultType::NeedsInput,
                    degraded_profile: None,
                    queue: None,
                    warning: None,
                    recommended_action: Some(
                        "Reduce workload, wait for reset, or upgrade plan.".to_string(),
                    ),
                },
                HardLimitBehavior::Degrade => QuotaDecision {
                    allowed: true,
                    action: QuotaAction::Warn,
                    result_type: QuotaResultType::Degraded,
                    degraded_profile: Some("cheap".to_string()),
                    queue: None,
                    warning: Some(
                        "Usage limit reached. Auto-degrading to low-cost profile.".to_string(),
                    ),
                    recommended_action: None,
                },
                HardLimitBehavior::Queue => QuotaDecision {
                    allowed: false,
                    action: QuotaAction::Block,
                    result_type: QuotaResultType::Queued,
                    degraded_profile: None,
                    queue: Some(QueueTicket {
                        eta_minutes: self.queue_eta_minutes.max(1),
                        queued_at: Utc::now(),
                    }),
                    warning: None,
                    recommended_action: None,
                },
            };
        }

        let projected = usage.tokens_used.saturating_add(tokens_needed);
        let soft_floor =
            self.limits.tokens_per_month * u64::from(self.soft_limit_percent) / 100;
        if projected >= soft_floor {
            return QuotaDecision {
                allowed: true,
                action: QuotaAction::Warn,
                result_type: QuotaResultType::Warn,
                degraded_profile: None,
                queue: None,
                warning: Some(format!(
                    "Approaching the monthly token limit ({projected}/{} projected).",
                    self.limits.tokens_per_month
                )),
                recommended_action: None,
            };
        }

        QuotaDecision::allow()
    }
}
