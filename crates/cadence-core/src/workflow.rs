use cadence_types::{Intent, QuotaDecision, QuotaResultType, QuotaUsage, WorkflowState};

use crate::orchestrator::{
    CommandOutcome, CommandStatus, DiffAction, Orchestrator, ReflexionReport,
};

/// Command-shaped wrapper over one orchestrator. Every entry point
/// returns the uniform `{status, state, message, approval?}` shape.
#[derive(Clone)]
pub struct Workflow {
    orchestrator: Orchestrator,
}

/// Diff review directive, e.g. `approve 1,3` or `reject all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffDirective {
    pub action: DiffAction,
    pub selection: String,
}

pub fn parse_diff_directive(raw: &str) -> Option<DiffDirective> {
    let mut tokens = raw.trim().split_whitespace();
    let action = match tokens.next()? {
        "approve" => DiffAction::Approve,
        "reject" => DiffAction::Reject,
        _ => return None,
    };
    Some(DiffDirective {
        action,
        selection: tokens.collect::<Vec<_>>().join(" "),
    })
}

impl Workflow {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Feed the product brief to the plan agent. A completed run reopens
    /// into a fresh intake first.
    pub async fn start_plan(&self, brief: &str) -> CommandOutcome {
        let state = self.orchestrator.current_state().await;
        match state {
            WorkflowState::Done => {
                // DONE → PRD_INTAKE is the only way back in.
                self.orchestrator.reopen().await;
                self.orchestrator.process_input(brief).await
            }
            WorkflowState::PrdIntake
            | WorkflowState::PrdClarifying
            | WorkflowState::PlanDrafted => self.orchestrator.process_input(brief).await,
            WorkflowState::AwaitingPlanConfirmation => CommandOutcome {
                status: CommandStatus::NeedsInput,
                state,
                message: "a drafted plan is already awaiting confirmation".to_string(),
                approval: None,
            },
            other => CommandOutcome {
                status: CommandStatus::Blocked,
                state: other,
                message: format!("planning is not available in state {other}"),
                approval: None,
            },
        }
    }

    /// Explicit plan decision, bypassing the classifier entirely.
    pub async fn submit_plan_decision(&self, decision: Intent) -> CommandOutcome {
        match self.orchestrator.process_approval(decision).await {
            Ok(result) => CommandOutcome {
                status: CommandStatus::Success,
                state: result.new_state,
                message: if result.approved {
                    "plan approved; implementation unlocked".to_string()
                } else {
                    "plan decision recorded".to_string()
                },
                approval: None,
            },
            Err(err) => CommandOutcome {
                status: CommandStatus::Blocked,
                state: self.orchestrator.current_state().await,
                message: err.to_string(),
                approval: None,
            },
        }
    }

    /// Build step. While the plan awaits confirmation this never
    /// transitions; it reports `needs_input` instead.
    pub async fn run_build(&self, instruction: Option<&str>) -> CommandOutcome {
        let state = self.orchestrator.current_state().await;
        match state {
            WorkflowState::AwaitingPlanConfirmation => CommandOutcome {
                status: CommandStatus::NeedsInput,
                state,
                message: "the plan is awaiting confirmation; approve it before building"
                    .to_string(),
                approval: None,
            },
            WorkflowState::Implementing => {
                self.orchestrator
                    .process_input(
                        instruction.unwrap_or("Continue implementing the approved plan."),
                    )
                    .await
            }
            other => CommandOutcome {
                status: CommandStatus::Blocked,
                state: other,
                message: format!("building is not available in state {other}"),
                approval: None,
            },
        }
    }

    pub async fn run_qa(&self) -> CommandOutcome {
        match self.orchestrator.run_qa_with_reflexion().await {
            Ok(ReflexionReport { success: true, attempts }) => CommandOutcome {
                status: CommandStatus::Success,
                state: self.orchestrator.current_state().await,
                message: format!("QA passed after {attempts} attempt(s)"),
                approval: None,
            },
            Ok(ReflexionReport { attempts, .. }) => CommandOutcome {
                status: CommandStatus::Error,
                state: self.orchestrator.current_state().await,
                message: format!("QA exhausted {attempts} attempt(s) without passing"),
                approval: None,
            },
            Err(err) => CommandOutcome {
                status: CommandStatus::Blocked,
                state: self.orchestrator.current_state().await,
                message: err.to_string(),
                approval: None,
            },
        }
    }

    pub async fn run_review(&self) -> CommandOutcome {
        let state = self.orchestrator.current_state().await;
        if state != WorkflowState::Review {
            return CommandOutcome {
                status: CommandStatus::Blocked,
                state,
                message: format!("review is not available in state {state}"),
                approval: None,
            };
        }
        self.orchestrator
            .process_input("Review the applied changes.")
            .await
    }

    pub async fn run_refactor(&self) -> CommandOutcome {
        let state = self.orchestrator.current_state().await;
        match state {
            WorkflowState::Review => {
                self.orchestrator.advance_to_refactor().await;
                self.orchestrator
                    .process_input("Refactor the implementation without changing behavior.")
                    .await
            }
            WorkflowState::Refactor => {
                self.orchestrator
                    .process_input("Refactor the implementation without changing behavior.")
                    .await
            }
            other => CommandOutcome {
                status: CommandStatus::Blocked,
                state: other,
                message: format!("refactoring is not available in state {other}"),
                approval: None,
            },
        }
    }

    /// `approve [selection]` / `reject [selection]` over the current
    /// reviewable diff.
    pub async fn review_diff(&self, raw: &str) -> CommandOutcome {
        let Some(directive) = parse_diff_directive(raw) else {
            return CommandOutcome {
                status: CommandStatus::Error,
                state: self.orchestrator.current_state().await,
                message: format!("unrecognized diff directive `{raw}`"),
                approval: None,
            };
        };
        self.orchestrator
            .review_diff(directive.action, &directive.selection)
            .await
    }

    /// Quota contract at the plan boundary; maps the resolver's decision
    /// onto the command shape.
    pub async fn check_quota(&self, usage: QuotaUsage, tokens_needed: u64) -> CommandOutcome {
        let decision: QuotaDecision = self.orchestrator.resolve_quota(usage, tokens_needed);
        let state = self.orchestrator.current_state().await;
        let status = match decision.result_type {
            QuotaResultType::Allow | QuotaResultType::Warn | QuotaResultType::Degraded => {
                CommandStatus::Success
            }
            QuotaResultType::NeedsInput => CommandStatus::NeedsInput,
            QuotaResultType::Queued => CommandStatus::Blocked,
        };
        let message = decision
            .warning
            .clone()
            .or(decision.recommended_action.clone())
            .unwrap_or_else(|| "quota check passed".to_string());
        CommandOutcome {
            status,
            state,
            message,
            approval: None,
        }
    }

    pub async fn stop(&self, reason: &str) -> CommandOutcome {
        self.orchestrator.stop(reason).await;
        CommandOutcome {
            status: CommandStatus::Success,
            state: self.orchestrator.current_state().await,
            message: format!("run stopped: {reason}"),
            approval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_directives_parse_action_and_selection() {
        let directive = parse_diff_directive("approve 1, 3").unwrap();
        assert_eq!(directive.action, DiffAction::Approve);
        assert_eq!(directive.selection, "1, 3");

        let directive = parse_diff_directive("reject all").unwrap();
        assert_eq!(directive.action, DiffAction::Reject);
        assert_eq!(directive.selection, "all");

        let directive = parse_diff_directive("approve").unwrap();
        assert_eq!(directive.selection, "");

        assert!(parse_diff_directive("merge 1").is_none());
    }
}
