use serde::{Deserialize, Serialize};

use cadence_types::{Intent, IntentResult, ToolOperation, WorkflowState};

use crate::intent::{classify, ClassifierConfig};

/// Directed edge set. A transition not listed here is a no-op.
pub fn legal_transitions(state: WorkflowState) -> &'static [WorkflowState] {
    use WorkflowState::*;
    match state {
        PrdIntake => &[PrdClarifying, PlanDrafted],
        PrdClarifying => &[PlanDrafted, PrdClarifying],
        PlanDrafted => &[AwaitingPlanConfirmation],
        AwaitingPlanConfirmation => &[Implementing, PlanDrafted, PrdClarifying],
        Implementing => &[Qa, Implementing],
        Qa => &[Review, Implementing],
        Review => &[Refactor, Done, Implementing],
        Refactor => &[Done, Implementing],
        Done => &[PrdIntake],
    }
}

/// States where any tool operation other than `read` is blocked.
pub fn is_write_blocked(state: WorkflowState) -> bool {
    matches!(
        state,
        WorkflowState::PrdIntake
            | WorkflowState::PrdClarifying
            | WorkflowState::PlanDrafted
            | WorkflowState::AwaitingPlanConfirmation
    )
}

/// States where only `read` is allowed.
pub fn is_read_only(state: WorkflowState) -> bool {
    matches!(state, WorkflowState::Review | WorkflowState::Done)
}

pub fn is_full_authority(state: WorkflowState) -> bool {
    matches!(state, WorkflowState::Implementing | WorkflowState::Refactor)
}

pub fn is_test_allowed(state: WorkflowState) -> bool {
    state == WorkflowState::Qa || is_full_authority(state)
}

/// Whether `operation` may run at all in `state`, independent of the
/// approval mode.
pub fn operation_allowed(state: WorkflowState, operation: ToolOperation) -> bool {
    match operation {
        ToolOperation::Read => true,
        ToolOperation::Exec => is_test_allowed(state),
        ToolOperation::Write | ToolOperation::Delete => is_full_authority(state),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub new_state: WorkflowState,
    pub transitioned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NlApprovalAction {
    DirectApply,
    Confirm,
    NoChange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NlApprovalOutcome {
    pub action: NlApprovalAction,
    pub classification: IntentResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    pub new_state: WorkflowState,
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: WorkflowState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: WorkflowState::PrdIntake,
        }
    }

    pub fn at(state: WorkflowState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn can_transition(&self, target: WorkflowState) -> bool {
        legal_transitions(self.state).contains(&target)
    }

    /// Returns false without mutation when the edge is absent.
    pub fn transition(&mut self, target: WorkflowState) -> bool {
        if !self.can_transition(target) {
            return false;
        }
        self.state = target;
        true
    }

    /// Bypasses validation. Reserved for checkpoint restore.
    pub fn force_transition(&mut self, target: WorkflowState) {
        self.state = target;
    }

    /// Explicit approval processing, legal only while awaiting plan
    /// confirmation.
    pub fn apply_approval(&mut self, decision: Intent) -> anyhow::Result<ApprovalOutcome> {
        if self.state != WorkflowState::AwaitingPlanConfirmation {
            anyhow::bail!(
                "plan approval is only valid in AWAITING_PLAN_CONFIRMATION (current: {})",
                self.state
            );
        }
        let outcome = match decision {
            Intent::Approve => {
                let transitioned = self.transition(WorkflowState::Implementing);
                ApprovalOutcome {
                    approved: true,
                    new_state: self.state,
                    transitioned,
                }
            }
            Intent::Revise | Intent::Deny => {
                let transitioned = self.transition(WorkflowState::PlanDrafted);
                ApprovalOutcome {
                    approved: false,
                    new_state: self.state,
                    transitioned,
                }
            }
            Intent::Ask => ApprovalOutcome {
                approved: false,
                new_state: self.state,
                transitioned: false,
            },
        };
        Ok(outcome)
    }

    /// Natural-language approval: apply directly above the approve
    /// threshold, request explicit confirmation above the confirm
    /// threshold, otherwise leave the state untouched.
    pub fn process_natural_language(
        &mut self,
        input: &str,
        config: &ClassifierConfig,
    ) -> anyhow::Result<NlApprovalOutcome> {
        if self.state != WorkflowState::AwaitingPlanConfirmation {
            anyhow::bail!(
                "natural-language approval is only valid in AWAITING_PLAN_CONFIRMATION (current: {})",
                self.state
            );
        }
        let classification = classify(input, config);
        if classification.confidence >= config.approve_threshold {
            let applied = self.apply_approval(classification.intent)?;
            return Ok(NlApprovalOutcome {
                action: NlApprovalAction::DirectApply,
                classification,
                approved: Some(applied.approved),
                new_state: applied.new_state,
            });
        }
        let action = if classification.confidence >= config.confirm_threshold {
            NlApprovalAction::Confirm
        } else {
            NlApprovalAction::NoChange
        };
        Ok(NlApprovalOutcome {
            action,
            classification,
            approved: None,
            new_state: self.state,
        })
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
