use serde::{Deserialize, Serialize};

/// Workflow position of a run. Single-valued; mutated only by the state
/// machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    PrdIntake,
    PrdClarifying,
    PlanDrafted,
    AwaitingPlanConfirmation,
    Implementing,
    Qa,
    Review,
    Refactor,
    Done,
}

impl WorkflowState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::PrdIntake => "PRD_INTAKE",
            WorkflowState::PrdClarifying => "PRD_CLARIFYING",
            WorkflowState::PlanDrafted => "PLAN_DRAFTED",
            WorkflowState::AwaitingPlanConfirmation => "AWAITING_PLAN_CONFIRMATION",
            WorkflowState::Implementing => "IMPLEMENTING",
            WorkflowState::Qa => "QA",
            WorkflowState::Review => "REVIEW",
            WorkflowState::Refactor => "REFACTOR",
            WorkflowState::Done => "DONE",
        }
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_screaming_snake_case() {
        let json = serde_json::to_string(&WorkflowState::AwaitingPlanConfirmation).unwrap();
        assert_eq!(json, "\"AWAITING_PLAN_CONFIRMATION\"");
        assert_eq!(WorkflowState::Qa.as_str(), "QA");
    }
}
