use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use cadence_observability::AuditLog;
use cadence_tools::ToolRegistry;
use cadence_types::{
    Actor, Checkpoint, Diff, EventType, Intent, Message, MessageRole, QuotaDecision, QuotaLimits,
    QuotaUsage, Run, RunStatus, ToolExecutionContext, ToolExecutionResult, WorkflowState,
};

use crate::agents::{infer_operation, unknown_tool_result, AgentContext, AgentRegistry, AgentRole};
use crate::cancellation::CancellationRegistry;
use crate::config::RuntimeOptions;
use crate::diff_review::{approve_hunks, parse_selection, reject_hunks};
use crate::event_bus::{EmitOptions, EventBus};
use crate::intent::{classify, ClassifierConfig};
use crate::pipeline::ToolPipeline;
use crate::quota::QuotaResolver;
use crate::reflexion::{compose_feedback, parse_qa_output, QaParse};
use crate::state_machine::{NlApprovalAction, StateMachine};
use crate::storage::RunStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    NeedsInput,
    Blocked,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSummary {
    pub action: NlApprovalAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_state: Option<WorkflowState>,
}

/// Uniform result shape for every command-shaped entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub status: CommandStatus,
    pub state: WorkflowState,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalSummary>,
}

impl CommandOutcome {
    fn new(status: CommandStatus, state: WorkflowState, message: impl Into<String>) -> Self {
        Self {
            status,
            state,
            message: message.into(),
            approval: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResult {
    pub approved: bool,
    pub new_state: WorkflowState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NlApprovalResult {
    pub action: NlApprovalAction,
    pub intent: Intent,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    pub new_state: WorkflowState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflexionReport {
    pub success: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffAction {
    Approve,
    Reject,
}

#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub tool_name: String,
    pub arguments: Value,
    pub user_approved: bool,
}

/// Everything an orchestrator needs at construction. Configuration is
/// injected here and threaded through `AgentContext`; there is no
/// module-level state.
pub struct OrchestratorConfig {
    pub project_id: String,
    pub working_directory: String,
    pub options: RuntimeOptions,
    pub store: Arc<dyn RunStore>,
    pub tools: ToolRegistry,
    pub agents: AgentRegistry,
    pub quota_limits: Option<QuotaLimits>,
    pub audit: Option<Arc<AuditLog>>,
}

struct Core {
    run_id: String,
    session_id: String,
    run: RwLock<Run>,
    bus: EventBus,
    state: Arc<RwLock<StateMachine>>,
    transcript: RwLock<Vec<Message>>,
    pending_diffs: RwLock<Vec<Diff>>,
    tools: ToolRegistry,
    agents: AgentRegistry,
    pipeline: ToolPipeline,
    store: Arc<dyn RunStore>,
    options: RuntimeOptions,
    cancellations: CancellationRegistry,
    quota: Option<QuotaResolver>,
    turn_lock: Mutex<()>,
    running: AtomicBool,
}

/// Owns the state machine, event bus, tool registry, agent registry,
/// transcript, and pending diffs for one run. All mutating entry points
/// serialize on a single turn mutex; only one agent step, tool execution,
/// or transition is in flight at a time.
#[derive(Clone)]
pub struct Orchestrator {
    core: Arc<Core>,
}

/// Validated transition plus its event emission, shared by the
/// orchestrator and the bound `transition` handed to agents.
pub(crate) async fn apply_transition(
    state: &Arc<RwLock<StateMachine>>,
    bus: &EventBus,
    target: WorkflowState,
    reason: Option<&str>,
    actor: Actor,
) -> bool {
    let from = {
        let mut machine = state.write().await;
        let from = machine.state();
        if !machine.transition(target) {
            return false;
        }
        from
    };
    bus.set_state(target);
    let _ = bus.emit(
        EventType::StateTransition,
        json!({"from": from, "to": target, "reason": reason}),
        EmitOptions::actor(actor),
    );
    true
}

impl Orchestrator {
    pub async fn start(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let run = Run::new(
            config.project_id,
            config.working_directory,
            serde_json::to_value(&config.options)?,
        );
        let run_id = run.id.clone();
        config.store.create_run(run.clone()).await?;

        let bus = EventBus::new(run_id.clone(), WorkflowState::PrdIntake);
        if config.options.persist_events {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            bus.attach_sink(tx);
            let store = config.store.clone();
            tokio::spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    if let Err(err) = store.save_event(envelope).await {
                        tracing::warn!(error = %err, "event write-through failed");
                    }
                }
            });
        }
        if let Some(audit) = config.audit {
            bus.on_all(Arc::new(move |envelope| audit.append(envelope)));
        }

        // Keep the run record in step with terminal workflow states.
        {
            let store = config.store.clone();
            let run_id_for_done = run_id.clone();
            bus.on(
                EventType::StateTransition,
                Arc::new(move |envelope| {
                    if envelope.payload.get("to").and_then(|v| v.as_str()) == Some("DONE") {
                        let store = store.clone();
                        let run_id = run_id_for_done.clone();
                        tokio::spawn(async move {
                            if let Err(err) =
                                store.update_run_status(&run_id, RunStatus::Completed).await
                            {
                                tracing::warn!(error = %err, "run status update failed");
                            }
                        });
                    }
                }),
            );
        }

        let quota = config.quota_limits.map(|limits| {
            QuotaResolver::new(
                limits,
                config.options.hard_limit_behavior,
                config.options.queue_eta_minutes,
            )
            .with_soft_limit_percent(config.options.soft_limit_percent)
        });

        let cancellations = CancellationRegistry::new();
        cancellations.create(&run_id).await;

        let session = cadence_types::Session::new(run_id.clone(), run.project_id.clone());
        let session_id = session.id.clone();
        config.store.save_session(session).await?;

        let core = Core {
            run_id: run_id.clone(),
            session_id,
            run: RwLock::new(run),
            pipeline: ToolPipeline::new(bus.clone()),
            bus,
            state: Arc::new(RwLock::new(StateMachine::new())),
            transcript: RwLock::new(Vec::new()),
            pending_diffs: RwLock::new(Vec::new()),
            tools: config.tools,
            agents: config.agents,
            store: config.store,
            options: config.options,
            cancellations,
            quota,
            turn_lock: Mutex::new(()),
            running: AtomicBool::new(true),
        };
        Ok(Self {
            core: Arc::new(core),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.core.run_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.core.bus
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.core.options
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.core.agents
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.core.tools
    }

    pub async fn current_state(&self) -> WorkflowState {
        self.core.state.read().await.state()
    }

    pub async fn transcript(&self) -> Vec<Message> {
        self.core.transcript.read().await.clone()
    }

    pub async fn pending_diffs(&self) -> Vec<Diff> {
        self.core.pending_diffs.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            approve_threshold: self.core.options.approve_threshold,
            confirm_threshold: self.core.options.confirm_threshold,
            conflict_policy: self.core.options.conflict_policy,
        }
    }

    /// Route one user utterance. In `AWAITING_PLAN_CONFIRMATION` the
    /// input runs through the plan-confirmation sub-flow; everywhere else
    /// it is dispatched to the agent responsible for the current state.
    pub async fn process_input(&self, text: &str) -> CommandOutcome {
        let _turn = self.core.turn_lock.lock().await;
        if !self.is_running() {
            return CommandOutcome::new(
                CommandStatus::Error,
                self.core.state.read().await.state(),
                "run is stopped",
            );
        }

        self.emit(Actor::User, EventType::UserInput, json!({"text": text}));
        self.append_message(Message::from_actor(Actor::User, MessageRole::User, text))
            .await;

        let state = self.core.state.read().await.state();
        if state == WorkflowState::AwaitingPlanConfirmation {
            return self.plan_confirmation_flow(text).await;
        }

        match AgentRole::for_state(state) {
            Some(role) => self.dispatch_agent(role, text).await,
            None => CommandOutcome::new(
                CommandStatus::Success,
                state,
                "run is complete; reopen it to start a new intake",
            ),
        }
    }

    /// Explicit approval decision, `source: command`. Valid only while
    /// awaiting plan confirmation.
    pub async fn process_approval(&self, decision: Intent) -> anyhow::Result<ApprovalResult> {
        let _turn = self.core.turn_lock.lock().await;
        self.apply_plan_decision(decision, "command").await
    }

    /// Natural-language approval with the confidence-banded contract:
    /// apply, confirm, or leave untouched.
    pub async fn process_natural_language_approval(
        &self,
        input: &str,
    ) -> anyhow::Result<NlApprovalResult> {
        let _turn = self.core.turn_lock.lock().await;
        self.natural_language_approval_locked(input).await
    }

    async fn natural_language_approval_locked(
        &self,
        input: &str,
    ) -> anyhow::Result<NlApprovalResult> {
        let state = self.core.state.read().await.state();
        if state != WorkflowState::AwaitingPlanConfirmation {
            anyhow::bail!(
                "natural-language approval is only valid in AWAITING_PLAN_CONFIRMATION (current: {state})"
            );
        }
        let config = self.classifier_config();
        let classification = classify(input, &config);
        if classification.confidence >= config.approve_threshold {
            self.emit(
                Actor::User,
                EventType::UserApproval,
                json!({
                    "source": "natural_language",
                    "intent": classification.intent,
                    "confidence": classification.confidence,
                    "reasoning": classification.reasoning,
                }),
            );
            let applied = self.apply_decision_locked(classification.intent).await;
            return Ok(NlApprovalResult {
                action: NlApprovalAction::DirectApply,
                intent: classification.intent,
                confidence: classification.confidence,
                approved: Some(applied.approved),
                new_state: applied.new_state,
            });
        }
        let action = if classification.confidence >= config.confirm_threshold {
            NlApprovalAction::Confirm
        } else {
            NlApprovalAction::NoChange
        };
        Ok(NlApprovalResult {
            action,
            intent: classification.intent,
            confidence: classification.confidence,
            approved: None,
            new_state: state,
        })
    }

    async fn apply_plan_decision(
        &self,
        decision: Intent,
        source: &str,
    ) -> anyhow::Result<ApprovalResult> {
        let state = self.core.state.read().await.state();
        if state != WorkflowState::AwaitingPlanConfirmation {
            anyhow::bail!(
                "plan approval is only valid in AWAITING_PLAN_CONFIRMATION (current: {state})"
            );
        }
        self.emit(
            Actor::User,
            EventType::UserApproval,
            json!({"source": source, "decision": decision}),
        );
        Ok(self.apply_decision_locked(decision).await)
    }

    async fn apply_decision_locked(&self, decision: Intent) -> ApprovalResult {
        let (approved, target) = match decision {
            Intent::Approve => (true, Some(WorkflowState::Implementing)),
            Intent::Revise | Intent::Deny => (false, Some(WorkflowState::PlanDrafted)),
            Intent::Ask => (false, None),
        };
        if let Some(target) = target {
            apply_transition(
                &self.core.state,
                &self.core.bus,
                target,
                Some("plan decision"),
                Actor::User,
            )
            .await;
        }
        ApprovalResult {
            approved,
            new_state: self.core.state.read().await.state(),
        }
    }

    async fn plan_confirmation_flow(&self, text: &str) -> CommandOutcome {
        if let Some(decision) = parse_plan_command(text) {
            let state = self.core.state.read().await.state();
            return match self.apply_plan_decision(decision, "command").await {
                Ok(result) => {
                    let mut outcome = CommandOutcome::new(
                        CommandStatus::Success,
                        result.new_state,
                        if result.approved {
                            "plan approved; implementation unlocked"
                        } else if decision == Intent::Ask {
                            "plan question noted; still awaiting confirmation"
                        } else {
                            "plan returned to draft for revision"
                        },
                    );
                    outcome.approval = Some(ApprovalSummary {
                        action: NlApprovalAction::DirectApply,
                        intent: Some(decision),
                        confidence: None,
                        approved: Some(result.approved),
                        new_state: Some(result.new_state),
                    });
                    outcome
                }
                Err(err) => CommandOutcome::new(CommandStatus::Error, state, err.to_string()),
            };
        }

        match self.natural_language_approval_locked(text).await {
            Ok(result) => {
                let status = if result.action == NlApprovalAction::DirectApply {
                    CommandStatus::Success
                } else {
                    CommandStatus::NeedsInput
                };
                let message = match result.action {
                    NlApprovalAction::DirectApply if result.approved == Some(true) => {
                        "plan approved; implementation unlocked".to_string()
                    }
                    NlApprovalAction::DirectApply => {
                        "plan decision applied; back to drafting".to_string()
                    }
                    NlApprovalAction::Confirm => format!(
                        "read `{}` with medium confidence; reply `/plan {}` to confirm",
                        result.intent.as_str(),
                        result.intent.as_str()
                    ),
                    NlApprovalAction::NoChange => {
                        "could not read a clear decision; plan unchanged".to_string()
                    }
                };
                let mut outcome = CommandOutcome::new(status, result.new_state, message);
                outcome.approval = Some(ApprovalSummary {
                    action: result.action,
                    intent: Some(result.intent),
                    confidence: Some(result.confidence),
                    approved: result.approved,
                    new_state: Some(result.new_state),
                });
                outcome
            }
            Err(err) => CommandOutcome::new(
                CommandStatus::Error,
                self.core.state.read().await.state(),
                err.to_string(),
            ),
        }
    }

    async fn agent_context(&self, actor: Actor) -> AgentContext {
        AgentContext::new(
            actor,
            self.core.state.clone(),
            self.core.bus.clone(),
            self.core.pipeline.clone(),
            self.core.tools.clone(),
            self.core.transcript.read().await.clone(),
            self.core.options.clone(),
            self.core.run.read().await.working_directory.clone(),
            self.core.cancellations.get_or_create(&self.core.run_id).await,
        )
    }

    async fn dispatch_agent(&self, role: AgentRole, input: &str) -> CommandOutcome {
        let actor = role.actor();
        let state_before = self.core.state.read().await.state();
        let Some(agent) = self.core.agents.get(role).await else {
            return CommandOutcome::new(
                CommandStatus::Error,
                state_before,
                format!("no agent registered for role {role:?}"),
            );
        };

        self.emit(actor, EventType::TurnStart, json!({"agent": agent.name()}));
        self.emit(actor, EventType::AgentStart, json!({"agent": agent.name()}));

        let ctx = self.agent_context(actor).await;
        let reply = agent.run(&ctx, input).await;

        let outcome = match reply {
            Ok(reply) => {
                self.append_message(Message::from_actor(
                    actor,
                    MessageRole::Assistant,
                    reply.content.clone(),
                ))
                .await;
                for diff in reply.proposed_diffs {
                    self.register_diff_locked(diff, actor).await;
                }
                self.emit(
                    actor,
                    EventType::AgentStop,
                    json!({"agent": agent.name(), "status": "ok"}),
                );

                if role == AgentRole::Plan {
                    self.advance_plan_if_unmoved(state_before, actor).await;
                }

                CommandOutcome::new(
                    CommandStatus::Success,
                    self.core.state.read().await.state(),
                    reply.content,
                )
            }
            Err(err) => {
                self.emit(
                    actor,
                    EventType::AgentStop,
                    json!({"agent": agent.name(), "status": "error"}),
                );
                self.emit(
                    actor,
                    EventType::Error,
                    json!({
                        "code": "AGENT_FAILURE",
                        "message": err.to_string(),
                        "recoverable": true,
                    }),
                );
                CommandOutcome::new(
                    CommandStatus::Error,
                    self.core.state.read().await.state(),
                    err.to_string(),
                )
            }
        };

        self.emit(actor, EventType::TurnEnd, json!({"agent": agent.name()}));
        outcome
    }

    /// A plan reply that did not itself move the workflow advances to the
    /// confirmation gate.
    async fn advance_plan_if_unmoved(&self, state_before: WorkflowState, actor: Actor) {
        let current = self.core.state.read().await.state();
        if current != state_before {
            return;
        }
        if matches!(
            current,
            WorkflowState::PrdIntake | WorkflowState::PrdClarifying | WorkflowState::PlanDrafted
        ) {
            if current != WorkflowState::PlanDrafted {
                apply_transition(
                    &self.core.state,
                    &self.core.bus,
                    WorkflowState::PlanDrafted,
                    Some("plan drafted"),
                    actor,
                )
                .await;
            }
            apply_transition(
                &self.core.state,
                &self.core.bus,
                WorkflowState::AwaitingPlanConfirmation,
                Some("plan ready for confirmation"),
                actor,
            )
            .await;
        }
    }

    /// Look up and run one tool through the gate pipeline. Operation is
    /// taken from the definition; name-based inference covers undeclared
    /// legacy tools and warns when it fires.
    pub async fn execute_tool(&self, request: ToolRequest) -> ToolExecutionResult {
        let _turn = self.core.turn_lock.lock().await;
        self.execute_tool_locked(request, Actor::System).await
    }

    async fn execute_tool_locked(
        &self,
        request: ToolRequest,
        actor: Actor,
    ) -> ToolExecutionResult {
        let Some(tool) = self.core.tools.get(&request.tool_name).await else {
            return unknown_tool_result(&request.tool_name);
        };
        let definition = tool.definition();
        let inferred = if definition.operation.is_none() {
            let inferred = infer_operation(&request.tool_name);
            if let Some(operation) = inferred {
                self.emit(
                    actor,
                    EventType::PolicyWarn,
                    json!({
                        "rule": "operation-inference",
                        "message": format!(
                            "tool `{}` declares no operation; inferred `{}` from its name",
                            request.tool_name,
                            operation.as_str()
                        ),
                        "action": format!("{}:{}", operation.as_str(), request.tool_name),
                    }),
                );
            }
            inferred
        } else {
            None
        };
        let ctx = ToolExecutionContext {
            state: self.core.state.read().await.state(),
            approval_mode: self.core.options.approval_mode,
            working_directory: self.core.run.read().await.working_directory.clone(),
            user_approved: request.user_approved,
            operation: inferred,
        };
        let cancel = self.core.cancellations.get_or_create(&self.core.run_id).await;
        self.core
            .pipeline
            .execute(tool, request.arguments, &ctx, actor, cancel)
            .await
    }

    /// Register an agent-proposed edit for review.
    pub async fn propose_diff(&self, diff: Diff) {
        let _turn = self.core.turn_lock.lock().await;
        self.register_diff_locked(diff, Actor::BuilderAgent).await;
    }

    async fn register_diff_locked(&self, diff: Diff, actor: Actor) {
        self.emit(
            actor,
            EventType::DiffProposed,
            json!({
                "diffId": diff.id,
                "filePath": diff.file_path,
                "hunks": diff.hunks.len(),
            }),
        );
        self.core.pending_diffs.write().await.push(diff);
    }

    /// Hunk-level review of the first diff that still has pending hunks.
    pub async fn review_diff(&self, action: DiffAction, selection_raw: &str) -> CommandOutcome {
        let _turn = self.core.turn_lock.lock().await;
        let state = self.core.state.read().await.state();
        if !matches!(state, WorkflowState::Implementing | WorkflowState::Qa) {
            return CommandOutcome::new(
                CommandStatus::Blocked,
                state,
                format!("diff review is not available in state {state}"),
            );
        }

        let selection = match parse_selection(selection_raw) {
            Ok(selection) => selection,
            Err(err) => {
                return CommandOutcome::new(CommandStatus::Error, state, err.to_string());
            }
        };

        let mut diffs = self.core.pending_diffs.write().await;
        let Some(diff) = diffs.iter_mut().find(|d| d.has_pending_hunks()) else {
            return CommandOutcome::new(
                CommandStatus::NeedsInput,
                state,
                "no diff is awaiting review",
            );
        };

        match action {
            DiffAction::Approve => {
                match approve_hunks(diff, &selection, &self.core.bus, Actor::User) {
                    Ok(summary) => {
                        drop(diffs);
                        if state == WorkflowState::Implementing {
                            apply_transition(
                                &self.core.state,
                                &self.core.bus,
                                WorkflowState::Qa,
                                Some("diff applied"),
                                Actor::User,
                            )
                            .await;
                        }
                        CommandOutcome::new(
                            CommandStatus::Success,
                            self.core.state.read().await.state(),
                            format!(
                                "applied diff {} ({} approved, {} rejected, checksum {})",
                                summary.diff_id,
                                summary.approved,
                                summary.rejected,
                                summary.checksum
                            ),
                        )
                    }
                    Err(err) => CommandOutcome::new(CommandStatus::Error, state, err.to_string()),
                }
            }
            DiffAction::Reject => {
                match reject_hunks(diff, &selection, &self.core.bus, Actor::User) {
                    Ok(summary) => CommandOutcome::new(
                        CommandStatus::Success,
                        state,
                        format!(
                            "rejected {} hunk(s) on diff {}{}",
                            summary.rejected,
                            summary.diff_id,
                            if summary.terminal { "; diff closed" } else { "" }
                        ),
                    ),
                    Err(err) => CommandOutcome::new(CommandStatus::Error, state, err.to_string()),
                }
            }
        }
    }

    /// Bounded QA retry with structured feedback to the builder.
    pub async fn run_qa_with_reflexion(&self) -> anyhow::Result<ReflexionReport> {
        let _turn = self.core.turn_lock.lock().await;
        if !self.is_running() {
            anyhow::bail!("run is stopped");
        }
        {
            let state = self.core.state.read().await.state();
            if state == WorkflowState::Implementing {
                apply_transition(
                    &self.core.state,
                    &self.core.bus,
                    WorkflowState::Qa,
                    Some("qa requested"),
                    Actor::System,
                )
                .await;
            }
        }
        let state = self.core.state.read().await.state();
        if state != WorkflowState::Qa {
            anyhow::bail!("QA can only run from IMPLEMENTING or QA (current: {state})");
        }

        let max_attempts = self.core.options.max_reflexion_retries.max(1);
        for attempt in 1..=max_attempts {
            self.emit(
                Actor::QaAgent,
                EventType::TestRun,
                json!({"framework": "reflexion", "testPattern": format!("attempt-{attempt}")}),
            );

            let parse = self.qa_attempt().await;
            if parse.passed {
                self.emit(
                    Actor::QaAgent,
                    EventType::TestResult,
                    json!({"passed": 1, "failed": 0}),
                );
                apply_transition(
                    &self.core.state,
                    &self.core.bus,
                    WorkflowState::Review,
                    Some("qa passed"),
                    Actor::QaAgent,
                )
                .await;
                return Ok(ReflexionReport {
                    success: true,
                    attempts: attempt,
                });
            }

            self.emit(
                Actor::QaAgent,
                EventType::TestResult,
                json!({"passed": 0, "failed": 1}),
            );

            if attempt < max_attempts {
                let feedback = compose_feedback(&parse, attempt);
                self.append_message(Message::from_actor(
                    Actor::System,
                    MessageRole::System,
                    feedback.clone(),
                ))
                .await;
                self.builder_fix_attempt(&feedback).await;
            }
        }

        self.emit(
            Actor::System,
            EventType::Error,
            json!({
                "code": "REFLEXION_MAX_RETRIES",
                "message": format!("QA failed after {max_attempts} attempts"),
                "recoverable": false,
            }),
        );
        Ok(ReflexionReport {
            success: false,
            attempts: max_attempts,
        })
    }

    async fn qa_attempt(&self) -> QaParse {
        let Some(agent) = self.core.agents.get(AgentRole::Qa).await else {
            return QaParse {
                passed: false,
                failed_tests: Vec::new(),
                error_line: Some("no QA agent registered".to_string()),
            };
        };
        self.emit(
            Actor::QaAgent,
            EventType::AgentStart,
            json!({"agent": agent.name()}),
        );
        let ctx = self.agent_context(Actor::QaAgent).await;
        let reply = agent
            .run(&ctx, "Run the test suite and report the results.")
            .await;
        self.emit(
            Actor::QaAgent,
            EventType::AgentStop,
            json!({"agent": agent.name()}),
        );
        match reply {
            Ok(reply) => {
                self.append_message(Message::from_actor(
                    Actor::QaAgent,
                    MessageRole::Assistant,
                    reply.content.clone(),
                ))
                .await;
                parse_qa_output(&reply.content)
            }
            Err(err) => QaParse {
                passed: false,
                failed_tests: Vec::new(),
                error_line: Some(err.to_string()),
            },
        }
    }

    async fn builder_fix_attempt(&self, feedback: &str) {
        let Some(agent) = self.core.agents.get(AgentRole::Builder).await else {
            return;
        };
        self.emit(
            Actor::BuilderAgent,
            EventType::AgentStart,
            json!({"agent": agent.name()}),
        );
        let ctx = self.agent_context(Actor::BuilderAgent).await;
        match agent.run(&ctx, feedback).await {
            Ok(reply) => {
                self.append_message(Message::from_actor(
                    Actor::BuilderAgent,
                    MessageRole::Assistant,
                    reply.content.clone(),
                ))
                .await;
                for diff in reply.proposed_diffs {
                    self.register_diff_locked(diff, Actor::BuilderAgent).await;
                }
            }
            Err(err) => {
                self.emit(
                    Actor::BuilderAgent,
                    EventType::Error,
                    json!({
                        "code": "AGENT_FAILURE",
                        "message": err.to_string(),
                        "recoverable": true,
                    }),
                );
            }
        }
        self.emit(
            Actor::BuilderAgent,
            EventType::AgentStop,
            json!({"agent": agent.name()}),
        );
    }

    pub async fn create_checkpoint(
        &self,
        description: Option<String>,
    ) -> anyhow::Result<Checkpoint> {
        let _turn = self.core.turn_lock.lock().await;
        let state = self.core.state.read().await.state();
        let opaque = json!({
            "transcript": *self.core.transcript.read().await,
            "pendingDiffs": *self.core.pending_diffs.read().await,
        });
        let checkpoint = Checkpoint::new(self.core.run_id.clone(), state, opaque, description);
        self.core.store.save_checkpoint(checkpoint.clone()).await?;
        self.emit(
            Actor::System,
            EventType::CheckpointSaved,
            json!({"checkpointId": checkpoint.id, "state": state}),
        );
        Ok(checkpoint)
    }

    /// Rehydrates workflow state and the captured transcript/diffs. The
    /// only caller of `force_transition`.
    pub async fn restore_checkpoint(&self, checkpoint_id: &str) -> anyhow::Result<()> {
        let _turn = self.core.turn_lock.lock().await;
        let checkpoints = self.core.store.list_checkpoints(&self.core.run_id).await?;
        let Some(checkpoint) = checkpoints.into_iter().find(|c| c.id == checkpoint_id) else {
            anyhow::bail!("unknown checkpoint `{checkpoint_id}`");
        };

        self.core.state.write().await.force_transition(checkpoint.state);
        self.core.bus.set_state(checkpoint.state);
        if let Some(transcript) = checkpoint.opaque_data.get("transcript") {
            *self.core.transcript.write().await =
                serde_json::from_value(transcript.clone()).unwrap_or_default();
        }
        if let Some(diffs) = checkpoint.opaque_data.get("pendingDiffs") {
            *self.core.pending_diffs.write().await =
                serde_json::from_value(diffs.clone()).unwrap_or_default();
        }
        self.emit(
            Actor::System,
            EventType::CheckpointRestored,
            json!({"checkpointId": checkpoint.id, "state": checkpoint.state}),
        );
        Ok(())
    }

    /// `DONE → PRD_INTAKE`: reopen a completed run for a fresh intake.
    pub async fn reopen(&self) -> bool {
        let _turn = self.core.turn_lock.lock().await;
        apply_transition(
            &self.core.state,
            &self.core.bus,
            WorkflowState::PrdIntake,
            Some("run reopened"),
            Actor::User,
        )
        .await
    }

    /// `REVIEW → REFACTOR` on reviewer request.
    pub async fn advance_to_refactor(&self) -> bool {
        let _turn = self.core.turn_lock.lock().await;
        apply_transition(
            &self.core.state,
            &self.core.bus,
            WorkflowState::Refactor,
            Some("refactor requested"),
            Actor::User,
        )
        .await
    }

    /// Quota contract at the plan boundary. Without configured limits
    /// every check allows.
    pub fn resolve_quota(&self, usage: QuotaUsage, tokens_needed: u64) -> QuotaDecision {
        match &self.core.quota {
            Some(resolver) => resolver.check(usage, tokens_needed),
            None => QuotaDecision::allow(),
        }
    }

    /// Idempotent. Marks the run cancelled and cancels the run token;
    /// in-flight tool handlers are not forcibly aborted.
    pub async fn stop(&self, reason: &str) {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.core.cancellations.cancel(&self.core.run_id).await;
        {
            let mut run = self.core.run.write().await;
            run.status = RunStatus::Cancelled;
        }
        if let Err(err) = self
            .core
            .store
            .update_run_status(&self.core.run_id, RunStatus::Cancelled)
            .await
        {
            tracing::warn!(error = %err, "run status update failed on stop");
        }
        self.emit(
            Actor::System,
            EventType::TurnEnd,
            json!({"reason": reason, "stopped": true}),
        );
    }

    /// Roll back an applied diff. The entity goes terminal and leaves the
    /// pending list; callers revert the file through their write tools.
    pub async fn rollback_diff(&self, diff_id: &str) -> CommandOutcome {
        let _turn = self.core.turn_lock.lock().await;
        let state = self.core.state.read().await.state();
        let mut diffs = self.core.pending_diffs.write().await;
        let Some(position) = diffs.iter().position(|d| d.id == diff_id) else {
            return CommandOutcome::new(
                CommandStatus::Error,
                state,
                format!("unknown diff `{diff_id}`"),
            );
        };
        if diffs[position].status != cadence_types::DiffStatus::Applied {
            return CommandOutcome::new(
                CommandStatus::Blocked,
                state,
                format!("diff `{diff_id}` is not applied; nothing to roll back"),
            );
        }
        let mut diff = diffs.remove(position);
        diff.status = cadence_types::DiffStatus::RolledBack;
        self.emit(
            Actor::User,
            EventType::DiffRolledBack,
            json!({"diffId": diff.id, "filePath": diff.file_path}),
        );
        CommandOutcome::new(
            CommandStatus::Success,
            state,
            format!("rolled back diff {} on {}", diff.id, diff.file_path),
        )
    }

    pub fn session_id(&self) -> &str {
        &self.core.session_id
    }

    fn emit(&self, actor: Actor, event_type: EventType, payload: Value) {
        if let Err(err) = self
            .core
            .bus
            .emit(event_type, payload, EmitOptions::actor(actor))
        {
            tracing::warn!(error = %err, event = %event_type, "orchestrator emit failed");
        }
    }

    async fn append_message(&self, message: Message) {
        let snapshot = {
            let mut transcript = self.core.transcript.write().await;
            transcript.push(message);
            transcript.clone()
        };
        // Session persistence is a sink; failures never surface.
        let session = cadence_types::Session {
            id: self.core.session_id.clone(),
            run_id: self.core.run_id.clone(),
            title: self.core.run.read().await.project_id.clone(),
            transcript: snapshot,
            created_at: self.core.run.read().await.created_at,
            updated_at: chrono::Utc::now(),
        };
        if let Err(err) = self.core.store.save_session(session).await {
            tracing::warn!(error = %err, "session write-through failed");
        }
    }
}

/// `/plan approve|revise|ask|deny` — the only string-aware boundary for
/// explicit plan decisions.
pub fn parse_plan_command(text: &str) -> Option<Intent> {
    let mut tokens = text.trim().split_whitespace();
    if tokens.next()? != "/plan" {
        return None;
    }
    match tokens.next()? {
        "approve" => Some(Intent::Approve),
        "revise" => Some(Intent::Revise),
        "ask" => Some(Intent::Ask),
        "deny" => Some(Intent::Deny),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_commands_parse_only_known_decisions() {
        assert_eq!(parse_plan_command("/plan approve"), Some(Intent::Approve));
        assert_eq!(parse_plan_command("  /plan deny  "), Some(Intent::Deny));
        assert_eq!(parse_plan_command("/plan maybe"), None);
        assert_eq!(parse_plan_command("approve"), None);
        assert_eq!(parse_plan_command("/plan"), None);
    }
}
