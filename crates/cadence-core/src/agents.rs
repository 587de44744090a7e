use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use cadence_providers::{ChatMessage, GatewayConfig, GatewayRegistry};
use cadence_tools::ToolRegistry;
use cadence_types::{
    Actor, Diff, EventEnvelope, EventType, Message, MessageRole, ToolExecutionContext,
    ToolExecutionResult, ToolOperation, ToolStatus, WorkflowState,
};

use crate::config::RuntimeOptions;
use crate::event_bus::{EmitOptions, EventBus};
use crate::pipeline::ToolPipeline;
use crate::state_machine::StateMachine;

/// The five workflow roles an orchestrator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Plan,
    Builder,
    Qa,
    Review,
    Refactor,
}

impl AgentRole {
    pub fn actor(self) -> Actor {
        match self {
            AgentRole::Plan => Actor::PlanAgent,
            AgentRole::Builder => Actor::BuilderAgent,
            AgentRole::Qa => Actor::QaAgent,
            AgentRole::Review => Actor::ReviewAgent,
            AgentRole::Refactor => Actor::RefactorAgent,
        }
    }

    /// Which role answers input in a given state. `DONE` routes to no
    /// agent; the run must be reopened first.
    pub fn for_state(state: WorkflowState) -> Option<AgentRole> {
        match state {
            WorkflowState::PrdIntake
            | WorkflowState::PrdClarifying
            | WorkflowState::PlanDrafted
            | WorkflowState::AwaitingPlanConfirmation => Some(AgentRole::Plan),
            WorkflowState::Implementing => Some(AgentRole::Builder),
            WorkflowState::Qa => Some(AgentRole::Qa),
            WorkflowState::Review => Some(AgentRole::Review),
            WorkflowState::Refactor => Some(AgentRole::Refactor),
            WorkflowState::Done => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentReply {
    pub content: String,
    pub proposed_diffs: Vec<Diff>,
}

impl AgentReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            proposed_diffs: Vec::new(),
        }
    }
}

/// Execution surface handed to an agent for one step. Carries bound
/// `emit`, `execute_tool`, and `transition`; agents never hold the bus or
/// the state machine directly.
pub struct AgentContext {
    actor: Actor,
    state: Arc<RwLock<StateMachine>>,
    bus: EventBus,
    pipeline: ToolPipeline,
    tools: ToolRegistry,
    transcript: Vec<Message>,
    options: RuntimeOptions,
    working_directory: String,
    cancel: CancellationToken,
}

impl AgentContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        actor: Actor,
        state: Arc<RwLock<StateMachine>>,
        bus: EventBus,
        pipeline: ToolPipeline,
        tools: ToolRegistry,
        transcript: Vec<Message>,
        options: RuntimeOptions,
        working_directory: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            actor,
            state,
            bus,
            pipeline,
            tools,
            transcript,
            options,
            working_directory,
            cancel,
        }
    }

    pub fn actor(&self) -> Actor {
        self.actor
    }

    /// Read-only view of the transcript at step start.
    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn working_directory(&self) -> &str {
        &self.working_directory
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn current_state(&self) -> WorkflowState {
        self.state.read().await.state()
    }

    pub fn emit(&self, event_type: EventType, payload: Value) -> anyhow::Result<EventEnvelope> {
        self.bus
            .emit(event_type, payload, EmitOptions::actor(self.actor))
    }

    /// Tool execution bound to this agent's actor and the run's approval
    /// mode. Unknown tools resolve to an error result, never a panic.
    pub async fn execute_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        user_approved: bool,
    ) -> ToolExecutionResult {
        let Some(tool) = self.tools.get(tool_name).await else {
            return unknown_tool_result(tool_name);
        };
        let definition = tool.definition();
        let inferred = if definition.operation.is_none() {
            let inferred = infer_operation(tool_name);
            if inferred.is_some() {
                self.warn_operation_inference(tool_name, inferred);
            }
            inferred
        } else {
            None
        };
        let ctx = ToolExecutionContext {
            state: self.current_state().await,
            approval_mode: self.options.approval_mode,
            working_directory: self.working_directory.clone(),
            user_approved,
            operation: inferred,
        };
        self.pipeline
            .execute(tool, arguments, &ctx, self.actor, self.cancel.clone())
            .await
    }

    pub async fn transition(&self, target: WorkflowState, reason: Option<&str>) -> bool {
        crate::orchestrator::apply_transition(&self.state, &self.bus, target, reason, self.actor)
            .await
    }

    fn warn_operation_inference(&self, tool_name: &str, inferred: Option<ToolOperation>) {
        let operation = inferred.map(|op| op.as_str()).unwrap_or("exec");
        let _ = self.bus.emit(
            EventType::PolicyWarn,
            json!({
                "rule": "operation-inference",
                "message": format!(
                    "tool `{tool_name}` declares no operation; inferred `{operation}` from its name"
                ),
                "action": format!("{operation}:{tool_name}"),
            }),
            EmitOptions::actor(self.actor),
        );
    }
}

pub(crate) fn unknown_tool_result(tool_name: &str) -> ToolExecutionResult {
    ToolExecutionResult {
        status: ToolStatus::Error,
        tool_name: tool_name.to_string(),
        message: format!("tool `{tool_name}` is not registered"),
        policy: cadence_types::PolicyOutcome {
            decision: cadence_types::PolicyDecision::Block,
            reason: "unknown tool".to_string(),
        },
        result: None,
    }
}

/// Loose name-based operation inference kept for tools that predate the
/// explicit `operation` field. New tools should declare it.
pub fn infer_operation(tool_name: &str) -> Option<ToolOperation> {
    let name = tool_name.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| name.contains(n));
    if has(&["read", "list", "search"]) {
        return Some(ToolOperation::Read);
    }
    if has(&["delete", "remove"]) {
        return Some(ToolOperation::Delete);
    }
    if has(&["exec", "run", "test", "lint"]) {
        return Some(ToolOperation::Exec);
    }
    if has(&["write", "patch", "apply", "format"]) {
        return Some(ToolOperation::Write);
    }
    None
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;
    fn role(&self) -> AgentRole;
    async fn run(&self, ctx: &AgentContext, input: &str) -> anyhow::Result<AgentReply>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub role: AgentRole,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AgentFrontmatter {
    name: Option<String>,
    role: AgentRole,
    hidden: Option<bool>,
}

pub fn default_definitions() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition {
            name: "plan".to_string(),
            role: AgentRole::Plan,
            hidden: false,
            system_prompt: Some(
                "You are a planning-focused engineering agent. Turn the product brief into \
a milestone plan with explicit acceptance criteria. When details are missing, ask targeted \
clarification questions instead of guessing."
                    .to_string(),
            ),
        },
        AgentDefinition {
            name: "builder".to_string(),
            role: AgentRole::Builder,
            hidden: false,
            system_prompt: Some(
                "You are a build-focused engineering agent. Prefer concrete implementation. \
Propose edits as reviewable diffs and keep each change scoped to one concern."
                    .to_string(),
            ),
        },
        AgentDefinition {
            name: "qa".to_string(),
            role: AgentRole::Qa,
            hidden: false,
            system_prompt: Some(
                "You are a QA agent. Run the test suite, report pass/fail with the failing \
test names and the first error line. Do not propose fixes yourself."
                    .to_string(),
            ),
        },
        AgentDefinition {
            name: "review".to_string(),
            role: AgentRole::Review,
            hidden: false,
            system_prompt: Some(
                "You are a code review agent. Read the applied changes and flag correctness \
risks before style concerns."
                    .to_string(),
            ),
        },
        AgentDefinition {
            name: "refactor".to_string(),
            role: AgentRole::Refactor,
            hidden: false,
            system_prompt: Some(
                "You are a refactoring agent. Simplify the implementation without changing \
observable behavior; the test suite is the contract."
                    .to_string(),
            ),
        },
    ]
}

/// Custom definitions live in `.cadence/agents/*.md` with YAML
/// frontmatter; the body becomes the system prompt.
pub async fn load_custom_definitions(dir: impl Into<PathBuf>) -> anyhow::Result<Vec<AgentDefinition>> {
    let dir: PathBuf = dir.into();
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(err) => return Err(err.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|v| v.to_str()) else {
            continue;
        };
        if ext != "md" {
            continue;
        }
        let raw = fs::read_to_string(&path).await?;
        if let Some(definition) = parse_agent_markdown(&raw, &path) {
            out.push(definition);
        }
    }

    Ok(out)
}

fn parse_agent_markdown(raw: &str, path: &Path) -> Option<AgentDefinition> {
    let trimmed = raw.trim_start();
    if !trimmed.starts_with("---") {
        return None;
    }
    let mut parts = trimmed.splitn(3, "---");
    let _ = parts.next();
    let frontmatter = parts.next()?.trim();
    let body = parts.next()?.trim().to_string();
    let parsed: AgentFrontmatter = serde_yaml::from_str(frontmatter).ok()?;
    let default_name = path.file_stem()?.to_string_lossy().to_string();
    Some(AgentDefinition {
        name: parsed.name.unwrap_or(default_name),
        role: parsed.role,
        hidden: parsed.hidden.unwrap_or(false),
        system_prompt: if body.is_empty() { None } else { Some(body) },
    })
}

/// Role-keyed agent set owned by one orchestrator.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<AgentRole, Arc<dyn Agent>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All five roles backed by the model gateway registry.
    pub async fn model_backed(gateways: GatewayRegistry) -> Self {
        let registry = Self::new();
        for definition in default_definitions() {
            registry
                .register(Arc::new(ModelBackedAgent::new(definition, gateways.clone())))
                .await;
        }
        registry
    }

    pub async fn register(&self, agent: Arc<dyn Agent>) {
        self.agents.write().await.insert(agent.role(), agent);
    }

    pub async fn get(&self, role: AgentRole) -> Option<Arc<dyn Agent>> {
        self.agents.read().await.get(&role).cloned()
    }
}

/// Default agent implementation: one gateway round-trip per step, with
/// `model.call`/`model.result` emitted around it.
pub struct ModelBackedAgent {
    definition: AgentDefinition,
    gateways: GatewayRegistry,
    gateway_id: Option<String>,
}

impl ModelBackedAgent {
    pub fn new(definition: AgentDefinition, gateways: GatewayRegistry) -> Self {
        Self {
            definition,
            gateways,
            gateway_id: None,
        }
    }

    pub fn with_gateway(mut self, gateway_id: impl Into<String>) -> Self {
        self.gateway_id = Some(gateway_id.into());
        self
    }

    fn messages_for(&self, ctx: &AgentContext, input: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(ctx.transcript().len() + 2);
        if let Some(system) = &self.definition.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        for message in ctx.transcript() {
            let role = match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::System => "system",
            };
            messages.push(ChatMessage {
                role: role.to_string(),
                content: message.content.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: input.to_string(),
        });
        messages
    }
}

#[async_trait]
impl Agent for ModelBackedAgent {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn role(&self) -> AgentRole {
        self.definition.role
    }

    async fn run(&self, ctx: &AgentContext, input: &str) -> anyhow::Result<AgentReply> {
        let messages = self.messages_for(ctx, input);
        let tools = ctx.tools.list().await;
        ctx.emit(
            EventType::ModelCall,
            json!({
                "agent": self.definition.name,
                "gateway": self.gateway_id,
                "messages": messages.len(),
            }),
        )?;
        let routed = self
            .gateways
            .call_with_fallback(self.gateway_id.as_deref(), messages, tools, GatewayConfig::default())
            .await?;
        ctx.emit(
            EventType::ModelResult,
            json!({
                "agent": self.definition.name,
                "gateway": routed.gateway_id,
                "reroutedFrom": routed.rerouted_from,
                "finishReason": routed.response.finish_reason,
                "latencyMs": routed.response.latency_ms,
                "tokenUsage": routed.response.token_usage,
            }),
        )?;
        Ok(AgentReply::text(routed.response.content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_inference_follows_the_documented_order() {
        assert_eq!(infer_operation("fs_read"), Some(ToolOperation::Read));
        assert_eq!(infer_operation("code_search"), Some(ToolOperation::Read));
        assert_eq!(infer_operation("remove_file"), Some(ToolOperation::Delete));
        assert_eq!(infer_operation("run_lint"), Some(ToolOperation::Exec));
        assert_eq!(infer_operation("apply_patch"), Some(ToolOperation::Write));
        assert_eq!(infer_operation("mystery"), None);
        // `read` outranks `write` when both substrings appear.
        assert_eq!(infer_operation("read_write"), Some(ToolOperation::Read));
    }

    #[test]
    fn roles_cover_every_non_terminal_state() {
        assert_eq!(AgentRole::for_state(WorkflowState::PrdIntake), Some(AgentRole::Plan));
        assert_eq!(AgentRole::for_state(WorkflowState::Implementing), Some(AgentRole::Builder));
        assert_eq!(AgentRole::for_state(WorkflowState::Qa), Some(AgentRole::Qa));
        assert_eq!(AgentRole::for_state(WorkflowState::Review), Some(AgentRole::Review));
        assert_eq!(AgentRole::for_state(WorkflowState::Refactor), Some(AgentRole::Refactor));
        assert_eq!(AgentRole::for_state(WorkflowState::Done), None);
    }

    #[test]
    fn markdown_definitions_parse_frontmatter_and_body() {
        let raw = "---\nname: security-review\nrole: review\nhidden: true\n---\nFlag injection risks first.";
        let definition = parse_agent_markdown(raw, Path::new("security-review.md")).unwrap();
        assert_eq!(definition.name, "security-review");
        assert_eq!(definition.role, AgentRole::Review);
        assert!(definition.hidden);
        assert_eq!(
            definition.system_prompt.as_deref(),
            Some("Flag injection risks first.")
        );
    }

    #[test]
    fn markdown_without_frontmatter_is_skipped() {
        assert!(parse_agent_markdown("just prose", Path::new("x.md")).is_none());
    }

    #[tokio::test]
    async fn custom_definitions_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("strict-qa.md"),
            "---\nrole: qa\n---\nTreat warnings as failures.",
        )
        .await
        .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();

        let definitions = load_custom_definitions(dir.path()).await.unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name, "strict-qa");
        assert_eq!(definitions[0].role, AgentRole::Qa);
    }

    #[tokio::test]
    async fn model_backed_agent_emits_call_and_result_events() {
        use crate::event_bus::EventBus;
        use crate::pipeline::ToolPipeline;
        use cadence_providers::{ModelGateway, ModelResponse, TokenUsage};

        struct CannedGateway;

        #[async_trait]
        impl ModelGateway for CannedGateway {
            fn id(&self) -> &str {
                "canned"
            }
            async fn call(
                &self,
                _messages: Vec<ChatMessage>,
                _tools: Vec<cadence_types::ToolDefinition>,
                _config: GatewayConfig,
            ) -> anyhow::Result<ModelResponse> {
                Ok(ModelResponse {
                    content: "milestone plan".to_string(),
                    tool_calls: Vec::new(),
                    token_usage: TokenUsage::default(),
                    finish_reason: "stop".to_string(),
                    latency_ms: 1,
                })
            }
        }

        let gateways = GatewayRegistry::new();
        gateways.register(Arc::new(CannedGateway)).await;
        let agent = ModelBackedAgent::new(
            default_definitions().remove(0),
            gateways,
        );

        let bus = EventBus::new("run-t", WorkflowState::PrdIntake);
        let ctx = AgentContext::new(
            Actor::PlanAgent,
            Arc::new(RwLock::new(crate::state_machine::StateMachine::new())),
            bus.clone(),
            ToolPipeline::new(bus.clone()),
            cadence_tools::ToolRegistry::new(),
            Vec::new(),
            crate::config::RuntimeOptions::default(),
            ".".to_string(),
            CancellationToken::new(),
        );

        let reply = agent.run(&ctx, "Build a todo app.").await.unwrap();
        assert_eq!(reply.content, "milestone plan");
        assert_eq!(bus.events_of_type(EventType::ModelCall).len(), 1);
        assert_eq!(bus.events_of_type(EventType::ModelResult).len(), 1);
    }

    #[test]
    fn default_definitions_cover_all_roles() {
        let definitions = default_definitions();
        for role in [
            AgentRole::Plan,
            AgentRole::Builder,
            AgentRole::Qa,
            AgentRole::Review,
            AgentRole::Refactor,
        ] {
            assert!(definitions.iter().any(|d| d.role == role));
        }
    }
}
