use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use cadence_tools::Tool;
use cadence_types::{
    Actor, ApprovalMode, EventType, PolicyDecision, PolicyEventPayload, PolicyOutcome,
    ToolCallPayload, ToolExecutionContext, ToolExecutionResult, ToolOperation, ToolResultPayload,
    ToolStatus,
};

use crate::event_bus::{EmitOptions, EventBus};
use crate::redaction::RedactionPolicy;
use crate::state_machine::operation_allowed;

/// Exec arguments matching any of these are refused outright.
pub struct DangerousCommandPolicy {
    patterns: Vec<(String, Regex)>,
}

impl DangerousCommandPolicy {
    pub fn standard() -> Self {
        let mut policy = Self {
            patterns: Vec::new(),
        };
        for raw in [
            r"rm\s+-[a-z]*r[a-z]*f[a-z]*\s+/",
            r"\bsudo\b",
            r"curl[^|]*\|\s*(bash|sh)\b",
            r"wget[^|]*\|\s*(bash|sh)\b",
            r"\bmkfs\b",
            r"\bdd\s+if=.*of=/dev/",
        ] {
            policy.add_pattern(raw).expect("builtin dangerous pattern");
        }
        policy
    }

    pub fn add_pattern(&mut self, raw: &str) -> anyhow::Result<()> {
        let compiled = Regex::new(raw)?;
        self.patterns.push((raw.to_string(), compiled));
        Ok(())
    }

    /// First matching pattern, scanning every string value in the
    /// argument record.
    pub fn matched_pattern(&self, args: &Value) -> Option<&str> {
        let mut found = None;
        visit_strings(args, &mut |text| {
            if found.is_none() {
                found = self
                    .patterns
                    .iter()
                    .find(|(_, regex)| regex.is_match(text))
                    .map(|(raw, _)| raw.as_str());
            }
        });
        found
    }
}

fn visit_strings<'a>(value: &'a Value, visit: &mut impl FnMut(&'a str)) {
    match value {
        Value::String(text) => visit(text),
        Value::Array(items) => items.iter().for_each(|item| visit_strings(item, visit)),
        Value::Object(map) => map.values().for_each(|child| visit_strings(child, visit)),
        _ => {}
    }
}

/// Exec commands that skip approval in fast mode.
pub struct FastAllowList {
    prefixes: Vec<&'static str>,
}

impl FastAllowList {
    pub fn standard() -> Self {
        Self {
            prefixes: vec![
                "npm test",
                "npm run test",
                "pnpm test",
                "pnpm run test",
                "yarn test",
                "yarn run test",
                "git status",
                "git diff",
                "git log",
                "ls",
                "dir",
                "pwd",
                "echo",
            ],
        }
    }

    pub fn allows(&self, args: &Value) -> bool {
        let Some(command) = args.get("command").and_then(|v| v.as_str()) else {
            return false;
        };
        let trimmed = command.trim();
        self.prefixes.iter().any(|prefix| trimmed.starts_with(prefix))
    }
}

enum GateDecision {
    Allow,
    Block { rule: String, reason: String },
    NeedsApproval { reason: String },
}

/// Mediates every tool invocation through the four gates and emits the
/// prescribed event sequence. Never propagates handler failures.
#[derive(Clone)]
pub struct ToolPipeline {
    bus: EventBus,
    dangerous: Arc<DangerousCommandPolicy>,
    fast_allow: Arc<FastAllowList>,
}

impl ToolPipeline {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            dangerous: Arc::new(DangerousCommandPolicy::standard()),
            fast_allow: Arc::new(FastAllowList::standard()),
        }
    }

    pub fn with_dangerous_policy(mut self, policy: DangerousCommandPolicy) -> Self {
        self.dangerous = Arc::new(policy);
        self
    }

    pub async fn execute(
        &self,
        tool: Arc<dyn Tool>,
        args: Value,
        ctx: &ToolExecutionContext,
        actor: Actor,
        cancel: CancellationToken,
    ) -> ToolExecutionResult {
        let definition = tool.definition();
        let operation = definition
            .operation
            .or(ctx.operation)
            .unwrap_or(ToolOperation::Exec);
        let decision = self.evaluate_gates(&definition.name, operation, &definition, &args, ctx);

        // One correlation id threads tool.call, policy.*, and tool.result.
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let requires_approval = definition.requires_approval
            || matches!(&decision, GateDecision::NeedsApproval { .. });
        self.emit(
            EventType::ToolCall,
            serde_json::to_value(ToolCallPayload {
                tool_name: definition.name.clone(),
                arguments: args.clone(),
                requires_approval,
            })
            .unwrap_or_else(|_| json!({})),
            actor,
            &correlation_id,
        );

        match decision {
            GateDecision::Block { rule, reason } => {
                self.emit(
                    EventType::PolicyBlock,
                    serde_json::to_value(PolicyEventPayload {
                        rule,
                        message: reason.clone(),
                        action: format!("{}:{}", operation.as_str(), definition.name),
                    })
                    .unwrap_or_else(|_| json!({})),
                    actor,
                    &correlation_id,
                );
                self.emit_result(&definition.name, false, Some(reason.clone()), 0, actor, &correlation_id);
                ToolExecutionResult {
                    status: ToolStatus::Blocked,
                    tool_name: definition.name,
                    message: reason.clone(),
                    policy: PolicyOutcome {
                        decision: PolicyDecision::Block,
                        reason,
                    },
                    result: None,
                }
            }
            GateDecision::NeedsApproval { reason } => {
                self.emit_result(&definition.name, false, Some(reason.clone()), 0, actor, &correlation_id);
                ToolExecutionResult {
                    status: ToolStatus::NeedsInput,
                    tool_name: definition.name,
                    message: reason.clone(),
                    policy: PolicyOutcome {
                        decision: PolicyDecision::NeedsApproval,
                        reason,
                    },
                    result: None,
                }
            }
            GateDecision::Allow => {
                let started = Instant::now();
                let handler = {
                    let tool = tool.clone();
                    let args = args.clone();
                    tokio::spawn(async move { tool.execute_with_cancel(args, cancel).await })
                };
                let outcome = match handler.await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(err)) => cadence_types::ToolOutcome::failed(err.to_string()),
                    Err(join_err) => cadence_types::ToolOutcome::failed(format!(
                        "tool handler aborted: {join_err}"
                    )),
                };
                let duration_ms = started.elapsed().as_millis() as u64;
                self.emit_result(
                    &definition.name,
                    outcome.success,
                    outcome.error.clone(),
                    duration_ms,
                    actor,
                    &correlation_id,
                );
                let (status, message) = if outcome.success {
                    (
                        ToolStatus::Success,
                        format!("tool `{}` completed", definition.name),
                    )
                } else {
                    (
                        ToolStatus::Error,
                        outcome
                            .error
                            .clone()
                            .unwrap_or_else(|| "tool handler failed".to_string()),
                    )
                };
                ToolExecutionResult {
                    status,
                    tool_name: definition.name,
                    message,
                    policy: PolicyOutcome {
                        decision: PolicyDecision::Allow,
                        reason: "allowed".to_string(),
                    },
                    result: Some(outcome),
                }
            }
        }
    }

    fn evaluate_gates(
        &self,
        tool_name: &str,
        operation: ToolOperation,
        definition: &cadence_types::ToolDefinition,
        args: &Value,
        ctx: &ToolExecutionContext,
    ) -> GateDecision {
        // Gate 1: state authority.
        if !operation_allowed(ctx.state, operation) {
            return GateDecision::Block {
                rule: "state-authority".to_string(),
                reason: format!(
                    "{} operations are not permitted in state {}",
                    operation.as_str(),
                    ctx.state
                ),
            };
        }

        // Gate 2: dangerous exec patterns.
        if operation == ToolOperation::Exec {
            if let Some(pattern) = self.dangerous.matched_pattern(args) {
                return GateDecision::Block {
                    rule: "dangerous-command".to_string(),
                    reason: format!("command matches blocked pattern `{pattern}`"),
                };
            }
        }

        // Gate 3: guardian, sensitive data never flows into mutations.
        if operation != ToolOperation::Read
            && RedactionPolicy::standard().contains_sensitive(args)
        {
            return GateDecision::Block {
                rule: "guardian-sensitive-data".to_string(),
                reason: format!(
                    "arguments to `{tool_name}` contain sensitive material"
                ),
            };
        }

        // Gate 4: approval requirement by mode.
        let mode_requires = match ctx.approval_mode {
            ApprovalMode::Strict => operation != ToolOperation::Read,
            ApprovalMode::Balanced => matches!(
                operation,
                ToolOperation::Write | ToolOperation::Delete | ToolOperation::Exec
            ),
            ApprovalMode::Fast => {
                operation == ToolOperation::Exec
                    && !definition.allow_in_fast_mode
                    && !self.fast_allow.allows(args)
            }
        };
        let required = mode_requires || definition.requires_approval;
        if required && !ctx.user_approved {
            return GateDecision::NeedsApproval {
                reason: format!(
                    "tool `{tool_name}` requires approval for {} operations in {:?} mode",
                    operation.as_str(),
                    ctx.approval_mode
                ),
            };
        }

        GateDecision::Allow
    }

    fn emit(&self, event_type: EventType, payload: Value, actor: Actor, correlation_id: &str) {
        if let Err(err) = self.bus.emit(
            event_type,
            payload,
            EmitOptions::correlated(actor, correlation_id),
        ) {
            tracing::warn!(error = %err, event = %event_type, "pipeline emit failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_result(
        &self,
        tool_name: &str,
        success: bool,
        error: Option<String>,
        duration_ms: u64,
        actor: Actor,
        correlation_id: &str,
    ) {
        self.emit(
            EventType::ToolResult,
            serde_json::to_value(ToolResultPayload {
                tool_name: tool_name.to_string(),
                success,
                error,
                duration_ms,
            })
            .unwrap_or_else(|_| json!({})),
            actor,
            correlation_id,
        );
    }
}
