use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use cadence_types::{ToolDefinition, ToolOperation, ToolOutcome};

/// Contract every handler satisfies. Handlers surface failures through
/// `ToolOutcome`; a returned `Err` is treated by the pipeline as a thrown
/// handler and captured, never propagated.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutcome>;
    async fn execute_with_cancel(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutcome> {
        self.execute(args).await
    }
}

/// Name-keyed tool set. Registered once per orchestrator; duplicate names
/// are refused so the set stays read-only in practice after setup.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registry preloaded with the builtin filesystem and shell handlers.
    pub async fn with_builtins() -> Self {
        let registry = Self::new();
        for tool in builtin_tools() {
            // Builtin names never collide.
            let _ = registry.register(tool).await;
        }
        registry
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) -> anyhow::Result<()> {
        let definition = tool.definition();
        validate_tool_definition(&definition)?;
        let mut tools = self.tools.write().await;
        if tools.contains_key(&definition.name) {
            anyhow::bail!("tool `{}` is already registered", definition.name);
        }
        tracing::debug!(tool = %definition.name, "tool registered");
        tools.insert(definition.name, tool);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<ToolDefinition> {
        let mut definitions = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.definition())
            .collect::<Vec<_>>();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDefinitionError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolDefinitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool definition `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolDefinitionError {}

pub fn validate_tool_definition(definition: &ToolDefinition) -> Result<(), ToolDefinitionError> {
    if definition.name.trim().is_empty() {
        return Err(ToolDefinitionError {
            tool_name: definition.name.clone(),
            path: "$".to_string(),
            reason: "tool name is empty".to_string(),
        });
    }
    validate_schema_node(&definition.name, "$", &definition.parameters)
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolDefinitionError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolDefinitionError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    if let Some(additional) = obj.get("additionalProperties") {
        validate_schema_node(tool_name, &format!("{path}.additionalProperties"), additional)?;
    }
    for keyword in ["oneOf", "anyOf", "allOf"] {
        if let Some(children) = obj.get(keyword).and_then(|v| v.as_array()) {
            for (idx, child) in children.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}.{keyword}[{idx}]"), child)?;
            }
        }
    }

    Ok(())
}

fn builtin_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(FsReadTool),
        Arc::new(FsWriteTool),
        Arc::new(FsListTool),
        Arc::new(ExecShellTool),
    ]
}

fn is_path_allowed(path: &str) -> bool {
    let raw = Path::new(path);
    if raw.is_absolute() {
        return false;
    }
    !raw.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
}

struct FsReadTool;

#[async_trait]
impl Tool for FsReadTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fs_read".to_string(),
            description: "Read file contents".to_string(),
            parameters: json!({"type":"object","properties":{"path":{"type":"string"}}}),
            operation: Some(ToolOperation::Read),
            requires_approval: false,
            allow_in_fast_mode: true,
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutcome> {
        let path = args["path"].as_str().unwrap_or("");
        if !is_path_allowed(path) {
            return Ok(ToolOutcome::failed("path denied by workspace sandbox"));
        }
        match fs::read_to_string(path).await {
            Ok(data) => Ok(ToolOutcome::ok(json!({"content": data}))),
            Err(err) => Ok(ToolOutcome::failed(format!("read {path}: {err}"))),
        }
    }
}

struct FsWriteTool;

#[async_trait]
impl Tool for FsWriteTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fs_write".to_string(),
            description: "Write file contents".to_string(),
            parameters: json!({
                "type":"object",
                "properties":{"path":{"type":"string"},"content":{"type":"string"}}
            }),
            operation: Some(ToolOperation::Write),
            requires_approval: false,
            allow_in_fast_mode: false,
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutcome> {
        let path = args["path"].as_str().unwrap_or("");
        let content = args["content"].as_str().unwrap_or("");
        if !is_path_allowed(path) {
            return Ok(ToolOutcome::failed("path denied by workspace sandbox"));
        }
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, content).await?;
        Ok(ToolOutcome::ok(json!({"bytesWritten": content.len()})))
    }
}

struct FsListTool;

#[async_trait]
impl Tool for FsListTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "fs_list".to_string(),
            description: "List directory entries".to_string(),
            parameters: json!({"type":"object","properties":{"path":{"type":"string"}}}),
            operation: Some(ToolOperation::Read),
            requires_approval: false,
            allow_in_fast_mode: true,
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutcome> {
        let path = args["path"].as_str().unwrap_or(".");
        if !is_path_allowed(path) {
            return Ok(ToolOutcome::failed("path denied by workspace sandbox"));
        }
        let mut entries = match fs::read_dir(path).await {
            Ok(rd) => rd,
            Err(err) => return Ok(ToolOutcome::failed(format!("list {path}: {err}"))),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(ToolOutcome::ok(json!({"entries": names})))
    }
}

struct ExecShellTool;

#[async_trait]
impl Tool for ExecShellTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "exec_shell".to_string(),
            description: "Run a shell command in the workspace".to_string(),
            parameters: json!({
                "type":"object",
                "properties":{"command":{"type":"string"},"env":{"type":"object"}}
            }),
            operation: Some(ToolOperation::Exec),
            requires_approval: false,
            allow_in_fast_mode: false,
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolOutcome> {
        self.execute_with_cancel(args, CancellationToken::new())
            .await
    }

    async fn execute_with_cancel(
        &self,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutcome> {
        let cmd = args["command"].as_str().unwrap_or("");
        let mut command = Command::new("sh");
        command.args(["-c", cmd]);
        if let Some(env) = args.get("env").and_then(|v| v.as_object()) {
            for (k, v) in env {
                if let Some(value) = v.as_str() {
                    command.env(k, value);
                }
            }
        }
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        let mut child = command.spawn()?;
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Ok(ToolOutcome {
                    success: false,
                    data: None,
                    error: Some("command cancelled".to_string()),
                    metadata: json!({"cancelled": true}),
                });
            }
            result = child.wait() => result?
        };
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        if let Some(mut out) = child.stdout.take() {
            out.read_to_end(&mut stdout_buf).await?;
        }
        if let Some(mut err) = child.stderr.take() {
            err.read_to_end(&mut stderr_buf).await?;
        }
        let stdout = String::from_utf8_lossy(&stdout_buf).to_string();
        let stderr = String::from_utf8_lossy(&stderr_buf).to_string();
        Ok(ToolOutcome {
            success: status.success(),
            data: Some(json!({"stdout": stdout, "exitCode": status.code()})),
            error: if status.success() {
                None
            } else {
                Some(format!("command exited: {}", status))
            },
            metadata: json!({"stderr": stderr}),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_refuses_duplicate_names() {
        let registry = ToolRegistry::with_builtins().await;
        let err = registry.register(Arc::new(FsReadTool)).await.unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn list_is_sorted_by_name() {
        let registry = ToolRegistry::with_builtins().await;
        let names = registry
            .list()
            .await
            .into_iter()
            .map(|d| d.name)
            .collect::<Vec<_>>();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"exec_shell".to_string()));
    }

    #[tokio::test]
    async fn validation_rejects_array_without_items() {
        let definition = ToolDefinition {
            name: "broken".to_string(),
            description: "array schema missing items".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"values": {"type": "array"}}
            }),
            operation: Some(ToolOperation::Read),
            requires_approval: false,
            allow_in_fast_mode: false,
        };
        let err = validate_tool_definition(&definition).unwrap_err();
        assert_eq!(err.path, "$.properties.values");
    }

    #[tokio::test]
    async fn fs_tools_reject_absolute_and_parent_paths() {
        let registry = ToolRegistry::with_builtins().await;
        let read = registry.get("fs_read").await.unwrap();
        let denied = read.execute(json!({"path": "/etc/passwd"})).await.unwrap();
        assert!(!denied.success);
        let denied = read.execute(json!({"path": "../outside"})).await.unwrap();
        assert!(!denied.success);
    }

    #[tokio::test]
    async fn exec_shell_captures_stdout() {
        let tool = ExecShellTool;
        let outcome = tool.execute(json!({"command": "echo hello"})).await.unwrap();
        assert!(outcome.success);
        let stdout = outcome.data.unwrap()["stdout"].as_str().unwrap().to_string();
        assert!(stdout.contains("hello"));
    }

    #[tokio::test]
    async fn fs_write_round_trips_within_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let write = FsWriteTool;
        let outcome = write
            .execute(json!({"path": "notes/a.txt", "content": "x"}))
            .await
            .unwrap();
        assert!(outcome.success);

        let read = FsReadTool;
        let outcome = read.execute(json!({"path": "notes/a.txt"})).await.unwrap();
        assert_eq!(outcome.data.unwrap()["content"], "x");

        std::env::set_current_dir(prev).unwrap();
    }
}
