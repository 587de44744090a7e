use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use cadence_types::{ApprovalMode, ConflictPolicy, HardLimitBehavior};

/// Recognized options consumed by the core. Everything else in the merged
/// document is preserved but ignored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeOptions {
    pub approval_mode: ApprovalMode,
    pub max_reflexion_retries: u32,
    pub approve_threshold: f64,
    pub confirm_threshold: f64,
    pub conflict_policy: ConflictPolicy,
    pub hard_limit_behavior: HardLimitBehavior,
    pub queue_eta_minutes: u64,
    pub soft_limit_percent: u8,
    pub persist_events: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            approval_mode: ApprovalMode::Balanced,
            max_reflexion_retries: 3,
            approve_threshold: 0.85,
            confirm_threshold: 0.60,
            conflict_policy: ConflictPolicy::DenyOverApprove,
            hard_limit_behavior: HardLimitBehavior::Block,
            queue_eta_minutes: 5,
            soft_limit_percent: 80,
            persist_events: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
}

/// Global file → project file → environment → runtime overrides,
/// deep-merged in that order.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn load(project_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let global = match global_config_path() {
            Some(path) => read_json_file(&path).await.unwrap_or_else(|_| empty_object()),
            None => empty_object(),
        };
        let project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());

        Ok(Self {
            project_path,
            layers: Arc::new(RwLock::new(ConfigLayers {
                global,
                project,
                env: env_layer(),
                runtime: empty_object(),
            })),
        })
    }

    pub fn in_memory(project: Value) -> Self {
        Self {
            project_path: PathBuf::from("cadence.json"),
            layers: Arc::new(RwLock::new(ConfigLayers {
                global: empty_object(),
                project,
                env: empty_object(),
                runtime: empty_object(),
            })),
        }
    }

    pub async fn effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        merged
    }

    pub async fn options(&self) -> RuntimeOptions {
        serde_json::from_value(self.effective_value().await).unwrap_or_default()
    }

    pub async fn patch_runtime(&self, patch: Value) -> RuntimeOptions {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.runtime, &patch);
        }
        self.options().await
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<RuntimeOptions> {
        let snapshot = {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
            layers.project.clone()
        };
        let raw = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&self.project_path, raw).await?;
        Ok(self.options().await)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("cadence").join("config.json"))
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

fn env_layer() -> Value {
    let mut layer = Map::new();
    if let Ok(mode) = std::env::var("CADENCE_APPROVAL_MODE") {
        layer.insert("approvalMode".to_string(), json!(mode.to_lowercase()));
    }
    if let Ok(raw) = std::env::var("CADENCE_MAX_REFLEXION_RETRIES") {
        if let Ok(parsed) = raw.parse::<u32>() {
            layer.insert("maxReflexionRetries".to_string(), json!(parsed));
        }
    }
    if let Ok(raw) = std::env::var("CADENCE_HARD_LIMIT_BEHAVIOR") {
        layer.insert("hardLimitBehavior".to_string(), json!(raw.to_lowercase()));
    }
    if let Ok(raw) = std::env::var("CADENCE_PERSIST_EVENTS") {
        layer.insert("persistEvents".to_string(), json!(raw == "1" || raw == "true"));
    }
    Value::Object(layer)
}

fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match target_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
