use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use cadence_types::ToolDefinition;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    Content(String),
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Non-streaming completion result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    pub token_usage: TokenUsage,
    pub finish_reason: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDecision {
    Retry,
    Backoff,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorClassification {
    /// Provider-facing category, e.g. `rate_limit`, `auth`, `network`.
    pub kind: String,
    pub retry_decision: RetryDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// Surface the core consumes from provider adapters. Concrete HTTP
/// adapters live outside the core and implement this trait.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    fn id(&self) -> &str;

    async fn call(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        config: GatewayConfig,
    ) -> anyhow::Result<ModelResponse>;

    /// Default stream is synthesized from `call` for adapters without a
    /// native streaming surface.
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        config: GatewayConfig,
        _cancel: CancellationToken,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = StreamChunk> + Send>>> {
        let response = self.call(messages, tools, config).await?;
        let chunks = vec![
            StreamChunk::Content(response.content),
            StreamChunk::Done {
                finish_reason: response.finish_reason,
                usage: Some(response.token_usage),
            },
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn token_count(&self, messages: &[ChatMessage]) -> u64 {
        // Whitespace token estimate; adapters override with real counters.
        messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum()
    }

    fn classify_error(&self, error: &anyhow::Error) -> ErrorClassification {
        classify_error_text(&error.to_string())
    }
}

pub fn classify_error_text(text: &str) -> ErrorClassification {
    let lowered = text.to_lowercase();
    if lowered.contains("429") || lowered.contains("rate limit") || lowered.contains("quota") {
        return ErrorClassification {
            kind: "rate_limit".to_string(),
            retry_decision: RetryDecision::Backoff,
            retry_after_ms: Some(30_000),
        };
    }
    if lowered.contains("401") || lowered.contains("403") || lowered.contains("unauthorized") {
        return ErrorClassification {
            kind: "auth".to_string(),
            retry_decision: RetryDecision::Fail,
            retry_after_ms: None,
        };
    }
    if lowered.contains("timeout")
        || lowered.contains("timed out")
        || lowered.contains("connection")
        || lowered.contains("503")
        || lowered.contains("502")
    {
        return ErrorClassification {
            kind: "network".to_string(),
            retry_decision: RetryDecision::Retry,
            retry_after_ms: Some(1_000),
        };
    }
    ErrorClassification {
        kind: "unknown".to_string(),
        retry_decision: RetryDecision::Fail,
        retry_after_ms: None,
    }
}

/// Result of a registry call, carrying the id of the gateway that finally
/// answered so callers can surface reroutes in their event payloads.
#[derive(Debug, Clone)]
pub struct RoutedResponse {
    pub gateway_id: String,
    pub rerouted_from: Option<String>,
    pub response: ModelResponse,
}

#[derive(Clone)]
pub struct GatewayRegistry {
    gateways: Arc<RwLock<HashMap<String, Arc<dyn ModelGateway>>>>,
    default_gateway: Arc<RwLock<Option<String>>>,
    fallbacks: Arc<RwLock<HashMap<String, String>>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self {
            gateways: Arc::new(RwLock::new(HashMap::new())),
            default_gateway: Arc::new(RwLock::new(None)),
            fallbacks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, gateway: Arc<dyn ModelGateway>) {
        let id = gateway.id().to_string();
        let mut gateways = self.gateways.write().await;
        let mut default = self.default_gateway.write().await;
        if default.is_none() {
            *default = Some(id.clone());
        }
        gateways.insert(id, gateway);
    }

    pub async fn declare_fallback(&self, from: &str, to: &str) {
        self.fallbacks
            .write()
            .await
            .insert(from.to_string(), to.to_string());
    }

    pub async fn get(&self, id: Option<&str>) -> anyhow::Result<Arc<dyn ModelGateway>> {
        let gateways = self.gateways.read().await;
        let wanted = match id {
            Some(id) => id.to_string(),
            None => self
                .default_gateway
                .read()
                .await
                .clone()
                .ok_or_else(|| anyhow::anyhow!("no model gateway configured"))?,
        };
        gateways
            .get(&wanted)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("model gateway `{wanted}` is not configured"))
    }

    /// Call the selected gateway; on a retryable failure with a declared
    /// fallback, reroute once. The caller observes the reroute through
    /// `RoutedResponse::rerouted_from`.
    pub async fn call_with_fallback(
        &self,
        gateway_id: Option<&str>,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
        config: GatewayConfig,
    ) -> anyhow::Result<RoutedResponse> {
        let primary = self.get(gateway_id).await?;
        let primary_id = primary.id().to_string();
        let err = match primary
            .call(messages.clone(), tools.clone(), config.clone())
            .await
        {
            Ok(response) => {
                return Ok(RoutedResponse {
                    gateway_id: primary_id,
                    rerouted_from: None,
                    response,
                })
            }
            Err(err) => err,
        };

        let classification = primary.classify_error(&err);
        if classification.retry_decision == RetryDecision::Fail {
            return Err(err);
        }
        let fallback_id = self.fallbacks.read().await.get(&primary_id).cloned();
        let Some(fallback_id) = fallback_id else {
            return Err(err);
        };
        tracing::warn!(
            from = %primary_id,
            to = %fallback_id,
            kind = %classification.kind,
            "rerouting model call to fallback gateway"
        );
        let fallback = self.get(Some(&fallback_id)).await?;
        let response = fallback.call(messages, tools, config).await?;
        Ok(RoutedResponse {
            gateway_id: fallback_id,
            rerouted_from: Some(primary_id),
            response,
        })
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}
