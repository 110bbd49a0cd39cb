//! Talks to OpenAI-compatible APIs for embeddings and structured LLM calls.
//! All optional; see AiConfig::from_env(). The engine only sees the
//! `Embedder` and `Completer` traits, so tests plug in deterministic fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::MemoryError;

fn ai_err(msg: impl Into<String>) -> MemoryError {
    MemoryError::AiBackend(msg.into())
}

const AI_TIMEOUT: Duration = Duration::from_secs(30);

/// Text → vector. Batchable; failures are transient.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError>;

    fn model_name(&self) -> &str;
}

/// One forced tool call: the model must answer by calling `tool_name` with
/// arguments matching `schema`.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Selects a per-component model override ("extract", "summary", ...).
    pub component: String,
    pub system: String,
    pub user: String,
    pub tool_name: String,
    pub tool_description: String,
    pub schema: serde_json::Value,
}

/// Prompt → structured output.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, req: CompletionRequest) -> Result<serde_json::Value, MemoryError>;

    /// Model that will answer requests for `component`.
    fn model_for(&self, component: &str) -> String;
}

/// Call a completer and decode its tool arguments into `T`.
pub async fn complete_as<T: serde::de::DeserializeOwned>(
    completer: &dyn Completer,
    req: CompletionRequest,
) -> Result<T, MemoryError> {
    let tool = req.tool_name.clone();
    let value = completer.complete(req).await?;
    serde_json::from_value(value).map_err(|e| ai_err(format!("{tool} arguments parse failed: {e}")))
}

#[derive(Clone)]
pub struct AiConfig {
    pub llm_url: String,
    pub llm_key: String,
    pub llm_model: String,
    pub embed_url: String,
    pub embed_key: String,
    pub embed_model: String,
    pub client: reqwest::Client,
    // Per-component model overrides (fall back to llm_model if None)
    pub extract_model: Option<String>,
    pub summary_model: Option<String>,
}

impl AiConfig {
    pub fn model_for(&self, component: &str) -> &str {
        let m = match component {
            "extract" => self.extract_model.as_deref(),
            "summary" => self.summary_model.as_deref(),
            _ => None,
        };
        m.unwrap_or(&self.llm_model)
    }

    /// Returns `None` if `STRATA_LLM_URL` is not set or the HTTP client
    /// cannot be built.
    pub fn from_env() -> Option<Self> {
        let llm_url = std::env::var("STRATA_LLM_URL").ok()?;
        let llm_key = std::env::var("STRATA_LLM_KEY").unwrap_or_default();
        let llm_model =
            std::env::var("STRATA_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
        let embed_url = std::env::var("STRATA_EMBED_URL").unwrap_or_else(|_| {
            // Only rewrite if this looks like a chat completions endpoint
            if llm_url.contains("/chat/completions") {
                llm_url.replace("/chat/completions", "/embeddings")
            } else {
                format!("{}/embeddings", llm_url.trim_end_matches('/'))
            }
        });
        let embed_key =
            std::env::var("STRATA_EMBED_KEY").unwrap_or_else(|_| llm_key.clone());
        let embed_model = std::env::var("STRATA_EMBED_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".into());

        let client = match reqwest::Client::builder().timeout(AI_TIMEOUT).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("failed to build HTTP client: {e}");
                return None;
            }
        };

        Some(Self {
            llm_url,
            llm_key,
            llm_model,
            embed_url,
            embed_key,
            embed_model,
            client,
            extract_model: std::env::var("STRATA_EXTRACT_MODEL").ok(),
            summary_model: std::env::var("STRATA_SUMMARY_MODEL").ok(),
        })
    }

    pub fn has_llm(&self) -> bool {
        !self.llm_url.is_empty()
    }

    pub fn has_embed(&self) -> bool {
        !self.embed_url.is_empty()
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    tools: Vec<ToolDef>,
    tool_choice: serde_json::Value,
}

#[derive(Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ToolDef {
    #[serde(rename = "type")]
    tool_type: String,
    function: FunctionDef,
}

#[derive(Serialize)]
struct FunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ToolCall {
    function: ToolCallFunction,
}

#[derive(Deserialize)]
struct ToolCallFunction {
    arguments: String,
}

#[async_trait]
impl Completer for AiConfig {
    /// Forces the model to call the named function, returns the parsed arguments.
    async fn complete(&self, req: CompletionRequest) -> Result<serde_json::Value, MemoryError> {
        if !self.has_llm() {
            return Err(MemoryError::AiNotConfigured);
        }
        let model = self.model_for(&req.component).to_string();
        let body = ChatRequest {
            model: model.clone(),
            messages: vec![
                ChatMessage { role: "system".into(), content: req.system },
                ChatMessage { role: "user".into(), content: req.user },
            ],
            temperature: 0.1,
            tools: vec![ToolDef {
                tool_type: "function".into(),
                function: FunctionDef {
                    name: req.tool_name.clone(),
                    description: req.tool_description,
                    parameters: req.schema,
                },
            }],
            tool_choice: serde_json::json!({"type": "function", "function": {"name": req.tool_name}}),
        };

        let mut builder = self.client.post(&self.llm_url).json(&body);
        if !self.llm_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.llm_key));
        }

        let start = std::time::Instant::now();
        let resp = builder
            .send()
            .await
            .map_err(|e| ai_err(format!("LLM tool call failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ai_err(format!("LLM returned {status}: {text}")));
        }

        let chat: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ai_err(format!("LLM tool response parse failed: {e}")))?;
        debug!(
            model = %model,
            component = %req.component,
            ms = start.elapsed().as_millis() as u64,
            "tool call complete"
        );

        let args = chat
            .choices
            .first()
            .and_then(|c| c.message.tool_calls.as_ref())
            .and_then(|tc| tc.first())
            .map(|tc| tc.function.arguments.clone())
            .ok_or_else(|| ai_err("no tool call in response"))?;

        serde_json::from_str(&args)
            .map_err(|e| ai_err(format!("tool call arguments parse failed: {e}: {args}")))
    }

    fn model_for(&self, component: &str) -> String {
        AiConfig::model_for(self, component).to_string()
    }
}

#[derive(Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for AiConfig {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if !self.has_embed() {
            return Err(MemoryError::AiNotConfigured);
        }

        let req = EmbedRequest {
            model: self.embed_model.clone(),
            input: texts.to_vec(),
        };

        let mut builder = self.client.post(&self.embed_url).json(&req);
        if !self.embed_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.embed_key));
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| ai_err(format!("embedding request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ai_err(format!("embedding API returned {status}: {body}")));
        }

        let embed_resp: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| ai_err(format!("embedding response parse failed: {e}")))?;

        let embeddings: Vec<Vec<f32>> = embed_resp.data.into_iter().map(|d| d.embedding).collect();
        if embeddings.len() != texts.len() {
            return Err(ai_err(format!(
                "embedding count mismatch: sent {} texts, got {} embeddings",
                texts.len(),
                embeddings.len()
            )));
        }
        Ok(embeddings)
    }

    fn model_name(&self) -> &str {
        &self.embed_model
    }
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Serialize an f32 vector to bytes (little-endian) for SQLite BLOB storage.
pub fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(v.len() * 4);
    for &f in v {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    buf
}

/// Deserialize bytes back to an f32 vector. Trailing partial chunks are ignored.
pub fn bytes_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_same_vec() {
        let v: Vec<f32> = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-10);
    }

    #[test]
    fn cosine_perpendicular() {
        let a: Vec<f32> = vec![1.0, 0.0];
        let b: Vec<f32> = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-10);
    }

    #[test]
    fn cosine_mismatched_or_empty() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn embedding_bytes_roundtrip() {
        let original: Vec<f32> = vec![1.0, -2.5, 3.125, 0.0, f32::MAX];
        let decoded = bytes_to_embedding(&embedding_to_bytes(&original));
        assert_eq!(original, decoded);
    }

    #[test]
    fn component_model_override() {
        let cfg = AiConfig {
            llm_url: "http://localhost/v1/chat/completions".into(),
            llm_key: String::new(),
            llm_model: "base".into(),
            embed_url: String::new(),
            embed_key: String::new(),
            embed_model: "emb".into(),
            client: reqwest::Client::new(),
            extract_model: Some("big".into()),
            summary_model: None,
        };
        assert_eq!(cfg.model_for("extract"), "big");
        assert_eq!(cfg.model_for("summary"), "base");
        assert!(!cfg.has_embed());
    }
}
