use crate::config::LlmConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One call to the completion service: system instructions plus a user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub user: String,
    pub max_tokens: u32,
}

/// Black-box text completion. Implementations must bound their own latency.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }

    fn body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(ref system) = request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.user}));

        serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.0,
            "max_tokens": request.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        debug!("Calling completion service with model {}", self.model);

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Generation("Completion service timed out".to_string())
                } else {
                    PipelineError::Generation(format!("Completion service unreachable: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            warn!("Completion service returned {}: {}", status, error_text);
            return Err(PipelineError::Generation(match status.as_u16() {
                401 => "Invalid API key. Please check the OPENROUTER_API_KEY environment variable.".to_string(),
                429 => "Rate limit exceeded. Please try again in a moment.".to_string(),
                code => format!("API error ({})", code),
            }));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Generation(format!("Failed to parse completion response: {}", e)))?;

        extract_content(&response_json)
    }
}

/// Pulls `choices[0].message.content` out of a chat completion body.
pub fn extract_content(response_json: &serde_json::Value) -> Result<String> {
    if let Some(error) = response_json.get("error") {
        return Err(PipelineError::Generation(format!("Completion service error: {}", error)));
    }

    let choice = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| PipelineError::Generation("No choices in completion response".to_string()))?;

    if choice.get("finish_reason").and_then(|r| r.as_str()) == Some("length") {
        warn!("Completion was truncated by the token limit");
    }

    let content = choice["message"]["content"].as_str().unwrap_or("").trim();
    if content.is_empty() {
        return Err(PipelineError::Generation("Empty content in completion response".to_string()));
    }

    Ok(content.to_string())
}
