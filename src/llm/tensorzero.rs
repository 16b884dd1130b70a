use crate::http::build_client;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout: Duration,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            gateway_url: std::env::var("TENSORZERO_GATEWAY_URL").unwrap_or_default(),
            api_key: std::env::var("TENSORZERO_API_KEY").ok(),
            model: std::env::var("TENSORZERO_MODEL").ok(),
            timeout: Duration::from_secs(
                crate::config::parse_env("LLM_TIMEOUT_SECS")
                    .filter(|v: &u64| *v > 0)
                    .unwrap_or(60),
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing gateway url")]
    MissingGateway,
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default)]
    pub usage: Option<LlmUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

/// Client for a TensorZero-style inference gateway.
pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: build_client(config.timeout),
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.gateway_url.trim().is_empty()
    }

    pub async fn chat(
        &self,
        function_name: &str,
        messages: &[LlmMessage],
    ) -> Result<LlmResponse, LlmError> {
        let gateway = self.config.gateway_url.trim().trim_end_matches('/');
        if gateway.is_empty() {
            return Err(LlmError::MissingGateway);
        }

        let body = ChatRequest {
            function_name: function_name.to_string(),
            model_name: self.config.model.clone(),
            input: ChatInput {
                messages: messages.to_vec(),
            },
        };

        let mut request = self.http.post(format!("{gateway}/inference")).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }

        let payload: TensorZeroResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        if let Some(usage) = &payload.usage {
            tracing::debug!(
                target = "catalog.llm",
                function = function_name,
                input_tokens = ?usage.input_tokens,
                output_tokens = ?usage.output_tokens,
                "llm_usage"
            );
        }

        let text = payload
            .content
            .into_iter()
            .find(|item| item.r#type == "text")
            .map(|item| item.text)
            .ok_or_else(|| LlmError::InvalidResponse("missing text".into()))?;

        Ok(LlmResponse {
            text,
            usage: payload.usage,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    function_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_name: Option<String>,
    input: ChatInput,
}

#[derive(Debug, Serialize)]
struct ChatInput {
    messages: Vec<LlmMessage>,
}

#[derive(Debug, Deserialize)]
struct TensorZeroResponse {
    content: Vec<ResponseContent>,
    #[serde(default)]
    usage: Option<LlmUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    r#type: String,
    #[serde(default)]
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_gateway_fails_without_network() {
        let client = LlmClient::new(LlmConfig {
            gateway_url: "  ".into(),
            api_key: None,
            model: None,
            timeout: Duration::from_secs(1),
        });
        assert!(!client.is_configured());
        let err = client
            .chat("catalog_enrich", &[LlmMessage::user("hi")])
            .await
            .expect_err("no gateway");
        assert!(matches!(err, LlmError::MissingGateway));
    }

    #[test]
    fn parses_gateway_payload() {
        let payload: TensorZeroResponse = serde_json::from_str(
            r#"{"content":[{"type":"thought"},{"type":"text","text":"ok"}],"usage":{"input_tokens":3,"output_tokens":1}}"#,
        )
        .expect("payload");
        assert_eq!(payload.content[1].text, "ok");
        assert_eq!(payload.usage.and_then(|u| u.output_tokens), Some(1));
    }
}
