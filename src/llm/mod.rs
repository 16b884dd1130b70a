pub mod tensorzero;

use async_trait::async_trait;
pub use tensorzero::{LlmClient, LlmConfig, LlmError, LlmMessage, LlmResponse};

/// Opaque model gateway used for vision extraction and description writing.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn chat(&self, function: &str, messages: &[LlmMessage])
    -> Result<LlmResponse, LlmError>;
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn chat(
        &self,
        function: &str,
        messages: &[LlmMessage],
    ) -> Result<LlmResponse, LlmError> {
        LlmClient::chat(self, function, messages).await
    }
}

/// Models like to wrap JSON answers in a ```json fence.
pub fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_fenced_json() {
        let raw = "```json\n[{\"sku\":\"A\"}]\n```\ntrailing chatter";
        assert_eq!(strip_markdown_fence(raw), "[{\"sku\":\"A\"}]");
        assert_eq!(strip_markdown_fence("  {\"a\":1} "), "{\"a\":1}");
    }
}
