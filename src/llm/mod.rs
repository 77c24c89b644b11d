//! LLM provider implementations

mod error;
mod gemini;
mod scripted;
pub mod streaming;
mod types;

pub use error::LlmError;
pub use gemini::GeminiProvider;
pub use scripted::{RecordedRequest, ScriptedProvider};
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Trait for LLM providers
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &str;

    /// Model identifier requests are sent to
    fn model(&self) -> &str;

    /// Send a chat completion request (non-streaming)
    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse>;

    /// Send a streaming chat completion request
    ///
    /// The callback is invoked for each chunk as it arrives. The default
    /// implementation falls back to `chat()` and replays the complete
    /// response as a single TextDelta followed by its tool calls.
    async fn chat_streaming(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        callback: StreamCallback,
    ) -> Result<LlmResponse> {
        let response = self.chat(messages, tools).await?;

        if let Some(text) = response.text() {
            callback(StreamEvent::TextDelta(text.to_string()));
        }

        for tool_call in response.tool_calls() {
            callback(StreamEvent::ToolCallStart {
                id: tool_call.id.clone(),
                name: tool_call.name.clone(),
            });
            callback(StreamEvent::ToolCallDelta {
                id: tool_call.id.clone(),
                arguments_delta: tool_call.arguments.to_string(),
            });
            callback(StreamEvent::ToolCallComplete {
                id: tool_call.id.clone(),
            });
        }

        callback(StreamEvent::Done);
        Ok(response)
    }

    /// Whether `chat_streaming` is native rather than the buffered fallback
    fn supports_streaming(&self) -> bool {
        false
    }
}

/// Create an LLM provider for one model reference
pub fn create_provider(name: &str, model: &str, max_tokens: usize) -> Result<Arc<dyn LlmProvider>> {
    match name.to_lowercase().as_str() {
        "gemini" | "google" => {
            let p = GeminiProvider::new()?
                .with_model(model)
                .with_max_tokens(max_tokens);
            Ok(Arc::new(p))
        }
        "scripted" | "offline" => Ok(Arc::new(ScriptedProvider::new().with_model(model))),
        _ => anyhow::bail!("Unknown LLM provider: {}. Supported: gemini, scripted", name),
    }
}
