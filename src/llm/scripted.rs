//! Scripted provider for offline runs and tests
//!
//! Registered as provider "scripted". Replays queued responses in order and,
//! once the queue is empty, echoes the last user message. Every request is
//! recorded so callers can assert on what the model actually received.

use super::{
    LlmProvider, LlmResponse, Message, Role, StreamCallback, StreamEvent, StreamingResponseBuilder,
    ToolDefinition,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// What the provider saw on one call
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
}

impl RecordedRequest {
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .and_then(|m| m.content.as_text())
    }

    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| m.content.as_text())
    }
}

pub struct ScriptedProvider {
    model: String,
    responses: Mutex<VecDeque<LlmResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
    chunk_delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            model: "scripted".to_string(),
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            chunk_delay: None,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_responses(self, responses: Vec<LlmResponse>) -> Self {
        self.responses.lock().unwrap().extend(responses);
        self
    }

    /// Sleep between streamed chunks
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn push_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next_response(&self, messages: &[Message], tools: Option<&[ToolDefinition]>) -> LlmResponse {
        let recorded = RecordedRequest {
            messages: messages.to_vec(),
            tool_names: tools
                .unwrap_or_default()
                .iter()
                .map(|t| t.name.clone())
                .collect(),
        };
        let echo = recorded
            .last_user_message()
            .map(|m| format!("You said: {}", m))
            .unwrap_or_default();
        self.requests.lock().unwrap().push(recorded);

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(LlmResponse::Text {
                text: echo,
                usage: None,
            })
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Split text into word-sized deltas, keeping the whitespace attached
fn word_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
    ) -> Result<LlmResponse> {
        Ok(self.next_response(messages, tools))
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat_streaming(
        &self,
        messages: &[Message],
        tools: Option<&[ToolDefinition]>,
        callback: StreamCallback,
    ) -> Result<LlmResponse> {
        let response = self.next_response(messages, tools);
        let mut builder = StreamingResponseBuilder::new();

        for chunk in word_chunks(response.text().unwrap_or_default()) {
            if let Some(delay) = self.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            let event = StreamEvent::TextDelta(chunk);
            builder.process(&event);
            callback(event);
        }

        for call in response.tool_calls() {
            let events = [
                StreamEvent::ToolCallStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                },
                StreamEvent::ToolCallDelta {
                    id: call.id.clone(),
                    arguments_delta: call.arguments.to_string(),
                },
                StreamEvent::ToolCallComplete {
                    id: call.id.clone(),
                },
            ];
            for event in events {
                builder.process(&event);
                callback(event);
            }
        }

        builder.usage = response.usage().cloned();
        callback(StreamEvent::Done);
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_word_chunks_rejoin() {
        let chunks = word_chunks("Hello there, analyst!");
        assert_eq!(chunks, vec!["Hello ", "there, ", "analyst!"]);
        assert_eq!(chunks.concat(), "Hello there, analyst!");
    }

    #[tokio::test]
    async fn test_echo_when_queue_empty() {
        let provider = ScriptedProvider::new();
        let response = provider
            .chat(&[Message::system("sys"), Message::user("ping")], None)
            .await
            .unwrap();
        assert_eq!(response.text(), Some("You said: ping"));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(provider.requests()[0].system_prompt(), Some("sys"));
    }

    #[tokio::test]
    async fn test_streaming_emits_word_deltas() {
        let provider = ScriptedProvider::new().with_responses(vec![LlmResponse::Text {
            text: "two words".into(),
            usage: None,
        }]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let response = provider
            .chat_streaming(
                &[Message::user("x")],
                None,
                Box::new(move |e| sink.lock().unwrap().push(e)),
            )
            .await
            .unwrap();

        assert_eq!(response.text(), Some("two words"));
        let events = seen.lock().unwrap();
        assert_eq!(events[0], StreamEvent::TextDelta("two ".into()));
        assert_eq!(events[1], StreamEvent::TextDelta("words".into()));
        assert_eq!(events[2], StreamEvent::Done);
    }
}
