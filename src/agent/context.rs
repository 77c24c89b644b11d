//! Prompt assembly for a single run

use crate::llm::{Message, ToolCall};
use crate::storage::AgentRun;

/// Max tokens for a single tool result (to prevent one file from filling context)
const MAX_TOOL_RESULT_TOKENS: usize = 8_000;

/// Messages sent to the model during one run
pub struct ConversationContext {
    messages: Vec<Message>,
}

impl ConversationContext {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    /// Replay earlier exchanges, oldest first
    pub fn add_history(&mut self, runs: &[AgentRun]) {
        for run in runs {
            self.messages.push(Message::user(&run.user));
            self.messages.push(Message::assistant(&run.assistant));
        }
    }

    pub fn add_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn add_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    /// Assistant turn that requested tools; must precede their results
    pub fn add_assistant_tool_calls(&mut self, text: Option<&str>, tool_calls: &[ToolCall]) {
        self.messages
            .push(Message::assistant_tool_calls(text, tool_calls));
    }

    /// Add a tool result (auto-truncates if too large)
    pub fn add_tool_result(&mut self, tool_call_id: impl Into<String>, result: &str) {
        let truncated = Self::truncate_if_needed(result, MAX_TOOL_RESULT_TOKENS);
        self.messages
            .push(Message::tool_result(tool_call_id, truncated));
    }

    /// Truncate text if it exceeds token limit
    fn truncate_if_needed(text: &str, max_tokens: usize) -> String {
        if Self::estimate_tokens(text) <= max_tokens {
            return text.to_string();
        }

        // ~4 chars per token is a rough estimate
        let max_chars = max_tokens * 4;
        let truncated: String = text.chars().take(max_chars).collect();

        format!(
            "{}\n\n... [TRUNCATED: Content exceeded {} tokens. Narrow the query for more detail.]",
            truncated, max_tokens
        )
    }

    /// Estimate tokens in text (~4 chars per token for English)
    pub fn estimate_tokens(text: &str) -> usize {
        (text.len() + 3) / 4
    }

    pub fn estimate_total_tokens(&self) -> usize {
        self.messages
            .iter()
            .map(|m| match m.content.as_text() {
                Some(text) => Self::estimate_tokens(text),
                None => 0,
            })
            .sum()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}
