//! Session summaries

use super::{extract_json, SessionSummary};
use crate::llm::{LlmProvider, Message};
use crate::storage::AgentRun;
use anyhow::{Context, Result};
use std::sync::Arc;

const SUMMARIZER_PROMPT: &str = "\
Analyze the following conversation between a user and an assistant, and extract the following details:
  - Summary (str): Provide a concise summary of the session, focusing on important information that would be helpful for future interactions.
  - Topics (Optional[List[str]]): List the topics discussed in the session.
Please ignore any frivolous information.
Respond with a JSON object with the keys \"summary\" and \"topics\" and nothing else.";

pub struct MemorySummarizer {
    provider: Arc<dyn LlmProvider>,
}

impl MemorySummarizer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    fn transcript(runs: &[AgentRun]) -> String {
        let mut out = String::from("Conversation:\n");
        for run in runs {
            out.push_str(&format!("User: {}\n", run.user));
            out.push_str(&format!("Assistant: {}\n", run.assistant));
        }
        out
    }

    /// Summarize a session; `None` when there is nothing to summarize
    pub async fn summarize(&self, runs: &[AgentRun]) -> Result<Option<SessionSummary>> {
        if runs.is_empty() {
            return Ok(None);
        }

        let messages = vec![
            Message::system(SUMMARIZER_PROMPT),
            Message::user(Self::transcript(runs)),
        ];
        let response = self.provider.chat(&messages, None).await?;
        let text = response.text().unwrap_or_default();

        let summary: SessionSummary = serde_json::from_str(extract_json(text))
            .with_context(|| format!("Summarizer returned invalid JSON: {}", text))?;
        tracing::debug!(
            model = self.provider.model(),
            topics = summary.topics.len(),
            "Session summarized"
        );
        Ok(Some(summary))
    }
}
