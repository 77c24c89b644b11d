//! Decides whether a user message holds something worth remembering

use super::UserMemory;
use crate::llm::{LlmProvider, Message};
use anyhow::Result;
use std::sync::Arc;

const CLASSIFIER_PROMPT: &str = "\
Your task is to identify if the user's message contains information that is worth remembering for future conversations.
This includes details that could personalize ongoing interactions with the user, such as:
  - Personal facts: name, age, occupation, location, interests, preferences, etc.
  - Significant life events or experiences shared by the user
  - Important context about the user's current situation, challenges or goals
  - What the user likes or dislikes, their opinions, beliefs, values, etc.
  - Any other details that provide valuable insights into the user's personality, perspective or needs
Your task is to decide whether the user input contains any of the above information worth remembering.
If the user input contains any information worth remembering for future conversations, respond with 'yes'.
If the input does not contain any important details worth saving, respond with 'no' to disregard it.
You will also be provided with a list of existing memories to help you decide if the input is new or already known.
If the memory already exists that matches the input, respond with 'no' to keep it as is.
If a memory exists that needs to be updated or deleted, respond with 'yes' to update/delete it.
You must only respond with 'yes' or 'no'. Nothing else will be considered as a valid response.";

pub struct MemoryClassifier {
    provider: Arc<dyn LlmProvider>,
}

impl MemoryClassifier {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    fn system_prompt(existing: &[UserMemory]) -> String {
        let mut prompt = CLASSIFIER_PROMPT.to_string();
        if !existing.is_empty() {
            prompt.push_str("\n\nExisting memories:\n<existing_memories>\n");
            for memory in existing {
                prompt.push_str(&format!("  - {}\n", memory.memory));
            }
            prompt.push_str("</existing_memories>");
        }
        prompt
    }

    /// Ask the model; anything but a leading "yes" counts as no
    pub async fn should_add_memory(&self, message: &str, existing: &[UserMemory]) -> Result<bool> {
        let messages = vec![
            Message::system(Self::system_prompt(existing)),
            Message::user(message),
        ];
        let response = self.provider.chat(&messages, None).await?;
        let answer = response.text().unwrap_or_default().trim().to_lowercase();
        let keep = answer.starts_with("yes");
        tracing::debug!(model = self.provider.model(), keep, "Memory classifier answered");
        Ok(keep)
    }
}
