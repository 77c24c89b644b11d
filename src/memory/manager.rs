//! Applies memory edits proposed by the model

use super::{extract_json, MemoryDb, UserMemory};
use crate::llm::{LlmProvider, Message};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;

const MANAGER_PROMPT: &str = "\
Your task is to manage the user's memories based on the user's latest message.
Memories are short third-person statements about the user, e.g. \"User works in finance\".
You may:
  - add a new memory: {\"op\": \"add\", \"memory\": \"...\"}
  - update an existing memory: {\"op\": \"update\", \"id\": <id>, \"memory\": \"...\"}
  - delete an existing memory: {\"op\": \"delete\", \"id\": <id>}
  - clear all memories: {\"op\": \"clear\"}
Do not store information that is already captured by an existing memory.
Respond with a JSON array of operations and nothing else. Respond with [] if no change is needed.";

/// One edit to the memory database
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum MemoryOp {
    Add { memory: String },
    Update { id: i64, memory: String },
    Delete { id: i64 },
    Clear,
}

pub struct MemoryManager {
    provider: Arc<dyn LlmProvider>,
}

impl MemoryManager {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    fn system_prompt(existing: &[UserMemory]) -> String {
        let mut prompt = MANAGER_PROMPT.to_string();
        prompt.push_str("\n\nExisting memories:\n<existing_memories>\n");
        for memory in existing {
            prompt.push_str(&format!("  - id {}: {}\n", memory.id, memory.memory));
        }
        prompt.push_str("</existing_memories>");
        prompt
    }

    /// Ask the model which edits to make
    pub async fn plan(&self, message: &str, existing: &[UserMemory]) -> Result<Vec<MemoryOp>> {
        let messages = vec![
            Message::system(Self::system_prompt(existing)),
            Message::user(message),
        ];
        let response = self.provider.chat(&messages, None).await?;
        let text = response.text().unwrap_or_default();
        serde_json::from_str(extract_json(text))
            .with_context(|| format!("Memory manager returned invalid JSON: {}", text))
    }

    /// Plan and apply edits for one user message; returns the edits applied
    pub async fn update(
        &self,
        db: &MemoryDb,
        user_id: Option<&str>,
        message: &str,
    ) -> Result<Vec<MemoryOp>> {
        let existing = db.list(user_id)?;
        let ops = self.plan(message, &existing).await?;
        let owned = |id: i64| existing.iter().any(|m| m.id == id);

        let mut applied = Vec::with_capacity(ops.len());
        for op in ops {
            let done = match &op {
                MemoryOp::Add { memory } => {
                    db.add(user_id, memory)?;
                    true
                }
                // Ids outside this user's memories are ignored
                MemoryOp::Update { id, memory } => owned(*id) && db.update(*id, memory)?,
                MemoryOp::Delete { id } => owned(*id) && db.delete(*id)?,
                MemoryOp::Clear => {
                    db.clear(user_id)?;
                    true
                }
            };
            if done {
                applied.push(op);
            } else {
                tracing::debug!(?op, "Skipped memory edit for unknown id");
            }
        }

        tracing::info!(edits = applied.len(), "Updated user memories");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, ScriptedProvider};

    fn reply(s: &str) -> LlmResponse {
        LlmResponse::Text {
            text: s.into(),
            usage: None,
        }
    }

    #[test]
    fn test_op_parsing() {
        let ops: Vec<MemoryOp> = serde_json::from_str(
            r#"[{"op":"add","memory":"x"},{"op":"delete","id":3},{"op":"clear"}]"#,
        )
        .unwrap();
        assert_eq!(
            ops,
            vec![
                MemoryOp::Add { memory: "x".into() },
                MemoryOp::Delete { id: 3 },
                MemoryOp::Clear
            ]
        );
    }

    #[tokio::test]
    async fn test_update_applies_ops() {
        let db = MemoryDb::in_memory().unwrap();
        let old = db.add(None, "User likes tea").unwrap();
        let foreign = db.add(Some("bob"), "Bob's memory").unwrap();

        let provider = Arc::new(ScriptedProvider::new().with_responses(vec![reply(&format!(
            r#"[{{"op":"add","memory":"User is Ada"}},
                {{"op":"update","id":{old},"memory":"User likes coffee"}},
                {{"op":"delete","id":{foreign}}}]"#
        ))]));
        let manager = MemoryManager::new(provider.clone());

        let applied = manager
            .update(&db, None, "I'm Ada and I switched to coffee")
            .await
            .unwrap();
        assert_eq!(applied.len(), 2);

        let memories: Vec<String> = db.list(None).unwrap().into_iter().map(|m| m.memory).collect();
        assert_eq!(memories, vec!["User likes coffee", "User is Ada"]);
        assert_eq!(db.list(Some("bob")).unwrap().len(), 1);

        let prompt = provider.requests()[0].system_prompt().unwrap().to_string();
        assert!(prompt.contains(&format!("id {old}: User likes tea")));
    }

    #[tokio::test]
    async fn test_empty_plan_changes_nothing() {
        let db = MemoryDb::in_memory().unwrap();
        let provider = Arc::new(ScriptedProvider::new().with_responses(vec![reply("[]")]));
        let applied = MemoryManager::new(provider)
            .update(&db, None, "hello")
            .await
            .unwrap();
        assert!(applied.is_empty());
        assert!(db.list(None).unwrap().is_empty());
    }
}
