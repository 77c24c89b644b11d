//! Agent memory: user memories and session summaries
//!
//! After each run the agent hands the exchange to [`AgentMemory`], which
//! (depending on its flags) asks the classifier whether the user said
//! something worth keeping, lets the manager edit the memory database, and
//! refreshes the session summary with the summarizer.

mod classifier;
mod db;
mod manager;
mod summarizer;

pub use classifier::MemoryClassifier;
pub use db::{MemoryDb, UserMemory};
pub use manager::{MemoryManager, MemoryOp};
pub use summarizer::MemorySummarizer;

use crate::config::MemoryConfig;
use crate::llm::LlmProvider;
use crate::storage::{AgentSession, AgentStorage};
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

/// Summary of a chat session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub summary: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Strip a Markdown code fence around a JSON reply, if there is one
pub(crate) fn extract_json(text: &str) -> &str {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    let fence = FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").ok());

    fence
        .as_ref()
        .and_then(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map_or(text.trim(), |m| m.as_str())
}

/// What changed in memory after a run
#[derive(Debug, Default)]
pub struct MemoryUpdate {
    pub memory_ops: Vec<MemoryOp>,
    pub summary: Option<SessionSummary>,
}

/// Memory subsystem of an agent
pub struct AgentMemory {
    db: MemoryDb,
    classifier: MemoryClassifier,
    summarizer: MemorySummarizer,
    manager: MemoryManager,
    create_user_memories: bool,
    create_session_summary: bool,
    update_user_memories_after_run: bool,
    update_session_summary_after_run: bool,
}

impl AgentMemory {
    /// Classifier and manager use `model`; the summarizer uses `summary_model`
    pub fn new(
        db: MemoryDb,
        config: &MemoryConfig,
        model: Arc<dyn LlmProvider>,
        summary_model: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            db,
            classifier: MemoryClassifier::new(model.clone()),
            summarizer: MemorySummarizer::new(summary_model),
            manager: MemoryManager::new(model),
            create_user_memories: config.create_user_memories,
            create_session_summary: config.create_session_summary,
            update_user_memories_after_run: config.update_user_memories_after_run,
            update_session_summary_after_run: config.update_session_summary_after_run,
        }
    }

    pub fn db(&self) -> &MemoryDb {
        &self.db
    }

    /// Whether a run will do any memory work afterwards
    pub fn updates_after_run(&self) -> bool {
        (self.create_user_memories && self.update_user_memories_after_run)
            || (self.create_session_summary && self.update_session_summary_after_run)
    }

    /// Memories included in the system prompt
    pub fn user_memories(&self, user_id: Option<&str>) -> Vec<UserMemory> {
        if !self.create_user_memories {
            return Vec::new();
        }
        self.db.list(user_id).unwrap_or_else(|e| {
            tracing::warn!("Failed to load user memories: {:#}", e);
            Vec::new()
        })
    }

    /// Post-run memory work
    ///
    /// Each half fails independently: a failed classification does not stop
    /// the summary from being refreshed.
    pub async fn update_after_run(
        &self,
        storage: &AgentStorage,
        session: &AgentSession,
        user_message: &str,
    ) -> MemoryUpdate {
        let mut update = MemoryUpdate::default();
        let user_id = session.user_id.as_deref();

        if self.create_user_memories && self.update_user_memories_after_run {
            match self.update_user_memories(user_id, user_message).await {
                Ok(ops) => update.memory_ops = ops,
                Err(e) => tracing::warn!("Failed to update user memories: {:#}", e),
            }
        }

        if self.create_session_summary && self.update_session_summary_after_run {
            match self.update_summary(storage, session).await {
                Ok(summary) => update.summary = summary,
                Err(e) => tracing::warn!("Failed to update session summary: {:#}", e),
            }
        }

        update
    }

    async fn update_user_memories(
        &self,
        user_id: Option<&str>,
        user_message: &str,
    ) -> Result<Vec<MemoryOp>> {
        let existing = self.db.list(user_id)?;
        if !self
            .classifier
            .should_add_memory(user_message, &existing)
            .await?
        {
            return Ok(Vec::new());
        }
        self.manager.update(&self.db, user_id, user_message).await
    }

    async fn update_summary(
        &self,
        storage: &AgentStorage,
        session: &AgentSession,
    ) -> Result<Option<SessionSummary>> {
        let Some(summary) = self.summarizer.summarize(&session.runs).await? else {
            return Ok(None);
        };
        storage.set_summary(&session.session_id, &summary)?;
        Ok(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, ScriptedProvider};
    use crate::storage::AgentRun;
    use tempfile::TempDir;

    fn reply(s: &str) -> LlmResponse {
        LlmResponse::Text {
            text: s.into(),
            usage: None,
        }
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json("  [1]  "), "[1]");
        assert_eq!(extract_json("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("Here:\n```\n[]\n```\nDone"), "[]");
    }

    #[tokio::test]
    async fn test_update_after_run_uses_both_models() {
        let dir = TempDir::new().unwrap();
        let storage = AgentStorage::open(dir.path().join("s.db"), "chat_agent").unwrap();
        let session = storage
            .append_run("s1", None, AgentRun::new("I'm Ada", "Hi Ada"))
            .unwrap();

        let flash = Arc::new(ScriptedProvider::new().with_responses(vec![
            reply("yes"),
            reply(r#"[{"op":"add","memory":"User is called Ada"}]"#),
        ]));
        let pro = Arc::new(ScriptedProvider::new().with_responses(vec![reply(
            r#"{"summary":"User introduced as Ada","topics":["introductions"]}"#,
        )]));

        let memory = AgentMemory::new(
            MemoryDb::in_memory().unwrap(),
            &MemoryConfig::default(),
            flash.clone(),
            pro.clone(),
        );
        assert!(memory.updates_after_run());

        let update = memory.update_after_run(&storage, &session, "I'm Ada").await;
        assert_eq!(update.memory_ops.len(), 1);
        assert_eq!(flash.call_count(), 2);
        assert_eq!(pro.call_count(), 1);

        assert_eq!(memory.user_memories(None)[0].memory, "User is called Ada");
        let stored = storage.read("s1").unwrap().unwrap();
        assert_eq!(stored.summary, update.summary);
    }

    #[tokio::test]
    async fn test_classifier_no_skips_manager() {
        let dir = TempDir::new().unwrap();
        let storage = AgentStorage::open(dir.path().join("s.db"), "chat_agent").unwrap();
        let session = storage
            .append_run("s1", None, AgentRun::new("hi", "hello"))
            .unwrap();

        let flash = Arc::new(ScriptedProvider::new().with_responses(vec![reply("no")]));
        let config = MemoryConfig {
            update_session_summary_after_run: false,
            ..MemoryConfig::default()
        };
        let memory = AgentMemory::new(
            MemoryDb::in_memory().unwrap(),
            &config,
            flash.clone(),
            Arc::new(ScriptedProvider::new()),
        );

        let update = memory.update_after_run(&storage, &session, "hi").await;
        assert!(update.memory_ops.is_empty());
        assert!(update.summary.is_none());
        assert_eq!(flash.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let dir = TempDir::new().unwrap();
        let storage = AgentStorage::open(dir.path().join("s.db"), "chat_agent").unwrap();
        let session = storage
            .append_run("s1", None, AgentRun::new("q", "a"))
            .unwrap();

        // Manager reply is not JSON; the summary still lands
        let flash = Arc::new(
            ScriptedProvider::new().with_responses(vec![reply("yes"), reply("not json")]),
        );
        let pro = Arc::new(
            ScriptedProvider::new().with_responses(vec![reply(r#"{"summary":"q and a"}"#)]),
        );
        let memory = AgentMemory::new(
            MemoryDb::in_memory().unwrap(),
            &MemoryConfig::default(),
            flash,
            pro,
        );

        let update = memory.update_after_run(&storage, &session, "q").await;
        assert!(update.memory_ops.is_empty());
        assert_eq!(update.summary.unwrap().summary, "q and a");
    }
}
