//! Reactive half of the chat module

use super::{chat_ui, ChatError, ChatMessage, ChatRole, ChatSurface, ModuleId};
use crate::agent::Agent;
use crate::stream;
use anyhow::Result;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Text fragments of one answer, in order
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One browser session's chat
///
/// Holds the visible transcript and serializes runs: a submission waits until
/// the previous answer has finished streaming.
pub struct ChatServer {
    id: ModuleId,
    session_id: String,
    agent: Arc<Agent>,
    messages: Arc<Mutex<Vec<ChatMessage>>>,
    run_lock: Arc<AsyncMutex<()>>,
    cancel: CancellationToken,
    last_active: Arc<Mutex<Instant>>,
}

struct Pending {
    fragments: FragmentStream,
    messages: Arc<Mutex<Vec<ChatMessage>>>,
    last_active: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
    _run: OwnedMutexGuard<()>,
}

impl ChatServer {
    pub fn new(
        id: ModuleId,
        session_id: impl Into<String>,
        agent: Arc<Agent>,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            id,
            session_id: session_id.into(),
            agent,
            messages: Arc::new(Mutex::new(messages)),
            run_lock: Arc::new(AsyncMutex::new(())),
            cancel: CancellationToken::new(),
            last_active: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Messages shown in the pane (system messages excluded)
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.is_visible())
            .cloned()
            .collect()
    }

    /// Current state of the pane
    pub fn surface(&self) -> ChatSurface {
        chat_ui(&self.id, &self.messages.lock().unwrap())
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time since the last submission or streamed fragment
    ///
    /// `None` while an answer is streaming.
    pub fn idle_for(&self) -> Option<Duration> {
        if self.run_lock.try_lock().is_err() {
            return None;
        }
        Some(self.last_active.lock().unwrap().elapsed())
    }

    /// Answer a user message
    ///
    /// Waits for any earlier answer in this session to finish, records the
    /// message, and starts one agent run. The returned stream yields the
    /// answer's text as it arrives and appends it to the transcript. The run
    /// lock is released when the stream ends or is dropped.
    pub async fn on_user_submit(&self, text: &str) -> Result<FragmentStream, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.is_closed() {
            return Err(ChatError::Closed);
        }

        let guard = tokio::select! {
            guard = Arc::clone(&self.run_lock).lock_owned() => guard,
            _ = self.cancel.cancelled() => return Err(ChatError::Closed),
        };

        {
            let mut messages = self.messages.lock().unwrap();
            messages.push(ChatMessage::user(text));
            messages.push(ChatMessage::assistant(String::new()));
        }
        touch(&self.last_active);
        tracing::debug!(session = %self.session_id, "Chat submission");

        let fragments: FragmentStream =
            Box::pin(stream::as_stream(self.agent.run(&self.session_id, text, true)));
        let pending = Pending {
            fragments,
            messages: Arc::clone(&self.messages),
            last_active: Arc::clone(&self.last_active),
            cancel: self.cancel.clone(),
            _run: guard,
        };

        Ok(Box::pin(futures::stream::unfold(
            Some(pending),
            |state| async move {
                let mut pending = state?;
                let next = tokio::select! {
                    _ = pending.cancel.cancelled() => return None,
                    next = pending.fragments.next() => next,
                };
                match next {
                    Some(Ok(fragment)) => {
                        append_to_answer(&pending.messages, &fragment);
                        touch(&pending.last_active);
                        Some((Ok(fragment), Some(pending)))
                    }
                    // An error ends the answer
                    Some(Err(e)) => {
                        drop_empty_answer(&pending.messages);
                        Some((Err(e), None))
                    }
                    None => None,
                }
            },
        )))
    }

    /// Tear the session down, stopping any answer in flight
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(session = %self.session_id, "Chat session closed");
        }
        self.cancel.cancel();
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn append_to_answer(messages: &Mutex<Vec<ChatMessage>>, fragment: &str) {
    let mut messages = messages.lock().unwrap();
    if let Some(last) = messages.last_mut() {
        last.content.push_str(fragment);
    }
}

/// Remove the placeholder of an answer that never produced text
fn drop_empty_answer(messages: &Mutex<Vec<ChatMessage>>) {
    let mut messages = messages.lock().unwrap();
    if messages
        .last()
        .is_some_and(|m| m.role == ChatRole::Assistant && m.content.is_empty())
    {
        messages.pop();
    }
}

fn touch(last_active: &Mutex<Instant>) {
    *last_active.lock().unwrap() = Instant::now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::config::{AgentConfig, MemoryConfig, ToolsConfig};
    use crate::llm::{LlmProvider, LlmResponse, Message, ScriptedProvider, ToolDefinition};
    use crate::memory::{AgentMemory, MemoryDb};
    use crate::storage::AgentStorage;
    use crate::tools::ToolRegistry;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct UnavailableProvider;

    #[async_trait]
    impl LlmProvider for UnavailableProvider {
        fn name(&self) -> &str {
            "unavailable"
        }

        fn model(&self) -> &str {
            "unavailable"
        }

        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
        ) -> Result<LlmResponse> {
            anyhow::bail!("model unavailable")
        }
    }

    fn chat(dir: &TempDir, provider: Arc<dyn LlmProvider>) -> ChatServer {
        let memory_config = MemoryConfig {
            create_user_memories: false,
            create_session_summary: false,
            ..MemoryConfig::default()
        };
        let tools =
            ToolRegistry::for_analyst(dir.path().to_path_buf(), &ToolsConfig::default()).unwrap();
        let storage = AgentStorage::open(dir.path().join("storage.db"), "chat_agent").unwrap();
        let memory = AgentMemory::new(
            MemoryDb::in_memory().unwrap(),
            &memory_config,
            provider.clone(),
            provider.clone(),
        );
        let agent = Agent::new(&AgentConfig::default(), provider, tools, storage, memory);
        ChatServer::new(
            ModuleId::new("chat_session"),
            "session-1",
            Arc::new(agent),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_submit_streams_and_records_answer() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new().with_responses(vec![
            LlmResponse::Text {
                text: "sales.csv and notes.json".into(),
                usage: None,
            },
        ]));
        let chat = chat(&dir, provider.clone());

        let fragments: Vec<String> = chat
            .on_user_submit("list my files")
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(fragments.concat(), "sales.csv and notes.json");
        assert_eq!(provider.call_count(), 1);
        assert_eq!(
            provider.requests()[0].last_user_message(),
            Some("list my files")
        );
        assert_eq!(
            chat.messages(),
            vec![
                ChatMessage::user("list my files"),
                ChatMessage::assistant("sales.csv and notes.json"),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_submit_waits_for_first_stream() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        let chat = chat(&dir, provider.clone());

        let first = chat.on_user_submit("first").await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(100), chat.on_user_submit("second")).await;
        assert!(blocked.is_err());

        let _: Vec<_> = first.collect().await;
        let second = chat.on_user_submit("second").await.unwrap();
        let _: Vec<_> = second.collect().await;

        let asked: Vec<String> = provider
            .requests()
            .iter()
            .filter_map(|r| r.last_user_message().map(str::to_string))
            .collect();
        assert_eq!(asked, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_close_stops_stream_and_rejects_submissions() {
        let dir = TempDir::new().unwrap();
        let provider =
            Arc::new(ScriptedProvider::new().with_chunk_delay(Duration::from_millis(50)));
        let chat = chat(&dir, provider);

        let mut stream = chat
            .on_user_submit("a fairly long question to answer")
            .await
            .unwrap();
        chat.close();
        assert!(stream.next().await.is_none());
        assert!(matches!(
            chat.on_user_submit("again").await,
            Err(ChatError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let dir = TempDir::new().unwrap();
        let chat = chat(&dir, Arc::new(ScriptedProvider::new()));
        assert!(matches!(
            chat.on_user_submit("   ").await,
            Err(ChatError::EmptyMessage)
        ));
        assert!(chat.messages().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_leaves_no_empty_answer() {
        let dir = TempDir::new().unwrap();
        let chat = chat(&dir, Arc::new(UnavailableProvider));

        let items: Vec<Result<String>> = chat
            .on_user_submit("are you there?")
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(format!("{:#}", items[0].as_ref().unwrap_err()).contains("model unavailable"));
        assert_eq!(chat.messages(), vec![ChatMessage::user("are you there?")]);
    }

    #[tokio::test]
    async fn test_idle_time_tracks_activity() {
        let dir = TempDir::new().unwrap();
        let provider =
            Arc::new(ScriptedProvider::new().with_chunk_delay(Duration::from_millis(100)));
        let chat = chat(&dir, provider);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(chat.idle_for().unwrap() >= Duration::from_millis(50));

        let stream = chat.on_user_submit("one two three").await.unwrap();
        assert_eq!(chat.idle_for(), None);
        let _: Vec<_> = stream.collect().await;

        assert!(chat.idle_for().unwrap() < Duration::from_millis(50));
    }
}
