//! The analyst agent and its run stream

use super::ConversationContext;
use crate::config::{self, AgentConfig, Config};
use crate::llm::{self, LlmProvider, LlmResponse, StreamCallback, StreamEvent, TokenUsage};
use crate::memory::{AgentMemory, MemoryDb, SessionSummary, UserMemory};
use crate::storage::{AgentRun, AgentStorage};
use crate::tools::ToolRegistry;
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Buffered chunks between the run task and its consumer
const RUN_CHANNEL_CAPACITY: usize = 64;

/// Kind of a response chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted,
    /// Incremental user-visible output
    RunResponse,
    ToolCallStarted,
    ToolCallCompleted,
    UpdatingMemory,
    RunCompleted,
}

/// Payload of a response chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RunContent {
    Text(String),
    Json(serde_json::Value),
    Empty,
}

impl RunContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RunContent::Text(text) => Some(text),
            RunContent::Json(_) | RunContent::Empty => None,
        }
    }
}

/// One chunk of agent output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResponse {
    pub run_id: String,
    pub session_id: String,
    pub event: RunEvent,
    pub content: RunContent,
    pub created_at: DateTime<Utc>,
}

impl RunResponse {
    pub fn new(
        run_id: impl Into<String>,
        session_id: impl Into<String>,
        event: RunEvent,
        content: RunContent,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_id: session_id.into(),
            event,
            content,
            created_at: Utc::now(),
        }
    }
}

/// Stream returned by [`Agent::run`]
pub type RunStream = Pin<Box<dyn Stream<Item = Result<RunResponse>> + Send>>;

/// Where one run sends its chunks
struct RunSink {
    tx: mpsc::Sender<Result<RunResponse>>,
    run_id: String,
    session_id: String,
    stream: bool,
}

impl RunSink {
    /// Send a chunk; fails once the consumer has gone away
    async fn emit(&self, event: RunEvent, content: RunContent) -> Result<()> {
        // Non-streaming runs only deliver the final response
        if !self.stream {
            return Ok(());
        }
        self.send(event, content).await
    }

    async fn send(&self, event: RunEvent, content: RunContent) -> Result<()> {
        let chunk = RunResponse::new(&self.run_id, &self.session_id, event, content);
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| anyhow::anyhow!("Run stream closed by consumer"))
    }
}

/// A configured analyst agent
///
/// Built once at startup and shared as `Arc<Agent>`; every chat session runs
/// through the same instance and is told apart by its session id.
pub struct Agent {
    model: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    storage: AgentStorage,
    memory: AgentMemory,
    description: String,
    instructions: Vec<String>,
    markdown: bool,
    add_datetime_to_instructions: bool,
    add_history_to_messages: bool,
    num_history_responses: usize,
    max_iterations: usize,
    show_tool_calls: bool,
    telemetry: bool,
    user_id: Option<String>,
}

impl Agent {
    pub fn new(
        config: &AgentConfig,
        model: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        storage: AgentStorage,
        memory: AgentMemory,
    ) -> Self {
        Self {
            model,
            tools,
            storage,
            memory,
            description: config.description.clone(),
            instructions: config.instructions.clone(),
            markdown: config.markdown,
            add_datetime_to_instructions: config.add_datetime_to_instructions,
            add_history_to_messages: config.add_history_to_messages,
            num_history_responses: config.num_history_responses,
            max_iterations: config.max_iterations.max(1),
            show_tool_calls: config.show_tool_calls,
            telemetry: config.telemetry,
            user_id: config.user_id.clone(),
        }
    }

    /// Build the agent described by `config`; relative database paths
    /// resolve against `working_dir`
    pub fn from_config(config: &Config, working_dir: &Path) -> Result<Self> {
        let model = llm::create_provider(
            &config.llm.provider,
            &config.llm.model,
            config.llm.max_tokens,
        )?;
        let summary_model = llm::create_provider(
            &config.llm.provider,
            &config.llm.summary_model,
            config.llm.max_tokens,
        )?;

        let tools = ToolRegistry::for_analyst(working_dir.to_path_buf(), &config.tools)?;
        let storage = AgentStorage::open(
            working_dir.join(&config.storage.db_file),
            &config.storage.table_name,
        )
        .context("Failed to open agent storage")?;
        let memory_db = MemoryDb::open(&working_dir.join(&config.memory.db_file))
            .context("Failed to open memory database")?;
        let memory = AgentMemory::new(memory_db, &config.memory, model.clone(), summary_model);

        tracing::info!(
            provider = model.name(),
            model = model.model(),
            summary_model = %config.llm.summary_model,
            tools = ?tools.names(),
            "Agent configured"
        );

        Ok(Self::new(&config.agent, model, tools, storage, memory))
    }

    pub fn model(&self) -> &Arc<dyn LlmProvider> {
        &self.model
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn storage(&self) -> &AgentStorage {
        &self.storage
    }

    pub fn memory(&self) -> &AgentMemory {
        &self.memory
    }

    /// Run the agent on one user message
    ///
    /// The run executes on its own task and feeds the returned stream. With
    /// `stream` set every chunk is delivered as it happens; otherwise the
    /// stream carries a single `RunResponse` with the complete answer.
    /// Dropping the stream stops the run at its next chunk.
    pub fn run(self: &Arc<Self>, session_id: &str, message: &str, stream: bool) -> RunStream {
        let (tx, rx) = mpsc::channel(RUN_CHANNEL_CAPACITY);
        let sink = RunSink {
            tx,
            run_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            stream,
        };
        let agent = Arc::clone(self);
        let message = message.to_string();

        tokio::spawn(async move {
            if let Err(e) = agent.execute_run(&sink, &message).await {
                if sink.tx.is_closed() {
                    tracing::debug!(run_id = %sink.run_id, "Run abandoned: {:#}", e);
                } else {
                    tracing::error!(run_id = %sink.run_id, "Run failed: {:#}", e);
                    let _ = sink.tx.send(Err(e)).await;
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    fn system_prompt(&self, memories: &[UserMemory], summary: Option<&SessionSummary>) -> String {
        let mut prompt = self.description.clone();

        let mut instructions = self.instructions.clone();
        if self.markdown {
            instructions.push("Use markdown to format your answers.".to_string());
        }
        if self.add_datetime_to_instructions {
            instructions.push(format!(
                "The current time is {}",
                Local::now().format("%Y-%m-%d %H:%M:%S %Z")
            ));
        }
        if !instructions.is_empty() {
            prompt.push_str("\n\n<instructions>\n");
            for instruction in &instructions {
                prompt.push_str(&format!("- {}\n", instruction));
            }
            prompt.push_str("</instructions>");
        }

        if !memories.is_empty() {
            prompt.push_str(
                "\n\nYou have access to memories from previous interactions with the user:\n\
                 <memories_from_previous_interactions>\n",
            );
            for memory in memories {
                prompt.push_str(&format!("- {}\n", memory.memory));
            }
            prompt.push_str("</memories_from_previous_interactions>");
        }

        if let Some(summary) = summary {
            prompt.push_str("\n\nHere is a brief summary of your previous interactions:\n<summary_of_previous_interactions>\n");
            prompt.push_str(&summary.summary);
            if !summary.topics.is_empty() {
                prompt.push_str(&format!("\nTopics: {}", summary.topics.join(", ")));
            }
            prompt.push_str("\n</summary_of_previous_interactions>");
        }

        prompt
    }

    async fn execute_run(&self, sink: &RunSink, message: &str) -> Result<()> {
        tracing::debug!(run_id = %sink.run_id, session_id = %sink.session_id, "Run started");
        sink.emit(RunEvent::RunStarted, RunContent::Empty).await?;

        let session = self.storage.read(&sink.session_id)?;
        let memories = self.memory.user_memories(self.user_id.as_deref());
        let summary = session.as_ref().and_then(|s| s.summary.as_ref());

        let mut ctx = ConversationContext::new(self.system_prompt(&memories, summary));
        if self.add_history_to_messages {
            if let Some(session) = &session {
                ctx.add_history(session.last_runs(self.num_history_responses));
            }
        }
        ctx.add_user(message);

        let definitions = self.tools.definitions();
        let tools = (!definitions.is_empty()).then_some(definitions.as_slice());
        let mut usage = TokenUsage::default();
        let mut answer = String::new();
        let mut tool_calls_made = 0usize;
        let mut finished = false;

        for iteration in 0..self.max_iterations {
            tracing::debug!(
                iteration,
                tokens = ctx.estimate_total_tokens(),
                "Calling model"
            );

            let response = if sink.stream {
                self.stream_model(sink, &ctx, tools).await?
            } else {
                self.model.chat(ctx.messages(), tools).await?
            };
            if let Some(u) = response.usage() {
                usage.add(u);
            }

            let text = response.text().unwrap_or_default();
            answer.push_str(text);

            let calls = response.tool_calls();
            if calls.is_empty() {
                ctx.add_assistant(text);
                finished = true;
                break;
            }

            ctx.add_assistant_tool_calls(Some(text), calls);
            for call in calls {
                tool_calls_made += 1;
                if self.show_tool_calls {
                    sink.emit(
                        RunEvent::RunResponse,
                        RunContent::Text(format!(" - Running: {}({})\n\n", call.name, call.arguments)),
                    )
                    .await?;
                }
                sink.emit(
                    RunEvent::ToolCallStarted,
                    RunContent::Json(json!({
                        "id": call.id,
                        "name": call.name,
                        "arguments": call.arguments,
                    })),
                )
                .await?;

                tracing::debug!("Executing tool: {} with args: {}", call.name, call.arguments);
                let result = self.tools.execute(&call.name, call.arguments.clone()).await;

                sink.emit(
                    RunEvent::ToolCallCompleted,
                    RunContent::Json(json!({
                        "id": call.id,
                        "name": call.name,
                        "success": result.success,
                    })),
                )
                .await?;
                ctx.add_tool_result(&call.id, &result.output);
            }
        }

        if !finished {
            let notice = "\n\nI've reached the maximum number of steps for this request. Let me know if you'd like me to continue.";
            tracing::warn!(max_iterations = self.max_iterations, "Run hit iteration limit");
            answer.push_str(notice);
            sink.emit(RunEvent::RunResponse, RunContent::Text(notice.to_string()))
                .await?;
        }

        if !sink.stream {
            sink.send(RunEvent::RunResponse, RunContent::Text(answer.clone()))
                .await?;
        }

        let session = self.storage.append_run(
            &sink.session_id,
            self.user_id.as_deref(),
            AgentRun::new(message, answer.as_str()),
        )?;

        if self.memory.updates_after_run() {
            sink.emit(RunEvent::UpdatingMemory, RunContent::Empty).await?;
            self.memory.update_after_run(&self.storage, &session, message).await;
        }

        if config::telemetry_enabled(self.telemetry) {
            tracing::info!(
                target: "analyst_chat::telemetry",
                run_id = %sink.run_id,
                session_id = %sink.session_id,
                model = self.model.model(),
                tool_calls = tool_calls_made,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "run completed"
            );
        }

        tracing::debug!(run_id = %sink.run_id, tool_calls = tool_calls_made, "Run completed");
        sink.emit(RunEvent::RunCompleted, RunContent::Text(answer)).await?;
        Ok(())
    }

    /// One streaming model call; text deltas go out as they arrive
    async fn stream_model(
        &self,
        sink: &RunSink,
        ctx: &ConversationContext,
        tools: Option<&[llm::ToolDefinition]>,
    ) -> Result<LlmResponse> {
        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
        let callback: StreamCallback = Box::new(move |event| {
            if let StreamEvent::TextDelta(text) = event {
                let _ = delta_tx.send(text);
            }
        });

        // The callback (and with it the sender) is dropped when the call
        // finishes, which ends the forwarding loop. A closed run stream fails
        // the forward and drops the model call with it.
        let call = self.model.chat_streaming(ctx.messages(), tools, callback);
        let forward = async {
            while let Some(text) = delta_rx.recv().await {
                sink.emit(RunEvent::RunResponse, RunContent::Text(text)).await?;
            }
            Ok::<_, anyhow::Error>(())
        };

        let (response, ()) = tokio::try_join!(call, forward)?;
        Ok(response)
    }
}
