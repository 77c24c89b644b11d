//! End-to-end runs of the analyst agent against a scripted model

use analyst_chat::agent::{Agent, RunContent, RunEvent, RunResponse};
use analyst_chat::chat::{ChatServer, ModuleId};
use analyst_chat::config::{AgentConfig, MemoryConfig, ToolsConfig};
use analyst_chat::llm::{LlmResponse, Role, ScriptedProvider, ToolCall};
use analyst_chat::memory::{AgentMemory, MemoryDb};
use analyst_chat::storage::AgentStorage;
use analyst_chat::stream;
use analyst_chat::tools::ToolRegistry;
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn agent(dir: &TempDir, provider: Arc<ScriptedProvider>) -> Arc<Agent> {
    let memory_config = MemoryConfig {
        create_user_memories: false,
        create_session_summary: false,
        ..MemoryConfig::default()
    };
    let tools = ToolRegistry::for_analyst(dir.path().to_path_buf(), &ToolsConfig::default())
        .unwrap();
    let storage = AgentStorage::open(dir.path().join("tmp/agent_storage.db"), "chat_agent").unwrap();
    let memory = AgentMemory::new(
        MemoryDb::in_memory().unwrap(),
        &memory_config,
        provider.clone(),
        provider.clone(),
    );
    Arc::new(Agent::new(
        &AgentConfig::default(),
        provider,
        tools,
        storage,
        memory,
    ))
}

fn tool_call(idx: usize, name: &str, arguments: serde_json::Value) -> LlmResponse {
    LlmResponse::ToolCalls {
        calls: vec![ToolCall {
            id: format!("call_{}_{}", idx, name),
            name: name.to_string(),
            arguments,
        }],
        usage: None,
    }
}

#[tokio::test]
async fn test_csv_question_answered_through_sql() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("sales.csv"),
        "region,amount\nnorth,10\nsouth,7\nnorth,5\n",
    )
    .unwrap();

    let provider = Arc::new(ScriptedProvider::new().with_responses(vec![
        tool_call(0, "create_table_from_path", json!({"path": "sales.csv"})),
        tool_call(
            1,
            "run_query",
            json!({"query": "SELECT region, SUM(amount) AS total FROM sales GROUP BY region ORDER BY region"}),
        ),
        LlmResponse::Text {
            text: "North sold 15, south sold 7.".into(),
            usage: None,
        },
    ]));
    let agent = agent(&dir, provider.clone());

    let chunks: Vec<RunResponse> = agent
        .run("s1", "Which region sold more?", true)
        .map(|c| c.unwrap())
        .collect()
        .await;

    let started: Vec<String> = chunks
        .iter()
        .filter(|c| c.event == RunEvent::ToolCallStarted)
        .filter_map(|c| match &c.content {
            RunContent::Json(v) => v["name"].as_str().map(str::to_string),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["create_table_from_path", "run_query"]);

    // The query result went back to the model
    let last_request = &provider.requests()[2];
    let tool_outputs: Vec<&str> = last_request
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .filter_map(|m| m.content.as_text())
        .collect();
    assert_eq!(tool_outputs, vec!["sales", "region,total\nnorth,15\nsouth,7"]);

    let visible: String = stream::text_fragments(chunks.clone()).collect();
    assert!(visible.ends_with("North sold 15, south sold 7."));
    assert_eq!(
        chunks.last().unwrap().content,
        RunContent::Text("North sold 15, south sold 7.".into())
    );

    let session = agent.storage().read("s1").unwrap().unwrap();
    assert_eq!(session.runs.len(), 1);
    assert_eq!(session.runs[0].user, "Which region sold more?");
}

#[tokio::test]
async fn test_history_carries_across_submissions() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    let chat = ChatServer::new(
        ModuleId::new("chat_session"),
        "session-a",
        agent(&dir, provider.clone()),
        Vec::new(),
    );

    for text in ["first question", "second question"] {
        let stream = chat.on_user_submit(text).await.unwrap();
        let _: Vec<_> = stream.collect().await;
    }

    let second = &provider.requests()[1];
    let texts: Vec<&str> = second
        .messages
        .iter()
        .skip(1)
        .filter_map(|m| m.content.as_text())
        .collect();
    assert_eq!(
        texts,
        vec![
            "first question",
            "You said: first question",
            "second question"
        ]
    );
    assert_eq!(chat.messages().len(), 4);
}

#[tokio::test]
async fn test_sessions_do_not_share_history() {
    let dir = TempDir::new().unwrap();
    let provider = Arc::new(ScriptedProvider::new());
    let agent = agent(&dir, provider.clone());

    let _: Vec<_> = agent.run("a", "hello from a", true).collect().await;
    let _: Vec<_> = agent.run("b", "hello from b", true).collect().await;

    // system prompt + new message only
    assert_eq!(provider.requests()[1].messages.len(), 2);
    let ids = agent.storage().session_ids().unwrap();
    assert_eq!(ids.len(), 2);
}
