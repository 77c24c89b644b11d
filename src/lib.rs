//! analyst-chat: browser chat with a data-analyst agent
//!
//! This library provides:
//! - An agent that answers with file, SQL (SQLite) and web search tools
//! - Persistent sessions, user memories and session summaries
//! - A chat module rendering the conversation and streaming answers
//! - An HTTP server hosting the chat page

pub mod agent;
pub mod chat;
pub mod config;
pub mod dev;
pub mod llm;
pub mod memory;
pub mod storage;
pub mod stream;
pub mod tools;
pub mod transport;
pub mod ui;

pub use agent::Agent;
pub use config::Config;
