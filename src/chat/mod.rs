//! Chat module: a rendered chat pane plus the session that feeds it
//!
//! The render half ([`chat_ui`]) turns a message list into a [`ChatSurface`];
//! the reactive half ([`ChatServer`]) answers submissions by running the agent
//! and streaming its text back. Both are keyed by the same [`ModuleId`] so the
//! page and its session agree on element ids.

mod render;
mod server;

pub use render::{chat_ui, render_markdown, ChatSurface, CHAT_HEIGHT};
pub(crate) use render::{escape_html, render_message};
pub use server::{ChatServer, FragmentStream};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Namespace that scopes element ids of one chat module instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self(namespace.into())
    }

    pub fn namespace(&self) -> &str {
        &self.0
    }

    /// Id of an element inside this module, e.g. `chat_session-chat`
    pub fn element_id(&self, name: &str) -> String {
        format!("{}-{}", self.0, name)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One entry of the chat pane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }

    /// Whether the message is shown in the chat pane
    pub fn is_visible(&self) -> bool {
        self.role != ChatRole::System
    }
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Chat session not found: {0}")]
    SessionNotFound(String),

    #[error("Chat session has been closed")]
    Closed,

    #[error("Message is empty")]
    EmptyMessage,
}
