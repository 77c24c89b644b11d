//! Analyst agent: prompt assembly, tool loop and run streaming

mod context;
mod run;

pub use context::ConversationContext;
pub use run::{Agent, RunContent, RunEvent, RunResponse, RunStream};
