//! Adapters from agent run chunks to user-visible text
//!
//! Only `RunResponse` chunks with text content carry output meant for the
//! chat pane; tool notifications and lifecycle markers are dropped.

use crate::agent::{RunContent, RunEvent, RunResponse};
use anyhow::Result;
use futures::{Stream, StreamExt};

/// Text of a chunk when it is incremental user-visible output
pub fn visible_text(chunk: &RunResponse) -> Option<&str> {
    match (&chunk.event, &chunk.content) {
        (RunEvent::RunResponse, RunContent::Text(text)) => Some(text),
        _ => None,
    }
}

/// Synchronous form over an iterator of chunks
pub fn text_fragments<I>(chunks: I) -> impl Iterator<Item = String>
where
    I: IntoIterator<Item = RunResponse>,
{
    chunks.into_iter().filter_map(|chunk| match chunk {
        RunResponse {
            event: RunEvent::RunResponse,
            content: RunContent::Text(text),
            ..
        } => Some(text),
        _ => None,
    })
}

/// Async form over a run stream; errors pass through unchanged
pub fn as_stream<S>(chunks: S) -> impl Stream<Item = Result<String>>
where
    S: Stream<Item = Result<RunResponse>>,
{
    chunks.filter_map(|item| async move {
        match item {
            Ok(RunResponse {
                event: RunEvent::RunResponse,
                content: RunContent::Text(text),
                ..
            }) => Some(Ok(text)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }
    })
}
