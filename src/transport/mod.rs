//! Transport layer: the HTTP server behind the chat page

pub mod http;

pub use http::{router, run_http_server, AppState};
