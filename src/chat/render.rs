//! Render half of the chat module

use super::{ChatMessage, ChatRole, ModuleId};
use pulldown_cmark::{html, Event, Options, Parser};
use serde::Serialize;

/// Height of the chat pane
pub const CHAT_HEIGHT: &str = "80vh";

/// A chat pane ready to be placed on a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatSurface {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    pub height: String,
    pub fill: bool,
}

/// Build the chat pane for `id`, pre-populated with `messages`
///
/// System messages never reach the pane.
pub fn chat_ui(id: &ModuleId, messages: &[ChatMessage]) -> ChatSurface {
    ChatSurface {
        id: id.element_id("chat"),
        messages: messages.iter().filter(|m| m.is_visible()).cloned().collect(),
        height: CHAT_HEIGHT.to_string(),
        fill: true,
    }
}

impl ChatSurface {
    pub fn to_html(&self) -> String {
        let mut out = format!(
            r#"<div id="{id}" class="chat-surface{fill}" style="height: {height}">"#,
            id = escape_html(&self.id),
            fill = if self.fill { " chat-fill" } else { "" },
            height = escape_html(&self.height),
        );
        out.push_str(r#"<div class="chat-messages">"#);
        for message in &self.messages {
            out.push_str(&render_message(message));
        }
        out.push_str("</div>");
        out.push_str(&format!(
            r#"<form class="chat-input"><textarea id="{id}_user_input" rows="1" placeholder="Enter a message..."></textarea><button type="submit">Send</button></form>"#,
            id = escape_html(&self.id),
        ));
        out.push_str("</div>");
        out
    }
}

/// One message bubble; assistant text is Markdown, user text is literal
pub(crate) fn render_message(message: &ChatMessage) -> String {
    let (class, body) = match message.role {
        ChatRole::Assistant => ("assistant", render_markdown(&message.content)),
        ChatRole::User => ("user", format!("<p>{}</p>", escape_html(&message.content))),
        ChatRole::System => ("system", escape_html(&message.content)),
    };
    format!(
        r#"<div class="chat-message chat-{class}" data-role="{class}"><div class="chat-content">{body}</div></div>"#
    )
}

/// Markdown to HTML with raw HTML shown as text
pub fn render_markdown(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let events = Parser::new_ext(text, options).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        other => other,
    });

    let mut out = String::with_capacity(text.len() * 3 / 2);
    html::push_html(&mut out, events);
    out
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
