//! Page layout around the chat pane

use crate::chat::{escape_html, ChatSurface};

pub const PAGE_TITLE: &str = "Agent Chat";

/// Full-width page shell with the chat assets linked
pub fn page_fluid(title: &str, body: &str, reload: bool) -> String {
    let reload_attr = if reload { r#" data-reload="/dev/reload""# } else { "" };
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
<link rel="stylesheet" href="/static/chat.css">
</head>
<body class="container-fluid"{reload_attr}>
{body}
<script src="/static/chat.js" defer></script>
</body>
</html>
"#,
        title = escape_html(title),
    )
}

pub fn card(header: &str, body: &str) -> String {
    format!(
        r#"<div class="card"><div class="card-header">{}</div><div class="card-body">{}</div></div>"#,
        escape_html(header),
        body
    )
}

/// The app: one card whose output slot holds the session's chat pane
pub fn app_page(session_id: &str, chat: &ChatSurface, reload: bool) -> String {
    let slot = format!(
        r#"<div class="chat-output" data-session="{}">{}</div>"#,
        escape_html(session_id),
        chat.to_html()
    );
    page_fluid(PAGE_TITLE, &card(PAGE_TITLE, &slot), reload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{chat_ui, ModuleId};

    #[test]
    fn test_page_holds_card_and_chat() {
        let surface = chat_ui(&ModuleId::new("chat_session"), &[]);
        let html = app_page("abc", &surface, false);

        assert!(html.contains(r#"<div class="card-header">Agent Chat</div>"#));
        assert!(html.contains(r#"data-session="abc""#));
        assert!(html.contains(r#"id="chat_session-chat""#));
        assert!(html.contains("/static/chat.js"));
        assert!(!html.contains("data-reload"));
    }

    #[test]
    fn test_reload_hook_only_when_enabled() {
        let surface = chat_ui(&ModuleId::new("chat_session"), &[]);
        assert!(app_page("abc", &surface, true).contains(r#"data-reload="/dev/reload""#));
    }
}
