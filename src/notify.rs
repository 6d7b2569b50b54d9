use teloxide::utils::{html, markdown};

use crate::platform::{ChatInfo, TextMode};
use crate::rules::{ChannelKey, PhraseGroup};

/// Maximum excerpt length in characters before truncation
pub const EXCERPT_LIMIT: usize = 300;

/// Everything an alert shows about one matched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationPayload {
    pub channel_name: String,
    pub phrase: Vec<String>,
    pub excerpt: String,
    pub link: String,
}

impl NotificationPayload {
    pub fn new(
        chat: &ChatInfo,
        key: &ChannelKey,
        phrase: &PhraseGroup,
        message_id: i64,
        text: &str,
    ) -> Self {
        let channel_name = chat
            .title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| key.to_string());

        Self {
            channel_name,
            phrase: phrase.tokens().to_vec(),
            excerpt: excerpt(text),
            link: message_link(chat, message_id),
        }
    }
}

/// Cut `text` to [`EXCERPT_LIMIT`] characters, appending "..." when shortened.
pub fn excerpt(text: &str) -> String {
    match text.char_indices().nth(EXCERPT_LIMIT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Deep link to a message.
///
/// Public chats link by handle. Private channels use the `t.me/c/` form,
/// which takes the chat id without Telegram's `-100` prefix.
pub fn message_link(chat: &ChatInfo, message_id: i64) -> String {
    match chat.username.as_deref().filter(|u| !u.is_empty()) {
        Some(handle) => format!("https://t.me/{}/{}", handle, message_id),
        None => {
            let id = chat.id.to_string();
            let internal = id
                .strip_prefix("-100")
                .unwrap_or_else(|| id.trim_start_matches('-'));
            format!("https://t.me/c/{}/{}", internal, message_id)
        }
    }
}

/// Render the alert text for the given markup dialect.
pub fn format(payload: &NotificationPayload, mode: TextMode) -> String {
    let escape = |s: &str| match mode {
        TextMode::Html => html::escape(s),
        TextMode::MarkdownV2 => markdown::escape(s),
        TextMode::Plain => s.to_string(),
    };
    let bold = |s: &str| match mode {
        TextMode::Html => html::bold(s),
        TextMode::MarkdownV2 => markdown::bold(s),
        TextMode::Plain => s.to_string(),
    };

    let header = escape(&format!("Match in {}", payload.channel_name));
    let mut text = format!("🔔 {}\n\n", bold(&header));
    text.push_str(&format!(
        "{} {}\n",
        bold(&escape("Phrase:")),
        escape(&payload.phrase.join(", "))
    ));
    text.push_str(&format!(
        "{} {}\n",
        bold(&escape("Message:")),
        escape(&payload.excerpt)
    ));
    text.push_str(&format!("{} {}", bold(&escape("Link:")), escape(&payload.link)));
    text
}
