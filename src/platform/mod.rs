pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;

/// Chat metadata carried by an incoming message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatInfo {
    pub id: i64,
    /// Public handle, without the leading `@`
    pub username: Option<String>,
    pub title: Option<String>,
}

/// A message observed in one of the monitored chats
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub message_id: i64,
    pub chat: ChatInfo,
    pub text: Option<String>,
}

/// Markup dialect the notification text is written in
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TextMode {
    #[default]
    Html,
    MarkdownV2,
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub disable_link_preview: bool,
    pub text_mode: TextMode,
}

/// Outbound transport for alerts.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, recipient: i64, text: &str, options: &SendOptions) -> Result<()>;
}
