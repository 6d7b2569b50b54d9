use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use teloxide::dispatching::ShutdownToken;
use teloxide::prelude::*;
use teloxide::types::{LinkPreviewOptions, ParseMode};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ChatInfo, MessageEvent, NotificationSink, SendOptions, TextMode};

/// Convert a Telegram message into the engine's event shape.
/// Media posts carry their text in the caption.
pub fn event_from_message(msg: &Message) -> MessageEvent {
    MessageEvent {
        message_id: i64::from(msg.id.0),
        chat: ChatInfo {
            id: msg.chat.id.0,
            username: msg.chat.username().map(str::to_string),
            title: msg.chat.title().map(str::to_string),
        },
        text: msg.text().or_else(|| msg.caption()).map(str::to_string),
    }
}

/// Receives channel posts and chat messages and forwards them as events.
pub struct Listener {
    token: ShutdownToken,
    task: JoinHandle<()>,
}

impl Listener {
    /// Start polling for updates. Events arrive on the returned stream until
    /// the listener is stopped or the dispatcher exits.
    pub fn start(bot: Bot) -> (Self, UnboundedReceiver<MessageEvent>) {
        let (tx, rx) = mpsc::unbounded();

        let handler = dptree::entry()
            .branch(Update::filter_channel_post().endpoint(forward_message))
            .branch(Update::filter_message().endpoint(forward_message));

        let mut dispatcher = Dispatcher::builder(bot, handler)
            .dependencies(dptree::deps![tx])
            .default_handler(|upd| async move {
                debug!("Ignoring update: {:?}", upd.id);
            })
            .error_handler(LoggingErrorHandler::with_custom_text("listener"))
            .build();

        let token = dispatcher.shutdown_token();
        let task = tokio::spawn(async move {
            info!("Starting Telegram listener...");
            dispatcher.dispatch().await;
            info!("Telegram listener stopped");
        });

        (Self { token, task }, rx)
    }

    /// Stop polling for updates. Resolves once the dispatcher has finished
    /// forwarding everything it already fetched.
    pub async fn halt(&self) {
        match self.token.shutdown() {
            Ok(done) => done.await,
            Err(_) => debug!("Telegram listener was not running"),
        }
    }

    /// Wait for the dispatcher task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Telegram listener task failed: {}", e);
        }
    }
}

async fn forward_message(
    msg: Message,
    events: UnboundedSender<MessageEvent>,
) -> ResponseResult<()> {
    let event = event_from_message(&msg);
    debug!(
        "Received message {} from chat {}",
        event.message_id, event.chat.id
    );
    if events.unbounded_send(event).is_err() {
        warn!("Event stream closed, dropping message {}", msg.id.0);
    }
    Ok(())
}

/// Delivers alerts through the Bot API.
pub struct TelegramSink {
    bot: Bot,
}

impl TelegramSink {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn deliver(&self, recipient: i64, text: &str, options: &SendOptions) -> Result<()> {
        let mut request = self.bot.send_message(ChatId(recipient), text);

        match options.text_mode {
            TextMode::Html => request = request.parse_mode(ParseMode::Html),
            TextMode::MarkdownV2 => request = request.parse_mode(ParseMode::MarkdownV2),
            TextMode::Plain => {}
        }

        if options.disable_link_preview {
            request = request.link_preview_options(LinkPreviewOptions {
                is_disabled: true,
                url: None,
                prefer_small_media: false,
                prefer_large_media: false,
                show_above_text: false,
            });
        }

        request
            .await
            .with_context(|| format!("Failed to send notification to {}", recipient))?;
        Ok(())
    }
}
