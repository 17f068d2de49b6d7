use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::{debug, info, warn};

use crate::platform::{ChatSender, DeliveryStatus, IncomingMessage};
use crate::plugins::PluginHost;

/// Telegram caps messages at 4096 characters; stay a little under.
const MAX_MESSAGE_LEN: usize = 4000;

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        // A single character wider than max_len still has to go out
        if end == start {
            end += text[start..].chars().next().map_or(1, char::len_utf8);
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Plugin replies go out through the bot, one message per chunk.
pub struct TelegramSender {
    bot: Bot,
}

impl TelegramSender {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatSender for TelegramSender {
    async fn send(&self, conversation: &str, text: &str) -> Result<()> {
        let chat_id: i64 = conversation
            .parse()
            .with_context(|| format!("Not a Telegram chat id: {}", conversation))?;

        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            self.bot
                .send_message(ChatId(chat_id), chunk)
                .await
                .with_context(|| format!("Failed to send message to chat {}", chat_id))?;
        }
        Ok(())
    }
}

fn is_allowed(allowed_user_ids: &[u64], user_id: u64) -> bool {
    allowed_user_ids.is_empty() || allowed_user_ids.contains(&user_id)
}

/// Run the Telegram bot platform until Ctrl-C
pub async fn run(host: Arc<PluginHost>, allowed_user_ids: Vec<u64>, bot: Bot) -> Result<()> {
    info!("Starting Telegram platform...");

    let handler = Update::filter_message()
        .filter_map(move |msg: Message| {
            let user = msg.from.as_ref()?;
            if is_allowed(&allowed_user_ids, user.id.0) {
                Some(msg)
            } else {
                debug!("Ignoring message from user {}", user.id.0);
                None
            }
        })
        .endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![host])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(msg: Message, host: Arc<PluginHost>) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };

    debug!("Telegram message from {} ({})", user.full_name(), user.id.0);

    let incoming = IncomingMessage {
        sender_id: user.id.0.to_string(),
        sender_display_name: user.full_name(),
        body: text.to_string(),
        conversation: msg.chat.id.0.to_string(),
    };

    // Fire and forget: plugins reply on their own through the sender.
    host.dispatch(incoming, DeliveryStatus::Received);
    Ok(())
}
