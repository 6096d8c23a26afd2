//! Telegram client using teloxide.

use std::future::Future;

use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, FileId, MessageId, ReactionType, ReplyParameters};
use tracing::{debug, info, warn};

/// Chat operations the engine needs.
pub trait ChatApi: Send + Sync {
    /// Send plain text, optionally as a reply. Returns the new message ID.
    fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> impl Future<Output = Result<i64, String>> + Send;

    fn send_typing(&self, chat_id: i64) -> impl Future<Output = Result<(), String>> + Send;

    fn set_message_reaction(
        &self,
        chat_id: i64,
        message_id: i64,
        emoji: &str,
    ) -> impl Future<Output = Result<(), String>> + Send;

    /// Download a file by file_id.
    fn download_file(&self, file_id: &str) -> impl Future<Output = Result<Vec<u8>, String>> + Send;
}

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

impl ChatApi for TelegramClient {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, String> {
        let mut request = self.bot.send_message(ChatId(chat_id), text);

        if let Some(msg_id) = reply_to_message_id {
            let reply_params = ReplyParameters::new(MessageId(msg_id as i32));
            request = request.reply_parameters(reply_params);
        }

        request.await.map(|msg| msg.id.0 as i64).map_err(|e| {
            let msg = format!("Failed to send: {e}");
            warn!("{}", msg);
            msg
        })
    }

    async fn send_typing(&self, chat_id: i64) -> Result<(), String> {
        self.bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
            .map(|_| ())
            .map_err(|e| format!("Failed to send typing action: {e}"))
    }

    async fn set_message_reaction(
        &self,
        chat_id: i64,
        message_id: i64,
        emoji: &str,
    ) -> Result<(), String> {
        info!("Adding reaction {} to msg {} in chat {}", emoji, message_id, chat_id);

        let reaction = ReactionType::Emoji {
            emoji: emoji.to_string(),
        };

        self.bot
            .set_message_reaction(ChatId(chat_id), MessageId(message_id as i32))
            .reaction(vec![reaction])
            .await
            .map_err(|e| {
                let msg = format!("Failed to add reaction: {e}");
                warn!("{}", msg);
                msg
            })?;

        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, String> {
        let file = self
            .bot
            .get_file(FileId(file_id.to_string()))
            .await
            .map_err(|e| format!("Failed to get file info: {e}"))?;

        let mut data = Vec::new();
        self.bot
            .download_file(&file.path, &mut data)
            .await
            .map_err(|e| format!("Failed to download file: {e}"))?;

        debug!("Downloaded {} ({} bytes)", file.path, data.len());
        Ok(data)
    }
}
