//! Chatbot engine - turns incoming Telegram messages into replies.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono_tz::Tz;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::chatbot::context::ConversationStore;
use crate::chatbot::message::{ChatMessage, IncomingMessage, MediaRef, BOT_SENDER};
use crate::chatbot::provider::{ModelProvider, ProviderError};
use crate::chatbot::telegram::ChatApi;
use crate::chatbot::whisper::Whisper;

pub const GREETING: &str = "Hello! I am your speech-to-text bot.";
pub const APOLOGY: &str = "Sorry, something went wrong while processing your message.";
pub const TRY_AGAIN_LATER: &str = "Sorry, I can't answer right now. Please try again later.";
pub const NO_EVENT_FOUND: &str = "Sorry, I couldn't find an event in this image.";
pub const EVENT_FAILED: &str =
    "Sorry, I couldn't process the photo. Please make sure it contains clear event information.";
pub const LOW_CONFIDENCE_WARNING: &str =
    "I'm not very confident about the event details, please double-check them.";

const PROMPT_SEPARATOR: &str = "\n---\n";
/// Prompts longer than this are logged with the middle cut out.
const PROMPT_LOG_LIMIT: usize = 1024;

#[derive(Debug)]
pub enum EngineError {
    Telegram(String),
    Transcription(String),
    Provider(ProviderError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Telegram(e) => write!(f, "Telegram error: {e}"),
            EngineError::Transcription(e) => write!(f, "Transcription error: {e}"),
            EngineError::Provider(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Provider(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        EngineError::Provider(e)
    }
}

/// Engine settings, derived from the config file at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chat and user IDs the bot answers to.
    pub allowed_ids: HashSet<i64>,
    /// Lowercased, without `@`.
    pub bot_username: Option<String>,
    /// Lowercased.
    pub aliases: Vec<String>,
    pub message_handling: bool,
    pub schedule_events: bool,
    pub reactions: bool,
    pub token_limit: usize,
    pub history_limit: usize,
    pub timezone: Tz,
}

/// Text of an incoming message and where it came from.
#[derive(Debug, Clone, PartialEq)]
enum Resolved {
    Plain(String),
    /// Transcribed voice or text read from an image.
    FromMedia(String),
}

impl Resolved {
    fn text(&self) -> &str {
        match self {
            Resolved::Plain(t) | Resolved::FromMedia(t) => t,
        }
    }
}

/// The chatbot engine.
pub struct ChatbotEngine<P, T> {
    config: EngineConfig,
    provider: Arc<P>,
    telegram: Arc<T>,
    whisper: Option<Arc<Whisper>>,
    store: Mutex<ConversationStore>,
}

impl<P: ModelProvider, T: ChatApi> ChatbotEngine<P, T> {
    pub fn new(
        config: EngineConfig,
        provider: Arc<P>,
        telegram: Arc<T>,
        whisper: Option<Arc<Whisper>>,
    ) -> Self {
        let store = ConversationStore::new(config.history_limit);
        Self {
            config,
            provider,
            telegram,
            whisper,
            store: Mutex::new(store),
        }
    }

    pub fn is_allowed(&self, chat_id: i64, user_id: i64) -> bool {
        self.config.allowed_ids.contains(&chat_id) || self.config.allowed_ids.contains(&user_id)
    }

    /// Reply to `/hi`.
    pub async fn handle_hi(&self, chat_id: i64, user_id: i64, message_id: i64) {
        if !self.is_allowed(chat_id, user_id) {
            warn!("Unauthorized /hi by user {} in chat {}", user_id, chat_id);
            return;
        }
        if let Err(e) = self.telegram.send_message(chat_id, GREETING, Some(message_id)).await {
            warn!("Failed to greet: {e}");
        }
    }

    /// Handle an incoming message.
    pub async fn handle_message(&self, msg: IncomingMessage) {
        if !self.is_allowed(msg.chat_id, msg.user_id) {
            warn!(
                "Unauthorized access attempt by user {} in chat {}",
                msg.user_id, msg.chat_id
            );
            return;
        }

        if let Err(e) = self.process_message(&msg).await {
            error!(
                "Failed to handle message {} from user {} in chat {}: {e}",
                msg.message_id, msg.user_id, msg.chat_id
            );
            if let Err(e) = self
                .telegram
                .send_message(msg.chat_id, APOLOGY, Some(msg.message_id))
                .await
            {
                warn!("Failed to send apology: {e}");
            }
        }
    }

    /// Handle a message edit. Edits only update context.
    pub async fn handle_edit(&self, chat_id: i64, user_id: i64, message_id: i64, new_text: &str) {
        if !self.is_allowed(chat_id, user_id) {
            return;
        }
        let updated = self.store.lock().await.edit_message(chat_id, message_id, new_text);
        debug!("Edit of msg {} in chat {} (known: {})", message_id, chat_id, updated);
    }

    async fn process_message(&self, msg: &IncomingMessage) -> Result<(), EngineError> {
        if self.config.schedule_events
            && let Some(photo) = &msg.photo
        {
            return self.handle_event_photo(msg, photo).await;
        }
        if !self.config.message_handling {
            return Ok(());
        }

        let resolved = self.resolve_text(msg).await?;
        let text = resolved.text();
        if text.trim().is_empty() {
            debug!("Nothing to handle in msg {}", msg.message_id);
            return Ok(());
        }
        info!(
            "📨 {} ({}): \"{}\"",
            msg.sender,
            msg.user_id,
            text.chars().take(50).collect::<String>()
        );

        // Context is assembled before the message joins it; the message
        // itself goes after the separator.
        let context = {
            let mut store = self.store.lock().await;
            let context = store.assemble(msg.chat_id, self.config.token_limit);
            store.add_message(ChatMessage {
                message_id: msg.message_id,
                chat_id: msg.chat_id,
                user_id: msg.user_id,
                sender: msg.sender.clone(),
                text: text.to_string(),
                is_bot: false,
                reply_to: msg.reply_to.clone(),
            });
            context
        };

        if !is_addressed(
            text,
            msg.reply_to_bot,
            self.config.bot_username.as_deref(),
            &self.config.aliases,
        ) {
            return self.handle_unaddressed(msg, &resolved).await;
        }

        self.send_typing(msg.chat_id).await;
        let prompt = build_prompt(&context, &msg.sender, text);
        debug!("Generated prompt: {}", trim_for_log(&prompt, PROMPT_LOG_LIMIT));

        let response = self.provider.generate(&prompt).await?;
        if response.is_empty() {
            warn!("No answer for msg {} in chat {}", msg.message_id, msg.chat_id);
            self.reply(msg, TRY_AGAIN_LATER).await?;
            return Ok(());
        }

        let reply = format_reply(&resolved, &response);
        let reply_id = self.reply(msg, &reply).await?;

        self.store.lock().await.add_message(ChatMessage {
            message_id: reply_id,
            chat_id: msg.chat_id,
            user_id: 0,
            sender: BOT_SENDER.to_string(),
            text: response,
            is_bot: true,
            reply_to: None,
        });
        Ok(())
    }

    async fn handle_unaddressed(
        &self,
        msg: &IncomingMessage,
        resolved: &Resolved,
    ) -> Result<(), EngineError> {
        match resolved {
            Resolved::FromMedia(text) => {
                self.send_typing(msg.chat_id).await;
                self.reply(msg, text).await?;
            }
            Resolved::Plain(text) if self.config.reactions => {
                // A missing reaction is not worth an apology.
                match self.provider.choose_reaction(text).await {
                    Ok(Some(emoji)) => {
                        if let Err(e) = self
                            .telegram
                            .set_message_reaction(msg.chat_id, msg.message_id, &emoji)
                            .await
                        {
                            warn!("Failed to react to msg {}: {e}", msg.message_id);
                        }
                    }
                    Ok(None) => debug!("No reaction for msg {}", msg.message_id),
                    Err(e) => warn!("Failed to choose reaction: {e}"),
                }
            }
            Resolved::Plain(_) => {}
        }
        Ok(())
    }

    async fn resolve_text(&self, msg: &IncomingMessage) -> Result<Resolved, EngineError> {
        if let Some(voice) = &msg.voice {
            let audio = self.download(voice).await?;
            let text = self.transcribe(audio, &voice.mime_type).await?;
            debug!("Received voice message \"{}\" from {}", text, msg.user_id);
            return Ok(Resolved::FromMedia(text));
        }

        if let Some(photo) = &msg.photo {
            let image = self.download(photo).await?;
            let extracted = self.provider.image_to_text(&image, &photo.mime_type).await?;
            let text = match msg.caption.as_deref().map(str::trim) {
                Some(caption) if !caption.is_empty() => {
                    format!("{caption}\n{extracted}").trim().to_string()
                }
                _ => extracted,
            };
            debug!("Received photo -> text \"{}\" from {}", text, msg.user_id);
            return Ok(Resolved::FromMedia(text));
        }

        let text = msg
            .text
            .clone()
            .or_else(|| msg.caption.clone())
            .unwrap_or_default();
        Ok(Resolved::Plain(text))
    }

    async fn transcribe(&self, audio: Vec<u8>, mime_type: &str) -> Result<String, EngineError> {
        match &self.whisper {
            Some(whisper) => {
                let whisper = whisper.clone();
                tokio::task::spawn_blocking(move || whisper.transcribe(&audio))
                    .await
                    .map_err(|e| EngineError::Transcription(format!("Whisper task failed: {e}")))?
                    .map_err(EngineError::Transcription)
            }
            None => Ok(self.provider.transcribe(&audio, mime_type).await?),
        }
    }

    async fn handle_event_photo(
        &self,
        msg: &IncomingMessage,
        photo: &MediaRef,
    ) -> Result<(), EngineError> {
        self.send_typing(msg.chat_id).await;

        let image = self.download(photo).await?;
        let event = match self.provider.parse_image_to_event(&image, &photo.mime_type).await {
            Ok(event) => event,
            Err(e) => {
                error!("Photo processing failed for user {}: {e}", msg.user_id);
                self.reply(msg, EVENT_FAILED).await?;
                return Ok(());
            }
        };

        if event.is_empty() {
            info!("No event found in photo msg {}", msg.message_id);
            self.reply(msg, NO_EVENT_FOUND).await?;
            return Ok(());
        }
        if event.is_low_confidence() {
            self.reply(msg, LOW_CONFIDENCE_WARNING).await?;
        }

        match event.summary(self.config.timezone) {
            Ok(summary) => {
                self.reply(msg, &summary).await?;
            }
            Err(e) => {
                error!("Photo processing failed for user {}: {e}", msg.user_id);
                self.reply(msg, EVENT_FAILED).await?;
            }
        }
        Ok(())
    }

    async fn download(&self, media: &MediaRef) -> Result<Vec<u8>, EngineError> {
        self.telegram
            .download_file(&media.file_id)
            .await
            .map_err(EngineError::Telegram)
    }

    async fn reply(&self, msg: &IncomingMessage, text: &str) -> Result<i64, EngineError> {
        self.telegram
            .send_message(msg.chat_id, text, Some(msg.message_id))
            .await
            .map_err(EngineError::Telegram)
    }

    async fn send_typing(&self, chat_id: i64) {
        if let Err(e) = self.telegram.send_typing(chat_id).await {
            debug!("{e}");
        }
    }
}

/// Mentions an alias or the bot's username, or replies to the bot.
pub fn is_addressed(
    text: &str,
    reply_to_bot: bool,
    bot_username: Option<&str>,
    aliases: &[String],
) -> bool {
    if reply_to_bot {
        return true;
    }
    let text = text.to_lowercase();
    aliases
        .iter()
        .map(String::as_str)
        .chain(bot_username)
        .filter(|name| !name.is_empty())
        .any(|name| text.contains(name))
}

pub fn build_prompt(context: &str, sender: &str, text: &str) -> String {
    format!("{context}{PROMPT_SEPARATOR}{sender}: {text}")
}

/// Keep the first and last `limit / 2` bytes of long text.
pub fn trim_for_log(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let half = limit / 2;
    let mut head = half;
    while !text.is_char_boundary(head) {
        head -= 1;
    }
    let mut tail = text.len() - half;
    while !text.is_char_boundary(tail) {
        tail += 1;
    }
    format!("{}\n...\n{}", &text[..head], &text[tail..])
}

/// Quote the recognized text above answers to media.
fn format_reply(resolved: &Resolved, response: &str) -> String {
    match resolved {
        Resolved::FromMedia(text) => format!(">>{text}\n\n{response}"),
        Resolved::Plain(_) => response.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases() -> Vec<String> {
        vec!["vox".to_string(), "бот".to_string()]
    }

    #[test]
    fn test_addressed_by_alias_case_insensitive() {
        assert!(is_addressed("Hey VOX, what's up?", false, None, &aliases()));
        assert!(is_addressed("Бот, привет", false, None, &aliases()));
    }

    #[test]
    fn test_addressed_by_username() {
        assert!(is_addressed("@VoxRelay_Bot ping", false, Some("voxrelay_bot"), &[]));
    }

    #[test]
    fn test_addressed_by_reply() {
        assert!(is_addressed("ok", true, Some("voxrelay_bot"), &[]));
    }

    #[test]
    fn test_not_addressed() {
        assert!(!is_addressed("hello everyone", false, Some("voxrelay_bot"), &aliases()));
        assert!(!is_addressed("anything", false, None, &[String::new()]));
    }

    #[test]
    fn test_build_prompt() {
        assert_eq!(
            build_prompt("Ann: hi\nBob: yo", "Ann", "vox, thoughts?"),
            "Ann: hi\nBob: yo\n---\nAnn: vox, thoughts?"
        );
    }

    #[test]
    fn test_trim_for_log() {
        assert_eq!(trim_for_log("short", 1024), "short");

        let long = format!("{}{}", "a".repeat(600), "b".repeat(600));
        let trimmed = trim_for_log(&long, 1024);
        assert!(trimmed.starts_with(&"a".repeat(512)));
        assert!(trimmed.ends_with(&"b".repeat(512)));
        assert!(trimmed.contains("\n...\n"));
        assert_eq!(trimmed.len(), 1024 + "\n...\n".len());
    }

    #[test]
    fn test_trim_for_log_multibyte() {
        let long = "я".repeat(700);
        let trimmed = trim_for_log(&long, 1024);
        assert!(trimmed.contains("\n...\n"));
    }

    #[test]
    fn test_format_reply() {
        let media = Resolved::FromMedia("what time is it".to_string());
        assert_eq!(format_reply(&media, "noon"), ">>what time is it\n\nnoon");
        let plain = Resolved::Plain("what time is it".to_string());
        assert_eq!(format_reply(&plain, "noon"), "noon");
    }
}
