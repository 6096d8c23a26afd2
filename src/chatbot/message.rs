//! Chat message types and their prompt formatting.

/// Content quoted when replying to another message.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyTo {
    pub message_id: i64,
    pub sender: String,
    pub text: String,
}

/// A message kept in a chat's context.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub sender: String,
    pub text: String,
    pub is_bot: bool,
    pub reply_to: Option<ReplyTo>,
}

/// A Telegram file to download.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRef {
    pub file_id: String,
    pub mime_type: String,
}

/// A message as it arrives, before media is resolved to text.
#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub message_id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub sender: String,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub voice: Option<MediaRef>,
    /// Largest available photo size.
    pub photo: Option<MediaRef>,
    pub reply_to: Option<ReplyTo>,
    /// The message replies to one of the bot's messages.
    pub reply_to_bot: bool,
}

/// Max chars to include from quoted reply.
const MAX_QUOTE_LENGTH: usize = 200;

/// Sender label used for the bot's own messages.
pub const BOT_SENDER: &str = "Bot";

/// Safely truncate a string at a char boundary.
fn truncate_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl ChatMessage {
    /// Format as a `Sender: text` context line.
    ///
    /// ```text
    /// Bob (replying to Alice: "what about rust?"): yeah I agree
    /// ```
    pub fn format(&self) -> String {
        let sender = if self.is_bot { BOT_SENDER } else { self.sender.as_str() };

        match self.reply_to {
            Some(ref reply) => {
                let quoted = if reply.text.len() > MAX_QUOTE_LENGTH {
                    format!("{}...", truncate_safe(&reply.text, MAX_QUOTE_LENGTH))
                } else {
                    reply.text.clone()
                };
                format!(
                    "{} (replying to {}: {:?}): {}",
                    sender,
                    reply.sender,
                    quoted,
                    self.text.trim()
                )
            }
            None => format!("{}: {}", sender, self.text.trim()),
        }
    }
}
