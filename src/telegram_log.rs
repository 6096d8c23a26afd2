//! Forwards errors and warnings to the admin chat.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatId;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Telegram rejects longer messages.
const MAX_MESSAGE_CHARS: usize = 4000;
/// Batched warnings are flushed early past this many.
const MAX_BATCH: usize = 50;
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Log message with priority.
#[derive(Debug, PartialEq)]
enum LogMessage {
    /// ERROR - send immediately
    Urgent(String),
    /// WARN - batch and send periodically
    Batched(String),
}

pub struct AdminLogLayer {
    tx: mpsc::UnboundedSender<LogMessage>,
}

impl AdminLogLayer {
    /// Must be called inside a Tokio runtime.
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogMessage>();

        tokio::spawn(async move {
            let mut buffer: Vec<String> = Vec::new();
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        match msg {
                            Some(LogMessage::Urgent(text)) => {
                                send_log(&bot, chat_id, &text).await;
                            }
                            Some(LogMessage::Batched(text)) => {
                                buffer.push(text);
                                if buffer.len() >= MAX_BATCH {
                                    flush_buffer(&bot, chat_id, &mut buffer).await;
                                }
                            }
                            None => {
                                flush_buffer(&bot, chat_id, &mut buffer).await;
                                break;
                            }
                        }
                    }
                    _ = interval.tick() => {
                        flush_buffer(&bot, chat_id, &mut buffer).await;
                    }
                }
            }
        });

        Self { tx }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max).collect();
    format!("{}...", truncated)
}

async fn send_log(bot: &Bot, chat_id: ChatId, text: &str) {
    let text = truncate_chars(text, MAX_MESSAGE_CHARS);
    // Not logged through tracing, that would feed back into this layer.
    if let Err(e) = bot.send_message(chat_id, &text).await {
        eprintln!("Failed to send log to admin chat: {e}");
    }
}

async fn flush_buffer(bot: &Bot, chat_id: ChatId, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let combined = buffer.join("\n");
    buffer.clear();
    send_log(bot, chat_id, &combined).await;
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else if self.message.is_empty() {
            self.message = format!("{} = {:?}", field.name(), value);
        } else {
            self.message
                .push_str(&format!(", {} = {:?}", field.name(), value));
        }
    }
}

/// Priority for an event, None if it stays out of the admin chat.
fn classify(level: Level, message: String) -> Option<LogMessage> {
    match level {
        Level::ERROR => Some(LogMessage::Urgent(format!("❌ {}", message))),
        Level::WARN => Some(LogMessage::Batched(format!("⚠️ {}", message))),
        _ => None,
    }
}

impl<S: Subscriber> Layer<S> for AdminLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        if let Some(msg) = classify(level, visitor.message)
            && self.tx.send(msg).is_err()
        {
            eprintln!("Log channel closed, message dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_levels() {
        assert_eq!(
            classify(Level::ERROR, "boom".to_string()),
            Some(LogMessage::Urgent("❌ boom".to_string()))
        );
        assert_eq!(
            classify(Level::WARN, "careful".to_string()),
            Some(LogMessage::Batched("⚠️ careful".to_string()))
        );
        assert_eq!(classify(Level::INFO, "fyi".to_string()), None);
        assert_eq!(classify(Level::DEBUG, "noise".to_string()), None);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("ошибка", 3), "оши...");
    }
}
