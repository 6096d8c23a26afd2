//! Chatbot module - relays Telegram messages to Gemini models.

pub mod backend;
pub mod context;
pub mod engine;
pub mod events;
pub mod gemini;
pub mod message;
pub mod provider;
pub mod retry;
pub mod router;
pub mod telegram;
pub mod usage;
pub mod whisper;

pub use engine::{ChatbotEngine, EngineConfig};
pub use message::{ChatMessage, IncomingMessage, ReplyTo};
pub use provider::{GenerationClient, ModelProvider};
pub use telegram::{ChatApi, TelegramClient};
pub use whisper::Whisper;

#[cfg(test)]
mod tests;
