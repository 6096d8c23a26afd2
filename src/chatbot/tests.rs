//! Cross-module tests for the chatbot: model fallback through the
//! generation client, and full message flows through the engine.
//!
//! Run with: cargo test chatbot

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use regex::Regex;

use super::backend::{Backend, BackendError, BackendResponse, GenerateConfig, Part, Tool};
use super::engine::{self, ChatbotEngine, EngineConfig};
use super::message::{IncomingMessage, MediaRef};
use super::provider::{
    Capabilities, CapabilityRule, GenerationClient, GenerationSettings, ModelCatalog, ModelProvider,
    ProviderError,
};
use super::router::tests::{day, ManualClock};
use super::router::ModelRouter;
use super::telegram::ChatApi;
use super::usage::ModelSpec;

// =============================================================================
// TEST DOUBLES
// =============================================================================

#[derive(Debug, Clone)]
struct Call {
    model: String,
    contents: Vec<Part>,
    config: GenerateConfig,
}

#[derive(Default)]
struct FakeState {
    scripts: HashMap<String, VecDeque<Result<String, BackendError>>>,
    calls: Vec<Call>,
    list_calls: u32,
}

/// Backend answering from per-model scripts, `ok from {model}` by default.
#[derive(Clone, Default)]
struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    fn script(&self, model: &str, response: Result<&str, BackendError>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .entry(model.to_string())
            .or_default()
            .push_back(response.map(str::to_string));
    }

    fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn models_called(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.model).collect()
    }

    fn list_calls(&self) -> u32 {
        self.state.lock().unwrap().list_calls
    }

    /// Last text part of the most recent call.
    fn last_prompt(&self) -> String {
        self.calls()
            .last()
            .and_then(|c| {
                c.contents.iter().rev().find_map(|p| match p {
                    Part::Text(t) => Some(t.clone()),
                    Part::InlineData { .. } => None,
                })
            })
            .unwrap_or_default()
    }
}

impl Backend for FakeBackend {
    async fn generate_content(
        &self,
        model: &str,
        contents: &[Part],
        config: &GenerateConfig,
    ) -> Result<BackendResponse, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            model: model.to_string(),
            contents: contents.to_vec(),
            config: config.clone(),
        });
        state
            .scripts
            .get_mut(model)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(format!("ok from {model}")))
            .map(|text| BackendResponse { text })
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        Ok(vec!["gemini-2.5-flash".to_string()])
    }
}

fn quota() -> BackendError {
    BackendError::ResourceExhausted("429 RESOURCE_EXHAUSTED".to_string())
}

fn not_found() -> BackendError {
    BackendError::NotFound("models/gone is not found".to_string())
}

fn catalog(models: Vec<ModelSpec>) -> ModelCatalog {
    ModelCatalog {
        generation_models: models.clone(),
        transcription_models: models.clone(),
        reaction_models: models,
        reaction_preferred_family: None,
        thinking_budget: None,
        search_enabled: false,
        capability_rules: vec![CapabilityRule {
            pattern: Regex::new("^gemma").unwrap(),
            capabilities: Capabilities::NONE,
        }],
    }
}

struct Harness {
    client: GenerationClient<FakeBackend>,
    backend: FakeBackend,
    clock: Arc<ManualClock>,
}

fn harness_with(catalog: ModelCatalog, prompt_prefix: Option<&str>) -> Harness {
    let backend = FakeBackend::default();
    let clock = Arc::new(ManualClock::new(day(1)));
    let router = Arc::new(ModelRouter::new(clock.clone()));
    let client = GenerationClient::new(
        backend.clone(),
        router,
        Arc::new(RwLock::new(catalog)),
        GenerationSettings {
            language: "ru".to_string(),
            prompt_prefix: prompt_prefix.map(str::to_string),
        },
    );
    Harness {
        client,
        backend,
        clock,
    }
}

fn harness(models: Vec<ModelSpec>) -> Harness {
    harness_with(catalog(models), None)
}

#[derive(Debug, Clone, PartialEq)]
struct Sent {
    chat_id: i64,
    text: String,
    reply_to: Option<i64>,
}

/// Telegram double that records everything the engine does.
#[derive(Default)]
struct MockTelegram {
    sent: Mutex<Vec<Sent>>,
    reactions: Mutex<Vec<(i64, i64, String)>>,
    typing: Mutex<Vec<i64>>,
    files: HashMap<String, Vec<u8>>,
    next_id: AtomicI64,
}

impl MockTelegram {
    fn with_file(mut self, file_id: &str, data: &[u8]) -> Self {
        self.files.insert(file_id.to_string(), data.to_vec());
        self
    }

    fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|s| s.text.clone()).collect()
    }
}

impl ChatApi for MockTelegram {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> Result<i64, String> {
        self.sent.lock().unwrap().push(Sent {
            chat_id,
            text: text.to_string(),
            reply_to: reply_to_message_id,
        });
        Ok(1000 + self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn send_typing(&self, chat_id: i64) -> Result<(), String> {
        self.typing.lock().unwrap().push(chat_id);
        Ok(())
    }

    async fn set_message_reaction(
        &self,
        chat_id: i64,
        message_id: i64,
        emoji: &str,
    ) -> Result<(), String> {
        self.reactions
            .lock()
            .unwrap()
            .push((chat_id, message_id, emoji.to_string()));
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, String> {
        self.files
            .get(file_id)
            .cloned()
            .ok_or_else(|| format!("no such file: {file_id}"))
    }
}

// =============================================================================
// MODEL FALLBACK
// =============================================================================

mod fallback {
    use super::*;

    #[tokio::test]
    async fn test_day_budget_moves_to_next_model() {
        let h = harness(vec![
            ModelSpec::new("m1", None, Some(1)),
            ModelSpec::unlimited("m2"),
        ]);

        assert_eq!(h.client.generate("first").await.unwrap(), "ok from m1");
        assert_eq!(h.client.generate("second").await.unwrap(), "ok from m2");
        assert_eq!(h.backend.models_called(), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_day_budget_restored_next_day() {
        let h = harness(vec![
            ModelSpec::new("m1", None, Some(1)),
            ModelSpec::unlimited("m2"),
        ]);

        h.client.generate("first").await.unwrap();
        h.clock.set_today(day(2));
        assert_eq!(h.client.generate("second").await.unwrap(), "ok from m1");
    }

    #[tokio::test]
    async fn test_quota_error_falls_back_and_marks_exhausted() {
        let h = harness(vec![ModelSpec::unlimited("m1"), ModelSpec::unlimited("m2")]);
        h.backend.script("m1", Err(quota()));

        assert_eq!(h.client.generate("hi").await.unwrap(), "ok from m2");
        assert_eq!(h.backend.models_called(), vec!["m1", "m2"]);

        let m1 = h.client.router().usage("m1").unwrap();
        assert!(m1.exhausted);
        // The failed attempt still counts
        assert_eq!(m1.day_count, 1);

        // Exhausted for the rest of the day
        h.client.generate("again").await.unwrap();
        assert_eq!(h.backend.models_called(), vec!["m1", "m2", "m2"]);
    }

    #[tokio::test]
    async fn test_all_models_exhausted_gives_empty_result() {
        let h = harness(vec![ModelSpec::unlimited("m1"), ModelSpec::unlimited("m2")]);
        h.backend.script("m1", Err(quota()));
        h.backend.script("m2", Err(quota()));

        assert_eq!(h.client.generate("hi").await.unwrap(), "");
        assert_eq!(h.backend.models_called(), vec!["m1", "m2"]);

        // Nothing is dispatched while every model is exhausted
        assert_eq!(h.client.generate("hi again").await.unwrap(), "");
        assert_eq!(h.backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_quota_on_last_attempt_is_returned() {
        let h = harness(vec![
            ModelSpec::unlimited("m1"),
            ModelSpec::unlimited("m2"),
            ModelSpec::unlimited("m3"),
        ]);
        for m in ["m1", "m2", "m3"] {
            h.backend.script(m, Err(quota()));
        }

        let err = h.client.generate("hi").await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Backend(BackendError::ResourceExhausted(_))
        ));
        assert_eq!(h.backend.models_called(), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried_and_lists_models() {
        let h = harness(vec![ModelSpec::unlimited("gone"), ModelSpec::unlimited("m2")]);
        h.backend.script("gone", Err(not_found()));

        let err = h.client.generate("hi").await.unwrap_err();
        assert!(matches!(err, ProviderError::Backend(BackendError::NotFound(_))));
        assert_eq!(h.backend.models_called(), vec!["gone"]);
        assert_eq!(h.backend.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_other_errors_propagate_without_fallback() {
        let h = harness(vec![ModelSpec::unlimited("m1"), ModelSpec::unlimited("m2")]);
        h.backend.script(
            "m1",
            Err(BackendError::Api {
                status: 500,
                message: "internal".to_string(),
            }),
        );

        let err = h.client.generate("hi").await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Backend(BackendError::Api { status: 500, .. })
        ));
        assert_eq!(h.backend.models_called(), vec!["m1"]);
        assert_eq!(h.backend.list_calls(), 0);
        assert!(!h.client.router().usage("m1").unwrap().exhausted);
    }

    #[tokio::test]
    async fn test_empty_candidate_list() {
        let h = harness(vec![]);
        assert_eq!(h.client.generate("hi").await.unwrap(), "");
        assert_eq!(h.client.transcribe(b"ogg", "audio/ogg").await.unwrap(), "");
        assert_eq!(h.client.choose_reaction("hi").await.unwrap(), None);
        assert!(h.client.parse_image_to_event(b"img", "image/jpeg").await.unwrap().is_empty());
        assert!(h.backend.calls().is_empty());
    }
}

// =============================================================================
// REQUEST SHAPING
// =============================================================================

mod request_shaping {
    use super::*;

    fn rich_catalog(models: Vec<ModelSpec>) -> ModelCatalog {
        ModelCatalog {
            thinking_budget: Some(256),
            search_enabled: true,
            ..catalog(models)
        }
    }

    #[tokio::test]
    async fn test_gemma_gets_instruction_in_content() {
        let h = harness_with(
            rich_catalog(vec![ModelSpec::unlimited("gemma-3-27b-it")]),
            Some("Answer briefly."),
        );

        h.client.generate("what is rust?").await.unwrap();

        let call = &h.backend.calls()[0];
        assert_eq!(
            call.contents,
            vec![Part::text("Answer briefly."), Part::text("what is rust?")]
        );
        assert_eq!(call.config, GenerateConfig::default());
    }

    #[tokio::test]
    async fn test_gemini_gets_full_config() {
        let h = harness_with(
            rich_catalog(vec![ModelSpec::unlimited("gemini-2.5-flash")]),
            Some("Answer briefly."),
        );

        h.client.generate("what is rust?").await.unwrap();

        let call = &h.backend.calls()[0];
        assert_eq!(call.contents, vec![Part::text("what is rust?")]);
        assert_eq!(call.config.system_instruction.as_deref(), Some("Answer briefly."));
        assert_eq!(call.config.tools, vec![Tool::GoogleSearch]);
        assert_eq!(call.config.thinking_budget, Some(256));
    }

    #[tokio::test]
    async fn test_fallback_reshapes_per_model() {
        let h = harness_with(
            rich_catalog(vec![
                ModelSpec::unlimited("gemini-2.5-flash"),
                ModelSpec::unlimited("gemma-3-27b-it"),
            ]),
            Some("Answer briefly."),
        );
        h.backend.script("gemini-2.5-flash", Err(quota()));

        assert_eq!(h.client.generate("hi").await.unwrap(), "ok from gemma-3-27b-it");
        let calls = h.backend.calls();
        assert!(calls[0].config.system_instruction.is_some());
        assert!(calls[1].config.system_instruction.is_none());
        assert_eq!(calls[1].contents[0], Part::text("Answer briefly."));
    }

    #[tokio::test]
    async fn test_transcribe_sends_audio_first() {
        let h = harness(vec![ModelSpec::unlimited("m1")]);
        h.backend.script("m1", Ok("  привет мир \n"));

        assert_eq!(h.client.transcribe(b"ogg-bytes", "audio/ogg").await.unwrap(), "привет мир");
        let call = &h.backend.calls()[0];
        assert_eq!(call.contents[0], Part::inline("audio/ogg", b"ogg-bytes".to_vec()));
        assert!(h.backend.last_prompt().contains("ru"));
    }

    #[tokio::test]
    async fn test_reaction_prefers_family() {
        let mut cat = catalog(vec![
            ModelSpec::unlimited("gemini-2.5-flash"),
            ModelSpec::unlimited("gemini-2.5-flash-lite"),
        ]);
        cat.reaction_preferred_family = Some("flash-lite".to_string());
        let h = harness_with(cat, None);
        h.backend.script("gemini-2.5-flash-lite", Ok("🔥"));

        assert_eq!(h.client.choose_reaction("we shipped it!").await.unwrap(), Some("🔥".to_string()));
        assert_eq!(h.backend.models_called(), vec!["gemini-2.5-flash-lite"]);
    }

    #[tokio::test]
    async fn test_reaction_none() {
        let h = harness(vec![ModelSpec::unlimited("m1")]);
        h.backend.script("m1", Ok("NONE"));
        assert_eq!(h.client.choose_reaction("ok").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_event_json_in_code_fence() {
        let h = harness(vec![ModelSpec::unlimited("m1")]);
        h.backend.script(
            "m1",
            Ok("```json\n{\"title\":\"Concert\",\"date\":\"2024-05-01\",\"time\":\"19:30\",\"confidence\":0.9}\n```"),
        );

        let event = h.client.parse_image_to_event(b"img", "image/jpeg").await.unwrap();
        assert_eq!(event.title.as_deref(), Some("Concert"));
        assert_eq!(event.time.as_deref(), Some("19:30"));
        assert!(!event.is_low_confidence());
        assert!(h.backend.calls()[0].config.json_response);
        assert!(h.backend.last_prompt().contains("2024-01-01"));
    }

    #[tokio::test]
    async fn test_event_garbage_is_parse_error() {
        let h = harness(vec![ModelSpec::unlimited("m1")]);
        h.backend.script("m1", Ok("there is a concert tomorrow"));

        let err = h.client.parse_image_to_event(b"img", "image/jpeg").await.unwrap_err();
        assert!(matches!(err, ProviderError::Parse(_)));
    }
}

// =============================================================================
// ENGINE FLOWS
// =============================================================================

mod engine_flow {
    use super::*;

    const CHAT: i64 = -100500;

    fn engine_config() -> EngineConfig {
        EngineConfig {
            allowed_ids: HashSet::from([CHAT]),
            bot_username: Some("voxrelay_bot".to_string()),
            aliases: vec!["vox".to_string()],
            message_handling: true,
            schedule_events: false,
            reactions: false,
            token_limit: 1000,
            history_limit: 50,
            timezone: chrono_tz::UTC,
        }
    }

    struct TestBot {
        engine: ChatbotEngine<GenerationClient<FakeBackend>, MockTelegram>,
        telegram: Arc<MockTelegram>,
        backend: FakeBackend,
    }

    impl TestBot {
        fn new(config: EngineConfig, telegram: MockTelegram) -> Self {
            let h = harness(vec![ModelSpec::unlimited("m1")]);
            let telegram = Arc::new(telegram);
            Self {
                engine: ChatbotEngine::new(config, Arc::new(h.client), telegram.clone(), None),
                telegram,
                backend: h.backend,
            }
        }

        fn sent(&self) -> Vec<String> {
            self.telegram.sent_texts()
        }
    }

    fn text_msg(id: i64, sender: &str, text: &str) -> IncomingMessage {
        IncomingMessage {
            message_id: id,
            chat_id: CHAT,
            user_id: 7,
            sender: sender.to_string(),
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    fn voice_msg(id: i64) -> IncomingMessage {
        IncomingMessage {
            message_id: id,
            chat_id: CHAT,
            user_id: 7,
            sender: "Ann".to_string(),
            voice: Some(MediaRef {
                file_id: "voice-1".to_string(),
                mime_type: "audio/ogg".to_string(),
            }),
            ..Default::default()
        }
    }

    fn photo_msg(id: i64) -> IncomingMessage {
        IncomingMessage {
            message_id: id,
            chat_id: CHAT,
            user_id: 7,
            sender: "Ann".to_string(),
            photo: Some(MediaRef {
                file_id: "photo-1".to_string(),
                mime_type: "image/jpeg".to_string(),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unauthorized_chat_is_ignored() {
        let bot = TestBot::new(engine_config(), MockTelegram::default());
        let mut msg = text_msg(1, "Eve", "vox, hello");
        msg.chat_id = 999;
        msg.user_id = 8;

        bot.engine.handle_message(msg).await;

        assert!(bot.sent().is_empty());
        assert!(bot.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_allowed_user_in_other_chat() {
        let mut config = engine_config();
        config.allowed_ids.insert(8);
        let bot = TestBot::new(config, MockTelegram::default());
        let mut msg = text_msg(1, "Eve", "vox, hello");
        msg.chat_id = 999;
        msg.user_id = 8;

        bot.engine.handle_message(msg).await;

        assert_eq!(bot.sent(), vec!["ok from m1"]);
    }

    #[tokio::test]
    async fn test_bot_stays_quiet_when_not_addressed() {
        let bot = TestBot::new(engine_config(), MockTelegram::default());

        bot.engine.handle_message(text_msg(1, "Ann", "hey everyone")).await;

        assert!(bot.sent().is_empty());
        assert!(bot.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_addressed_message_gets_answer_with_context() {
        let bot = TestBot::new(engine_config(), MockTelegram::default());

        bot.engine.handle_message(text_msg(1, "Ann", "hey everyone")).await;
        bot.engine.handle_message(text_msg(2, "Bob", "Vox, what's up?")).await;

        assert_eq!(
            bot.backend.last_prompt(),
            "Ann: hey everyone\n---\nBob: Vox, what's up?"
        );
        let sent = bot.telegram.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![Sent {
                chat_id: CHAT,
                text: "ok from m1".to_string(),
                reply_to: Some(2),
            }]
        );
        assert_eq!(*bot.telegram.typing.lock().unwrap(), vec![CHAT]);
    }

    #[tokio::test]
    async fn test_bot_reply_joins_context() {
        let bot = TestBot::new(engine_config(), MockTelegram::default());

        bot.engine.handle_message(text_msg(1, "Ann", "vox, hi")).await;
        bot.engine.handle_message(text_msg(2, "Ann", "vox, and again")).await;

        assert_eq!(
            bot.backend.last_prompt(),
            "Ann: vox, hi\nBot: ok from m1\n---\nAnn: vox, and again"
        );
    }

    #[tokio::test]
    async fn test_reply_to_bot_is_addressed() {
        let bot = TestBot::new(engine_config(), MockTelegram::default());
        let mut msg = text_msg(1, "Ann", "and then?");
        msg.reply_to_bot = true;

        bot.engine.handle_message(msg).await;

        assert_eq!(bot.sent(), vec!["ok from m1"]);
    }

    #[tokio::test]
    async fn test_edit_updates_context() {
        let bot = TestBot::new(engine_config(), MockTelegram::default());

        bot.engine.handle_message(text_msg(1, "Ann", "hello")).await;
        bot.engine.handle_edit(CHAT, 7, 1, "goodbye").await;
        bot.engine.handle_message(text_msg(2, "Ann", "vox?")).await;

        assert_eq!(bot.backend.last_prompt(), "Ann: goodbye\n---\nAnn: vox?");
    }

    #[tokio::test]
    async fn test_empty_answer_asks_to_try_later() {
        let bot = TestBot::new(engine_config(), MockTelegram::default());
        bot.backend.script("m1", Err(quota()));

        bot.engine.handle_message(text_msg(1, "Ann", "vox, hi")).await;

        assert_eq!(bot.sent(), vec![engine::TRY_AGAIN_LATER]);
    }

    #[tokio::test]
    async fn test_backend_failure_sends_apology() {
        let bot = TestBot::new(engine_config(), MockTelegram::default());
        bot.backend.script(
            "m1",
            Err(BackendError::Http("connection reset".to_string())),
        );

        bot.engine.handle_message(text_msg(1, "Ann", "vox, hi")).await;

        assert_eq!(bot.sent(), vec![engine::APOLOGY]);
    }

    #[tokio::test]
    async fn test_reaction_for_unaddressed_message() {
        let mut config = engine_config();
        config.reactions = true;
        let bot = TestBot::new(config, MockTelegram::default());
        bot.backend.script("m1", Ok("👍"));

        bot.engine.handle_message(text_msg(5, "Ann", "we shipped it")).await;

        assert!(bot.sent().is_empty());
        assert_eq!(
            *bot.telegram.reactions.lock().unwrap(),
            vec![(CHAT, 5, "👍".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unaddressed_voice_is_transcribed() {
        let bot = TestBot::new(
            engine_config(),
            MockTelegram::default().with_file("voice-1", b"ogg"),
        );
        bot.backend.script("m1", Ok("turn on the lights"));

        bot.engine.handle_message(voice_msg(3)).await;

        assert_eq!(bot.sent(), vec!["turn on the lights"]);
        assert_eq!(
            bot.backend.calls()[0].contents[0],
            Part::inline("audio/ogg", b"ogg".to_vec())
        );
    }

    #[tokio::test]
    async fn test_addressed_voice_quotes_transcript() {
        let bot = TestBot::new(
            engine_config(),
            MockTelegram::default().with_file("voice-1", b"ogg"),
        );
        bot.backend.script("m1", Ok("vox, what's the weather"));
        bot.backend.script("m1", Ok("sunny"));

        bot.engine.handle_message(voice_msg(3)).await;

        assert_eq!(bot.sent(), vec![">>vox, what's the weather\n\nsunny"]);
        assert_eq!(bot.backend.last_prompt(), "\n---\nAnn: vox, what's the weather");
    }

    #[tokio::test]
    async fn test_missing_file_sends_apology() {
        let bot = TestBot::new(engine_config(), MockTelegram::default());

        bot.engine.handle_message(voice_msg(3)).await;

        assert_eq!(bot.sent(), vec![engine::APOLOGY]);
    }

    #[tokio::test]
    async fn test_photo_text_with_caption() {
        let bot = TestBot::new(
            engine_config(),
            MockTelegram::default().with_file("photo-1", b"jpg"),
        );
        bot.backend.script("m1", Ok("OPEN 9-18"));
        let mut msg = photo_msg(4);
        msg.caption = Some("shop sign".to_string());

        bot.engine.handle_message(msg).await;

        assert_eq!(bot.sent(), vec!["shop sign\nOPEN 9-18"]);
    }

    #[tokio::test]
    async fn test_event_photo_summary() {
        let mut config = engine_config();
        config.schedule_events = true;
        let bot = TestBot::new(config, MockTelegram::default().with_file("photo-1", b"jpg"));
        bot.backend.script(
            "m1",
            Ok(r#"{"title":"Concert","date":"2024-05-01","time":"19:30","location":"Park","confidence":0.9}"#),
        );

        bot.engine.handle_message(photo_msg(4)).await;

        let sent = bot.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Title: Concert"));
        assert!(sent[0].contains("Date: 2024-05-01"));
        assert!(sent[0].contains("Time: 19:30 (UTC)"));
        assert!(sent[0].contains("Location: Park"));
    }

    #[tokio::test]
    async fn test_event_photo_low_confidence_warns_first() {
        let mut config = engine_config();
        config.schedule_events = true;
        let bot = TestBot::new(config, MockTelegram::default().with_file("photo-1", b"jpg"));
        bot.backend.script("m1", Ok(r#"{"title":"Meetup","date":"2024-05-01","confidence":0.3}"#));

        bot.engine.handle_message(photo_msg(4)).await;

        let sent = bot.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], engine::LOW_CONFIDENCE_WARNING);
        assert!(sent[1].contains("All day event"));
    }

    #[tokio::test]
    async fn test_event_photo_without_event() {
        let mut config = engine_config();
        config.schedule_events = true;
        let bot = TestBot::new(config, MockTelegram::default().with_file("photo-1", b"jpg"));
        bot.backend.script("m1", Ok("{}"));

        bot.engine.handle_message(photo_msg(4)).await;

        assert_eq!(bot.sent(), vec![engine::NO_EVENT_FOUND]);
    }

    #[tokio::test]
    async fn test_message_handling_off() {
        let mut config = engine_config();
        config.message_handling = false;
        let bot = TestBot::new(config, MockTelegram::default());

        bot.engine.handle_message(text_msg(1, "Ann", "vox, hi")).await;

        assert!(bot.sent().is_empty());
        assert!(bot.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_hi_command() {
        let bot = TestBot::new(engine_config(), MockTelegram::default());

        bot.engine.handle_hi(CHAT, 7, 10).await;
        bot.engine.handle_hi(999, 8, 11).await;

        assert_eq!(bot.sent(), vec![engine::GREETING]);
    }
}
