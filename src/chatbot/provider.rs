//! AI operations with quota-aware model fallback.
//!
//! Every operation picks a model through the [`ModelRouter`], records the
//! attempt, calls the backend, and falls back to the next candidate when the
//! backend reports quota exhaustion. Running out of candidates is not an
//! error: the operation returns an empty result instead.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::chatbot::backend::{Backend, BackendError, GenerateConfig, Part, Tool};
use crate::chatbot::events::{strip_markdown_to_json, EventDetails};
use crate::chatbot::retry::retry_with_item;
use crate::chatbot::router::{prefer_family, ModelRouter};
use crate::chatbot::usage::ModelSpec;

const TRANSCRIBE_ATTEMPTS: u32 = 3;
const GENERATE_ATTEMPTS: u32 = 3;
const IMAGE_TEXT_ATTEMPTS: u32 = 3;
const EVENT_ATTEMPTS: u32 = 2;
/// Reactions are decoration; give up early.
const REACTION_ATTEMPTS: u32 = 2;

/// Reactions Telegram accepts from bots.
pub const ALLOWED_REACTIONS: &[&str] = &[
    "👍", "👎", "❤", "🔥", "🥰", "👏", "😁", "🤔", "🤯", "😱", "😢", "🎉", "🤩", "🙏", "👌",
    "😍", "🤣", "💯", "⚡", "🏆", "💔", "🤨", "😐", "😭", "🤓", "👀", "🙈", "😇", "🤝", "🤗",
    "🫡", "🤪", "🗿", "🆒", "😎", "🤷", "😡",
];

/// Request features a model family supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub system_instruction: bool,
    pub tools: bool,
    pub thinking: bool,
}

impl Capabilities {
    pub const FULL: Self = Self {
        system_instruction: true,
        tools: true,
        thinking: true,
    };
    pub const NONE: Self = Self {
        system_instruction: false,
        tools: false,
        thinking: false,
    };
}

/// Capabilities for every model whose name matches `pattern`.
#[derive(Debug, Clone)]
pub struct CapabilityRule {
    pub pattern: Regex,
    pub capabilities: Capabilities,
}

/// Candidate models and request defaults. Reloadable at runtime.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub generation_models: Vec<ModelSpec>,
    pub transcription_models: Vec<ModelSpec>,
    pub reaction_models: Vec<ModelSpec>,
    /// Name fragment of the model family tried first for reactions.
    pub reaction_preferred_family: Option<String>,
    pub thinking_budget: Option<i32>,
    pub search_enabled: bool,
    /// First match wins; unmatched models support everything.
    pub capability_rules: Vec<CapabilityRule>,
}

impl ModelCatalog {
    pub fn capabilities(&self, model: &str) -> Capabilities {
        self.capability_rules
            .iter()
            .find(|rule| rule.pattern.is_match(model))
            .map(|rule| rule.capabilities)
            .unwrap_or(Capabilities::FULL)
    }
}

/// Adapt a request to what the model supports.
///
/// An unsupported system instruction is moved to the front of the content
/// so the model still sees it.
pub fn resolve_request(
    caps: Capabilities,
    contents: &[Part],
    config: &GenerateConfig,
) -> (Vec<Part>, GenerateConfig) {
    let mut contents = contents.to_vec();
    let mut config = config.clone();

    if !caps.system_instruction
        && let Some(instruction) = config.system_instruction.take()
    {
        contents.insert(0, Part::Text(instruction));
    }
    if !caps.tools {
        config.tools.clear();
    }
    if !caps.thinking {
        config.thinking_budget = None;
    }
    (contents, config)
}

#[derive(Debug)]
pub enum ProviderError {
    Backend(BackendError),
    /// The model answered, but not in the expected shape.
    Parse(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Backend(e) => write!(f, "{e}"),
            ProviderError::Parse(e) => write!(f, "Unexpected model output: {e}"),
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProviderError::Backend(e) => Some(e),
            ProviderError::Parse(_) => None,
        }
    }
}

impl From<BackendError> for ProviderError {
    fn from(e: BackendError) -> Self {
        ProviderError::Backend(e)
    }
}

/// The AI operations the chat engine needs.
pub trait ModelProvider: Send + Sync {
    /// Speech to text in the configured language. Empty if no model was available.
    fn transcribe(
        &self,
        audio: &[u8],
        mime_type: &str,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;

    /// Answer a prompt. Empty if no model was available.
    fn generate(&self, prompt: &str) -> impl Future<Output = Result<String, ProviderError>> + Send;

    /// Pick a reaction emoji for a message, if one fits.
    fn choose_reaction(
        &self,
        text: &str,
    ) -> impl Future<Output = Result<Option<String>, ProviderError>> + Send;

    /// Text found in an image, or a short description.
    fn image_to_text(
        &self,
        image: &[u8],
        mime_type: &str,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;

    /// Event details shown in an image. Empty if none.
    fn parse_image_to_event(
        &self,
        image: &[u8],
        mime_type: &str,
    ) -> impl Future<Output = Result<EventDetails, ProviderError>> + Send;
}

/// Fixed prompt settings.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub language: String,
    /// System instruction for `generate`.
    pub prompt_prefix: Option<String>,
}

/// [`ModelProvider`] over any [`Backend`].
pub struct GenerationClient<B> {
    backend: B,
    router: Arc<ModelRouter>,
    catalog: Arc<RwLock<ModelCatalog>>,
    settings: GenerationSettings,
}

impl<B: Backend> GenerationClient<B> {
    pub fn new(
        backend: B,
        router: Arc<ModelRouter>,
        catalog: Arc<RwLock<ModelCatalog>>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            backend,
            router,
            catalog,
            settings,
        }
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    fn catalog(&self) -> ModelCatalog {
        self.catalog.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// One logical operation across the candidate list.
    ///
    /// `Ok(None)` means every candidate was exhausted or skipped.
    async fn run_operation(
        &self,
        operation: &'static str,
        candidates: &[ModelSpec],
        max_attempts: u32,
        contents: Vec<Part>,
        config: GenerateConfig,
        catalog: &ModelCatalog,
    ) -> Result<Option<String>, BackendError> {
        let router = &*self.router;
        let backend = &self.backend;
        let contents = &contents;
        let config = &config;

        let outcome = retry_with_item(
            max_attempts,
            || router.pick_model(candidates),
            move |spec: ModelSpec| async move {
                let (contents, config) =
                    resolve_request(catalog.capabilities(&spec.name), contents, config);
                router.record_request(&spec);
                debug!("{operation}: dispatching to {}", spec.name);
                backend
                    .generate_content(&spec.name, &contents, &config)
                    .await
                    .map(|r| r.text)
            },
            |spec, attempt, max_attempts, err| {
                if err.is_not_found() {
                    error!("{operation}: model {} rejected: {err}", spec.name);
                    false
                } else if err.is_resource_exhausted() {
                    router.mark_exhausted(spec);
                    if attempt < max_attempts {
                        warn!(
                            "{operation}: {} out of quota (attempt {attempt}/{max_attempts}), falling back",
                            spec.name
                        );
                        true
                    } else {
                        warn!("{operation}: {} out of quota, no attempts left", spec.name);
                        false
                    }
                } else {
                    false
                }
            },
        )
        .await;

        match outcome {
            Ok(None) => {
                warn!("{operation}: no model available");
                Ok(None)
            }
            Ok(some) => Ok(some),
            Err(e) => {
                if e.is_not_found() {
                    self.log_available_models().await;
                }
                Err(e)
            }
        }
    }

    async fn log_available_models(&self) {
        match self.backend.list_models().await {
            Ok(models) => info!("Available models: {}", models.join(", ")),
            Err(e) => warn!("Failed to list models: {e}"),
        }
    }
}

impl<B: Backend> ModelProvider for GenerationClient<B> {
    async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<String, ProviderError> {
        let catalog = self.catalog();
        let contents = vec![
            Part::inline(mime_type, audio.to_vec()),
            Part::text(format!(
                "Transcribe this audio to {} text. Reply with the transcription only.",
                self.settings.language
            )),
        ];

        let text = self
            .run_operation(
                "transcribe",
                &catalog.transcription_models,
                TRANSCRIBE_ATTEMPTS,
                contents,
                GenerateConfig::default(),
                &catalog,
            )
            .await?;
        Ok(text.map(|t| t.trim().to_string()).unwrap_or_default())
    }

    async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let catalog = self.catalog();
        let config = GenerateConfig {
            system_instruction: self
                .settings
                .prompt_prefix
                .clone()
                .filter(|p| !p.trim().is_empty()),
            thinking_budget: catalog.thinking_budget,
            tools: if catalog.search_enabled {
                vec![Tool::GoogleSearch]
            } else {
                Vec::new()
            },
            json_response: false,
        };

        let text = self
            .run_operation(
                "generate",
                &catalog.generation_models,
                GENERATE_ATTEMPTS,
                vec![Part::text(prompt)],
                config,
                &catalog,
            )
            .await?;
        Ok(text.map(|t| t.trim().to_string()).unwrap_or_default())
    }

    async fn choose_reaction(&self, text: &str) -> Result<Option<String>, ProviderError> {
        let catalog = self.catalog();
        let candidates = match catalog.reaction_preferred_family {
            Some(ref family) => prefer_family(&catalog.reaction_models, family),
            None => catalog.reaction_models.clone(),
        };

        let prompt = format!(
            "Pick one emoji reaction for this chat message from the list below. \
             Reply with the emoji only, or NONE if no reaction fits.\n\
             Allowed: {}\n\nMessage:\n{}",
            ALLOWED_REACTIONS.join(" "),
            text
        );
        let config = GenerateConfig {
            thinking_budget: Some(0),
            ..Default::default()
        };

        let answer = self
            .run_operation(
                "choose_reaction",
                &candidates,
                REACTION_ATTEMPTS,
                vec![Part::text(prompt)],
                config,
                &catalog,
            )
            .await?;
        Ok(answer.as_deref().and_then(parse_reaction))
    }

    async fn image_to_text(&self, image: &[u8], mime_type: &str) -> Result<String, ProviderError> {
        let catalog = self.catalog();
        let contents = vec![
            Part::inline(mime_type, image.to_vec()),
            Part::text(format!(
                "Extract all text from this image. If there is no text, describe the image \
                 in one or two sentences. Answer in {}.",
                self.settings.language
            )),
        ];

        let text = self
            .run_operation(
                "image_to_text",
                &catalog.generation_models,
                IMAGE_TEXT_ATTEMPTS,
                contents,
                GenerateConfig::default(),
                &catalog,
            )
            .await?;
        Ok(text.map(|t| t.trim().to_string()).unwrap_or_default())
    }

    async fn parse_image_to_event(
        &self,
        image: &[u8],
        mime_type: &str,
    ) -> Result<EventDetails, ProviderError> {
        let catalog = self.catalog();
        let today = self.router.today();
        let contents = vec![
            Part::inline(mime_type, image.to_vec()),
            Part::text(format!(
                "Today is {today}. Find the event shown in this image and reply with a JSON \
                 object with keys: title, date (YYYY-MM-DD), time (HH:MM, or null if all day), \
                 location, description, confidence (0.0 to 1.0). Use null for unknown values."
            )),
        ];
        let config = GenerateConfig {
            json_response: true,
            ..Default::default()
        };

        let Some(text) = self
            .run_operation(
                "parse_image_to_event",
                &catalog.generation_models,
                EVENT_ATTEMPTS,
                contents,
                config,
                &catalog,
            )
            .await?
        else {
            return Ok(EventDetails::default());
        };

        let json = strip_markdown_to_json(&text);
        if json.is_empty() {
            return Ok(EventDetails::default());
        }
        serde_json::from_str(json).map_err(|e| ProviderError::Parse(format!("{e}: {json}")))
    }
}

/// Match a model answer against the allowed reactions.
fn parse_reaction(answer: &str) -> Option<String> {
    let normalized: String = answer.trim().chars().filter(|c| *c != '\u{FE0F}').collect();
    if normalized.is_empty() || normalized.eq_ignore_ascii_case("none") {
        return None;
    }
    ALLOWED_REACTIONS
        .iter()
        .find(|r| normalized == **r)
        .or_else(|| {
            // Longest first, so compound emoji are not cut short.
            let mut by_len: Vec<_> = ALLOWED_REACTIONS.iter().collect();
            by_len.sort_by_key(|r| std::cmp::Reverse(r.len()));
            by_len.into_iter().find(|r| normalized.starts_with(**r))
        })
        .map(|r| r.to_string())
}
