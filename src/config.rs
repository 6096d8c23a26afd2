use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use teloxide::types::ChatId;

use crate::chatbot::provider::{Capabilities, CapabilityRule, ModelCatalog};
use crate::chatbot::usage::ModelSpec;

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Invalid regex pattern.
    InvalidRegex { pattern: String, source: regex::Error },
    /// Unknown IANA timezone name.
    InvalidTimezone { name: String, reason: String },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::InvalidRegex { pattern, source } => {
                write!(f, "invalid regex pattern '{}': {}", pattern, source)
            }
            Self::InvalidTimezone { name, reason } => {
                write!(f, "invalid timezone '{}': {}", name, reason)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::InvalidRegex { source, .. } => Some(source),
            Self::InvalidTimezone { .. } | Self::Validation(_) => None,
        }
    }
}

/// Feature switches.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Features {
    /// Reply to messages addressed to the bot, relay transcriptions.
    pub message_handling: bool,
    /// Read event details from photos.
    pub schedule_events: bool,
    /// React with an emoji to messages not addressed to the bot.
    pub reactions: bool,
}

/// Bot commands that can be switched off.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Commands {
    /// `/hi` greeting.
    pub hi: bool,
}

impl Default for Commands {
    fn default() -> Self {
        Self { hi: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Deserialize)]
struct ConfigFile {
    telegram_bot_token: String,
    #[serde(default)]
    gemini_api_key: String,
    /// Chat that receives error reports.
    admin_chat_id: Option<i64>,
    /// Chat or user IDs the bot answers to.
    #[serde(default)]
    allowed_chat_ids: Vec<i64>,
    #[serde(default)]
    features: Features,
    #[serde(default)]
    commands: Commands,
    /// Extra names the bot responds to (case-insensitive).
    #[serde(default)]
    bot_aliases: Vec<String>,
    #[serde(default = "default_language")]
    language: String,
    /// System instruction for generated replies.
    prompt_prefix: Option<String>,
    #[serde(default = "default_token_limit")]
    token_limit: usize,
    /// Messages kept per chat.
    #[serde(default = "default_history_limit")]
    history_limit: usize,
    #[serde(default)]
    debug_mode: bool,
    #[serde(default)]
    log_format: LogFormat,
    /// Directory for logs. Defaults to current directory.
    data_dir: Option<String>,
    /// IANA timezone for day budgets and event times. Defaults to local time.
    timezone: Option<String>,
    /// Path to Whisper model file (.bin). Voice goes to Gemini when unset.
    whisper_model_path: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,
    /// Reload interval for the model catalog (0 = never).
    #[serde(default)]
    config_refresh_secs: u64,
    #[serde(flatten)]
    models: ModelsFile,
}

#[derive(Deserialize)]
struct ModelsFile {
    #[serde(default = "default_generation_models")]
    generation_models: Vec<ModelSpec>,
    #[serde(default = "default_transcription_models")]
    transcription_models: Vec<ModelSpec>,
    #[serde(default = "default_reaction_models")]
    reaction_models: Vec<ModelSpec>,
    #[serde(default = "default_reaction_family")]
    reaction_preferred_family: Option<String>,
    #[serde(default)]
    thinking_budget: Option<i32>,
    #[serde(default)]
    search_enabled: bool,
    #[serde(default = "default_capabilities")]
    capabilities: Vec<CapabilityFile>,
}

#[derive(Deserialize)]
struct CapabilityFile {
    pattern: String,
    #[serde(default)]
    system_instruction: bool,
    #[serde(default)]
    tools: bool,
    #[serde(default)]
    thinking: bool,
}

fn default_language() -> String {
    "ru".to_string()
}

fn default_token_limit() -> usize {
    500_000
}

fn default_history_limit() -> usize {
    200
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_generation_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("gemini-2.5-flash", Some(10), Some(250)),
        ModelSpec::new("gemini-2.5-flash-lite", Some(15), Some(1000)),
        ModelSpec::new("gemma-3-27b-it", Some(30), Some(14400)),
    ]
}

fn default_transcription_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("gemini-2.5-flash", Some(10), Some(250)),
        ModelSpec::new("gemini-2.5-flash-lite", Some(15), Some(1000)),
    ]
}

fn default_reaction_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::new("gemini-2.5-flash", Some(10), Some(250)),
        ModelSpec::new("gemini-2.5-flash-lite", Some(15), Some(1000)),
        ModelSpec::new("gemma-3-27b-it", Some(30), Some(14400)),
    ]
}

fn default_reaction_family() -> Option<String> {
    Some("flash-lite".to_string())
}

fn default_capabilities() -> Vec<CapabilityFile> {
    vec![CapabilityFile {
        pattern: "^gemma".to_string(),
        system_instruction: false,
        tools: false,
        thinking: false,
    }]
}

pub struct Config {
    /// Path to the config file (for catalog reloads)
    pub config_path: PathBuf,
    pub telegram_bot_token: String,
    pub gemini_api_key: String,
    pub admin_chat_id: Option<ChatId>,
    pub allowed_chat_ids: HashSet<i64>,
    pub features: Features,
    pub commands: Commands,
    /// Lowercased aliases.
    pub bot_aliases: Vec<String>,
    pub language: String,
    pub prompt_prefix: Option<String>,
    pub token_limit: usize,
    pub history_limit: usize,
    pub debug_mode: bool,
    pub log_format: LogFormat,
    pub data_dir: PathBuf,
    pub timezone: Option<Tz>,
    pub whisper_model_path: Option<PathBuf>,
    pub request_timeout: Duration,
    pub config_refresh: Option<Duration>,
    pub catalog: ModelCatalog,
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadFile { path: path.to_path_buf(), source: e })?;
    serde_json::from_str(&content)
        .map_err(|e| ConfigError::ParseJson { path: path.to_path_buf(), source: e })
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let file = read_config_file(&config_path)?;

        if file.telegram_bot_token.is_empty() {
            return Err(ConfigError::Validation("telegram_bot_token is required".into()));
        }
        // Telegram tokens are formatted as {bot_id}:{secret} where bot_id is numeric
        let token_parts: Vec<&str> = file.telegram_bot_token.split(':').collect();
        if token_parts.len() != 2 || token_parts[0].parse::<u64>().is_err() || token_parts[1].is_empty() {
            return Err(ConfigError::Validation(
                "telegram_bot_token appears invalid (expected format: 123456789:ABCdefGHI...)".into()
            ));
        }
        if file.gemini_api_key.trim().is_empty() {
            return Err(ConfigError::Validation("gemini_api_key is required".into()));
        }
        if file.allowed_chat_ids.is_empty() {
            return Err(ConfigError::Validation(
                "allowed_chat_ids must contain at least one chat or user ID".into(),
            ));
        }
        if file.language.trim().is_empty() {
            return Err(ConfigError::Validation("language must not be empty".into()));
        }
        if file.token_limit == 0 || file.history_limit == 0 {
            return Err(ConfigError::Validation(
                "token_limit and history_limit must be positive".into(),
            ));
        }

        let timezone = file
            .timezone
            .map(|name| {
                name.parse::<Tz>()
                    .map_err(|e| ConfigError::InvalidTimezone { reason: e.to_string(), name })
            })
            .transpose()?;

        let catalog = build_catalog(file.models)?;

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            config_path,
            telegram_bot_token: file.telegram_bot_token,
            gemini_api_key: file.gemini_api_key,
            admin_chat_id: file.admin_chat_id.map(ChatId),
            allowed_chat_ids: file.allowed_chat_ids.into_iter().collect(),
            features: file.features,
            commands: file.commands,
            bot_aliases: file
                .bot_aliases
                .into_iter()
                .map(|a| a.trim().trim_start_matches('@').to_lowercase())
                .filter(|a| !a.is_empty())
                .collect(),
            language: file.language.trim().to_lowercase(),
            prompt_prefix: file.prompt_prefix.filter(|p| !p.trim().is_empty()),
            token_limit: file.token_limit,
            history_limit: file.history_limit,
            debug_mode: file.debug_mode,
            log_format: file.log_format,
            data_dir,
            timezone,
            whisper_model_path: file.whisper_model_path.map(PathBuf::from),
            request_timeout: Duration::from_secs(file.request_timeout_secs.max(1)),
            config_refresh: (file.config_refresh_secs > 0)
                .then(|| Duration::from_secs(file.config_refresh_secs)),
            catalog,
        })
    }

    /// Re-read only the model catalog from `path`.
    pub fn load_catalog<P: AsRef<Path>>(path: P) -> Result<ModelCatalog, ConfigError> {
        let file = read_config_file(path.as_ref())?;
        build_catalog(file.models)
    }

    /// Chat or user must be listed.
    pub fn is_allowed(&self, chat_id: i64, user_id: i64) -> bool {
        self.allowed_chat_ids.contains(&chat_id) || self.allowed_chat_ids.contains(&user_id)
    }

    /// Timezone for user-facing times.
    pub fn display_timezone(&self) -> Tz {
        self.timezone.unwrap_or(chrono_tz::UTC)
    }
}

fn validate_models(field: &str, specs: &[ModelSpec]) -> Result<(), ConfigError> {
    if specs.is_empty() {
        return Err(ConfigError::Validation(format!("{field} must list at least one model")));
    }
    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{field} contains a model without a name")));
        }
        if spec.rpm == Some(0) || spec.rpd == Some(0) {
            return Err(ConfigError::Validation(format!(
                "{field}: rpm/rpd for '{}' must be positive (omit for unlimited)",
                spec.name
            )));
        }
    }
    Ok(())
}

fn build_catalog(models: ModelsFile) -> Result<ModelCatalog, ConfigError> {
    validate_models("generation_models", &models.generation_models)?;
    validate_models("transcription_models", &models.transcription_models)?;
    validate_models("reaction_models", &models.reaction_models)?;

    let capability_rules = models
        .capabilities
        .into_iter()
        .map(|c| {
            let pattern = Regex::new(&c.pattern)
                .map_err(|e| ConfigError::InvalidRegex { pattern: c.pattern.clone(), source: e })?;
            Ok(CapabilityRule {
                pattern,
                capabilities: Capabilities {
                    system_instruction: c.system_instruction,
                    tools: c.tools,
                    thinking: c.thinking,
                },
            })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;

    Ok(ModelCatalog {
        generation_models: models.generation_models,
        transcription_models: models.transcription_models,
        reaction_models: models.reaction_models,
        reaction_preferred_family: models.reaction_preferred_family.filter(|f| !f.is_empty()),
        thinking_budget: models.thinking_budget,
        search_enabled: models.search_enabled,
        capability_rules,
    })
}
