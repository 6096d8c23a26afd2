use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{debug, error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use voxrelay::chatbot::engine::{ChatbotEngine, EngineConfig};
use voxrelay::chatbot::gemini::GeminiClient;
use voxrelay::chatbot::message::{IncomingMessage, MediaRef, ReplyTo};
use voxrelay::chatbot::provider::{GenerationClient, GenerationSettings, ModelCatalog};
use voxrelay::chatbot::router::{ModelRouter, SystemClock};
use voxrelay::chatbot::telegram::TelegramClient;
use voxrelay::chatbot::whisper::Whisper;
use voxrelay::config::{Config, LogFormat};
use voxrelay::telegram_log::AdminLogLayer;

type Engine = ChatbotEngine<GenerationClient<GeminiClient>, TelegramClient>;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    #[command(description = "say hello")]
    Hi,
}

struct BotState {
    engine: Engine,
    bot_id: Option<UserId>,
    hi_enabled: bool,
}

impl BotState {
    async fn new(config: &Config, bot: &Bot, catalog: Arc<RwLock<ModelCatalog>>) -> Result<Self, String> {
        let (bot_id, bot_username) = match bot.get_me().await {
            Ok(me) => {
                info!("Bot user ID: {}, username: @{}", me.id, me.username());
                (Some(me.id), Some(me.username().to_lowercase()))
            }
            Err(e) => {
                warn!("Failed to get bot info: {e}");
                (None, None)
            }
        };

        let gemini = GeminiClient::new(config.gemini_api_key.clone(), config.request_timeout)?;
        let router = Arc::new(ModelRouter::new(Arc::new(SystemClock::new(config.timezone))));
        let provider = GenerationClient::new(
            gemini,
            router,
            catalog,
            GenerationSettings {
                language: config.language.clone(),
                prompt_prefix: config.prompt_prefix.clone(),
            },
        );

        let whisper = match config.whisper_model_path {
            Some(ref path) => match Whisper::new(path, &config.language) {
                Ok(w) => Some(Arc::new(w)),
                Err(e) => {
                    error!("Whisper unavailable, voice goes to Gemini: {e}");
                    None
                }
            },
            None => None,
        };

        let engine_config = EngineConfig {
            allowed_ids: config.allowed_chat_ids.clone(),
            bot_username,
            aliases: config.bot_aliases.clone(),
            message_handling: config.features.message_handling,
            schedule_events: config.features.schedule_events,
            reactions: config.features.reactions,
            token_limit: config.token_limit,
            history_limit: config.history_limit,
            timezone: config.display_timezone(),
        };
        let telegram = Arc::new(TelegramClient::new(bot.clone()));

        Ok(Self {
            engine: ChatbotEngine::new(engine_config, Arc::new(provider), telegram, whisper),
            bot_id,
            hi_enabled: config.commands.hi,
        })
    }
}

fn env_filter(debug_mode: bool) -> EnvFilter {
    let level = if debug_mode { tracing::Level::DEBUG } else { tracing::Level::INFO };
    EnvFilter::from_default_env().add_directive(level.into())
}

/// Keep the returned guard alive for the file log to flush.
fn init_logging(config: &Config, bot: &Bot) -> Result<tracing_appender::non_blocking::WorkerGuard, String> {
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| format!("Failed to create log dir {}: {e}", log_dir.display()))?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("voxrelay.log"))
        .map_err(|e| format!("Failed to open log file: {e}"))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .with_filter(env_filter(config.debug_mode))
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_filter(env_filter(config.debug_mode))
            .boxed(),
    });
    layers.push(
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(env_filter(config.debug_mode))
            .boxed(),
    );
    if let Some(chat_id) = config.admin_chat_id {
        layers.push(
            AdminLogLayer::new(bot.clone(), chat_id)
                .with_filter(LevelFilter::WARN)
                .boxed(),
        );
    }

    tracing_subscriber::registry().with(layers).init();
    Ok(guard)
}

/// Re-read the model catalog from `path` every `every`.
fn spawn_catalog_reload(path: PathBuf, catalog: Arc<RwLock<ModelCatalog>>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // First tick fires immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            match Config::load_catalog(&path) {
                Ok(new_catalog) => {
                    *catalog.write().unwrap_or_else(|e| e.into_inner()) = new_catalog;
                    debug!("Model catalog reloaded from {}", path.display());
                }
                Err(e) => warn!("Ignoring config reload: {e}"),
            }
        }
    });
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "voxrelay.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);

    let _guard = match init_logging(&config, &bot) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    info!("🚀 Starting voxrelay...");
    info!("Loaded config from {config_path}");
    info!("Allowed chats: {:?}", config.allowed_chat_ids);
    if config.debug_mode {
        info!("Debug logging enabled");
    }

    let catalog = Arc::new(RwLock::new(config.catalog.clone()));
    if let Some(every) = config.config_refresh {
        spawn_catalog_reload(config.config_path.clone(), catalog.clone(), every);
    }

    let state = match BotState::new(&config, &bot, catalog).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Startup failed: {e}");
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if let Some(chat_id) = config.admin_chat_id
        && let Err(e) = bot.send_message(chat_id, "voxrelay started").await
    {
        warn!("Failed to notify admin chat: {e}");
    }

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(dptree::entry().filter_command::<Command>().endpoint(handle_command))
                .branch(dptree::endpoint(handle_new_message)),
        )
        .branch(Update::filter_edited_message().endpoint(handle_edited_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_command(msg: Message, cmd: Command, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    match cmd {
        Command::Hi if state.hi_enabled => {
            state
                .engine
                .handle_hi(msg.chat.id.0, user.id.0 as i64, msg.id.0 as i64)
                .await;
        }
        Command::Hi => {}
    }
    Ok(())
}

async fn handle_new_message(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    if let Some(incoming) = telegram_to_incoming(&msg, state.bot_id) {
        state.engine.handle_message(incoming).await;
    }
    Ok(())
}

async fn handle_edited_message(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let Some(text) = msg.text().or_else(|| msg.caption()) else {
        return Ok(());
    };

    state
        .engine
        .handle_edit(msg.chat.id.0, user.id.0 as i64, msg.id.0 as i64, text)
        .await;
    Ok(())
}

fn display_name(user: &teloxide::types::User) -> String {
    if user.first_name.is_empty() {
        user.username.clone().unwrap_or_else(|| user.id.to_string())
    } else {
        user.first_name.clone()
    }
}

/// None for messages from bots or without a sender.
fn telegram_to_incoming(msg: &Message, bot_id: Option<UserId>) -> Option<IncomingMessage> {
    let user = msg.from.as_ref().filter(|u| !u.is_bot)?;

    let voice = msg.voice().map(|v| MediaRef {
        file_id: v.file.id.0.clone(),
        mime_type: v
            .mime_type
            .as_ref()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "audio/ogg".to_string()),
    });
    // Telegram lists photo sizes smallest first.
    let photo = msg.photo().and_then(|sizes| sizes.last()).map(|p| MediaRef {
        file_id: p.file.id.0.clone(),
        mime_type: "image/jpeg".to_string(),
    });

    let reply = msg.reply_to_message();
    let reply_to = reply.map(|r| ReplyTo {
        message_id: r.id.0 as i64,
        sender: r.from.as_ref().map(display_name).unwrap_or_else(|| "unknown".to_string()),
        text: r.text().or_else(|| r.caption()).unwrap_or("").to_string(),
    });
    let reply_to_bot = reply
        .and_then(|r| r.from.as_ref())
        .is_some_and(|u| Some(u.id) == bot_id);

    Some(IncomingMessage {
        message_id: msg.id.0 as i64,
        chat_id: msg.chat.id.0,
        user_id: user.id.0 as i64,
        sender: display_name(user),
        text: msg.text().map(str::to_string),
        caption: msg.caption().map(str::to_string),
        voice,
        photo,
        reply_to,
        reply_to_bot,
    })
}
