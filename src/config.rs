use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Duration as ChronoDuration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MESSAGES_IN_HISTORY: usize = 10;
const DEFAULT_MAX_ALIVE_DIALOGUE_SECS: i64 = 3600;
const DEFAULT_CHAT_CONTEXT_COUNT: u64 = 50;

pub const DEFAULT_ROLE: &str = "You are a helpful assistant.";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("expected {0} in the environment")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Generation policy and session limits used by the dialogue core.
#[derive(Debug, Clone)]
pub struct DialogueConfig {
    pub default_role: String,
    /// Number of user messages (each with its answer) kept per conversation.
    pub messages_in_history: usize,
    pub max_alive_dialogue: ChronoDuration,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            default_role: DEFAULT_ROLE.to_string(),
            messages_in_history: DEFAULT_MESSAGES_IN_HISTORY,
            max_alive_dialogue: ChronoDuration::seconds(DEFAULT_MAX_ALIVE_DIALOGUE_SECS),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub discord_token: String,
    pub backend: BackendConfig,
    pub dialogue: DialogueConfig,
    /// How many channel messages the transport fetches as ambient context.
    pub chat_context_count: u64,
    pub usage_ledger_path: Option<PathBuf>,
    pub support_contact: Option<String>,
}

pub fn from_env() -> Result<BotConfig, ConfigError> {
    from_lookup(|key| env::var(key).ok())
}

pub fn from_lookup<F>(lookup: F) -> Result<BotConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    let discord_token = get("DISCORD_TOKEN").ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;
    let api_key = get("OPENAI_API_KEY").ok_or(ConfigError::Missing("OPENAI_API_KEY"))?;

    let base_url = get("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let timeout_secs: u64 = parse_or(&get, "OPENAI_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;

    let temperature: f32 = parse_or(&get, "OPENAI_TEMPERATURE", DEFAULT_TEMPERATURE)?;
    if !(0.0..=2.0).contains(&temperature) {
        return Err(invalid("OPENAI_TEMPERATURE", temperature, "must be between 0.0 and 2.0"));
    }

    let max_tokens: u32 = parse_or(&get, "OPENAI_MAX_TOKENS", DEFAULT_MAX_TOKENS)?;
    if max_tokens == 0 {
        return Err(invalid("OPENAI_MAX_TOKENS", max_tokens, "must be positive"));
    }

    let messages_in_history: usize =
        parse_or(&get, "MESSAGES_IN_HISTORY", DEFAULT_MESSAGES_IN_HISTORY)?;
    if messages_in_history == 0 {
        return Err(invalid("MESSAGES_IN_HISTORY", messages_in_history, "must be at least 1"));
    }

    let max_alive_secs: i64 =
        parse_or(&get, "MAX_ALIVE_DIALOGUE", DEFAULT_MAX_ALIVE_DIALOGUE_SECS)?;
    if max_alive_secs <= 0 {
        return Err(invalid(
            "MAX_ALIVE_DIALOGUE",
            max_alive_secs,
            "must be a positive number of seconds",
        ));
    }

    let chat_context_count: u64 =
        parse_or(&get, "CHAT_CONTEXT_COUNT", DEFAULT_CHAT_CONTEXT_COUNT)?;
    // Discord caps a single history request at 100 messages.
    if chat_context_count > 100 {
        return Err(invalid("CHAT_CONTEXT_COUNT", chat_context_count, "must not exceed 100"));
    }

    Ok(BotConfig {
        discord_token,
        backend: BackendConfig {
            api_key,
            base_url,
            timeout: Duration::from_secs(timeout_secs),
        },
        dialogue: DialogueConfig {
            default_role: get("DEFAULT_ROLE").unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            messages_in_history,
            max_alive_dialogue: ChronoDuration::seconds(max_alive_secs),
            model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature,
            max_tokens,
        },
        chat_context_count,
        usage_ledger_path: get("USAGE_LEDGER_PATH").map(PathBuf::from),
        support_contact: get("SUPPORT_CONTACT"),
    })
}

fn parse_or<G, T>(get: G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn invalid(key: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
