//! Environment-backed configuration for `chat-smoke`.

use std::{env, error::Error, fmt, path::PathBuf, time::Duration};

use chat_core::{ReconnectPolicy, Sender};
use chat_ws::{ChatEndpoints, ChatRuntimeConfig};
use url::Url;

const DEFAULT_WS_URL: &str = "wss://api.dogymorbis.example/ws";
const DEFAULT_API_BASE_URL: &str = "https://api.dogymorbis.example";
const DEFAULT_DATA_DIR: &str = "./.chat-smoke-store";
const DEFAULT_USER_ID: &str = "smoke-user";
const DEFAULT_USER_NAME: &str = "Smoke Tester";
const DEFAULT_ROOM: &str = "park-walk";

/// Everything the smoke run needs.
#[derive(Debug, Clone)]
pub struct SmokeConfig {
    pub endpoints: ChatEndpoints,
    /// Root for the file-backed session store.
    pub data_dir: PathBuf,
    pub user: Sender,
    /// Room joined and written to by the smoke run.
    pub room: String,
    pub runtime: ChatRuntimeConfig,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let ws_url = parse_url("CHAT_WS_URL", DEFAULT_WS_URL, &mut lookup)?;
        if !matches!(ws_url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_WS_URL",
                value: ws_url.to_string(),
                reason: "scheme must be ws or wss".to_owned(),
            });
        }
        let api_base = parse_url("CHAT_API_BASE_URL", DEFAULT_API_BASE_URL, &mut lookup)?;

        let data_dir = optional_trimmed_env("CHAT_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let user = Sender::new(
            optional_trimmed_env("CHAT_USER_ID", &mut lookup)
                .unwrap_or_else(|| DEFAULT_USER_ID.to_owned()),
            optional_trimmed_env("CHAT_USER_NAME", &mut lookup)
                .unwrap_or_else(|| DEFAULT_USER_NAME.to_owned()),
        );
        let room = optional_trimmed_env("CHAT_SMOKE_ROOM", &mut lookup)
            .unwrap_or_else(|| DEFAULT_ROOM.to_owned());

        let defaults = ChatRuntimeConfig::default();
        let base_delay_ms = parse_optional_u64(
            "CHAT_RECONNECT_BASE_DELAY_MS",
            defaults.reconnect_policy.base_delay_ms(),
            &mut lookup,
        )?;
        let max_attempts = parse_optional_u32(
            "CHAT_RECONNECT_MAX_ATTEMPTS",
            defaults.reconnect_policy.max_attempts(),
            &mut lookup,
        )?;
        let connect_timeout = parse_positive_millis(
            "CHAT_CONNECT_TIMEOUT_MS",
            defaults.connect_timeout,
            &mut lookup,
        )?;
        let sync_interval =
            parse_positive_millis("CHAT_SYNC_INTERVAL_MS", defaults.sync_interval, &mut lookup)?;
        let sync_timeout =
            parse_positive_millis("CHAT_SYNC_TIMEOUT_MS", defaults.sync_timeout, &mut lookup)?;
        let request_timeout = parse_positive_millis(
            "CHAT_REQUEST_TIMEOUT_MS",
            defaults.request_timeout,
            &mut lookup,
        )?;

        Ok(Self {
            endpoints: ChatEndpoints { ws_url, api_base },
            data_dir,
            user,
            room,
            runtime: ChatRuntimeConfig {
                reconnect_policy: ReconnectPolicy::new(base_delay_ms, max_attempts),
                connect_timeout,
                sync_interval,
                sync_timeout,
                request_timeout,
                ..defaults
            },
        })
    }
}

/// Errors produced while parsing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_url<F>(key: &'static str, default: &str, lookup: &mut F) -> Result<Url, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = optional_trimmed_env(key, lookup).unwrap_or_else(|| default.to_owned());
    Url::parse(&value).map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_optional_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u32<F>(key: &'static str, default: u32, lookup: &mut F) -> Result<u32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u32>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_positive_millis<F>(
    key: &'static str,
    default: Duration,
    lookup: &mut F,
) -> Result<Duration, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    let millis = parse_optional_u64(key, default_ms, lookup)?;
    if millis == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(Duration::from_millis(millis))
}
