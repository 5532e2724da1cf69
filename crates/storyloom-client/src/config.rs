use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::backoff::ReconnectPolicy;

pub const ENV_PREFIX: &str = "STORYLOOM";

/// Tool names whose results describe scenes when nothing else is configured.
pub const DEFAULT_SCENE_TOOLS: &[&str] = &[
    "create_scene",
    "update_scene",
    "generate_scene_image",
    "generate_scene_video",
    "scene",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid {field} `{value}`: {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        source: url::ParseError,
    },
    #[error("unknown transport `{0}` (expected auto, websocket or event_stream)")]
    UnknownTransport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPreference {
    #[default]
    Auto,
    #[serde(alias = "ws")]
    Websocket,
    #[serde(alias = "sse")]
    EventStream,
}

impl FromStr for TransportPreference {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "websocket" | "ws" => Ok(Self::Websocket),
            "event_stream" | "event-stream" | "sse" => Ok(Self::EventStream),
            other => Err(ConfigError::UnknownTransport(other.to_string())),
        }
    }
}

impl fmt::Display for TransportPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Websocket => "websocket",
            Self::EventStream => "event_stream",
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub ws_base_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub transport: TransportPreference,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_artifacts")]
    pub max_artifacts: usize,
    /// Comma separated tool names; unset means [`DEFAULT_SCENE_TOOLS`].
    #[serde(default)]
    pub scene_tools: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            ws_base_url: None,
            auth_token: None,
            transport: TransportPreference::Auto,
            max_messages: default_max_messages(),
            max_artifacts: default_max_artifacts(),
            scene_tools: None,
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl ClientConfig {
    /// Reads `STORYLOOM_*` variables; nested keys use `__`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let source = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Self::from_source(source)
    }

    pub fn from_source(source: config::Config) -> Result<Self, ConfigError> {
        let config: ClientConfig = source.try_deserialize()?;
        config.normalize().validated()
    }

    fn normalize(mut self) -> Self {
        self.api_base_url = Self::normalize_opt(Some(self.api_base_url.clone()))
            .unwrap_or_else(default_api_base_url);
        self.ws_base_url = Self::normalize_opt(self.ws_base_url.take());
        self.auth_token = Self::normalize_opt(self.auth_token.take());
        self.scene_tools = Self::normalize_opt(self.scene_tools.take());
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn validated(self) -> Result<Self, ConfigError> {
        self.api_base()?;
        Ok(self)
    }

    pub fn api_base(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.api_base_url).map_err(|source| ConfigError::InvalidUrl {
            field: "api_base_url",
            value: self.api_base_url.clone(),
            source,
        })
    }

    pub fn scene_tool_set(&self) -> HashSet<String> {
        match &self.scene_tools {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            None => DEFAULT_SCENE_TOOLS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_retries,
        )
    }
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_max_messages() -> usize {
    500
}

fn default_max_artifacts() -> usize {
    200
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(overrides: &[(&str, &str)]) -> Result<ClientConfig, ConfigError> {
        let mut builder = config::Config::builder();
        for (key, value) in overrides {
            builder = builder.set_override(*key, *value)?;
        }
        ClientConfig::from_source(builder.build()?)
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = build(&[]).expect("config");
        assert_eq!(config.max_messages, 500);
        assert_eq!(config.max_artifacts, 200);
        assert_eq!(config.transport, TransportPreference::Auto);
        assert!(config.scene_tool_set().contains("create_scene"));
    }

    #[test]
    fn blank_strings_normalize_to_none() {
        let config = build(&[
            ("auth_token", "   "),
            ("ws_base_url", ""),
            ("scene_tools", "storyboard, , shot"),
            ("transport", "event_stream"),
        ])
        .expect("config");
        assert!(config.auth_token.is_none());
        assert!(config.ws_base_url.is_none());
        assert_eq!(config.transport, TransportPreference::EventStream);
        let tools = config.scene_tool_set();
        assert_eq!(tools.len(), 2);
        assert!(tools.contains("shot"));
    }

    #[test]
    fn rejects_unparseable_api_base() {
        let err = build(&[("api_base_url", "not a url")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn transport_parses_aliases() {
        assert_eq!(
            "sse".parse::<TransportPreference>().unwrap(),
            TransportPreference::EventStream
        );
        assert!("carrier-pigeon".parse::<TransportPreference>().is_err());
    }
}
