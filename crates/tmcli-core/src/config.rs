//! Configuration types for the gateway

use crate::auth::OAuthClientConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tmwire::{SamplingParams, TransportOptions};

/// Model used with a static OpenAI-compatible key when none is configured.
pub const DEFAULT_OPENAI_MODEL: &str = "qwen3-coder-plus";

/// Chat endpoint for device-flow identities without a resource URL.
pub const DEFAULT_DINGTALK_BASE_URL: &str = "https://tmcli.buguk12.com/v1";

/// Stand-in model name, replaced by the first discovered model.
pub const PLACEHOLDER_MODEL: &str = "coder-model";

/// Whether `model` still needs to be chosen from the discovered list.
pub fn is_placeholder_model(model: &str) -> bool {
    model.trim().is_empty() || model == PLACEHOLDER_MODEL
}

/// How an identity obtains credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthType {
    /// Static OpenAI-compatible API key.
    #[serde(rename = "openai")]
    OpenAi,
    /// Device-code OAuth2 flow.
    #[default]
    #[serde(rename = "dingtalk-oauth")]
    DingtalkOAuth,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::OpenAi => "openai",
            AuthType::DingtalkOAuth => "dingtalk-oauth",
        }
    }

    /// Whether credentials come from the device flow.
    pub fn is_oauth(&self) -> bool {
        matches!(self, AuthType::DingtalkOAuth)
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(AuthType::OpenAi),
            "dingtalk-oauth" => Ok(AuthType::DingtalkOAuth),
            other => Err(ConfigError::UnknownAuthType(other.to_string())),
        }
    }
}

/// Authorization server settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Print the verification URI instead of opening a browser.
    pub suppress_browser: bool,
}

impl OAuthSettings {
    pub fn client_config(&self) -> OAuthClientConfig {
        let defaults = OAuthClientConfig::default();
        OAuthClientConfig {
            base_url: self.base_url.clone().unwrap_or(defaults.base_url),
            client_id: self.client_id.clone().unwrap_or(defaults.client_id),
            scope: self.scope.clone().unwrap_or(defaults.scope),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub auth_type: AuthType,
    pub model: String,
    #[serde(skip_serializing, default = "default_secret")]
    pub api_key: SecretString,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    pub sampling: SamplingParams,
    pub oauth: OAuthSettings,
    /// Whether the config was loaded from the default location
    #[serde(skip)]
    pub is_from_default_location: bool,
}

fn default_secret() -> SecretString {
    SecretString::new(String::new())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_type: AuthType::default(),
            model: String::new(),
            api_key: default_secret(),
            base_url: None,
            proxy: None,
            timeout_secs: None,
            max_retries: None,
            sampling: SamplingParams::default(),
            oauth: OAuthSettings::default(),
            is_from_default_location: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.expose_secret().is_empty()
    }

    /// Applies `OPENAI_*`, `TMCLI_OAUTH_HOST` and `NO_BROWSER` from the
    /// process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if self.auth_type == AuthType::OpenAi {
            if let Some(key) = var("OPENAI_API_KEY") {
                self.api_key = SecretString::new(key);
            }
            if let Some(url) = var("OPENAI_BASE_URL") {
                self.base_url = Some(url);
            }
            if let Some(model) = var("OPENAI_MODEL") {
                self.model = model;
            }
        }
        if let Some(host) = var("TMCLI_OAUTH_HOST") {
            self.oauth.base_url = Some(host);
        }
        if let Some(flag) = var("NO_BROWSER") {
            self.oauth.suppress_browser = !matches!(flag.to_lowercase().as_str(), "0" | "false");
        }
    }
}

/// Everything needed to build one generator. Built from [`Config`] plus
/// per-auth-type defaults.
#[derive(Debug, Clone)]
pub struct ContentGeneratorConfig {
    pub model: String,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub auth_type: AuthType,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub sampling_params: SamplingParams,
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl ContentGeneratorConfig {
    pub fn transport_options(&self) -> TransportOptions {
        let defaults = TransportOptions::default();
        TransportOptions {
            timeout: self.timeout.or(defaults.timeout),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_backoff: defaults.retry_backoff,
            proxy: self.proxy.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// `tmcli/<version> (<os>; <arch>)`
pub fn user_agent() -> String {
    format!(
        "tmcli/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Unknown auth type `{0}` (expected `openai` or `dingtalk-oauth`)")]
    UnknownAuthType(String),
}

/// `<config dir>/tmcli/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("tmcli").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from(".tmcli/config.toml"))
}

/// Load configuration from the default location or specified path
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let (path, is_default) = match path {
        Some(p) => (p.to_path_buf(), false),
        None => (default_config_path(), true),
    };

    let mut config = if path.exists() {
        Config::from_file(&path)?
    } else {
        Config::default()
    };

    config.is_from_default_location = is_default;
    Ok(config)
}

/// Save configuration to the default location or specified path
pub fn save_config(config: &Config, path: Option<&Path>) -> Result<(), ConfigError> {
    let path = path.map(PathBuf::from).unwrap_or_else(default_config_path);

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    config.to_file(&path)
}
