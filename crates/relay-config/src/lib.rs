//! Relay Configuration
//!
//! TOML configuration loading with environment variable overrides

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Overrides `telegram.bot_token` when set.
pub const TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";
/// Overrides `completion.api_key` when set.
pub const API_KEY_ENV: &str = "RELAY_COMPLETION_API_KEY";

/// Telegram refuses bot uploads above 50 MB.
const MAX_SPEEDTEST_PAYLOAD_BYTES: u64 = 50 * 1000 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub selector: SelectorConfig,
    #[serde(default)]
    pub placeholder: PlaceholderConfig,
    #[serde(default)]
    pub speedtest: SpeedtestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Mention token without the leading `@`. Resolved through `getMe` when absent.
    #[serde(default)]
    pub bot_username: Option<String>,
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
    #[serde(default)]
    pub allowed_chats: Option<Vec<i64>>,
}

impl TelegramConfig {
    pub fn bot_username(&self) -> Option<String> {
        self.bot_username
            .as_deref()
            .map(str::trim)
            .map(|value| value.trim_start_matches('@').to_string())
            .filter(|value| !value.is_empty())
    }

    pub fn account_tag(&self) -> String {
        telegram_account_tag(&self.bot_token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProviderType {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "gemini")]
    Gemini,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub label: String,
}

impl ModelEntry {
    pub fn new(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default)]
    pub provider_type: ProviderType,
    #[serde(default)]
    pub api_key: String,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    /// Upper bound for a single completion call, transport included.
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::default(),
            api_key: String::new(),
            base_url: None,
            default_model: None,
            timeout_secs: default_completion_timeout_secs(),
            system_prompt: None,
            models: Vec::new(),
        }
    }
}

impl CompletionConfig {
    /// Configured catalog, or the built-in one for the provider type.
    pub fn model_entries(&self) -> Vec<ModelEntry> {
        if !self.models.is_empty() {
            return self.models.clone();
        }
        match self.provider_type {
            ProviderType::OpenAi => vec![
                ModelEntry::new("gpt-4o-mini", "GPT-4o mini"),
                ModelEntry::new("gpt-4o", "GPT-4o"),
                ModelEntry::new("gpt-4.1-mini", "GPT-4.1 mini"),
            ],
            ProviderType::Gemini => vec![
                ModelEntry::new("gemini-1.5-flash", "Gemini 1.5 Flash"),
                ModelEntry::new("gemini-1.5-pro", "Gemini 1.5 Pro"),
                ModelEntry::new("gemini-2.0-flash", "Gemini 2.0 Flash"),
            ],
        }
    }

    pub fn default_model_id(&self) -> Option<String> {
        self.default_model
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| self.model_entries().first().map(|entry| entry.id.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectorSource {
    #[default]
    Roster,
    Administrators,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SelectorConfig {
    #[serde(default)]
    pub source: SelectorSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceholderConfig {
    #[serde(default = "default_placeholder_text")]
    pub text: String,
}

impl Default for PlaceholderConfig {
    fn default() -> Self {
        Self {
            text: default_placeholder_text(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedtestConfig {
    #[serde(default = "default_speedtest_payload_bytes")]
    pub payload_bytes: u64,
    pub probe_url: Option<String>,
}

impl Default for SpeedtestConfig {
    fn default() -> Self {
        Self {
            payload_bytes: default_speedtest_payload_bytes(),
            probe_url: None,
        }
    }
}

impl SpeedtestConfig {
    pub fn probe_url(&self) -> Option<&str> {
        self.probe_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

pub fn telegram_account_tag(bot_token: &str) -> String {
    let token = bot_token.trim();
    token.split(':').next().unwrap_or(token).trim().to_string()
}

fn default_completion_timeout_secs() -> u64 {
    120
}

fn default_placeholder_text() -> String {
    "⏳ Думаю над ответом...".to_string()
}

fn default_speedtest_payload_bytes() -> u64 {
    5_000_000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_overrides(
            std::env::var(TOKEN_ENV).ok(),
            std::env::var(API_KEY_ENV).ok(),
        );
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("relay").join("config.toml"))
    }

    pub fn apply_overrides(&mut self, bot_token: Option<String>, api_key: Option<String>) {
        if let Some(token) = bot_token.filter(|value| !value.trim().is_empty()) {
            self.telegram.bot_token = token.trim().to_string();
        }
        if let Some(key) = api_key.filter(|value| !value.trim().is_empty()) {
            self.completion.api_key = key.trim().to_string();
        }
    }

    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        let home = || dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Home directory not found"));
        match self.core.data_dir.as_deref() {
            Some("~") => home(),
            Some(dir) if dir.starts_with("~/") => Ok(home()?.join(dir.trim_start_matches("~/"))),
            Some(dir) => Ok(PathBuf::from(dir)),
            None => Ok(home()?.join(".relay")),
        }
    }

    pub fn log_level(&self) -> &str {
        self.core.log_level.as_deref().unwrap_or("info")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let token = self.telegram.bot_token.trim();
        if token.is_empty() {
            anyhow::bail!("telegram.bot_token cannot be empty (or set {})", TOKEN_ENV);
        }
        if !token.contains(':') || self.telegram.account_tag().is_empty() {
            anyhow::bail!("telegram.bot_token has invalid format");
        }
        if let Some(timeout) = self.telegram.poll_timeout_secs {
            if timeout == 0 || timeout > 300 {
                anyhow::bail!("telegram.poll_timeout_secs must be in range 1..=300");
            }
        }

        if self.completion.api_key.trim().is_empty() {
            anyhow::bail!("completion.api_key cannot be empty (or set {})", API_KEY_ENV);
        }
        if self.completion.timeout_secs == 0 {
            anyhow::bail!("completion.timeout_secs must be > 0");
        }
        if let Some(base_url) = &self.completion.base_url {
            let base_url = base_url.trim();
            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                anyhow::bail!("completion.base_url must be an http(s) URL");
            }
        }

        let mut model_ids = HashSet::new();
        for entry in &self.completion.models {
            let id = entry.id.trim();
            if id.is_empty() {
                anyhow::bail!("completion.models contains an entry with empty id");
            }
            if entry.label.trim().is_empty() {
                anyhow::bail!("completion.models entry '{}' has empty label", id);
            }
            if !model_ids.insert(id.to_string()) {
                anyhow::bail!("Duplicate model id '{}' in completion.models", id);
            }
        }

        let Some(default_model) = self.completion.default_model_id() else {
            anyhow::bail!("completion model catalog is empty");
        };
        if !self
            .completion
            .model_entries()
            .iter()
            .any(|entry| entry.id == default_model)
        {
            anyhow::bail!(
                "completion.default_model '{}' is not in the model catalog",
                default_model
            );
        }

        if self.placeholder.text.trim().is_empty() {
            anyhow::bail!("placeholder.text cannot be empty");
        }

        if self.speedtest.payload_bytes == 0
            || self.speedtest.payload_bytes > MAX_SPEEDTEST_PAYLOAD_BYTES
        {
            anyhow::bail!(
                "speedtest.payload_bytes must be in range 1..={}",
                MAX_SPEEDTEST_PAYLOAD_BYTES
            );
        }
        if let Some(probe_url) = self.speedtest.probe_url() {
            if !probe_url.starts_with("http://") && !probe_url.starts_with("https://") {
                anyhow::bail!("speedtest.probe_url must be an http(s) URL");
            }
        }

        Ok(())
    }
}
