//! Configuration loading and persistence.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::events::SessionId;
use crate::credentials::Credential;
use crate::providers::env_api_key;

/// Returns the embedded default config template.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

/// Merges user config values into the default template.
fn merge_with_template(user_config: &str) -> Result<String> {
    use toml_edit::DocumentMut;

    let mut doc: DocumentMut = default_config_template()
        .parse()
        .context("Failed to parse default config template")?;
    let user_doc: DocumentMut = user_config.parse().context("Failed to parse user config")?;

    merge_items(doc.as_table_mut(), user_doc.as_table());

    Ok(doc.to_string())
}

/// Recursively merges items from source table into target table.
fn merge_items(target: &mut toml_edit::Table, source: &toml_edit::Table) {
    use toml_edit::Item;

    for (key, value) in source.iter() {
        match value {
            Item::Value(v) => {
                target[key] = Item::Value(v.clone());
            }
            Item::Table(src_table) => {
                if let Some(Item::Table(target_table)) = target.get_mut(key) {
                    merge_items(target_table, src_table);
                } else {
                    target[key] = Item::Table(src_table.clone());
                }
            }
            Item::ArrayOfTables(src_arr) => {
                target[key] = Item::ArrayOfTables(src_arr.clone());
            }
            Item::None => {}
        }
    }
}

pub mod paths {
    //! Path resolution for duet configuration and data directories.
    //!
    //! DUET_HOME resolution order:
    //! 1. DUET_HOME environment variable (if set)
    //! 2. ~/.config/duet (default)

    use std::path::PathBuf;

    /// Returns the duet home directory.
    pub fn duet_home() -> PathBuf {
        if let Ok(home) = std::env::var("DUET_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("duet")
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        duet_home().join("config.toml")
    }

    /// Returns the directory for rolling log files.
    pub fn logs_dir() -> PathBuf {
        duet_home().join("logs")
    }
}

/// Retry settings for transient provider failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 2,
            multiplier: 1.0,
            max_delay_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file_enabled: false,
        }
    }
}

/// Per-session generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl SessionConfig {
    pub const DEFAULT_SYSTEM_PROMPT: &'static str = "You are a helpful assistant.";
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;

    /// Temperature limited to the range providers accept.
    pub fn clamped_temperature(&self) -> f32 {
        if self.temperature.is_finite() {
            self.temperature.clamp(0.0, 2.0)
        } else {
            Self::DEFAULT_TEMPERATURE
        }
    }

    /// The model, unless unset or a `---` separator placeholder.
    pub fn selected_model(&self) -> Option<&str> {
        self.model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty() && !m.starts_with("---"))
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            credential_id: None,
            temperature: Self::DEFAULT_TEMPERATURE,
            system_prompt: Some(Self::DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }
}

/// One entry of `[[providers.gemini.keys]]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    #[serde(default = "new_key_id")]
    pub id: String,
    pub api_key: String,
    #[serde(default)]
    pub note: String,
}

fn new_key_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub keys: Vec<ApiKeyConfig>,
}

impl GeminiProviderConfig {
    /// Builds pool credentials from the configured keys.
    ///
    /// Keys that are blank or contain non-ASCII characters cannot be sent as
    /// a header value and are skipped. With no usable keys, `GEMINI_API_KEY`
    /// becomes a single credential with id `env`.
    pub fn credentials(&self) -> Vec<Credential> {
        let mut credentials: Vec<Credential> = self
            .keys
            .iter()
            .filter_map(|key| {
                let secret = key.api_key.trim();
                if secret.is_empty() || !secret.is_ascii() {
                    warn!(key = %key.id, "skipping unusable gemini api key");
                    return None;
                }
                Some(Credential::new(&key.id, secret, &key.note))
            })
            .collect();

        if credentials.is_empty()
            && let Some(secret) = env_api_key("GEMINI_API_KEY")
        {
            credentials.push(Credential::new("env", secret, "GEMINI_API_KEY"));
        }
        credentials
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub gemini: GeminiProviderConfig,
    pub ollama: OllamaProviderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minutes, kept as entered; parsed when a hand-off is armed.
    pub auto_reply_delay: String,
    pub poll_interval_ms: u64,
    pub stream_idle_timeout_secs: u64,
    pub health_refresh_secs: u64,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
    pub session_1: SessionConfig,
    pub session_2: SessionConfig,
    pub providers: ProvidersConfig,
}

impl Config {
    pub const DEFAULT_AUTO_REPLY_DELAY: &'static str = "1.0";
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
    pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 120;
    pub const DEFAULT_HEALTH_REFRESH_SECS: u64 = 600;

    /// Loads configuration from the default path.
    /// Returns defaults if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Writes the default template to `path`.
    ///
    /// # Errors
    /// Fails if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Saves only the auto-reply delay to the default config file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or written.
    pub fn save_auto_reply_delay(delay: &str) -> Result<()> {
        Self::save_auto_reply_delay_to(&paths::config_path(), delay)
    }

    /// Saves only the auto-reply delay, preserving comments and other fields.
    ///
    /// Creates the file from the template if it doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or written.
    pub fn save_auto_reply_delay_to(path: &Path, delay: &str) -> Result<()> {
        use toml_edit::{DocumentMut, value};

        let contents = if path.exists() {
            let user_config = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            merge_with_template(&user_config)?
        } else {
            default_config_template().to_string()
        };

        let mut doc: DocumentMut = contents
            .parse()
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        doc["auto_reply_delay"] = value(delay.trim());

        Self::write_config(path, &doc.to_string())
    }

    pub fn session(&self, id: SessionId) -> &SessionConfig {
        match id {
            SessionId::One => &self.session_1,
            SessionId::Two => &self.session_2,
        }
    }

    pub fn session_mut(&mut self, id: SessionId) -> &mut SessionConfig {
        match id {
            SessionId::One => &mut self.session_1,
            SessionId::Two => &mut self.session_2,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs.max(1))
    }

    pub fn health_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.health_refresh_secs.max(1))
    }

    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_reply_delay: Self::DEFAULT_AUTO_REPLY_DELAY.to_string(),
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
            stream_idle_timeout_secs: Self::DEFAULT_STREAM_IDLE_TIMEOUT_SECS,
            health_refresh_secs: Self::DEFAULT_HEALTH_REFRESH_SECS,
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
            session_1: SessionConfig::default(),
            session_2: SessionConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.auto_reply_delay, "1.0");
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
    }

    /// The shipped template must describe exactly the built-in defaults.
    #[test]
    fn test_template_matches_defaults() {
        let parsed: Config = toml::from_str(default_config_template()).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
auto_reply_delay = "0.5"

[session_2]
provider = "ollama"
model = "llama3"

[[providers.gemini.keys]]
id = "a"
api_key = "key-a"
note = "First"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.auto_reply_delay, "0.5");
        assert_eq!(config.session(SessionId::Two).provider.as_deref(), Some("ollama"));
        assert_eq!(config.session(SessionId::Two).temperature, 0.7);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.providers.gemini.keys[0].note, "First");
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "auto_reply_delay = [").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        Config::init(&path).unwrap();
        assert!(path.exists());
        let err = Config::init(&path).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_save_delay_preserves_other_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[session_1]\nmodel = \"m1\"\n").unwrap();

        Config::save_auto_reply_delay_to(&path, " 2.5 ").unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("# duet configuration"));
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.auto_reply_delay, "2.5");
        assert_eq!(config.session_1.model.as_deref(), Some("m1"));
    }

    #[test]
    fn test_selected_model_rejects_placeholders() {
        let mut session = SessionConfig::default();
        assert_eq!(session.selected_model(), None);
        session.model = Some("--- Gemini ---".to_string());
        assert_eq!(session.selected_model(), None);
        session.model = Some(" gemini-2.5-flash ".to_string());
        assert_eq!(session.selected_model(), Some("gemini-2.5-flash"));
    }

    #[test]
    fn test_temperature_is_clamped() {
        let session = SessionConfig {
            temperature: 3.5,
            ..SessionConfig::default()
        };
        assert_eq!(session.clamped_temperature(), 2.0);
        let session = SessionConfig {
            temperature: f32::NAN,
            ..SessionConfig::default()
        };
        assert_eq!(session.clamped_temperature(), 0.7);
    }

    #[test]
    fn test_unusable_keys_are_skipped() {
        let gemini = GeminiProviderConfig {
            base_url: None,
            keys: vec![
                ApiKeyConfig {
                    id: "blank".to_string(),
                    api_key: "  ".to_string(),
                    note: String::new(),
                },
                ApiKeyConfig {
                    id: "unicode".to_string(),
                    api_key: "kéy".to_string(),
                    note: String::new(),
                },
                ApiKeyConfig {
                    id: "ok".to_string(),
                    api_key: " abc ".to_string(),
                    note: "Fine".to_string(),
                },
            ],
        };
        let creds = gemini.credentials();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].id(), "ok");
        assert_eq!(creds[0].secret(), "abc");
    }
}
