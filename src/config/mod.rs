//! Configuration loaded once per invocation.
//!
//! The config file is JSON with camelCase keys at a per-OS canonical
//! location (`%APPDATA%\dev-agent` on Windows, `~/Library/Application
//! Support/dev-agent` on macOS, `~/.dev-agent` elsewhere). Missing fields
//! fall back to defaults, so an empty `{}` file is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Ceiling for the character-based token estimate of the history.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// Seconds before a running command is promoted to the background.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,

    /// Consecutive parse/transport failures tolerated in interactive mode.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Consecutive parse/transport failures tolerated in automated mode.
    #[serde(default = "default_max_retries_automated")]
    pub max_retries_automated: u32,

    /// Hard upper bound on agent loop iterations.
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,

    /// Sessions older than this are deleted at CLI startup.
    #[serde(default = "default_session_retention_days")]
    pub session_retention_days: u32,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_max_context_tokens() -> usize {
    131072
}
fn default_command_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_retries_automated() -> u32 {
    10
}
fn default_max_loops() -> u32 {
    1000
}
fn default_session_retention_days() -> u32 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: String::new(),
            model: default_model(),
            max_context_tokens: default_max_context_tokens(),
            command_timeout: default_command_timeout(),
            max_retries: default_max_retries(),
            max_retries_automated: default_max_retries_automated(),
            max_loops: default_max_loops(),
            session_retention_days: default_session_retention_days(),
        }
    }
}

impl Config {
    /// Per-OS configuration directory.
    pub fn config_dir() -> Result<PathBuf> {
        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;

        if cfg!(target_os = "windows") || cfg!(target_os = "macos") {
            Ok(base.config_dir().join("dev-agent"))
        } else {
            Ok(base.home_dir().join(".dev-agent"))
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Sessions live in a sibling directory of the config file.
    pub fn sessions_dir() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("sessions"))
    }

    pub fn exists() -> bool {
        Self::config_path().map(|p| p.exists()).unwrap_or(false)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Malformed config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)
            .with_context(|| format!("Cannot write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        match key {
            "apiUrl" => Ok(self.api_url.clone()),
            "apiKey" => Ok(self.api_key.clone()),
            "model" => Ok(self.model.clone()),
            "maxContextTokens" => Ok(self.max_context_tokens.to_string()),
            "commandTimeout" => Ok(self.command_timeout.to_string()),
            "maxRetries" => Ok(self.max_retries.to_string()),
            "maxRetriesAutomated" => Ok(self.max_retries_automated.to_string()),
            "maxLoops" => Ok(self.max_loops.to_string()),
            "sessionRetentionDays" => Ok(self.session_retention_days.to_string()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "apiUrl" => self.api_url = value.to_string(),
            "apiKey" => self.api_key = value.to_string(),
            "model" => self.model = value.to_string(),
            "maxContextTokens" => self.max_context_tokens = value.parse()?,
            "commandTimeout" => self.command_timeout = value.parse()?,
            "maxRetries" => self.max_retries = value.parse()?,
            "maxRetriesAutomated" => self.max_retries_automated = value.parse()?,
            "maxLoops" => self.max_loops = value.parse()?,
            "sessionRetentionDays" => self.session_retention_days = value.parse()?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_context_tokens, 131072);
        assert_eq!(config.command_timeout, 30);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_retries_automated, 10);
        assert_eq!(config.max_loops, 1000);
        assert_eq!(config.session_retention_days, 30);
        assert!(config.api_key.is_empty());
    }

    #[test]
    fn empty_object_deserializes_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_context_tokens, 131072);
        assert_eq!(config.api_url, "https://api.openai.com/v1");
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let config: Config =
            serde_json::from_str(r#"{"model":"local-model","commandTimeout":5}"#).unwrap();
        assert_eq!(config.model, "local-model");
        assert_eq!(config.command_timeout, 5);
        assert_eq!(config.max_loops, 1000);
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("\"apiUrl\""));
        assert!(json.contains("\"maxContextTokens\""));
        assert!(json.contains("\"sessionRetentionDays\""));
        assert!(!json.contains("api_url"));
    }

    #[test]
    fn get_value_round_trips_set_value() {
        let mut config = Config::default();
        config.set_value("maxLoops", "42").unwrap();
        assert_eq!(config.max_loops, 42);
        assert_eq!(config.get_value("maxLoops").unwrap(), "42");

        config.set_value("model", "my-model").unwrap();
        assert_eq!(config.get_value("model").unwrap(), "my-model");
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut config = Config::default();
        assert!(config.get_value("nope").is_err());
        assert!(config.set_value("nope", "1").is_err());
        assert!(config.set_value("maxLoops", "not-a-number").is_err());
    }
}
