//! Runtime configuration loaded once at startup from a TOML file.
//!
//! String values of the form `${NAME}` are replaced with the environment
//! variable `NAME` at load time. Configuration is immutable afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::db_path::resolve_database_path;
use crate::error::{MonitorError, Result};
use crate::model::{ChannelRule, SeverityLevel};

pub const CONFIG_PATH_ENV: &str = "CHATWATCH_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "chatwatch.toml";
pub const DEFAULT_BOT_TOKEN_ENV: &str = "SLACK_BOT_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub bot_token: Option<String>,
    pub bot_token_env: Option<String>,
    pub summary_channel: Option<String>,
    pub summary_channel_id: Option<String>,
    pub critical_channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub provider: Option<String>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    pub timeout_seconds: u64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: None,
            endpoint: None,
            model: None,
            api_key: None,
            api_key_env: None,
            timeout_seconds: 8,
            max_tokens: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub enabled: bool,
    /// Saved `curl` command for the Twilio Messages API to mine credentials from.
    pub service_file: Option<String>,
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub auth_token_env: Option<String>,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub content_sid: Option<String>,
    pub use_template: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub slack_webhook: Option<String>,
    pub whatsapp: WhatsAppConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub enabled: bool,
    pub check_interval_seconds: u64,
    pub severity_threshold: SeverityLevel,
    pub duplicate_window_minutes: i64,
    pub page_size: u32,
    pub fetch_timeout_seconds: u64,
    pub seen_cache_size: usize,
    pub llm: LlmConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: 30,
            severity_threshold: SeverityLevel::Important,
            duplicate_window_minutes: 60,
            page_size: 200,
            fetch_timeout_seconds: 20,
            seen_cache_size: 4096,
            llm: LlmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub lookback_minutes: i64,
    pub include_filtered: bool,
    pub send_initial: bool,
    pub max_highlights: usize,
    pub llm: LlmConfig,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 60,
            lookback_minutes: 60,
            include_filtered: true,
            send_initial: false,
            max_highlights: 10,
            llm: LlmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub database_path: Option<String>,
    pub slack: SlackConfig,
    pub channels: Vec<ChannelRule>,
    pub notifications: NotificationsConfig,
    pub realtime: RealtimeConfig,
    pub digest: DigestConfig,
}

/// Replace a `${NAME}` reference using `lookup`; other values pass through trimmed.
pub fn resolve_env_reference<F>(value: Option<String>, lookup: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let value = value?;
    let trimmed = value.trim();
    if let Some(name) = trimmed.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
        return lookup(name).filter(|v| !v.is_empty());
    }
    Some(trimmed.to_string())
}

fn env_lookup(name: &str) -> Option<String> {
    env::var(name).ok()
}

impl RuntimeConfig {
    /// Config path priority: CLI flag, `CHATWATCH_CONFIG`, `./chatwatch.toml`.
    pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
        if let Some(path) = cli_path {
            return path.to_path_buf();
        }
        match env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_CONFIG_FILE),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MonitorError::configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        let content = fs::read_to_string(path).map_err(|e| {
            MonitorError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::from_toml_str_with(content, &env_lookup)
    }

    /// Parse, resolve environment references through `lookup`, and validate.
    pub fn from_toml_str_with<F>(content: &str, lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: RuntimeConfig = toml::from_str(content)?;
        config.resolve_references(lookup);
        config.validate()?;
        Ok(config)
    }

    fn resolve_references<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.database_path = resolve_env_reference(self.database_path.take(), lookup);

        let slack = &mut self.slack;
        slack.bot_token = resolve_env_reference(slack.bot_token.take(), lookup);
        slack.summary_channel = resolve_env_reference(slack.summary_channel.take(), lookup);
        slack.summary_channel_id = resolve_env_reference(slack.summary_channel_id.take(), lookup);
        slack.critical_channel = resolve_env_reference(slack.critical_channel.take(), lookup);

        let notifications = &mut self.notifications;
        notifications.slack_webhook = resolve_env_reference(notifications.slack_webhook.take(), lookup);

        let whatsapp = &mut notifications.whatsapp;
        whatsapp.service_file = resolve_env_reference(whatsapp.service_file.take(), lookup);
        whatsapp.account_sid = resolve_env_reference(whatsapp.account_sid.take(), lookup);
        whatsapp.auth_token = resolve_env_reference(whatsapp.auth_token.take(), lookup);
        whatsapp.from_number = resolve_env_reference(whatsapp.from_number.take(), lookup);
        whatsapp.to_number = resolve_env_reference(whatsapp.to_number.take(), lookup);
        whatsapp.content_sid = resolve_env_reference(whatsapp.content_sid.take(), lookup);
        if whatsapp.auth_token.is_none() {
            if let Some(name) = &whatsapp.auth_token_env {
                whatsapp.auth_token = lookup(name).filter(|v| !v.is_empty());
            }
        }

        for llm in [&mut self.realtime.llm, &mut self.digest.llm] {
            llm.endpoint = resolve_env_reference(llm.endpoint.take(), lookup);
            llm.api_key = resolve_env_reference(llm.api_key.take(), lookup);
            if llm.api_key.is_none() {
                if let Some(name) = &llm.api_key_env {
                    llm.api_key = lookup(name).filter(|v| !v.is_empty());
                }
            }
        }
    }

    fn validate(&mut self) -> Result<()> {
        let mut seen = HashSet::new();

        for rule in &mut self.channels {
            rule.id = rule.id.trim().to_string();
            if rule.id.is_empty() {
                return Err(MonitorError::configuration("Channel entry missing 'id'"));
            }
            if !seen.insert(rule.id.clone()) {
                return Err(MonitorError::configuration(format!(
                    "Duplicate channel id '{}'",
                    rule.id
                )));
            }
            if rule.label.trim().is_empty() {
                rule.label = rule.id.clone();
            }
            if rule.recurrence_threshold == 0 {
                warn!(channel = %rule.id, "recurrence_threshold must be at least 1, using 1");
                rule.recurrence_threshold = 1;
            }
            rule.critical_keywords.retain(|k| !k.trim().is_empty());
            rule.ignore_patterns.retain(|p| !p.trim().is_empty());
        }

        if self.channels.is_empty() {
            warn!("No channels configured; the realtime monitor will have nothing to poll");
        }

        if self.realtime.duplicate_window_minutes < 0 {
            return Err(MonitorError::configuration(
                "realtime.duplicate_window_minutes must not be negative",
            ));
        }
        if self.digest.lookback_minutes <= 0 {
            return Err(MonitorError::configuration("digest.lookback_minutes must be positive"));
        }

        Ok(())
    }

    /// Bot token: `slack.bot_token`, then the env var named by `slack.bot_token_env`,
    /// then `SLACK_BOT_TOKEN`.
    pub fn bot_token(&self) -> Result<String> {
        self.bot_token_with(&env_lookup)
    }

    pub fn bot_token_with<F>(&self, lookup: &F) -> Result<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.slack
            .bot_token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| {
                self.slack
                    .bot_token_env
                    .as_deref()
                    .and_then(|name| lookup(name))
                    .filter(|t| !t.is_empty())
            })
            .or_else(|| lookup(DEFAULT_BOT_TOKEN_ENV).filter(|t| !t.is_empty()))
            .ok_or_else(|| {
                MonitorError::configuration(
                    "Slack bot token not found. Define slack.bot_token or slack.bot_token_env",
                )
            })
    }

    pub fn database_path(&self) -> PathBuf {
        resolve_database_path(self.database_path.as_deref())
    }

    pub fn active_channels(&self) -> impl Iterator<Item = &ChannelRule> {
        self.channels.iter().filter(|rule| !rule.muted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    const SAMPLE: &str = r##"
database_path = "${ALERT_DB}"

[slack]
bot_token_env = "OPS_BOT_TOKEN"
summary_channel = "alerts-digest"
critical_channel = "#incidents"

[[channels]]
id = "C0123456"
label = "payments"
severity_hint = "important"
recurrence_threshold = 2
critical_keywords = ["outage", "5xx"]
ignore_patterns = ["[test]"]

[[channels]]
id = "C0999999"
muted = true

[notifications]
slack_webhook = "${HOOK_URL}"

[notifications.whatsapp]
enabled = true
account_sid = "AC123"
auth_token_env = "TWILIO_TOKEN"
to_number = "+15550001111"

[realtime]
check_interval_seconds = 15

[realtime.llm]
enabled = true
endpoint = "http://localhost:8080/v1/chat/completions"
model = "tiny"
api_key = "${LLM_KEY}"

[digest]
enabled = true
send_initial = true
"##;

    #[test]
    fn test_sample_config_parses_with_defaults() {
        let lookup = lookup_from(&[
            ("ALERT_DB", "/tmp/alerts.db"),
            ("HOOK_URL", "https://hooks.example/abc"),
            ("TWILIO_TOKEN", "secret"),
            ("LLM_KEY", "sk-test"),
        ]);
        let config = RuntimeConfig::from_toml_str_with(SAMPLE, &lookup).unwrap();

        assert_eq!(config.database_path.as_deref(), Some("/tmp/alerts.db"));
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].severity_hint, SeverityLevel::Important);
        assert_eq!(config.channels[0].recurrence_threshold, 2);
        assert_eq!(config.channels[1].label, "C0999999");
        assert_eq!(config.channels[1].severity_hint, SeverityLevel::Normal);
        assert_eq!(config.active_channels().count(), 1);

        assert_eq!(config.notifications.slack_webhook.as_deref(), Some("https://hooks.example/abc"));
        assert_eq!(config.notifications.whatsapp.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.realtime.check_interval_seconds, 15);
        assert_eq!(config.realtime.severity_threshold, SeverityLevel::Important);
        assert_eq!(config.realtime.duplicate_window_minutes, 60);
        assert_eq!(config.realtime.page_size, 200);
        assert_eq!(config.realtime.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.realtime.llm.timeout_seconds, 8);
        assert_eq!(config.realtime.llm.max_tokens, 256);
        assert!(config.digest.enabled);
        assert_eq!(config.digest.interval_minutes, 60);
        assert_eq!(config.digest.lookback_minutes, 60);
        assert!(config.digest.include_filtered);
    }

    #[test]
    fn test_missing_env_reference_resolves_to_none() {
        let lookup = lookup_from(&[]);
        let config = RuntimeConfig::from_toml_str_with(SAMPLE, &lookup).unwrap();
        assert_eq!(config.notifications.slack_webhook, None);
        assert_eq!(config.database_path, None);
    }

    #[test]
    fn test_bot_token_priority() {
        let config = RuntimeConfig::from_toml_str_with(SAMPLE, &lookup_from(&[])).unwrap();

        let both = lookup_from(&[("OPS_BOT_TOKEN", "xoxb-ops"), ("SLACK_BOT_TOKEN", "xoxb-default")]);
        assert_eq!(config.bot_token_with(&both).unwrap(), "xoxb-ops");

        let fallback = lookup_from(&[("SLACK_BOT_TOKEN", "xoxb-default")]);
        assert_eq!(config.bot_token_with(&fallback).unwrap(), "xoxb-default");

        let err = config.bot_token_with(&lookup_from(&[])).unwrap_err();
        assert!(err.is_fatal());

        let mut inline = config.clone();
        inline.slack.bot_token = Some("xoxb-inline".to_string());
        assert_eq!(inline.bot_token_with(&both).unwrap(), "xoxb-inline");
    }

    #[test]
    fn test_unknown_severity_is_configuration_error() {
        let toml = "[[channels]]\nid = \"C1\"\nseverity_hint = \"urgent\"\n";
        let err = RuntimeConfig::from_toml_str_with(toml, &lookup_from(&[])).unwrap_err();
        assert!(err.is_fatal());

        let toml = "[realtime]\nseverity_threshold = \"LOUD\"\n";
        assert!(RuntimeConfig::from_toml_str_with(toml, &lookup_from(&[])).is_err());
    }

    #[test]
    fn test_channel_validation() {
        let empty = "[[channels]]\nid = \"  \"\n";
        assert!(RuntimeConfig::from_toml_str_with(empty, &lookup_from(&[])).is_err());

        let duplicate = "[[channels]]\nid = \"C1\"\n\n[[channels]]\nid = \"C1\"\n";
        let err = RuntimeConfig::from_toml_str_with(duplicate, &lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("Duplicate channel id"));

        let zero = "[[channels]]\nid = \"C1\"\nrecurrence_threshold = 0\n";
        let config = RuntimeConfig::from_toml_str_with(zero, &lookup_from(&[])).unwrap();
        assert_eq!(config.channels[0].recurrence_threshold, 1);
    }

    #[test]
    fn test_load_missing_file_is_fatal() {
        let err = RuntimeConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_resolve_path_prefers_cli_flag() {
        let path = RuntimeConfig::resolve_path(Some(Path::new("custom.toml")));
        assert_eq!(path, PathBuf::from("custom.toml"));
    }
}
