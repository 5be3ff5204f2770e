//! Notification routing to the primary chat sink and the optional WhatsApp sink.
//!
//! Every send returns `bool`. Failures are logged and never retried here; the
//! caller decides what an unconfirmed delivery means.

use regex::Regex;
use reqwest::Client;
use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{RuntimeConfig, SlackConfig, WhatsAppConfig};
use crate::source::ChatPoster;

const TWILIO_API_BASE: &str = "https://api.twilio.com";
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(6);
const TWILIO_TIMEOUT: Duration = Duration::from_secs(10);

/// Configured primary destinations, in resolution order after an explicit override.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Destinations {
    pub critical_channel: Option<String>,
    pub summary_channel_id: Option<String>,
    pub summary_channel: Option<String>,
}

impl From<&SlackConfig> for Destinations {
    fn from(slack: &SlackConfig) -> Self {
        let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.trim().is_empty());
        Self {
            critical_channel: non_empty(&slack.critical_channel),
            summary_channel_id: non_empty(&slack.summary_channel_id),
            summary_channel: non_empty(&slack.summary_channel),
        }
    }
}

impl Destinations {
    /// Override, then critical, then summary id, then summary name.
    pub fn resolve(&self, channel_override: Option<&str>) -> Option<String> {
        if let Some(channel) = channel_override.filter(|c| !c.trim().is_empty()) {
            return Some(normalize_channel_reference(channel));
        }
        if let Some(channel) = &self.critical_channel {
            return Some(normalize_channel_reference(channel));
        }
        if let Some(id) = &self.summary_channel_id {
            return Some(id.trim().to_string());
        }
        self.summary_channel
            .as_deref()
            .map(normalize_channel_reference)
    }
}

/// Opaque channel ids pass through; bare names gain a `#` prefix.
pub fn normalize_channel_reference(value: &str) -> String {
    let value = value.trim();
    if (value.starts_with('C') || value.starts_with('G')) && value.len() > 5 && !value.contains(' ') {
        return value.to_string();
    }
    if value.starts_with('#') {
        return value.to_string();
    }
    format!("#{}", value)
}

fn whatsapp_number(value: &str) -> String {
    let value = value.trim();
    if value.starts_with("whatsapp:") {
        value.to_string()
    } else {
        format!("whatsapp:{}", value)
    }
}

/// Values mined from a saved Twilio `curl` command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceFileCredentials {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub content_sid: Option<String>,
}

fn capture(pattern: &str, content: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    re.captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn parse_service_file(content: &str) -> ServiceFileCredentials {
    let mut parsed = ServiceFileCredentials {
        account_sid: capture(r"Accounts/([A-Za-z0-9]+)/Messages", content),
        to_number: capture(r"--data-urlencode '\s*To=([^']+)'", content).map(|v| whatsapp_number(&v)),
        from_number: capture(r"--data-urlencode '\s*From=([^']+)'", content).map(|v| whatsapp_number(&v)),
        content_sid: capture(r"--data-urlencode '\s*ContentSid=([^']+)'", content),
        auth_token: None,
    };

    if let Ok(re) = Regex::new(r"-u\s+'?([A-Za-z0-9]+):([^\s']+)") {
        if let Some(caps) = re.captures(content) {
            parsed.account_sid = caps.get(1).map(|m| m.as_str().to_string());
            // `[AuthToken]` style placeholders are not credentials
            parsed.auth_token = caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .filter(|token| !token.starts_with('['));
        }
    }

    parsed
}

/// Fully resolved credentials for the Twilio Messages API.
#[derive(Debug, Clone, PartialEq)]
pub struct WhatsAppCredentials {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub to_number: String,
    pub content_sid: Option<String>,
    pub use_template: bool,
}

impl WhatsAppCredentials {
    /// Returns `None` (sink disabled) when not enabled or when any credential is missing.
    pub fn from_config(config: &WhatsAppConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        let from_file = match &config.service_file {
            Some(path) => match fs::read_to_string(path) {
                Ok(content) => parse_service_file(&content),
                Err(e) => {
                    warn!("Cannot read WhatsApp service file {}: {}", path, e);
                    ServiceFileCredentials::default()
                }
            },
            None => ServiceFileCredentials::default(),
        };

        Self::merge(config, from_file)
    }

    fn merge(config: &WhatsAppConfig, from_file: ServiceFileCredentials) -> Option<Self> {
        let pick = |inline: &Option<String>, parsed: Option<String>| {
            inline.clone().filter(|v| !v.trim().is_empty()).or(parsed)
        };

        let account_sid = pick(&config.account_sid, from_file.account_sid);
        let auth_token = pick(&config.auth_token, from_file.auth_token);
        let from_number = pick(&config.from_number, from_file.from_number);
        let to_number = pick(&config.to_number, from_file.to_number);
        let content_sid = pick(&config.content_sid, from_file.content_sid);

        match (account_sid, auth_token, from_number, to_number) {
            (Some(account_sid), Some(auth_token), Some(from), Some(to)) => Some(Self {
                account_sid,
                auth_token,
                from_number: whatsapp_number(&from),
                to_number: whatsapp_number(&to),
                content_sid,
                use_template: config.use_template,
            }),
            _ => {
                warn!("WhatsApp enabled but credentials are incomplete; secondary sink disabled");
                None
            }
        }
    }

    fn form_payload(&self, message: &str) -> Vec<(&'static str, String)> {
        let mut payload = vec![
            ("To", self.to_number.clone()),
            ("From", self.from_number.clone()),
        ];
        match (&self.content_sid, self.use_template) {
            (Some(content_sid), true) => {
                payload.push(("ContentSid", content_sid.clone()));
                payload.push(("ContentVariables", json!({ "1": message }).to_string()));
            }
            _ => payload.push(("Body", message.to_string())),
        }
        payload
    }
}

/// Delivers alert and digest text to the configured sinks.
pub struct NotificationRouter {
    client: Client,
    destinations: Destinations,
    webhook_url: Option<String>,
    poster: Option<Arc<dyn ChatPoster>>,
    whatsapp: Option<WhatsAppCredentials>,
    twilio_base_url: String,
}

impl NotificationRouter {
    pub fn new(
        destinations: Destinations,
        webhook_url: Option<String>,
        poster: Option<Arc<dyn ChatPoster>>,
        whatsapp: Option<WhatsAppCredentials>,
    ) -> Self {
        Self {
            client: Client::new(),
            destinations,
            webhook_url: webhook_url.filter(|url| !url.trim().is_empty()),
            poster,
            whatsapp,
            twilio_base_url: TWILIO_API_BASE.to_string(),
        }
    }

    pub fn from_config(config: &RuntimeConfig, poster: Option<Arc<dyn ChatPoster>>) -> Self {
        let router = Self::new(
            Destinations::from(&config.slack),
            config.notifications.slack_webhook.clone(),
            poster,
            WhatsAppCredentials::from_config(&config.notifications.whatsapp),
        );
        info!(
            webhook = router.webhook_url.is_some(),
            whatsapp = router.secondary_enabled(),
            "Notification router ready"
        );
        router
    }

    pub fn with_twilio_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.twilio_base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    pub fn secondary_enabled(&self) -> bool {
        self.whatsapp.is_some()
    }

    /// Send to the primary sink. Fails closed when no destination resolves.
    pub async fn send_primary(&self, text: &str, channel_override: Option<&str>) -> bool {
        let Some(channel) = self.destinations.resolve(channel_override) else {
            warn!("No primary destination configured; dropping notification");
            return false;
        };

        if let Some(url) = &self.webhook_url {
            return self.post_webhook(url, text).await;
        }

        let Some(poster) = &self.poster else {
            warn!("No chat poster available for {}", channel);
            return false;
        };

        match poster.post_message(&channel, text).await {
            Ok(()) => {
                debug!(channel = %channel, "Primary notification delivered");
                true
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Primary notification failed");
                false
            }
        }
    }

    async fn post_webhook(&self, url: &str, text: &str) -> bool {
        match self
            .client
            .post(url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(&json!({ "text": text }))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!("Webhook returned HTTP {}", response.status());
                false
            }
            Err(e) => {
                warn!("Webhook request failed: {}", e);
                false
            }
        }
    }

    /// Send to the WhatsApp sink; `false` when it is disabled or the gateway rejects it.
    pub async fn send_secondary(&self, text: &str) -> bool {
        let Some(creds) = &self.whatsapp else {
            return false;
        };

        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.twilio_base_url, creds.account_sid
        );

        match self
            .client
            .post(&url)
            .timeout(TWILIO_TIMEOUT)
            .basic_auth(&creds.account_sid, Some(&creds.auth_token))
            .form(&creds.form_payload(text))
            .send()
            .await
        {
            Ok(response) if matches!(response.status().as_u16(), 200 | 201) => true,
            Ok(response) => {
                warn!("WhatsApp gateway returned HTTP {}", response.status());
                false
            }
            Err(e) => {
                warn!("WhatsApp request failed: {}", e);
                false
            }
        }
    }
}
