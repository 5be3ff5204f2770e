// Upstream chat platform: message history fetch and message posting

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{MonitorError, Result};
use crate::model::SourceMessage;

const SLACK_API_BASE: &str = "https://slack.com/api";
const MAX_TRANSPORT_ATTEMPTS: u32 = 3;
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Cursor-based incremental reader of channel history.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Messages strictly newer than `since_ts`, oldest first.
    async fn fetch_messages(&self, channel_id: &str, since_ts: &str, limit: u32) -> Result<Vec<SourceMessage>>;
}

/// Posts a text message to a channel by id or `#name`.
#[async_trait]
pub trait ChatPoster: Send + Sync {
    async fn post_message(&self, channel: &str, text: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    messages: Vec<HistoryItem>,
}

#[derive(Debug, Deserialize)]
struct HistoryItem {
    ts: Option<String>,
    user: Option<String>,
    text: Option<String>,
    thread_ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Turns a newest-first history page into oldest-first messages, dropping
/// entries that carry no timestamp or no text.
fn into_chronological(items: Vec<HistoryItem>) -> Vec<SourceMessage> {
    let mut messages: Vec<SourceMessage> = items
        .into_iter()
        .filter_map(|item| {
            let ts = item.ts.filter(|ts| !ts.is_empty())?;
            let text = item.text.filter(|text| !text.is_empty())?;
            Some(SourceMessage {
                ts,
                user: item.user,
                text,
                thread_ts: item.thread_ts,
            })
        })
        .collect();
    messages.reverse();
    messages
}

fn retry_after(response: &reqwest::Response, fallback: Duration) -> Duration {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(fallback)
}

/// Slack Web API client.
#[derive(Debug, Clone)]
pub struct SlackClient {
    client: Client,
    token: String,
    base_url: String,
    retry_delay: Duration,
}

impl SlackClient {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            token: token.into(),
            base_url: SLACK_API_BASE.to_string(),
            retry_delay: Duration::from_secs(1),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    /// Sends a request, waiting out 429s and retrying transport failures with linear backoff.
    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut transport_attempts = 0;
        let mut rate_limited = 0;

        loop {
            match build().bearer_auth(&self.token).send().await {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    rate_limited += 1;
                    if rate_limited > MAX_RATE_LIMIT_RETRIES {
                        return Err(MonitorError::fetch("slack", "rate limited"));
                    }
                    let wait = retry_after(&response, self.retry_delay);
                    warn!("Slack rate limit hit, retrying in {:?}", wait);
                    tokio::time::sleep(wait).await;
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    transport_attempts += 1;
                    if transport_attempts >= MAX_TRANSPORT_ATTEMPTS {
                        return Err(e.into());
                    }
                    debug!(attempt = transport_attempts, error = %e, "Slack request failed, backing off");
                    tokio::time::sleep(self.retry_delay * transport_attempts).await;
                }
            }
        }
    }
}

#[async_trait]
impl MessageSource for SlackClient {
    async fn fetch_messages(&self, channel_id: &str, since_ts: &str, limit: u32) -> Result<Vec<SourceMessage>> {
        let url = self.endpoint("conversations.history");
        let limit = limit.to_string();
        let response = self
            .send_with_retry(|| {
                self.client.get(&url).query(&[
                    ("channel", channel_id),
                    ("oldest", since_ts),
                    ("limit", limit.as_str()),
                    ("inclusive", "false"),
                ])
            })
            .await
            .map_err(|e| MonitorError::fetch(channel_id, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::fetch(channel_id, format!("HTTP {}", status)));
        }

        let body: HistoryResponse = response
            .json()
            .await
            .map_err(|e| MonitorError::fetch(channel_id, format!("invalid history payload: {}", e)))?;
        if !body.ok {
            return Err(MonitorError::fetch(
                channel_id,
                body.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }

        Ok(into_chronological(body.messages))
    }
}

#[async_trait]
impl ChatPoster for SlackClient {
    async fn post_message(&self, channel: &str, text: &str) -> Result<()> {
        let url = self.endpoint("chat.postMessage");
        let payload = json!({ "channel": channel, "text": text });
        let response = self
            .send_with_retry(|| self.client.post(&url).json(&payload))
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MonitorError::delivery("slack", format!("HTTP {}", status)));
        }

        let body: PostResponse = response.json().await?;
        if !body.ok {
            return Err(MonitorError::delivery(
                "slack",
                body.error.unwrap_or_else(|| "unknown_error".to_string()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_reversed_and_filtered() {
        let body: HistoryResponse = serde_json::from_str(
            r#"{
                "ok": true,
                "messages": [
                    {"ts": "300.0", "user": "U2", "text": "newest"},
                    {"ts": "250.0", "user": "U9", "text": ""},
                    {"user": "U3", "text": "no ts"},
                    {"ts": "200.0", "text": "bot message", "thread_ts": "150.0"},
                    {"ts": "100.0", "user": "U1", "text": "oldest"}
                ]
            }"#,
        )
        .unwrap();

        let messages = into_chronological(body.messages);
        let ts: Vec<&str> = messages.iter().map(|m| m.ts.as_str()).collect();
        assert_eq!(ts, vec!["100.0", "200.0", "300.0"]);
        assert_eq!(messages[1].user, None);
        assert_eq!(messages[1].thread_ts.as_deref(), Some("150.0"));
    }

    #[test]
    fn test_error_body_parses() {
        let body: HistoryResponse =
            serde_json::from_str(r#"{"ok": false, "error": "channel_not_found"}"#).unwrap();
        assert!(!body.ok);
        assert_eq!(body.error.as_deref(), Some("channel_not_found"));
        assert!(body.messages.is_empty());
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = SlackClient::new("xoxb-test").unwrap().with_base_url("http://127.0.0.1:9/api/");
        assert_eq!(client.endpoint("chat.postMessage"), "http://127.0.0.1:9/api/chat.postMessage");
    }
}
