// Periodic digest of recent alerts, delivered through the notification router

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{DigestConfig, SlackConfig};
use crate::error::Result;
use crate::llm::LlmClient;
use crate::model::{AlertRecord, SeverityLevel};
use crate::notify::NotificationRouter;
use crate::store::AlertStore;
use crate::text::preview;

const PREVIEW_CHARS: usize = 120;

/// What happened to one digest.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestOutcome {
    pub alert_count: usize,
    pub primary_sent: bool,
    /// `None` when the secondary sink is not configured.
    pub secondary_sent: Option<bool>,
    pub summarized: bool,
    pub message: String,
}

/// Render the fixed-format digest body for `alerts` (newest first).
pub fn render_digest(
    alerts: &[AlertRecord],
    lookback_minutes: i64,
    max_highlights: usize,
    now: DateTime<Utc>,
) -> String {
    let total = alerts.len();
    let sent = alerts.iter().filter(|a| a.sent).count();
    let critical = alerts
        .iter()
        .filter(|a| a.importance == SeverityLevel::Critical)
        .count();
    let important = alerts
        .iter()
        .filter(|a| a.importance == SeverityLevel::Important)
        .count();

    let mut lines = vec![
        format!("🕒 *Alert digest - {} UTC*", now.format("%d/%m %H:%M")),
        format!("Window: last {} minutes", lookback_minutes),
        format!(
            "Total alerts recorded: {} (notified: {} | filtered: {})",
            total,
            sent,
            total - sent
        ),
    ];

    if critical > 0 || important > 0 {
        let mut segments = Vec::new();
        if critical > 0 {
            segments.push(format!("🚨 {} critical", critical));
        }
        if important > 0 {
            segments.push(format!("⚠️ {} important", important));
        }
        lines.push(format!("Classification: {}", segments.join(", ")));
    } else {
        lines.push("Classification: no critical or important alerts in this window.".to_string());
    }

    if alerts.is_empty() {
        lines.push("\n✅ Nothing relevant recorded in this window.".to_string());
    } else {
        lines.push("\n📌 Highlights:".to_string());
        for alert in alerts.iter().take(max_highlights.max(1)) {
            let at = alert.event_ts.unwrap_or(alert.detected_at);
            lines.push(format!(
                "{} {} · #{} · [{}] · {}",
                if alert.sent { "✅" } else { "⏳" },
                at.format("%H:%M"),
                alert.channel_label,
                alert.importance,
                preview(&alert.text, PREVIEW_CHARS)
            ));
            lines.push(format!("   • Reason: {}", alert.decision_reason));
        }
    }

    lines.push("\n_Periodic digest_".to_string());
    lines.join("\n")
}

pub struct DigestGenerator {
    store: AlertStore,
    router: Arc<NotificationRouter>,
    settings: DigestConfig,
    target: Option<String>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl DigestGenerator {
    pub fn new(store: AlertStore, router: Arc<NotificationRouter>, settings: &DigestConfig, slack: &SlackConfig) -> Self {
        let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.trim().is_empty());
        let target = non_empty(&slack.summary_channel_id).or_else(|| non_empty(&slack.summary_channel));
        Self {
            store,
            router,
            settings: settings.clone(),
            target,
            llm: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub async fn build_digest_message(&self, lookback_minutes: i64, include_filtered: bool) -> Result<(usize, String)> {
        let alerts = self
            .store
            .fetch_recent_alerts(lookback_minutes, include_filtered, SeverityLevel::Normal)
            .await?;
        let message = render_digest(&alerts, lookback_minutes, self.settings.max_highlights, Utc::now());
        Ok((alerts.len(), message))
    }

    async fn summarize(&self, message: &mut String) -> bool {
        let Some(llm) = &self.llm else {
            return false;
        };
        let prompt = format!("Summarize the key points of this alert digest:\n\n{}", message);
        let timeout = Duration::from_secs(self.settings.llm.timeout_seconds.max(1));

        match tokio::time::timeout(timeout, llm.invoke(&prompt)).await {
            Ok(Ok(summary)) if !summary.trim().is_empty() => {
                message.push_str(&format!("\n\n🧠 *Summary:*\n{}", summary.trim()));
                true
            }
            Ok(Ok(_)) => false,
            Ok(Err(e)) => {
                warn!("Digest summary failed: {}", e);
                message.push_str(&format!("\n\n⚠️ LLM summary failed: {}", e));
                false
            }
            Err(_) => {
                warn!("Digest summary timed out");
                message.push_str("\n\n⚠️ LLM summary failed: timed out");
                false
            }
        }
    }

    /// Build the digest and route it to the summary destination and, when enabled, the secondary sink.
    pub async fn send_digest(&self) -> Result<DigestOutcome> {
        let (alert_count, mut message) = self
            .build_digest_message(self.settings.lookback_minutes, self.settings.include_filtered)
            .await?;
        let summarized = self.summarize(&mut message).await;

        let primary_sent = self.router.send_primary(&message, self.target.as_deref()).await;
        let secondary_sent = if self.router.secondary_enabled() {
            Some(self.router.send_secondary(&message).await)
        } else {
            None
        };

        info!(alerts = alert_count, primary_sent, ?secondary_sent, "Digest dispatched");
        Ok(DigestOutcome {
            alert_count,
            primary_sent,
            secondary_sent,
            summarized,
            message,
        })
    }

    /// Send a digest every `interval_minutes` until `shutdown` flips to true.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.settings.interval_minutes.max(1) * 60);
        info!(interval_minutes = interval.as_secs() / 60, "Digest loop started");

        if self.settings.send_initial && !*shutdown.borrow() {
            if let Err(e) = self.send_digest().await {
                warn!("Initial digest failed: {}", e);
            }
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.send_digest().await {
                warn!("Digest failed: {}", e);
            }
        }

        info!("Digest loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonitorError;
    use crate::llm::LlmError;
    use crate::notify::Destinations;
    use crate::source::ChatPoster;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingPoster {
        posts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChatPoster for RecordingPoster {
        async fn post_message(&self, channel: &str, text: &str) -> Result<()> {
            self.posts.lock().unwrap().push((channel.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn invoke(&self, _prompt: &str) -> std::result::Result<String, LlmError> {
            Err(LlmError::RateLimited)
        }
    }

    fn alert(id: &str, level: SeverityLevel, sent: bool, text: &str) -> AlertRecord {
        AlertRecord {
            message_id: format!("C1:{}", id),
            channel_id: "C1".to_string(),
            channel_label: "ops".to_string(),
            user: None,
            text: text.to_string(),
            source_ts: id.to_string(),
            importance: level,
            decision_reason: "Base severity NORMAL (channel hint)".to_string(),
            detected_at: Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap(),
            event_ts: Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 15, 0).unwrap()),
            content_hash: None,
            pattern_signature: None,
            sent,
        }
    }

    #[test]
    fn test_render_digest_counts_and_highlights() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let long_text = "x".repeat(200);
        let alerts = vec![
            alert("3", SeverityLevel::Critical, true, "db primary down"),
            alert("2", SeverityLevel::Important, false, &long_text),
            alert("1", SeverityLevel::Normal, false, "deploy done"),
        ];

        let body = render_digest(&alerts, 60, 2, now);
        assert!(body.starts_with("🕒 *Alert digest - 01/05 10:00 UTC*"));
        assert!(body.contains("Total alerts recorded: 3 (notified: 1 | filtered: 2)"));
        assert!(body.contains("Classification: 🚨 1 critical, ⚠️ 1 important"));
        assert!(body.contains("✅ 09:15 · #ops · [CRITICAL] · db primary down"));
        assert!(body.contains(&format!("⏳ 09:15 · #ops · [IMPORTANT] · {}...", "x".repeat(117))));
        assert!(!body.contains("deploy done"));
    }

    #[test]
    fn test_render_empty_digest() {
        let body = render_digest(&[], 30, 10, Utc::now());
        assert!(body.contains("Total alerts recorded: 0 (notified: 0 | filtered: 0)"));
        assert!(body.contains("no critical or important alerts"));
        assert!(body.contains("Nothing relevant recorded"));
    }

    #[tokio::test]
    async fn test_send_digest_targets_summary_channel_and_notes_llm_failure() {
        let dir = tempdir().unwrap();
        let store = AlertStore::open(dir.path().join("digest.db")).await.unwrap();
        let mut record = alert("1", SeverityLevel::Critical, true, "payments failing");
        record.detected_at = Utc::now();
        store.record_alert(&record).await.unwrap();
        let mut ignored = alert("2", SeverityLevel::Ignore, false, "[test] ping");
        ignored.detected_at = Utc::now();
        store.record_alert(&ignored).await.unwrap();

        let poster = Arc::new(RecordingPoster::default());
        let slack = SlackConfig {
            critical_channel: Some("incidents".to_string()),
            summary_channel: Some("daily-digest".to_string()),
            ..SlackConfig::default()
        };
        let router = Arc::new(NotificationRouter::new(
            Destinations::from(&slack),
            None,
            Some(poster.clone()),
            None,
        ));
        let generator =
            DigestGenerator::new(store, router, &DigestConfig::default(), &slack).with_llm(Arc::new(FailingLlm));

        let outcome = generator.send_digest().await.unwrap();
        assert_eq!(outcome.alert_count, 1);
        assert!(outcome.primary_sent);
        assert_eq!(outcome.secondary_sent, None);
        assert!(!outcome.summarized);
        assert!(outcome.message.contains("LLM summary failed: Rate limited"));

        let posts = poster.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "#daily-digest");
        assert!(posts[0].1.contains("payments failing"));
    }

    #[tokio::test]
    async fn test_digest_propagates_store_errors() {
        let dir = tempdir().unwrap();
        let store = AlertStore::open(dir.path().join("closed.db")).await.unwrap();
        store.close().await;

        let router = Arc::new(NotificationRouter::new(Destinations::default(), None, None, None));
        let generator = DigestGenerator::new(store, router, &DigestConfig::default(), &SlackConfig::default());
        let err = generator.send_digest().await.unwrap_err();
        assert!(matches!(err, MonitorError::Storage(_)));
    }

    #[tokio::test]
    async fn test_blank_summary_channel_id_falls_back_to_name() {
        let dir = tempdir().unwrap();
        let store = AlertStore::open(dir.path().join("target.db")).await.unwrap();
        let router = Arc::new(NotificationRouter::new(Destinations::default(), None, None, None));

        let slack = SlackConfig {
            summary_channel_id: Some("  ".to_string()),
            summary_channel: Some("daily-digest".to_string()),
            ..SlackConfig::default()
        };
        let generator = DigestGenerator::new(store.clone(), router.clone(), &DigestConfig::default(), &slack);
        assert_eq!(generator.target.as_deref(), Some("daily-digest"));

        let slack = SlackConfig {
            summary_channel_id: Some(String::new()),
            ..SlackConfig::default()
        };
        let generator = DigestGenerator::new(store, router, &DigestConfig::default(), &slack);
        assert_eq!(generator.target, None);
    }
}
