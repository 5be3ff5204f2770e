//! Realtime polling loop: fetch, classify, persist, notify, advance cursor.
//!
//! Per channel the monitor moves from *uninitialized* (no cursor) to
//! *cursor-bootstrapped* (cursor set to "now", nothing processed) to *polling*.
//! The cursor only moves after the messages it covers are durably recorded,
//! so a crash mid-batch re-delivers instead of losing messages.

use chrono::Utc;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classification, HeuristicClassifier};
use crate::config::RealtimeConfig;
use crate::error::{MonitorError, Result};
use crate::llm::{parse_severity_reply, render_triage_prompt, LlmClient};
use crate::model::{epoch_ts, AlertRecord, ChannelRule, SeverityLevel, SourceMessage};
use crate::notify::NotificationRouter;
use crate::source::MessageSource;
use crate::store::AlertStore;

const MIN_CHECK_INTERVAL_SECS: u64 = 5;

/// Feature switches replacing separate monitor variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorCapabilities {
    /// When off, nothing is written to the store: alerts are classified but not
    /// recorded and cursors only move in memory.
    pub persist_alerts: bool,
    pub notifications: bool,
    pub secondary_classifier: bool,
}

impl Default for MonitorCapabilities {
    fn default() -> Self {
        Self {
            persist_alerts: true,
            notifications: true,
            secondary_classifier: true,
        }
    }
}

/// Bounded set of recently handled message ids.
///
/// Only a fast path in front of [`AlertStore::has_message`]; eviction or a
/// restart simply falls back to the store.
pub struct SeenCache {
    inner: Mutex<LruCache<String, ()>>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        let mut cache = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.get(message_id).is_some()
    }

    pub fn insert(&self, message_id: String) {
        let mut cache = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.put(message_id, ());
    }

    pub fn len(&self) -> usize {
        let cache = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counters for one `run_once` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub channels_polled: usize,
    pub channels_bootstrapped: usize,
    pub channels_failed: usize,
    pub messages_fetched: usize,
    pub messages_classified: usize,
    pub alerts_recorded: usize,
    pub duplicates: usize,
    pub notifications_sent: usize,
    pub notifications_failed: usize,
    pub message_errors: usize,
}

fn severity_icon(level: SeverityLevel) -> &'static str {
    if level == SeverityLevel::Critical {
        "🚨"
    } else {
        "⚠️"
    }
}

/// Markdown rendering for the primary chat sink.
pub fn format_primary_alert(alert: &AlertRecord) -> String {
    format!(
        "{} *{}* alert in #{}\n• User: `{}`\n• Text: {}\n• Reason: {}",
        severity_icon(alert.importance),
        alert.importance,
        alert.channel_label,
        alert.user.as_deref().unwrap_or("unknown"),
        alert.text.trim(),
        alert.decision_reason
    )
}

/// Plain-text rendering for the secondary sink.
pub fn format_secondary_alert(alert: &AlertRecord) -> String {
    format!(
        "{} ALERT {}\nChannel: #{}\nUser: {}\nMessage: {}\nReason: {}",
        severity_icon(alert.importance),
        alert.importance,
        alert.channel_label,
        alert.user.as_deref().unwrap_or("unknown"),
        alert.text.trim(),
        alert.decision_reason
    )
}

pub struct RealtimeMonitor {
    store: AlertStore,
    classifier: HeuristicClassifier,
    source: Arc<dyn MessageSource>,
    router: Arc<NotificationRouter>,
    llm: Option<Arc<dyn LlmClient>>,
    channels: Vec<ChannelRule>,
    capabilities: MonitorCapabilities,
    seen: SeenCache,
    /// Cursors for runs that must leave the store untouched
    local_cursors: Mutex<HashMap<String, String>>,
    severity_threshold: SeverityLevel,
    check_interval: Duration,
    page_size: u32,
    fetch_timeout: Duration,
    llm_timeout: Duration,
}

impl RealtimeMonitor {
    pub fn new(
        store: AlertStore,
        source: Arc<dyn MessageSource>,
        router: Arc<NotificationRouter>,
        settings: &RealtimeConfig,
        channels: Vec<ChannelRule>,
        capabilities: MonitorCapabilities,
    ) -> Self {
        let classifier = HeuristicClassifier::new(
            store.clone(),
            settings.severity_threshold,
            settings.duplicate_window_minutes,
        );
        Self {
            store,
            classifier,
            source,
            router,
            llm: None,
            channels,
            capabilities,
            seen: SeenCache::new(settings.seen_cache_size),
            local_cursors: Mutex::new(HashMap::new()),
            severity_threshold: settings.severity_threshold,
            check_interval: Duration::from_secs(settings.check_interval_seconds.max(MIN_CHECK_INTERVAL_SECS)),
            page_size: settings.page_size.max(1),
            fetch_timeout: Duration::from_secs(settings.fetch_timeout_seconds.max(1)),
            llm_timeout: Duration::from_secs(settings.llm.timeout_seconds.max(1)),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn capabilities(&self) -> MonitorCapabilities {
        self.capabilities
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Poll every non-muted channel once. Errors are contained per channel.
    pub async fn run_once(&self) -> CycleReport {
        let mut report = CycleReport::default();

        for rule in self.channels.iter().filter(|rule| !rule.muted) {
            if let Err(e) = self.poll_channel(rule, &mut report).await {
                report.channels_failed += 1;
                warn!(channel = %rule.id, label = %rule.label, error = %e, "Channel poll failed");
            }
        }

        report
    }

    async fn load_cursor(&self, key: &str) -> Result<Option<String>> {
        if !self.capabilities.persist_alerts {
            let cursors = self.local_cursors.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(cursor) = cursors.get(key) {
                return Ok(Some(cursor.clone()));
            }
        }
        self.store.get_state(key).await
    }

    async fn save_cursor(&self, key: &str, value: &str) -> Result<()> {
        if self.capabilities.persist_alerts {
            return self.store.set_state(key, value).await;
        }
        let mut cursors = self.local_cursors.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cursors.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn poll_channel(&self, rule: &ChannelRule, report: &mut CycleReport) -> Result<()> {
        let cursor_key = rule.cursor_key();
        let Some(cursor) = self.load_cursor(&cursor_key).await? else {
            let now = epoch_ts(Utc::now());
            self.save_cursor(&cursor_key, &now).await?;
            report.channels_bootstrapped += 1;
            info!(channel = %rule.id, label = %rule.label, cursor = %now, "First poll; skipping history");
            return Ok(());
        };

        report.channels_polled += 1;
        let messages = tokio::time::timeout(
            self.fetch_timeout,
            self.source.fetch_messages(&rule.id, &cursor, self.page_size),
        )
        .await
        .map_err(|_| MonitorError::fetch(&rule.id, format!("timed out after {:?}", self.fetch_timeout)))??;

        if messages.is_empty() {
            return Ok(());
        }
        report.messages_fetched += messages.len();
        debug!(channel = %rule.id, count = messages.len(), "Fetched messages");

        let mut advance_to: Option<&str> = None;
        let mut prefix_intact = true;

        for message in &messages {
            match self.process_message(rule, message, report).await {
                Ok(()) => {
                    if prefix_intact {
                        advance_to = Some(message.ts.as_str());
                    }
                }
                Err(e) => {
                    prefix_intact = false;
                    report.message_errors += 1;
                    error!(channel = %rule.id, ts = %message.ts, error = %e, "Failed to process message");
                }
            }
        }

        if let Some(ts) = advance_to {
            self.save_cursor(&cursor_key, ts).await?;
        }
        Ok(())
    }

    async fn process_message(
        &self,
        rule: &ChannelRule,
        message: &SourceMessage,
        report: &mut CycleReport,
    ) -> Result<()> {
        let message_id = AlertRecord::message_id_for(&rule.id, &message.ts);

        if self.seen.contains(&message_id) || self.store.has_message(&message_id).await? {
            self.seen.insert(message_id);
            report.duplicates += 1;
            return Ok(());
        }

        if message.text.trim().is_empty() {
            debug!(message_id = %message_id, "Skipping empty message");
            self.seen.insert(message_id);
            return Ok(());
        }

        let mut classification = self
            .classifier
            .classify(rule, &message.text)
            .await
            .map_err(|e| MonitorError::Classification {
                message_id: message_id.clone(),
                reason: e.to_string(),
            })?;
        report.messages_classified += 1;

        self.apply_secondary_classifier(rule, &message.text, &mut classification)
            .await;

        let decision = &classification.decision;
        let deliver = decision.notify && self.capabilities.notifications;
        let alert = AlertRecord {
            message_id: message_id.clone(),
            channel_id: rule.id.clone(),
            channel_label: rule.label.clone(),
            user: message.user.clone(),
            text: message.text.clone(),
            source_ts: message.ts.clone(),
            importance: decision.severity,
            decision_reason: decision.reason.clone(),
            detected_at: Utc::now(),
            event_ts: message.event_time(),
            content_hash: Some(classification.content_hash.clone()),
            pattern_signature: None,
            sent: deliver,
        };

        let inserted = if self.capabilities.persist_alerts {
            self.store.record_alert(&alert).await?
        } else {
            true
        };
        self.seen.insert(message_id);

        if !inserted {
            report.duplicates += 1;
            return Ok(());
        }
        if self.capabilities.persist_alerts {
            report.alerts_recorded += 1;
        }

        info!(
            message_id = %alert.message_id,
            channel = %rule.label,
            severity = %alert.importance,
            notify = decision.notify,
            "Classified message"
        );

        if deliver {
            self.dispatch(&alert, report).await;
        }
        Ok(())
    }

    /// Re-rate decisions sitting exactly on the notify threshold.
    async fn apply_secondary_classifier(&self, rule: &ChannelRule, text: &str, classification: &mut Classification) {
        if !self.capabilities.secondary_classifier {
            return;
        }
        let Some(llm) = &self.llm else {
            return;
        };
        let severity = classification.decision.severity;
        if severity != self.severity_threshold || severity == SeverityLevel::Critical {
            return;
        }

        let prompt = render_triage_prompt(text, &rule.label, classification.recurrence_count);
        let decision = &mut classification.decision;

        match tokio::time::timeout(self.llm_timeout, llm.invoke(&prompt)).await {
            Ok(Ok(reply)) => match parse_severity_reply(&reply) {
                Some(level) if level != decision.severity => {
                    decision.severity = level;
                    decision.notify = level.at_least(self.severity_threshold);
                    decision.notify_targets = if decision.notify {
                        vec!["primary".to_string()]
                    } else {
                        Vec::new()
                    };
                    decision.reason.push_str(&format!("; Overridden by LLM ({})", level));
                }
                Some(_) => {}
                None => debug!(reply = %reply.trim(), "Ignoring unrecognized LLM reply"),
            },
            Ok(Err(e)) => decision.reason.push_str(&format!("; LLM error: {}", e)),
            Err(_) => decision.reason.push_str("; LLM error: timed out"),
        }
    }

    async fn dispatch(&self, alert: &AlertRecord, report: &mut CycleReport) {
        if self.router.send_primary(&format_primary_alert(alert), None).await {
            report.notifications_sent += 1;
        } else {
            report.notifications_failed += 1;
            warn!(message_id = %alert.message_id, "Primary notification not delivered");
        }

        if self.router.secondary_enabled() {
            if self.router.send_secondary(&format_secondary_alert(alert)).await {
                report.notifications_sent += 1;
            } else {
                report.notifications_failed += 1;
                warn!(message_id = %alert.message_id, "Secondary notification not delivered");
            }
        }
    }

    /// Loop `run_once` until `shutdown` flips to true. A running cycle is never interrupted.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.check_interval.as_secs(),
            channels = self.channels.iter().filter(|rule| !rule.muted).count(),
            "Realtime monitor started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let report = self.run_once().await;
            info!(
                polled = report.channels_polled,
                failed = report.channels_failed,
                fetched = report.messages_fetched,
                recorded = report.alerts_recorded,
                notified = report.notifications_sent,
                "Realtime cycle complete"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Realtime monitor stopped");
    }
}
