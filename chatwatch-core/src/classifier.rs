// Heuristic severity classification with recurrence-based escalation

use tracing::debug;

use crate::error::Result;
use crate::model::{AlertDecision, ChannelRule, SeverityLevel};
use crate::store::AlertStore;
use crate::text::{compute_content_hash, normalize_text};

/// Outcome of classifying one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub decision: AlertDecision,
    pub content_hash: String,
    /// Occurrences of this content inside the duplicate window, including this one.
    pub recurrence_count: u32,
    pub matched_keyword: Option<String>,
    pub ignored_pattern: Option<String>,
}

/// Rule-based classifier. The only side effect is a read-only recurrence
/// lookup in the store, so for a fixed store state the output is fully
/// determined by the rule and the text.
#[derive(Debug, Clone)]
pub struct HeuristicClassifier {
    store: AlertStore,
    severity_threshold: SeverityLevel,
    duplicate_window_minutes: i64,
}

fn find_case_insensitive<'a>(needles: &'a [String], haystack_lower: &str) -> Option<&'a String> {
    needles.iter().find(|needle| {
        let needle_lower = needle.to_lowercase();
        !needle_lower.is_empty() && haystack_lower.contains(&needle_lower)
    })
}

impl HeuristicClassifier {
    pub fn new(store: AlertStore, severity_threshold: SeverityLevel, duplicate_window_minutes: i64) -> Self {
        Self {
            store,
            severity_threshold,
            duplicate_window_minutes,
        }
    }

    pub fn severity_threshold(&self) -> SeverityLevel {
        self.severity_threshold
    }

    pub async fn classify(&self, rule: &ChannelRule, message_text: &str) -> Result<Classification> {
        let text = normalize_text(message_text);
        let text_lower = text.to_lowercase();
        let content_hash = compute_content_hash(&text, &rule.id);

        if let Some(pattern) = find_case_insensitive(&rule.ignore_patterns, &text_lower) {
            debug!(channel = %rule.id, pattern = %pattern, "Message matched ignore pattern");
            return Ok(Classification {
                decision: AlertDecision {
                    severity: SeverityLevel::Ignore,
                    reason: format!("Ignored due to pattern '{}'", pattern),
                    notify: false,
                    notify_targets: Vec::new(),
                    recurrence_count: 0,
                    ttl: None,
                },
                content_hash,
                recurrence_count: 0,
                matched_keyword: None,
                ignored_pattern: Some(pattern.clone()),
            });
        }

        let mut severity = rule.severity_hint;
        let mut reasons = vec![format!("Base severity {} (channel hint)", severity)];

        let matched_keyword = find_case_insensitive(&rule.critical_keywords, &text_lower).cloned();
        if let Some(keyword) = &matched_keyword {
            severity = SeverityLevel::Critical;
            reasons.push(format!("Matched critical keyword '{}'", keyword));
        }

        let prior = self
            .store
            .count_recent_occurrences(&content_hash, self.duplicate_window_minutes)
            .await?;
        let occurrences = prior.saturating_add(1);
        let threshold = rule.effective_recurrence_threshold();

        if occurrences >= threshold && severity != SeverityLevel::Critical {
            severity = SeverityLevel::Critical;
            reasons.push(format!("Recurrence threshold reached ({}/{})", occurrences, threshold));
        } else if prior > 0 {
            reasons.push(format!("Seen {} time(s) recently", prior));
        }

        let notify = severity.at_least(self.severity_threshold);
        Ok(Classification {
            decision: AlertDecision {
                severity,
                reason: reasons.join("; "),
                notify,
                notify_targets: if notify { vec!["primary".to_string()] } else { Vec::new() },
                recurrence_count: occurrences,
                ttl: None,
            },
            content_hash,
            recurrence_count: occurrences,
            matched_keyword,
            ignored_pattern: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AlertRecord;
    use chrono::Utc;
    use tempfile::{tempdir, TempDir};

    async fn classifier() -> (TempDir, AlertStore, HeuristicClassifier) {
        let temp_dir = tempdir().unwrap();
        let store = AlertStore::open(temp_dir.path().join("classifier.db")).await.unwrap();
        let classifier = HeuristicClassifier::new(store.clone(), SeverityLevel::Important, 60);
        (temp_dir, store, classifier)
    }

    async fn record(store: &AlertStore, rule: &ChannelRule, ts: &str, result: &Classification, text: &str) {
        let alert = AlertRecord {
            message_id: AlertRecord::message_id_for(&rule.id, ts),
            channel_id: rule.id.clone(),
            channel_label: rule.label.clone(),
            user: None,
            text: text.to_string(),
            source_ts: ts.to_string(),
            importance: result.decision.severity,
            decision_reason: result.decision.reason.clone(),
            detected_at: Utc::now(),
            event_ts: None,
            content_hash: Some(result.content_hash.clone()),
            pattern_signature: None,
            sent: result.decision.notify,
        };
        assert!(store.record_alert(&alert).await.unwrap());
    }

    #[tokio::test]
    async fn test_recurrence_escalates_on_third_occurrence() {
        let (_dir, store, classifier) = classifier().await;
        let rule = ChannelRule::new("C1", "ops");
        let texts = ["queue backlog growing", "Queue  backlog growing", "queue backlog GROWING ", "queue backlog growing"];

        let mut severities = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let result = classifier.classify(&rule, text).await.unwrap();
            severities.push(result.decision.severity);
            record(&store, &rule, &format!("{}.0", i + 1), &result, text).await;
        }

        assert_eq!(
            severities,
            vec![
                SeverityLevel::Normal,
                SeverityLevel::Normal,
                SeverityLevel::Critical,
                SeverityLevel::Critical
            ]
        );
    }

    #[tokio::test]
    async fn test_ignore_takes_precedence_over_critical_keyword() {
        let (_dir, _store, classifier) = classifier().await;
        let mut rule = ChannelRule::new("C1", "ops");
        rule.critical_keywords = vec!["outage".to_string()];
        rule.ignore_patterns = vec!["[TEST]".to_string()];

        let result = classifier.classify(&rule, "[test] simulated OUTAGE").await.unwrap();
        assert_eq!(result.decision.severity, SeverityLevel::Ignore);
        assert!(!result.decision.notify);
        assert_eq!(result.recurrence_count, 0);
        assert_eq!(result.ignored_pattern.as_deref(), Some("[TEST]"));
        assert!(result.decision.reason.contains("[TEST]"));
    }

    #[tokio::test]
    async fn test_critical_keyword_sets_notify() {
        let (_dir, _store, classifier) = classifier().await;
        let mut rule = ChannelRule::new("C1", "ops");
        rule.critical_keywords = vec!["Outage".to_string()];

        let result = classifier.classify(&rule, "minor outage detected").await.unwrap();
        assert_eq!(result.decision.severity, SeverityLevel::Critical);
        assert!(result.decision.notify);
        assert_eq!(result.matched_keyword.as_deref(), Some("Outage"));
        assert_eq!(result.recurrence_count, 1);
    }

    #[tokio::test]
    async fn test_empty_text_still_classifies() {
        let (_dir, _store, classifier) = classifier().await;
        let mut rule = ChannelRule::new("C1", "ops");
        rule.critical_keywords = vec!["down".to_string()];
        rule.ignore_patterns = vec!["".to_string()];

        let result = classifier.classify(&rule, "   \n\t").await.unwrap();
        assert_eq!(result.decision.severity, SeverityLevel::Normal);
        assert!(!result.decision.notify);
        assert_eq!(result.content_hash.len(), 64);
    }

    #[tokio::test]
    async fn test_classify_is_deterministic_for_same_store_state() {
        let (_dir, _store, classifier) = classifier().await;
        let mut rule = ChannelRule::new("C1", "ops");
        rule.severity_hint = SeverityLevel::Important;

        let first = classifier.classify(&rule, "deploy finished").await.unwrap();
        let second = classifier.classify(&rule, "deploy finished").await.unwrap();
        assert_eq!(first, second);
        assert!(first.decision.notify);
        assert_eq!(first.decision.notify_targets, vec!["primary".to_string()]);
    }
}
