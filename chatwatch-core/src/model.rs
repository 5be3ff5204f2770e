// Core value types shared by the classifier, store, monitor and digest

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Discrete urgency levels, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SeverityLevel {
    Ignore,
    Normal,
    Important,
    Critical,
}

impl SeverityLevel {
    pub const ALL: [SeverityLevel; 4] = [
        SeverityLevel::Ignore,
        SeverityLevel::Normal,
        SeverityLevel::Important,
        SeverityLevel::Critical,
    ];

    /// True when this level is greater than or equal to `other`.
    pub fn at_least(self, other: SeverityLevel) -> bool {
        self >= other
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SeverityLevel::Ignore => "IGNORE",
            SeverityLevel::Normal => "NORMAL",
            SeverityLevel::Important => "IMPORTANT",
            SeverityLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeverityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "IGNORE" => Ok(SeverityLevel::Ignore),
            "NORMAL" => Ok(SeverityLevel::Normal),
            "IMPORTANT" => Ok(SeverityLevel::Important),
            "CRITICAL" => Ok(SeverityLevel::Critical),
            other => Err(format!("unknown severity level '{}'", other)),
        }
    }
}

impl TryFrom<String> for SeverityLevel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SeverityLevel> for String {
    fn from(level: SeverityLevel) -> Self {
        level.as_str().to_string()
    }
}

/// Per-channel monitoring rule, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRule {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_severity_hint")]
    pub severity_hint: SeverityLevel,
    #[serde(default = "default_recurrence_threshold")]
    pub recurrence_threshold: u32,
    #[serde(default)]
    pub critical_keywords: Vec<String>,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
    #[serde(default)]
    pub muted: bool,
}

fn default_severity_hint() -> SeverityLevel {
    SeverityLevel::Normal
}

fn default_recurrence_threshold() -> u32 {
    3
}

impl ChannelRule {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            severity_hint: default_severity_hint(),
            recurrence_threshold: default_recurrence_threshold(),
            critical_keywords: Vec::new(),
            ignore_patterns: Vec::new(),
            muted: false,
        }
    }

    /// Recurrence threshold clamped to the `>= 1` invariant.
    pub fn effective_recurrence_threshold(&self) -> u32 {
        self.recurrence_threshold.max(1)
    }

    pub fn cursor_key(&self) -> String {
        format!("cursor:{}", self.id)
    }
}

/// One persisted decision per source message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub message_id: String,
    pub channel_id: String,
    pub channel_label: String,
    pub user: Option<String>,
    pub text: String,
    /// Raw upstream timestamp (`"1700000000.123456"` for Slack).
    pub source_ts: String,
    pub importance: SeverityLevel,
    pub decision_reason: String,
    pub detected_at: DateTime<Utc>,
    pub event_ts: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
    pub pattern_signature: Option<String>,
    pub sent: bool,
}

impl AlertRecord {
    /// Stable, globally unique id derived from the channel and source timestamp.
    pub fn message_id_for(channel_id: &str, source_ts: &str) -> String {
        format!("{}:{}", channel_id, source_ts)
    }
}

/// Transient classifier output consumed immediately by the monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertDecision {
    pub severity: SeverityLevel,
    pub reason: String,
    pub notify: bool,
    pub notify_targets: Vec<String>,
    pub recurrence_count: u32,
    pub ttl: Option<Duration>,
}

/// A message as returned by the upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub ts: String,
    pub user: Option<String>,
    pub text: String,
    #[serde(default)]
    pub thread_ts: Option<String>,
}

impl SourceMessage {
    pub fn new(ts: impl Into<String>, user: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            ts: ts.into(),
            user: user.map(str::to_string),
            text: text.into(),
            thread_ts: None,
        }
    }

    /// Parses the fractional epoch timestamp into UTC, if well formed.
    pub fn event_time(&self) -> Option<DateTime<Utc>> {
        parse_epoch_ts(&self.ts)
    }
}

/// Parses `"<secs>.<fraction>"` epoch strings used as source timestamps and cursors.
pub fn parse_epoch_ts(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    let (secs, fraction) = ts.split_once('.').unwrap_or((ts, ""));
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs: i64 = secs.parse().ok()?;
    let digits: String = fraction.chars().take(9).collect();
    let nanos: u32 = if digits.is_empty() {
        0
    } else {
        format!("{:0<9}", digits).parse().ok()?
    };
    Utc.timestamp_opt(secs, nanos).single()
}

/// Formats a UTC instant as a source-style epoch string with microsecond precision.
pub fn epoch_ts(at: DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}

/// Aggregates reported by `--stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertStatistics {
    pub hours: i64,
    pub total: i64,
    pub sent: i64,
    pub filtered: i64,
    pub critical: i64,
    pub important: i64,
    pub normal: i64,
    pub ignored: i64,
    pub active_patterns: i64,
    pub top_channels: Vec<(String, i64)>,
}

impl AlertStatistics {
    /// Percentage of recorded alerts that were not routed to a sink.
    pub fn filter_rate_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.filtered as f64 * 100.0 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_total_order() {
        assert!(SeverityLevel::Ignore < SeverityLevel::Normal);
        assert!(SeverityLevel::Normal < SeverityLevel::Important);
        assert!(SeverityLevel::Important < SeverityLevel::Critical);
        assert!(SeverityLevel::Critical.at_least(SeverityLevel::Important));
        assert!(SeverityLevel::Important.at_least(SeverityLevel::Important));
        assert!(!SeverityLevel::Normal.at_least(SeverityLevel::Important));
    }

    #[test]
    fn test_severity_parsing_is_case_insensitive() {
        assert_eq!("critical".parse::<SeverityLevel>(), Ok(SeverityLevel::Critical));
        assert_eq!(" Important ".parse::<SeverityLevel>(), Ok(SeverityLevel::Important));
        assert!("urgent".parse::<SeverityLevel>().is_err());
    }

    #[test]
    fn test_severity_serde_uses_uppercase_names() {
        let json = serde_json::to_string(&SeverityLevel::Important).unwrap();
        assert_eq!(json, "\"IMPORTANT\"");
        let parsed: SeverityLevel = serde_json::from_str("\"ignore\"").unwrap();
        assert_eq!(parsed, SeverityLevel::Ignore);
    }

    #[test]
    fn test_recurrence_threshold_is_clamped() {
        let mut rule = ChannelRule::new("C1", "ops");
        rule.recurrence_threshold = 0;
        assert_eq!(rule.effective_recurrence_threshold(), 1);
        assert_eq!(rule.cursor_key(), "cursor:C1");
    }

    #[test]
    fn test_epoch_ts_round_trip_precision() {
        let parsed = parse_epoch_ts("1700000000.123456").unwrap();
        assert_eq!(parsed.timestamp(), 1_700_000_000);
        assert_eq!(epoch_ts(parsed), "1700000000.123456");
        assert!(parse_epoch_ts("not-a-ts").is_none());
    }

    #[test]
    fn test_message_id_combines_channel_and_ts() {
        assert_eq!(AlertRecord::message_id_for("C9", "17.5"), "C9:17.5");
    }
}
