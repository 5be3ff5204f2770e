//! Durable alert store: alert records, recurrence lookups and monitor cursors.
//!
//! The store is the only component that touches persistent state. Duplicate
//! inserts are rejected by the `UNIQUE(message_id)` constraint, so concurrent
//! `record_alert` calls for the same message can never both succeed.

pub mod database;

use std::path::Path;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{AlertRecord, AlertStatistics, SeverityLevel};

/// Fixed-width timestamp layout so string comparison matches time order.
const DB_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub(crate) fn format_db_time(at: DateTime<Utc>) -> String {
    at.format(DB_TIME_FORMAT).to_string()
}

pub(crate) fn parse_db_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    // SQLite CURRENT_TIMESTAMP layout written by older versions
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    message_id: String,
    channel: String,
    channel_label: Option<String>,
    user: Option<String>,
    text: String,
    source_ts: String,
    importance: String,
    reason: Option<String>,
    content_hash: Option<String>,
    pattern_signature: Option<String>,
    detected_at: String,
    event_ts: Option<String>,
    sent: bool,
}

impl AlertRow {
    fn into_record(self) -> Option<AlertRecord> {
        let importance = match self.importance.parse::<SeverityLevel>() {
            Ok(level) => level,
            Err(e) => {
                warn!(message_id = %self.message_id, "Skipping row: {}", e);
                return None;
            }
        };
        let detected_at = parse_db_time(&self.detected_at).unwrap_or_else(|| {
            warn!(message_id = %self.message_id, "Unparseable detected_at '{}'", self.detected_at);
            DateTime::<Utc>::UNIX_EPOCH
        });

        Some(AlertRecord {
            channel_label: self
                .channel_label
                .filter(|label| !label.is_empty())
                .unwrap_or_else(|| self.channel.clone()),
            message_id: self.message_id,
            channel_id: self.channel,
            user: self.user,
            text: self.text,
            source_ts: self.source_ts,
            importance,
            decision_reason: self.reason.unwrap_or_default(),
            detected_at,
            event_ts: self.event_ts.as_deref().and_then(parse_db_time),
            content_hash: self.content_hash,
            pattern_signature: self.pattern_signature,
            sent: self.sent,
        })
    }
}

/// Repository for alert records, recurrence tracking and monitor state.
#[derive(Debug, Clone)]
pub struct AlertStore {
    pool: SqlitePool,
    legacy: database::LegacyColumns,
}

impl AlertStore {
    /// Open (creating if needed) the store at `path` and bring its schema up to date.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let pool = database::create_pool(&path).await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying the schema.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        database::create_schema(&pool).await?;
        let legacy = database::legacy_columns(&pool).await?;
        if legacy != database::LegacyColumns::default() {
            info!(?legacy, "Alert table carries legacy columns; mirroring writes");
        }
        Ok(Self { pool, legacy })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert an alert; returns `false` without side effects if `message_id` already exists.
    pub async fn record_alert(&self, alert: &AlertRecord) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let sql = self.insert_alert_sql();
        let inserted = sqlx::query(&sql)
            .bind(&alert.message_id)
            .bind(&alert.channel_id)
            .bind(&alert.channel_label)
            .bind(&alert.user)
            .bind(&alert.text)
            .bind(&alert.source_ts)
            .bind(alert.importance.as_str())
            .bind(&alert.decision_reason)
            .bind(&alert.content_hash)
            .bind(&alert.pattern_signature)
            .bind(format_db_time(alert.detected_at))
            .bind(alert.event_ts.map(format_db_time))
            .bind(alert.sent)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            == 1;

        if !inserted {
            tx.rollback().await?;
            debug!(message_id = %alert.message_id, "Alert already recorded");
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO decision_log (message_id, decision, reason, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&alert.message_id)
        .bind(alert.importance.as_str())
        .bind(&alert.decision_reason)
        .bind(format_db_time(Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    fn insert_alert_sql(&self) -> String {
        let mut columns = String::from(
            "message_id, channel, channel_label, user, text, source_ts, importance, \
             reason, content_hash, pattern_signature, detected_at, event_ts, sent",
        );
        let mut values = String::from("?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13");
        if self.legacy.slack_ts {
            columns.push_str(", slack_ts");
            values.push_str(", ?6");
        }
        if self.legacy.sent_to_slack {
            columns.push_str(", sent_to_slack");
            values.push_str(", ?13");
        }
        format!(
            "INSERT INTO alerts ({}) VALUES ({}) ON CONFLICT(message_id) DO NOTHING",
            columns, values
        )
    }

    pub async fn has_message(&self, message_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM alerts WHERE message_id = ?1 LIMIT 1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Count alerts sharing `content_hash` detected within the last `window_minutes`.
    ///
    /// Uses processing time (`detected_at`), never the source event time.
    pub async fn count_recent_occurrences(&self, content_hash: &str, window_minutes: i64) -> Result<u32> {
        let now = Utc::now();
        let cutoff = now - Duration::minutes(window_minutes.max(0));

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM alerts WHERE content_hash = ?1 AND detected_at >= ?2 AND detected_at <= ?3",
        )
        .bind(content_hash)
        .bind(format_db_time(cutoff))
        .bind(format_db_time(now))
        .fetch_one(&self.pool)
        .await?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Alerts detected within `lookback_minutes`, newest first.
    pub async fn fetch_recent_alerts(
        &self,
        lookback_minutes: i64,
        include_filtered: bool,
        min_severity: SeverityLevel,
    ) -> Result<Vec<AlertRecord>> {
        let cutoff = Utc::now() - Duration::minutes(lookback_minutes.max(0));

        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT message_id, channel, channel_label, user, text, source_ts, importance,
                   reason, content_hash, pattern_signature, detected_at, event_ts, sent
            FROM alerts
            WHERE detected_at >= ?1 AND (?2 OR sent = 1)
            ORDER BY detected_at DESC, id DESC
            "#,
        )
        .bind(format_db_time(cutoff))
        .bind(include_filtered)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(AlertRow::into_record)
            .filter(|alert| alert.importance.at_least(min_severity))
            .collect())
    }

    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM monitor_state WHERE key = ?1 LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO monitor_state (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(format_db_time(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete alerts detected more than `days` ago and their decision-log rows.
    pub async fn purge_older_than(&self, days: i64) -> Result<u64> {
        let cutoff = format_db_time(Utc::now() - Duration::days(days.max(0)));
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM alerts WHERE detected_at < ?1")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let orphaned = sqlx::query(
            "DELETE FROM decision_log
             WHERE created_at < ?1
                OR message_id NOT IN (SELECT message_id FROM alerts)",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        info!(deleted, decision_log = orphaned, days, "Purged old alerts");
        Ok(deleted)
    }

    pub async fn count_alerts(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Aggregate counts over the last `hours`.
    pub async fn statistics(&self, hours: i64) -> Result<AlertStatistics> {
        let cutoff = format_db_time(Utc::now() - Duration::hours(hours.max(0)));

        let (total, sent, critical, important, normal, ignored): (i64, i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN sent = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN importance = 'CRITICAL' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN importance = 'IMPORTANT' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN importance = 'NORMAL' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN importance = 'IGNORE' THEN 1 ELSE 0 END), 0)
                FROM alerts
                WHERE detected_at >= ?1
                "#,
            )
            .bind(&cutoff)
            .fetch_one(&self.pool)
            .await?;

        let top_channels: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT COALESCE(MAX(channel_label), channel), COUNT(*)
            FROM alerts
            WHERE detected_at >= ?1
            GROUP BY channel
            ORDER BY COUNT(*) DESC, channel ASC
            LIMIT 5
            "#,
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        let active_patterns: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM (
                SELECT content_hash FROM alerts
                WHERE detected_at >= ?1 AND content_hash IS NOT NULL
                GROUP BY content_hash
                HAVING COUNT(*) >= 2
            )
            "#,
        )
        .bind(&cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(AlertStatistics {
            hours,
            total,
            sent,
            filtered: total - sent,
            critical,
            important,
            normal,
            ignored,
            active_patterns,
            top_channels,
        })
    }
}
