#![forbid(unsafe_code)]

//! Persistence layer: the `live_chat` and `video_metadata` tables over a
//! local SQLite file.
//!
//! Both tables are append/merge-only. The ingestion pipeline is the sole
//! writer of `live_chat`, the metadata importer the sole writer of
//! `video_metadata`; nothing ever deletes rows. Concurrent writers coordinate
//! exclusively through the primary-key upsert below, which must merge rather
//! than clobber; see [`merge_messages`] for the policy in one place.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Builder, Connection, Row, params};

use crate::record::ChatMessage;

/// One row of the `video_metadata` table.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoMetadata {
    pub video_id: String,
    pub title: String,
    pub channel_id: String,
    pub channel_name: String,
    /// Scheduled/actual stream start (UTC).
    pub release_timestamp: Option<DateTime<Utc>>,
    /// Upload/processing timestamp, distinct from the release time.
    pub timestamp: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub was_live: Option<bool>,
    pub source_path: String,
}

/// A chat row joined against its video metadata, as consumed by the burst
/// detector.
#[derive(Debug, Clone)]
pub struct SearchRow {
    pub video_id: String,
    pub title: String,
    pub release_timestamp: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub message: String,
    pub video_offset_time_msec: Option<i64>,
}

/// A chat row as consumed by the activity aggregator. Only rows with a known
/// stream offset are returned.
#[derive(Debug, Clone)]
pub struct ActivityRow {
    pub video_id: String,
    pub author: String,
    pub offset_msec: i64,
    pub message: String,
}

/// The metadata slice the aggregator needs per video.
#[derive(Debug, Clone)]
pub struct VideoSummary {
    pub video_id: String,
    pub title: String,
    pub duration_seconds: Option<i64>,
    pub release_timestamp: Option<DateTime<Utc>>,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    for pragma in [
        "PRAGMA journal_mode=WAL",
        "PRAGMA synchronous=NORMAL",
        "PRAGMA foreign_keys=ON",
        "PRAGMA busy_timeout=5000",
    ] {
        conn.query(pragma, ()).await?;
    }
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS live_chat (
            message_id TEXT PRIMARY KEY,
            timestamp_usec INTEGER NOT NULL,
            video_id TEXT NOT NULL,
            author TEXT DEFAULT '',
            author_channel_id TEXT DEFAULT '',
            message TEXT DEFAULT '',
            is_moderator INTEGER NOT NULL DEFAULT 0,
            is_channel_owner INTEGER NOT NULL DEFAULT 0,
            video_offset_time_msec INTEGER,
            video_offset_time_text TEXT DEFAULT '',
            source_path TEXT DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS video_metadata (
            video_id TEXT PRIMARY KEY,
            title TEXT DEFAULT '',
            channel_id TEXT DEFAULT '',
            channel_name TEXT DEFAULT '',
            release_timestamp INTEGER,
            timestamp INTEGER,
            duration_seconds INTEGER,
            was_live INTEGER,
            source_path TEXT DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_live_chat_video
            ON live_chat(video_id, timestamp_usec);
        CREATE INDEX IF NOT EXISTS idx_live_chat_offset
            ON live_chat(video_id, video_offset_time_msec);
        "#,
    )
    .await?;
    Ok(())
}

/// Field-level merge policy for repeated ingestion of the same `message_id`.
///
/// Text fields: a non-empty incoming value wins, an empty one never
/// overwrites what is already stored. Timestamp, offset and flag fields: the
/// latest non-null value wins. This function is the reference definition; the
/// `ON CONFLICT` clause in [`ChatStore::upsert_messages`] implements the same
/// rules in SQL and the store tests hold the two equal.
pub fn merge_messages(existing: &ChatMessage, incoming: &ChatMessage) -> ChatMessage {
    fn text(incoming: &str, existing: &str) -> String {
        if incoming.is_empty() { existing } else { incoming }.to_string()
    }

    ChatMessage {
        message_id: existing.message_id.clone(),
        timestamp: incoming.timestamp,
        video_id: text(&incoming.video_id, &existing.video_id),
        author: text(&incoming.author, &existing.author),
        author_channel_id: text(&incoming.author_channel_id, &existing.author_channel_id),
        message: text(&incoming.message, &existing.message),
        is_moderator: incoming.is_moderator,
        is_channel_owner: incoming.is_channel_owner,
        video_offset_time_msec: incoming
            .video_offset_time_msec
            .or(existing.video_offset_time_msec),
        video_offset_time_text: text(
            &incoming.video_offset_time_text,
            &existing.video_offset_time_text,
        ),
        source_path: text(&incoming.source_path, &existing.source_path),
    }
}

/// Handle on the SQLite database. Each ingestion worker and each query call
/// opens its own `ChatStore`; coordination happens inside SQLite.
pub struct ChatStore {
    conn: Connection,
}

impl ChatStore {
    /// Opens (and if necessary creates) the database and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening chat DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Upserts one deduplicated batch inside a single transaction. Within the
    /// batch, callers must already have collapsed duplicate `message_id`s
    /// (last in file order wins); this method merges the batch against
    /// whatever is stored.
    pub async fn upsert_messages(&self, batch: &[ChatMessage]) -> Result<()> {
        let tx = self.conn.transaction().await.context("starting batch")?;
        for message in batch {
            tx.execute(
                r#"
                INSERT INTO live_chat (
                    message_id, timestamp_usec, video_id, author,
                    author_channel_id, message, is_moderator, is_channel_owner,
                    video_offset_time_msec, video_offset_time_text, source_path
                ) VALUES (
                    :message_id, :timestamp_usec, :video_id, :author,
                    :author_channel_id, :message, :is_moderator, :is_channel_owner,
                    :video_offset_time_msec, :video_offset_time_text, :source_path
                )
                ON CONFLICT(message_id) DO UPDATE SET
                    timestamp_usec = COALESCE(excluded.timestamp_usec, live_chat.timestamp_usec),
                    video_id = COALESCE(NULLIF(excluded.video_id, ''), live_chat.video_id),
                    author = COALESCE(NULLIF(excluded.author, ''), live_chat.author),
                    author_channel_id = COALESCE(NULLIF(excluded.author_channel_id, ''), live_chat.author_channel_id),
                    message = COALESCE(NULLIF(excluded.message, ''), live_chat.message),
                    is_moderator = excluded.is_moderator,
                    is_channel_owner = excluded.is_channel_owner,
                    video_offset_time_msec = COALESCE(excluded.video_offset_time_msec, live_chat.video_offset_time_msec),
                    video_offset_time_text = COALESCE(NULLIF(excluded.video_offset_time_text, ''), live_chat.video_offset_time_text),
                    source_path = COALESCE(NULLIF(excluded.source_path, ''), live_chat.source_path)
                "#,
                params![
                    message.message_id.as_str(),
                    message.timestamp.timestamp_micros(),
                    message.video_id.as_str(),
                    message.author.as_str(),
                    message.author_channel_id.as_str(),
                    message.message.as_str(),
                    message.is_moderator as i64,
                    message.is_channel_owner as i64,
                    message.video_offset_time_msec,
                    message.video_offset_time_text.as_str(),
                    message.source_path.as_str(),
                ],
            )
            .await?;
        }
        tx.commit().await.context("committing batch")?;
        Ok(())
    }

    /// Inserts or merges one video's metadata, same coalesce policy as
    /// messages: non-empty text wins, non-null values win.
    pub async fn upsert_metadata(&self, record: &VideoMetadata) -> Result<()> {
        self.conn
            .execute(
                r#"
                INSERT INTO video_metadata (
                    video_id, title, channel_id, channel_name,
                    release_timestamp, timestamp, duration_seconds, was_live,
                    source_path
                ) VALUES (
                    :video_id, :title, :channel_id, :channel_name,
                    :release_timestamp, :timestamp, :duration_seconds, :was_live,
                    :source_path
                )
                ON CONFLICT(video_id) DO UPDATE SET
                    title = COALESCE(NULLIF(excluded.title, ''), video_metadata.title),
                    channel_id = COALESCE(NULLIF(excluded.channel_id, ''), video_metadata.channel_id),
                    channel_name = COALESCE(NULLIF(excluded.channel_name, ''), video_metadata.channel_name),
                    release_timestamp = COALESCE(excluded.release_timestamp, video_metadata.release_timestamp),
                    timestamp = COALESCE(excluded.timestamp, video_metadata.timestamp),
                    duration_seconds = COALESCE(excluded.duration_seconds, video_metadata.duration_seconds),
                    was_live = COALESCE(excluded.was_live, video_metadata.was_live),
                    source_path = COALESCE(NULLIF(excluded.source_path, ''), video_metadata.source_path)
                "#,
                params![
                    record.video_id.as_str(),
                    record.title.as_str(),
                    record.channel_id.as_str(),
                    record.channel_name.as_str(),
                    record.release_timestamp.map(|ts| ts.timestamp()),
                    record.timestamp.map(|ts| ts.timestamp()),
                    record.duration_seconds,
                    record.was_live.map(|flag| flag as i64),
                    record.source_path.as_str(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Total rows in `live_chat`, reported by searches for audit purposes.
    pub async fn message_count(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM live_chat", params![])
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get(0)?)
    }

    /// Timestamp of the most recent stored message, if any.
    pub async fn latest_message_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query("SELECT MAX(timestamp_usec) FROM live_chat", params![])
            .await?;
        let row = rows.next().await?.context("missing max row")?;
        let usec: Option<i64> = row.get(0)?;
        Ok(usec.and_then(DateTime::from_timestamp_micros))
    }

    /// Streams the metadata join ordered by video and time, keeping only rows
    /// whose message text satisfies `is_match`. The ordering is what the
    /// burst detector's single sweep relies on.
    pub async fn matching_messages(
        &self,
        is_match: impl Fn(&str) -> bool,
    ) -> Result<Vec<SearchRow>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT lc.video_id, vm.title, vm.release_timestamp,
                       lc.timestamp_usec, lc.author, lc.message,
                       lc.video_offset_time_msec
                FROM live_chat lc
                JOIN video_metadata vm ON lc.video_id = vm.video_id
                ORDER BY lc.video_id, lc.timestamp_usec
                "#,
            )
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut matches = Vec::new();
        while let Some(row) = rows.next().await? {
            let message: String = row.get(5)?;
            if !is_match(&message) {
                continue;
            }
            matches.push(row_to_search(&row, message)?);
        }
        Ok(matches)
    }

    /// Chat rows with a known stream offset for the given videos, ordered by
    /// video and offset.
    pub async fn activity_rows(&self, video_ids: &[String]) -> Result<Vec<ActivityRow>> {
        if video_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .conn
            .prepare(&format!(
                r#"
                SELECT video_id, author, video_offset_time_msec, message
                FROM live_chat
                WHERE video_id IN ({})
                  AND video_offset_time_msec IS NOT NULL
                  AND video_offset_time_msec >= 0
                ORDER BY video_id, video_offset_time_msec
                "#,
                quoted_list(video_ids)
            ))
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut result = Vec::new();
        while let Some(row) = rows.next().await? {
            result.push(ActivityRow {
                video_id: row.get(0)?,
                author: row.get(1)?,
                offset_msec: row.get(2)?,
                message: row.get(3)?,
            });
        }
        Ok(result)
    }

    /// Title, duration and release time for each requested video.
    pub async fn video_summaries(&self, video_ids: &[String]) -> Result<Vec<VideoSummary>> {
        if video_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .conn
            .prepare(&format!(
                r#"
                SELECT video_id, title, duration_seconds,
                       COALESCE(release_timestamp, timestamp)
                FROM video_metadata
                WHERE video_id IN ({})
                "#,
                quoted_list(video_ids)
            ))
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut result = Vec::new();
        while let Some(row) = rows.next().await? {
            let release: Option<i64> = row.get(3)?;
            result.push(VideoSummary {
                video_id: row.get(0)?,
                title: row.get(1)?,
                duration_seconds: row.get(2)?,
                release_timestamp: release.and_then(|secs| DateTime::from_timestamp(secs, 0)),
            });
        }
        Ok(result)
    }

    /// Video ids ordered newest-first by release (falling back to the upload
    /// timestamp), optionally limited to the most recent `last_n` or a
    /// `[start, end]` date range (inclusive, UTC days).
    pub async fn select_video_ids(
        &self,
        last_n: Option<usize>,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<Vec<String>> {
        let mut conditions = vec!["COALESCE(release_timestamp, timestamp) IS NOT NULL".to_string()];
        if let Some(start) = start_date {
            let epoch = start.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
            conditions.push(format!(
                "COALESCE(release_timestamp, timestamp) >= {}",
                epoch.timestamp()
            ));
        }
        if let Some(end) = end_date {
            let next_day = end.succ_opt().context("date overflow")?;
            let epoch = next_day.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
            conditions.push(format!(
                "COALESCE(release_timestamp, timestamp) < {}",
                epoch.timestamp()
            ));
        }
        let limit = match last_n {
            Some(n) => format!("LIMIT {n}"),
            None => String::new(),
        };

        let mut stmt = self
            .conn
            .prepare(&format!(
                r#"
                SELECT video_id FROM video_metadata
                WHERE {}
                ORDER BY COALESCE(release_timestamp, timestamp) DESC
                {}
                "#,
                conditions.join(" AND "),
                limit
            ))
            .await?;

        let mut rows = stmt.query(params![]).await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }

    /// Distinct UTC calendar days with at least one released video inside
    /// `[since, before)`. Feeds the coverage report.
    pub async fn release_dates(
        &self,
        since: NaiveDate,
        before: NaiveDate,
    ) -> Result<Vec<NaiveDate>> {
        let since_epoch = since.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
        let before_epoch = before.and_hms_opt(0, 0, 0).expect("midnight").and_utc();
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT DISTINCT date(release_timestamp, 'unixepoch')
                FROM video_metadata
                WHERE release_timestamp IS NOT NULL
                  AND release_timestamp >= :since
                  AND release_timestamp < :before
                ORDER BY 1
                "#,
            )
            .await?;

        let mut rows = stmt
            .query(params![since_epoch.timestamp(), before_epoch.timestamp()])
            .await?;
        let mut dates = Vec::new();
        while let Some(row) = rows.next().await? {
            let day: String = row.get(0)?;
            let parsed = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                .with_context(|| format!("parsing stored date {day}"))?;
            dates.push(parsed);
        }
        Ok(dates)
    }

    /// Fetches one message row by id. Mostly a test aid; also handy for
    /// spot-checking a dedup decision from the REPL.
    pub async fn get_message(&self, message_id: &str) -> Result<Option<ChatMessage>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT message_id, timestamp_usec, video_id, author,
                       author_channel_id, message, is_moderator, is_channel_owner,
                       video_offset_time_msec, video_offset_time_text, source_path
                FROM live_chat
                WHERE message_id = ?1
                "#,
            )
            .await?;

        let mut rows = stmt.query([message_id]).await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(row_to_message(&row)?))
    }

    /// Fetches one metadata row by video id.
    pub async fn get_metadata(&self, video_id: &str) -> Result<Option<VideoMetadata>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT video_id, title, channel_id, channel_name,
                       release_timestamp, timestamp, duration_seconds, was_live,
                       source_path
                FROM video_metadata
                WHERE video_id = ?1
                "#,
            )
            .await?;

        let mut rows = stmt.query([video_id]).await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let release: Option<i64> = row.get(4)?;
        let timestamp: Option<i64> = row.get(5)?;
        let was_live: Option<i64> = row.get(7)?;
        Ok(Some(VideoMetadata {
            video_id: row.get(0)?,
            title: row.get(1)?,
            channel_id: row.get(2)?,
            channel_name: row.get(3)?,
            release_timestamp: release.and_then(|secs| DateTime::from_timestamp(secs, 0)),
            timestamp: timestamp.and_then(|secs| DateTime::from_timestamp(secs, 0)),
            duration_seconds: row.get(6)?,
            was_live: was_live.map(|flag| flag != 0),
            source_path: row.get(8)?,
        }))
    }
}

/// Renders ids as a quoted SQL list. Ids come from filenames or the CLI, so
/// quotes are doubled defensively even though valid ids cannot contain them.
fn quoted_list(ids: &[String]) -> String {
    ids.iter()
        .map(|id| format!("'{}'", id.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(",")
}

fn row_to_search(row: &Row, message: String) -> Result<SearchRow> {
    let release: Option<i64> = row.get(2)?;
    let usec: i64 = row.get(3)?;
    Ok(SearchRow {
        video_id: row.get(0)?,
        title: row.get(1)?,
        release_timestamp: release.and_then(|secs| DateTime::from_timestamp(secs, 0)),
        timestamp: DateTime::from_timestamp_micros(usec)
            .context("stored timestamp out of range")?,
        author: row.get(4)?,
        message,
        video_offset_time_msec: row.get(6)?,
    })
}

fn row_to_message(row: &Row) -> Result<ChatMessage> {
    let usec: i64 = row.get(1)?;
    Ok(ChatMessage {
        message_id: row.get(0)?,
        timestamp: DateTime::from_timestamp_micros(usec)
            .context("stored timestamp out of range")?,
        video_id: row.get(2)?,
        author: row.get(3)?,
        author_channel_id: row.get(4)?,
        message: row.get(5)?,
        is_moderator: row.get::<i64>(6)? != 0,
        is_channel_owner: row.get::<i64>(7)? != 0,
        video_offset_time_msec: row.get(8)?,
        video_offset_time_text: row.get(9)?,
        source_path: row.get(10)?,
    })
}
