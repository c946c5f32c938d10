#![forbid(unsafe_code)]

//! Chatter-activity aggregation: fixed-size time buckets over a stream's
//! offset axis with per-bucket unique-author and message counts, plus the
//! calendar coverage report over `video_metadata`.
//!
//! Read-only, single-threaded per call, like the burst detector.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::store::{ChatStore, VideoSummary};

/// Custom emoji shortcodes look like `:_KannaLove:` after run concatenation.
static EMOJI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r":_[^:]+:").expect("emoji pattern"));

/// One fixed-size bucket of a stream's chat activity.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityWindow {
    /// Offset of the bucket start from stream start, in seconds.
    pub start_offset_secs: i64,
    pub end_offset_secs: i64,
    pub unique_chatters: usize,
    pub messages: usize,
    /// Most frequent custom emoji shortcode in the bucket, if any.
    pub top_emoji: Option<String>,
}

/// A whole stream's bucketed activity.
#[derive(Debug, Clone)]
pub struct VideoActivity {
    pub video_id: String,
    pub title: String,
    pub release_date: Option<NaiveDate>,
    pub total_unique_chatters: usize,
    pub total_messages: usize,
    pub windows: Vec<ActivityWindow>,
}

/// Extracts every `:_Name:` emoji token from a message body.
pub fn extract_emojis(text: &str) -> Vec<String> {
    EMOJI_RE
        .find_iter(text)
        .map(|found| found.as_str().to_string())
        .collect()
}

/// Buckets each requested video's messages into `window_minutes`-sized
/// windows by stream offset.
///
/// Messages without an offset are ignored (offset tracking starts a little
/// after the stream does); messages past the stream's known duration are
/// dropped as trailing replay artifacts. Videos come back ordered by release
/// date, unknown dates last.
pub async fn activity(
    store: &ChatStore,
    video_ids: &[String],
    window_minutes: i64,
) -> Result<Vec<VideoActivity>> {
    let window_secs = window_minutes.max(1) * 60;
    let summaries: HashMap<String, VideoSummary> = store
        .video_summaries(video_ids)
        .await?
        .into_iter()
        .map(|summary| (summary.video_id.clone(), summary))
        .collect();
    let rows = store.activity_rows(video_ids).await?;

    let mut ordered_ids: Vec<&String> = video_ids.iter().collect();
    ordered_ids.sort_by_key(|id| {
        let date = summaries
            .get(*id)
            .and_then(|summary| summary.release_timestamp)
            .map(|ts| ts.date_naive());
        (date.is_none(), date, (*id).clone())
    });
    ordered_ids.dedup();

    let mut result = Vec::new();
    for video_id in ordered_ids {
        let summary = summaries.get(video_id);
        let duration_msec = summary
            .and_then(|summary| summary.duration_seconds)
            .map(|secs| secs * 1000);
        let video_rows: Vec<_> = rows
            .iter()
            .filter(|row| row.video_id == *video_id)
            .filter(|row| duration_msec.is_none_or(|max| row.offset_msec <= max))
            .collect();
        if video_rows.is_empty() {
            continue;
        }

        let max_offset_sec = video_rows
            .iter()
            .map(|row| row.offset_msec / 1000)
            .max()
            .unwrap_or(0);
        let bucket_count = (max_offset_sec / window_secs + 1) as usize;

        let mut authors: Vec<HashSet<&str>> = vec![HashSet::new(); bucket_count];
        let mut counts = vec![0usize; bucket_count];
        // (count, first-seen order) per emoji per bucket; ties resolve to the
        // emoji seen first, matching counting order.
        let mut emojis: Vec<HashMap<String, (usize, usize)>> = vec![HashMap::new(); bucket_count];
        let mut all_authors: HashSet<&str> = HashSet::new();

        for row in &video_rows {
            let bucket = ((row.offset_msec / 1000) / window_secs) as usize;
            authors[bucket].insert(row.author.as_str());
            all_authors.insert(row.author.as_str());
            counts[bucket] += 1;
            for emoji in extract_emojis(&row.message) {
                let next_rank = emojis[bucket].len();
                let entry = emojis[bucket].entry(emoji).or_insert((0, next_rank));
                entry.0 += 1;
            }
        }

        let windows = (0..bucket_count)
            .map(|bucket| ActivityWindow {
                start_offset_secs: bucket as i64 * window_secs,
                end_offset_secs: (bucket as i64 + 1) * window_secs,
                unique_chatters: authors[bucket].len(),
                messages: counts[bucket],
                top_emoji: top_emoji(&emojis[bucket]),
            })
            .collect();

        result.push(VideoActivity {
            video_id: video_id.clone(),
            title: summary
                .map(|summary| summary.title.clone())
                .unwrap_or_else(|| "Unknown Title".to_string()),
            release_date: summary
                .and_then(|summary| summary.release_timestamp)
                .map(|ts| ts.date_naive()),
            total_unique_chatters: all_authors.len(),
            total_messages: video_rows.len(),
            windows,
        });
    }
    Ok(result)
}

fn top_emoji(tally: &HashMap<String, (usize, usize)>) -> Option<String> {
    tally
        .iter()
        .max_by(|a, b| {
            // Highest count wins; on ties the earlier-seen emoji.
            a.1.0.cmp(&b.1.0).then(b.1.1.cmp(&a.1.1))
        })
        .map(|(emoji, _)| emoji.clone())
}

/// Calendar days in `[since, today)` with no released video, sorted
/// ascending. `today` is excluded because its VOD may not exist yet.
pub async fn missing_days(
    store: &ChatStore,
    since: NaiveDate,
    today: NaiveDate,
) -> Result<Vec<NaiveDate>> {
    if today <= since {
        return Ok(Vec::new());
    }
    let present: HashSet<NaiveDate> = store.release_dates(since, today).await?.into_iter().collect();
    let mut missing = Vec::new();
    let mut day = since;
    while day < today {
        if !present.contains(&day) {
            missing.push(day);
        }
        day = day.succ_opt().expect("date overflow");
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ChatMessage;
    use crate::store::VideoMetadata;
    use chrono::{DateTime, Utc};
    use tempfile::tempdir;

    #[test]
    fn extract_emojis_finds_shortcodes_only() {
        assert_eq!(
            extract_emojis("gg :_KannaLove: wow :_KannaHappy:"),
            vec![":_KannaLove:".to_string(), ":_KannaHappy:".to_string()]
        );
        assert!(extract_emojis("plain text :) ::").is_empty());
    }

    fn chat(id: &str, video_id: &str, author: &str, offset_msec: i64, text: &str) -> ChatMessage {
        ChatMessage {
            message_id: id.into(),
            timestamp: DateTime::from_timestamp(1_715_618_400 + offset_msec / 1000, 0).unwrap(),
            video_id: video_id.into(),
            author: author.into(),
            author_channel_id: format!("UC-{author}"),
            message: text.into(),
            is_moderator: false,
            is_channel_owner: false,
            video_offset_time_msec: Some(offset_msec),
            video_offset_time_text: String::new(),
            source_path: "p".into(),
        }
    }

    fn meta(video_id: &str, release_secs: i64, duration: Option<i64>) -> VideoMetadata {
        VideoMetadata {
            video_id: video_id.into(),
            title: format!("Stream {video_id}"),
            channel_id: "UCchan".into(),
            channel_name: "Channel".into(),
            release_timestamp: DateTime::<Utc>::from_timestamp(release_secs, 0),
            timestamp: None,
            duration_seconds: duration,
            was_live: Some(true),
            source_path: "p".into(),
        }
    }

    #[tokio::test]
    async fn buckets_unique_authors_and_messages_separately() -> Result<()> {
        let dir = tempdir()?;
        let store = ChatStore::open(&dir.path().join("test.db")).await?;
        store
            .upsert_metadata(&meta("a0000000000", 1_715_000_000, None))
            .await?;
        // First 5-minute window: alice twice, bob once. Second window: bob.
        store
            .upsert_messages(&[
                chat("m1", "a0000000000", "alice", 10_000, "hi"),
                chat("m2", "a0000000000", "alice", 20_000, "again"),
                chat("m3", "a0000000000", "bob", 30_000, "yo"),
                chat("m4", "a0000000000", "bob", 400_000, "late"),
            ])
            .await?;

        let videos = activity(&store, &["a0000000000".to_string()], 5).await?;
        assert_eq!(videos.len(), 1);
        let video = &videos[0];
        assert_eq!(video.total_messages, 4);
        assert_eq!(video.total_unique_chatters, 2);
        assert_eq!(video.windows.len(), 2);
        assert_eq!(video.windows[0].unique_chatters, 2);
        assert_eq!(video.windows[0].messages, 3);
        assert_eq!(video.windows[1].unique_chatters, 1);
        assert_eq!(video.windows[1].messages, 1);
        assert_eq!(video.windows[0].start_offset_secs, 0);
        assert_eq!(video.windows[1].start_offset_secs, 300);
        Ok(())
    }

    #[tokio::test]
    async fn messages_past_the_known_duration_are_dropped() -> Result<()> {
        let dir = tempdir()?;
        let store = ChatStore::open(&dir.path().join("test.db")).await?;
        store
            .upsert_metadata(&meta("a0000000000", 1_715_000_000, Some(600)))
            .await?;
        store
            .upsert_messages(&[
                chat("m1", "a0000000000", "alice", 10_000, "hi"),
                chat("m2", "a0000000000", "bob", 700_000, "replay artifact"),
            ])
            .await?;

        let videos = activity(&store, &["a0000000000".to_string()], 5).await?;
        assert_eq!(videos[0].total_messages, 1);
        assert_eq!(videos[0].windows.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn top_emoji_is_picked_by_frequency() -> Result<()> {
        let dir = tempdir()?;
        let store = ChatStore::open(&dir.path().join("test.db")).await?;
        store
            .upsert_metadata(&meta("a0000000000", 1_715_000_000, None))
            .await?;
        store
            .upsert_messages(&[
                chat("m1", "a0000000000", "a", 1_000, ":_KannaLove:"),
                chat("m2", "a0000000000", "b", 2_000, ":_KannaLove: :_KannaSad:"),
                chat("m3", "a0000000000", "c", 3_000, "no emoji"),
            ])
            .await?;

        let videos = activity(&store, &["a0000000000".to_string()], 5).await?;
        assert_eq!(
            videos[0].windows[0].top_emoji.as_deref(),
            Some(":_KannaLove:")
        );
        Ok(())
    }

    #[tokio::test]
    async fn videos_are_ordered_by_release_date() -> Result<()> {
        let dir = tempdir()?;
        let store = ChatStore::open(&dir.path().join("test.db")).await?;
        store
            .upsert_metadata(&meta("b0000000000", 1_700_000_000, None))
            .await?;
        store
            .upsert_metadata(&meta("a0000000000", 1_710_000_000, None))
            .await?;
        store
            .upsert_messages(&[
                chat("m1", "a0000000000", "x", 1_000, "hi"),
                chat("m2", "b0000000000", "y", 1_000, "hi"),
            ])
            .await?;

        let ids = vec!["a0000000000".to_string(), "b0000000000".to_string()];
        let videos = activity(&store, &ids, 5).await?;
        // "b" released earlier and must come first despite the request order.
        assert_eq!(videos[0].video_id, "b0000000000");
        assert_eq!(videos[1].video_id, "a0000000000");
        Ok(())
    }

    #[tokio::test]
    async fn messages_without_offsets_are_ignored() -> Result<()> {
        let dir = tempdir()?;
        let store = ChatStore::open(&dir.path().join("test.db")).await?;
        store
            .upsert_metadata(&meta("a0000000000", 1_715_000_000, None))
            .await?;
        let mut no_offset = chat("m1", "a0000000000", "alice", 0, "early");
        no_offset.video_offset_time_msec = None;
        store
            .upsert_messages(&[no_offset, chat("m2", "a0000000000", "bob", 5_000, "ok")])
            .await?;

        let videos = activity(&store, &["a0000000000".to_string()], 5).await?;
        assert_eq!(videos[0].total_messages, 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_days_reports_calendar_gaps() -> Result<()> {
        let dir = tempdir()?;
        let store = ChatStore::open(&dir.path().join("test.db")).await?;
        // Videos on 2024-05-25 and 2024-05-27.
        for (id, epoch) in [("a0000000000", 1_716_600_000_i64), ("c0000000000", 1_716_790_000)] {
            let mut record = meta(id, epoch, None);
            record.release_timestamp = DateTime::from_timestamp(epoch, 0);
            store.upsert_metadata(&record).await?;
        }

        let since = NaiveDate::from_ymd_opt(2024, 5, 25).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 5, 29).unwrap();
        let missing = missing_days(&store, since, today).await?;
        assert_eq!(
            missing,
            vec![
                NaiveDate::from_ymd_opt(2024, 5, 26).unwrap(),
                NaiveDate::from_ymd_opt(2024, 5, 28).unwrap(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_days_with_empty_period_is_empty() -> Result<()> {
        let dir = tempdir()?;
        let store = ChatStore::open(&dir.path().join("test.db")).await?;
        let day = NaiveDate::from_ymd_opt(2024, 5, 25).unwrap();
        assert!(missing_days(&store, day, day).await?.is_empty());
        Ok(())
    }
}
