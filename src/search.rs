#![forbid(unsafe_code)]

//! Burst detection: find, per video, the earliest message of every maximal
//! time window in which matching-chat volume crosses a threshold, without
//! ever reporting two overlapping windows for the same video.
//!
//! Matching is case-insensitive substring-style regex search, OR'd across
//! patterns. The store hands back the matching subsequence already sorted by
//! video and time, so the clustering itself is a single two-pointer sweep.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use regex::RegexSetBuilder;
use tokio_util::sync::CancellationToken;

use crate::store::{ChatStore, SearchRow};

/// Tuning knobs for a detection run.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    /// Window length in seconds.
    pub window_size: i64,
    /// Minimum matching messages inside a window for it to qualify.
    pub min_matches: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            window_size: 60,
            min_matches: 5,
        }
    }
}

/// The representative (earliest) message of one qualifying burst.
#[derive(Debug, Clone)]
pub struct BurstEvent {
    pub video_id: String,
    pub title: String,
    pub release_timestamp: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub message: String,
    /// Seek position in seconds: the stored stream offset when present,
    /// otherwise derived from the release timestamp.
    pub offset_seconds: i64,
}

/// A whole detection run: ordered results plus the audit values collaborators
/// display alongside them.
#[derive(Debug)]
pub struct SearchOutcome {
    pub results: Vec<BurstEvent>,
    pub rows_scanned: i64,
    pub latest_message: Option<DateTime<Utc>>,
}

/// Compiles the OR'd, case-insensitive pattern set.
pub fn build_matcher(patterns: &[String]) -> Result<regex::RegexSet> {
    RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()
        .context("compiling search patterns")
}

/// Sweeps one video's time-sorted matching timestamps and returns the indices
/// of burst representatives.
///
/// Every match anchors a candidate window `[t, t + window)` (half-open: a
/// message exactly at `t + window` is outside). A window qualifies when it
/// holds at least `min_matches` matches; the anchor itself is the earliest
/// message in it and becomes the representative. After a report, candidates
/// before `anchor + window` are suppressed so reported windows never overlap.
pub fn cluster_bursts(
    timestamps: &[DateTime<Utc>],
    window: Duration,
    min_matches: usize,
) -> Vec<usize> {
    let mut representatives = Vec::new();
    let mut suppressed_until: Option<DateTime<Utc>> = None;
    let mut end = 0usize;

    for start in 0..timestamps.len() {
        if let Some(boundary) = suppressed_until {
            if timestamps[start] < boundary {
                continue;
            }
        }
        if end < start {
            end = start;
        }
        let window_close = timestamps[start] + window;
        while end < timestamps.len() && timestamps[end] < window_close {
            end += 1;
        }
        if end - start >= min_matches {
            representatives.push(start);
            suppressed_until = Some(window_close);
        }
    }
    representatives
}

/// Runs burst detection over the whole store.
///
/// Any store/query failure aborts the call; there are no partial results.
/// Zero matches is a normal empty outcome. Results are globally sorted by
/// timestamp regardless of per-video discovery order.
pub async fn search(
    store: &ChatStore,
    patterns: &[String],
    options: SearchOptions,
    cancel: &CancellationToken,
) -> Result<SearchOutcome> {
    let matcher = build_matcher(patterns)?;
    let rows_scanned = store.message_count().await?;
    let latest_message = store.latest_message_timestamp().await?;
    let rows = store
        .matching_messages(|message| matcher.is_match(message))
        .await?;

    let window = Duration::seconds(options.window_size);
    let mut results = Vec::new();

    // Rows arrive ordered by (video_id, timestamp); consume one contiguous
    // video group at a time.
    let mut group_start = 0usize;
    while group_start < rows.len() {
        if cancel.is_cancelled() {
            bail!("search cancelled");
        }
        let video_id = &rows[group_start].video_id;
        let mut group_end = group_start + 1;
        while group_end < rows.len() && rows[group_end].video_id == *video_id {
            group_end += 1;
        }

        let group = &rows[group_start..group_end];
        let timestamps: Vec<DateTime<Utc>> = group.iter().map(|row| row.timestamp).collect();
        for index in cluster_bursts(&timestamps, window, options.min_matches) {
            results.push(to_event(&group[index]));
        }
        group_start = group_end;
    }

    results.sort_by_key(|event| event.timestamp);
    Ok(SearchOutcome {
        results,
        rows_scanned,
        latest_message,
    })
}

fn to_event(row: &SearchRow) -> BurstEvent {
    let offset_seconds = match row.video_offset_time_msec {
        // Stored stream offset is authoritative when tracking had begun.
        Some(msec) if msec > 0 => (msec + 999) / 1000,
        _ => row
            .release_timestamp
            .map(|release| {
                let millis = (row.timestamp - release).num_milliseconds();
                (millis + 999).div_euclid(1000)
            })
            .unwrap_or(0),
    };
    BurstEvent {
        video_id: row.video_id.clone(),
        title: row.title.clone(),
        release_timestamp: row.release_timestamp,
        timestamp: row.timestamp,
        author: row.author.clone(),
        message: row.message.clone(),
        offset_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ChatMessage;
    use crate::store::VideoMetadata;
    use tempfile::tempdir;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_715_618_400 + secs, 0).unwrap()
    }

    fn seconds(values: &[i64]) -> Vec<DateTime<Utc>> {
        values.iter().map(|&s| at(s)).collect()
    }

    #[test]
    fn two_clean_bursts_report_exactly_two_representatives() {
        // Matches at 0,10,20,30 and 70,80,90,100: window [0,60) holds four,
        // the next candidate at or past 60 is t=70, whose window also holds
        // four. Two results, not eight.
        let ts = seconds(&[0, 10, 20, 30, 70, 80, 90, 100]);
        let reported = cluster_bursts(&ts, Duration::seconds(60), 4);
        assert_eq!(reported, vec![0, 4]);
        assert_eq!(ts[reported[0]], at(0));
        assert_eq!(ts[reported[1]], at(70));
    }

    #[test]
    fn below_threshold_reports_nothing() {
        let ts = seconds(&[0, 10, 20, 30]);
        assert!(cluster_bursts(&ts, Duration::seconds(60), 5).is_empty());
    }

    #[test]
    fn window_is_half_open_at_the_far_edge() {
        // A match exactly at start+window is outside the window.
        let short = seconds(&[0, 10, 20, 60]);
        assert!(cluster_bursts(&short, Duration::seconds(60), 4).is_empty());

        let inside = seconds(&[0, 10, 20, 59]);
        assert_eq!(cluster_bursts(&inside, Duration::seconds(60), 4), vec![0]);
    }

    #[test]
    fn candidate_exactly_at_the_boundary_may_start_a_new_window() {
        let ts = seconds(&[0, 10, 20, 30, 60, 70, 80, 90]);
        assert_eq!(cluster_bursts(&ts, Duration::seconds(60), 4), vec![0, 4]);
    }

    #[test]
    fn candidates_inside_a_reported_window_are_suppressed() {
        // t=30 anchors a dense window of its own but overlaps the report at
        // t=0, so it must not be reported.
        let ts = seconds(&[0, 10, 20, 30, 40, 50, 55, 58]);
        assert_eq!(cluster_bursts(&ts, Duration::seconds(60), 4), vec![0]);
    }

    #[test]
    fn identical_timestamps_count_within_one_window() {
        let ts = seconds(&[0, 0, 0, 0]);
        assert_eq!(cluster_bursts(&ts, Duration::seconds(60), 4), vec![0]);
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(cluster_bursts(&[], Duration::seconds(60), 1).is_empty());
    }

    #[test]
    fn matcher_is_case_insensitive_and_ored() {
        let matcher = build_matcher(&["pog".into(), "lets go".into()]).unwrap();
        assert!(matcher.is_match("POGGERS"));
        assert!(matcher.is_match("ok LETS GO ok"));
        assert!(!matcher.is_match("quiet"));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(build_matcher(&["(".into()]).is_err());
    }

    fn chat(id: &str, video_id: &str, secs: i64, text: &str) -> ChatMessage {
        ChatMessage {
            message_id: id.into(),
            timestamp: at(secs),
            video_id: video_id.into(),
            author: "viewer".into(),
            author_channel_id: "UCabc".into(),
            message: text.into(),
            is_moderator: false,
            is_channel_owner: false,
            video_offset_time_msec: None,
            video_offset_time_text: String::new(),
            source_path: "p".into(),
        }
    }

    fn meta(video_id: &str, title: &str, release_secs: i64) -> VideoMetadata {
        VideoMetadata {
            video_id: video_id.into(),
            title: title.into(),
            channel_id: "UCchan".into(),
            channel_name: "Channel".into(),
            release_timestamp: Some(at(release_secs)),
            timestamp: None,
            duration_seconds: None,
            was_live: Some(true),
            source_path: "p".into(),
        }
    }

    async fn seeded_store(dir: &std::path::Path) -> Result<ChatStore> {
        let store = ChatStore::open(&dir.join("test.db")).await?;
        store.upsert_metadata(&meta("b0000000000", "Later stream", 500)).await?;
        store.upsert_metadata(&meta("a0000000000", "Earlier stream", -100)).await?;

        let mut batch = Vec::new();
        // "Later stream": burst at t=600..630.
        for (i, secs) in [600, 610, 620, 630].iter().enumerate() {
            batch.push(chat(&format!("b{i}"), "b0000000000", *secs, "POG moment"));
        }
        // "Earlier stream": burst at t=0..30 plus non-matching noise.
        for (i, secs) in [0, 10, 20, 30].iter().enumerate() {
            batch.push(chat(&format!("a{i}"), "a0000000000", *secs, "pog pog"));
        }
        batch.push(chat("noise", "a0000000000", 5, "unrelated"));
        store.upsert_messages(&batch).await?;
        Ok(store)
    }

    #[tokio::test]
    async fn results_are_globally_sorted_by_timestamp() -> Result<()> {
        let dir = tempdir()?;
        let store = seeded_store(dir.path()).await?;

        let outcome = search(
            &store,
            &["pog".into()],
            SearchOptions {
                window_size: 60,
                min_matches: 4,
            },
            &CancellationToken::new(),
        )
        .await?;

        assert_eq!(outcome.results.len(), 2);
        // Video "b" sorts first by id in the scan, but "a" bursts earlier.
        assert_eq!(outcome.results[0].video_id, "a0000000000");
        assert_eq!(outcome.results[0].title, "Earlier stream");
        assert_eq!(outcome.results[1].video_id, "b0000000000");
        assert_eq!(outcome.rows_scanned, 9);
        assert_eq!(outcome.latest_message, Some(at(630)));
        Ok(())
    }

    #[tokio::test]
    async fn offset_falls_back_to_release_delta() -> Result<()> {
        let dir = tempdir()?;
        let store = seeded_store(dir.path()).await?;

        let outcome = search(
            &store,
            &["pog".into()],
            SearchOptions {
                window_size: 60,
                min_matches: 4,
            },
            &CancellationToken::new(),
        )
        .await?;

        // "Earlier stream" released at t=-100, burst representative at t=0.
        assert_eq!(outcome.results[0].offset_seconds, 100);
        // "Later stream" released at t=500, representative at t=600.
        assert_eq!(outcome.results[1].offset_seconds, 100);
        Ok(())
    }

    #[tokio::test]
    async fn stored_offset_is_preferred_over_the_delta() -> Result<()> {
        let dir = tempdir()?;
        let store = ChatStore::open(&dir.path().join("test.db")).await?;
        store.upsert_metadata(&meta("a0000000000", "Stream", 0)).await?;
        let mut batch = Vec::new();
        for (i, secs) in [100, 110, 120].iter().enumerate() {
            let mut message = chat(&format!("m{i}"), "a0000000000", *secs, "hype");
            message.video_offset_time_msec = Some(4_500 + i as i64);
            batch.push(message);
        }
        store.upsert_messages(&batch).await?;

        let outcome = search(
            &store,
            &["hype".into()],
            SearchOptions {
                window_size: 60,
                min_matches: 3,
            },
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(outcome.results.len(), 1);
        // 4500 ms rounds up to 5 s, not 100 s from the release delta.
        assert_eq!(outcome.results[0].offset_seconds, 5);
        Ok(())
    }

    #[tokio::test]
    async fn zero_matches_is_a_normal_empty_outcome() -> Result<()> {
        let dir = tempdir()?;
        let store = seeded_store(dir.path()).await?;
        let outcome = search(
            &store,
            &["never-said".into()],
            SearchOptions::default(),
            &CancellationToken::new(),
        )
        .await?;
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.rows_scanned, 9);
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_aborts_the_sweep() -> Result<()> {
        let dir = tempdir()?;
        let store = seeded_store(dir.path()).await?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = search(&store, &["pog".into()], SearchOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        Ok(())
    }
}
