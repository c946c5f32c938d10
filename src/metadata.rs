#![forbid(unsafe_code)]

//! Import of per-video descriptor files (`*.info.json`) into the
//! `video_metadata` table.
//!
//! Sibling pipeline to chat ingestion, but much simpler: one JSON document
//! per file, no windowing, no batching. Re-imports merge under the same
//! coalesce policy as chat rows.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::DateTime;
use serde::Deserialize;

use crate::record::{extract_video_id, parse_duration};
use crate::store::{ChatStore, VideoMetadata};

/// The slice of a yt-dlp style descriptor this importer reads. Everything is
/// optional; missing fields become empty/null columns the next import can
/// fill in.
#[derive(Debug, Deserialize)]
struct RawDescriptor {
    id: Option<String>,
    title: Option<String>,
    channel_id: Option<String>,
    channel: Option<String>,
    release_timestamp: Option<i64>,
    timestamp: Option<i64>,
    duration: Option<f64>,
    duration_string: Option<String>,
    was_live: Option<bool>,
}

/// Parses one descriptor file into a [`VideoMetadata`] record.
///
/// The video id comes from the document itself, falling back to the bracketed
/// filename token; a file providing neither fails (that file only).
pub fn parse_descriptor(path: &Path, raw: &str) -> Result<VideoMetadata> {
    let descriptor: RawDescriptor = serde_json::from_str(raw)
        .with_context(|| format!("parsing descriptor {}", path.display()))?;

    let video_id = match descriptor.id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => extract_video_id(path)?,
    };

    // yt-dlp usually emits a numeric duration; older exports only carry the
    // human-readable string.
    let duration_seconds = descriptor
        .duration
        .map(|secs| secs.round() as i64)
        .or_else(|| {
            descriptor
                .duration_string
                .as_deref()
                .and_then(parse_duration)
        });

    let source_path = std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned();

    Ok(VideoMetadata {
        video_id,
        title: descriptor.title.unwrap_or_default(),
        channel_id: descriptor.channel_id.unwrap_or_default(),
        channel_name: descriptor.channel.unwrap_or_default(),
        release_timestamp: descriptor
            .release_timestamp
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        timestamp: descriptor
            .timestamp
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        duration_seconds,
        was_live: descriptor.was_live,
        source_path,
    })
}

/// Reads, parses and upserts one descriptor file.
pub async fn import_descriptor(store: &ChatStore, path: &Path) -> Result<VideoMetadata> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading descriptor {}", path.display()))?;
    let record = parse_descriptor(path, &raw)?;
    store
        .upsert_metadata(&record)
        .await
        .with_context(|| format!("storing metadata for {}", record.video_id))?;
    Ok(record)
}
