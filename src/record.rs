#![forbid(unsafe_code)]

//! Decoding of raw replay chat-log lines into canonical [`ChatMessage`]s.
//!
//! A chat-log file is JSON Lines, one action envelope per line. Most lines
//! carry a `liveChatTextMessageRenderer`; everything else (paid messages,
//! membership events, removals, ticker updates) is outside the data model and
//! decodes to [`LineOutcome::Skip`]. The serde structs below mirror only the
//! fields we read: unknown keys are ignored and absent optional subtrees are
//! tolerated, so a shape mismatch is confined to genuinely broken lines.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A chat-log or descriptor file whose name lacks the bracketed
/// 11-character video id token. Fatal to that file, never to the run.
#[derive(Debug, Error)]
#[error("no bracketed 11-character video id in file name: {}", path.display())]
pub struct MalformedFilename {
    pub path: PathBuf,
}

/// Canonical chat event, one row in the `live_chat` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    /// Platform-unique identifier; dedup key across repeated ingestions.
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub video_id: String,
    pub author: String,
    pub author_channel_id: String,
    /// Run-concatenated body; emoji runs contribute their first shortcode.
    pub message: String,
    pub is_moderator: bool,
    pub is_channel_owner: bool,
    /// Milliseconds from stream start; authoritative seek time when present.
    pub video_offset_time_msec: Option<i64>,
    /// Human-readable offset as displayed live, informational only.
    pub video_offset_time_text: String,
    pub source_path: String,
}

/// Outcome of decoding one line.
#[derive(Debug)]
pub enum LineOutcome {
    /// The line carried a plain-text chat event.
    Message(Box<ChatMessage>),
    /// Valid JSON, but not a plain-text chat event. Normal, not an error.
    Skip,
    /// Broken JSON or a text renderer missing its mandatory fields.
    Malformed,
}

// Envelope shapes, trimmed to the fields this pipeline reads.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    replay_chat_item_action: Option<RawReplayAction>,
    video_offset_time_msec: Option<RawNumber>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReplayAction {
    #[serde(default)]
    actions: Vec<RawAction>,
    video_offset_time_msec: Option<RawNumber>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAction {
    add_chat_item_action: Option<RawAddChatItem>,
}

#[derive(Debug, Deserialize)]
struct RawAddChatItem {
    item: Option<RawItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawItem {
    live_chat_text_message_renderer: Option<RawTextRenderer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTextRenderer {
    id: Option<String>,
    timestamp_usec: Option<RawNumber>,
    author_name: Option<RawSimpleText>,
    author_external_channel_id: Option<String>,
    message: Option<RawMessageBody>,
    #[serde(default)]
    author_badges: Vec<RawBadge>,
    timestamp_text: Option<RawSimpleText>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSimpleText {
    simple_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessageBody {
    #[serde(default)]
    runs: Vec<RawRun>,
}

/// A message fragment: literal text or an emoji reference, in display order.
/// The catch-all variant keeps one exotic run from poisoning the whole line.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRun {
    Text { text: String },
    Emoji { emoji: RawEmoji },
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct RawEmoji {
    #[serde(default)]
    shortcuts: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBadge {
    live_chat_author_badge_renderer: Option<RawBadgeRenderer>,
}

#[derive(Debug, Deserialize)]
struct RawBadgeRenderer {
    icon: Option<RawBadgeIcon>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBadgeIcon {
    icon_type: Option<String>,
}

/// Numbers in these exports show up both as JSON numbers and as decimal
/// strings (`"videoOffsetTimeMsec": "6441"`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Int(i64),
    Text(String),
}

impl RawNumber {
    fn as_i64(&self) -> Option<i64> {
        match self {
            RawNumber::Int(value) => Some(*value),
            RawNumber::Text(value) => value.trim().parse().ok(),
        }
    }
}

/// Decodes one chat-log line. `video_id` and `source_path` are per-file
/// values the caller resolved up front.
pub fn parse_line(line: &str, video_id: &str, source_path: &str) -> LineOutcome {
    let envelope: RawEnvelope = match serde_json::from_str(line) {
        Ok(envelope) => envelope,
        Err(_) => return LineOutcome::Malformed,
    };

    let Some(replay) = envelope.replay_chat_item_action else {
        return LineOutcome::Skip;
    };

    // The envelope-level offset is preferred; older exports nest it inside
    // the replay action instead.
    let offset_msec = envelope
        .video_offset_time_msec
        .as_ref()
        .and_then(RawNumber::as_i64)
        .or_else(|| {
            replay
                .video_offset_time_msec
                .as_ref()
                .and_then(RawNumber::as_i64)
        });

    let renderer = replay
        .actions
        .into_iter()
        .filter_map(|action| action.add_chat_item_action)
        .filter_map(|add| add.item)
        .find_map(|item| item.live_chat_text_message_renderer);
    let Some(renderer) = renderer else {
        return LineOutcome::Skip;
    };

    let Some(timestamp) = renderer
        .timestamp_usec
        .as_ref()
        .and_then(RawNumber::as_i64)
        .and_then(DateTime::from_timestamp_micros)
    else {
        // A text renderer without a usable timestamp cannot be ordered or
        // windowed; count it with the broken lines.
        return LineOutcome::Malformed;
    };

    let message = concat_runs(
        renderer
            .message
            .map(|body| body.runs)
            .unwrap_or_default(),
    );
    let (is_moderator, is_channel_owner) = badge_flags(&renderer.author_badges);

    LineOutcome::Message(Box::new(ChatMessage {
        message_id: renderer.id.unwrap_or_default(),
        timestamp,
        video_id: video_id.to_string(),
        author: simple_text(renderer.author_name),
        author_channel_id: renderer.author_external_channel_id.unwrap_or_default(),
        message,
        is_moderator,
        is_channel_owner,
        video_offset_time_msec: offset_msec,
        video_offset_time_text: simple_text(renderer.timestamp_text),
        source_path: source_path.to_string(),
    }))
}

fn simple_text(value: Option<RawSimpleText>) -> String {
    value.and_then(|text| text.simple_text).unwrap_or_default()
}

/// Concatenates runs in declaration order with no separators. An emoji run
/// contributes its first declared shortcode, or nothing when none exists.
fn concat_runs(runs: Vec<RawRun>) -> String {
    let mut message = String::new();
    for run in runs {
        match run {
            RawRun::Text { text } => message.push_str(&text),
            RawRun::Emoji { emoji } => {
                if let Some(shortcut) = emoji.shortcuts.first() {
                    message.push_str(shortcut);
                }
            }
            RawRun::Other(_) => {}
        }
    }
    message
}

/// True for each flag when *any* badge entry carries the matching icon type.
fn badge_flags(badges: &[RawBadge]) -> (bool, bool) {
    let mut is_moderator = false;
    let mut is_channel_owner = false;
    for badge in badges {
        let icon_type = badge
            .live_chat_author_badge_renderer
            .as_ref()
            .and_then(|renderer| renderer.icon.as_ref())
            .and_then(|icon| icon.icon_type.as_deref());
        match icon_type {
            Some("MODERATOR") => is_moderator = true,
            Some("OWNER") => is_channel_owner = true,
            _ => {}
        }
    }
    (is_moderator, is_channel_owner)
}

static VIDEO_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([A-Za-z0-9_-]{11})\]").expect("video id pattern"));

/// Extracts the 11-character video id enclosed in square brackets anywhere in
/// the path. This is a per-file precondition: without it no line of the file
/// can be attributed to a stream.
pub fn extract_video_id(path: &Path) -> Result<String, MalformedFilename> {
    let haystack = path.to_string_lossy();
    VIDEO_ID_RE
        .captures(&haystack)
        .map(|captures| captures[1].to_string())
        .ok_or_else(|| MalformedFilename {
            path: path.to_path_buf(),
        })
}

/// Converts a `H:MM:SS`, `M:SS` or `SS` duration string to seconds.
pub fn parse_duration(duration: &str) -> Option<i64> {
    let parts: Vec<i64> = duration
        .split(':')
        .map(|part| part.trim().parse().ok())
        .collect::<Option<_>>()?;
    match parts.as_slice() {
        [hours, minutes, seconds] => Some(hours * 3600 + minutes * 60 + seconds),
        [minutes, seconds] => Some(minutes * 60 + seconds),
        [seconds] => Some(*seconds),
        _ => None,
    }
}
