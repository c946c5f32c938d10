#![forbid(unsafe_code)]

//! Chat-log ingestion: file discovery, buffered per-file parsing, batch
//! deduplication and upsert, fanned out over a bounded worker pool.
//!
//! Isolation contract: a broken line costs that line, a broken file costs
//! that file, and nothing aborts the run as a whole. Workers share no mutable
//! state: each opens its own database connection and the upsert's conflict
//! policy makes concurrent writes of the same `message_id` commutative.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use std::fs::File;
use std::io::{BufRead, BufReader};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::Runtime;
use crate::metadata::import_descriptor;
use crate::record::{ChatMessage, LineOutcome, extract_video_id, parse_line};
use crate::store::ChatStore;

const CHAT_SUFFIX: &str = ".live_chat.json";
const METADATA_SUFFIX: &str = ".info.json";

/// Which file family an ingest pass consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestKind {
    Chat,
    Metadata,
}

impl IngestKind {
    fn suffix(self) -> &'static str {
        match self {
            IngestKind::Chat => CHAT_SUFFIX,
            IngestKind::Metadata => METADATA_SUFFIX,
        }
    }
}

/// Counters for one file.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileReport {
    pub messages_upserted: usize,
    pub malformed_lines: usize,
    pub batch_duplicates: usize,
}

/// Counters for a whole ingest run.
#[derive(Debug, Default, Clone, Copy)]
pub struct IngestReport {
    pub files_processed: usize,
    pub files_failed: usize,
    pub messages_upserted: usize,
    pub malformed_lines: usize,
    pub batch_duplicates: usize,
}

impl IngestReport {
    fn absorb(&mut self, file: FileReport) {
        self.files_processed += 1;
        self.messages_upserted += file.messages_upserted;
        self.malformed_lines += file.malformed_lines;
        self.batch_duplicates += file.batch_duplicates;
    }
}

/// Recursively discovers ingestable files under `dir` by suffix convention.
/// The directory must exist; its absence is an error the caller reports.
pub fn discover_files(dir: &Path, kind: IngestKind) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("directory not found: {}", dir.display());
    }
    let suffix = kind.suffix();
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.ends_with(suffix) {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Collapses duplicate `message_id`s within one buffered batch: the later
/// entry in file order wins wholesale, first-seen order is kept. Returns the
/// deduplicated batch and how many entries were collapsed.
fn dedup_batch(batch: Vec<ChatMessage>) -> (Vec<ChatMessage>, usize) {
    let mut by_id: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    let mut unique: Vec<ChatMessage> = Vec::with_capacity(batch.len());
    let mut collapsed = 0;
    for message in batch {
        match by_id.get(&message.message_id) {
            Some(&slot) => {
                unique[slot] = message;
                collapsed += 1;
            }
            None => {
                by_id.insert(message.message_id.clone(), unique.len());
                unique.push(message);
            }
        }
    }
    (unique, collapsed)
}

/// Deduplicates and commits one buffer. On a store failure a sample of the
/// batch is printed to aid diagnosis before the error propagates (failing
/// this file, not the run).
async fn flush_buffer(
    store: &ChatStore,
    buffer: &mut Vec<ChatMessage>,
    report: &mut FileReport,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    let (batch, collapsed) = dedup_batch(std::mem::take(buffer));
    report.batch_duplicates += collapsed;
    if let Err(err) = store.upsert_messages(&batch).await {
        eprintln!("Store rejected a batch of {} messages: {err:#}", batch.len());
        for message in batch.iter().take(3) {
            eprintln!("  sample row: {message:?}");
        }
        return Err(err);
    }
    report.messages_upserted += batch.len();
    Ok(())
}

/// Ingests a single chat-log file with its own store connection.
pub async fn ingest_chat_file(
    db_path: &Path,
    file_path: &Path,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<FileReport> {
    let video_id = extract_video_id(file_path)?;
    let canonical = std::fs::canonicalize(file_path)
        .unwrap_or_else(|_| file_path.to_path_buf())
        .to_string_lossy()
        .into_owned();

    let store = ChatStore::open(db_path).await?;
    let file =
        File::open(file_path).with_context(|| format!("opening {}", file_path.display()))?;
    let reader = BufReader::new(file);

    let mut report = FileReport::default();
    let mut buffer: Vec<ChatMessage> = Vec::new();

    for line in reader.lines() {
        let line = line.with_context(|| format!("reading {}", file_path.display()))?;
        match parse_line(&line, &video_id, &canonical) {
            LineOutcome::Message(message) => buffer.push(*message),
            LineOutcome::Skip => {}
            LineOutcome::Malformed => {
                eprintln!("Skipping malformed line in {}", file_path.display());
                report.malformed_lines += 1;
            }
        }
        if buffer.len() >= buffer_size {
            if cancel.is_cancelled() {
                bail!("ingestion cancelled");
            }
            flush_buffer(&store, &mut buffer, &mut report).await?;
        }
    }
    flush_buffer(&store, &mut buffer, &mut report).await?;
    Ok(report)
}

/// Ingests every matching file under `dir`.
///
/// Chat files fan out over a pool of `runtime.workers` concurrent tasks;
/// descriptor files are few and are imported sequentially. Per-file failures
/// are reported and counted, never fatal to the run.
pub async fn ingest_directory(
    runtime: &Runtime,
    dir: &Path,
    kind: IngestKind,
    cancel: &CancellationToken,
) -> Result<IngestReport> {
    let files = discover_files(dir, kind)?;
    match kind {
        IngestKind::Chat => ingest_chat_files(runtime, files, cancel).await,
        IngestKind::Metadata => ingest_metadata_files(runtime, files, cancel).await,
    }
}

async fn ingest_chat_files(
    runtime: &Runtime,
    files: Vec<PathBuf>,
    cancel: &CancellationToken,
) -> Result<IngestReport> {
    let semaphore = Arc::new(Semaphore::new(runtime.workers));
    let mut workers: JoinSet<(PathBuf, Result<Option<FileReport>>)> = JoinSet::new();

    for file_path in files {
        let semaphore = Arc::clone(&semaphore);
        let db_path = runtime.db_path.clone();
        let buffer_size = runtime.buffer_size;
        let cancel = cancel.clone();
        workers.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("pool closed");
            if cancel.is_cancelled() {
                return (file_path, Ok(None));
            }
            let outcome = ingest_chat_file(&db_path, &file_path, buffer_size, &cancel)
                .await
                .map(Some);
            (file_path, outcome)
        });
    }

    let mut report = IngestReport::default();
    while let Some(joined) = workers.join_next().await {
        let (file_path, outcome) = joined.context("ingestion worker panicked")?;
        match outcome {
            Ok(Some(file_report)) => report.absorb(file_report),
            Ok(None) => {}
            Err(err) => {
                eprintln!("Failed to ingest {}: {err:#}", file_path.display());
                report.files_failed += 1;
            }
        }
    }
    Ok(report)
}

async fn ingest_metadata_files(
    runtime: &Runtime,
    files: Vec<PathBuf>,
    cancel: &CancellationToken,
) -> Result<IngestReport> {
    let store = ChatStore::open(&runtime.db_path).await?;
    let mut report = IngestReport::default();
    for file_path in files {
        if cancel.is_cancelled() {
            break;
        }
        match import_descriptor(&store, &file_path).await {
            Ok(_) => report.files_processed += 1,
            Err(err) => {
                eprintln!("Failed to import {}: {err:#}", file_path.display());
                report.files_failed += 1;
            }
        }
    }
    Ok(report)
}
