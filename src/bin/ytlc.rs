#![forbid(unsafe_code)]

//! Command-line front end: ingestion, burst search, activity tables and the
//! archive coverage report, all over the same local database.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use ytlc_tools::activity;
use ytlc_tools::config::{self, Overrides};
use ytlc_tools::ingest::{self, IngestKind, IngestReport};
use ytlc_tools::search::{self, SearchOptions};
use ytlc_tools::store::ChatStore;

/// Day the archived channel started publishing VODs; coverage is reported
/// from here unless overridden.
const DEFAULT_COVERAGE_START: &str = "2024-05-25";

#[derive(Parser)]
#[command(name = "ytlc", version, about = "Live-chat replay archive tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FileKind {
    Chat,
    Metadata,
    All,
}

#[derive(Subcommand)]
enum Command {
    /// Walk a directory tree and upsert chat replays and video descriptors.
    Ingest {
        /// Directory holding *.live_chat.json / *.info.json files.
        data_dir: PathBuf,
        #[arg(long, value_enum, default_value = "all")]
        kind: FileKind,
        /// Worker-pool size for chat files.
        #[arg(long)]
        workers: Option<usize>,
        /// Messages buffered per file before a flush.
        #[arg(long)]
        buffer: Option<usize>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Find bursts of messages matching one or more regex patterns.
    Search {
        /// Case-insensitive regex patterns; a message matching any one counts.
        #[arg(required = true)]
        patterns: Vec<String>,
        /// Burst window in seconds.
        #[arg(short, long, default_value_t = 60)]
        window: i64,
        /// Matches required inside a window to report a burst.
        #[arg(short, long, default_value_t = 5)]
        min_matches: usize,
        /// Write the markdown report here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Include author and message columns in the report.
        #[arg(long)]
        debug: bool,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Per-video chat activity bucketed into fixed time windows.
    Activity {
        /// Videos to aggregate; defaults to a date/recency selection.
        video_ids: Vec<String>,
        #[arg(long, default_value_t = 5)]
        window_minutes: i64,
        /// Aggregate the N most recent videos.
        #[arg(long)]
        last_n: Option<usize>,
        /// Earliest release date to include (YYYY-MM-DD).
        #[arg(long)]
        start_date: Option<NaiveDate>,
        /// Latest release date to include (YYYY-MM-DD).
        #[arg(long)]
        end_date: Option<NaiveDate>,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List calendar days with no archived video.
    Coverage {
        #[arg(long, default_value = DEFAULT_COVERAGE_START)]
        since: NaiveDate,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupt received, finishing in-flight work...");
            signal_cancel.cancel();
        }
    });

    match cli.command {
        Command::Ingest {
            data_dir,
            kind,
            workers,
            buffer,
            db,
        } => {
            let runtime = config::resolve_runtime(Overrides {
                db_path: db,
                workers,
                buffer_size: buffer,
                env_path: None,
            })?;
            // Metadata first so chat rows join against fresh titles.
            if matches!(kind, FileKind::Metadata | FileKind::All) {
                let report =
                    ingest::ingest_directory(&runtime, &data_dir, IngestKind::Metadata, &cancel)
                        .await?;
                print_report("metadata", &report);
            }
            if matches!(kind, FileKind::Chat | FileKind::All) {
                let report =
                    ingest::ingest_directory(&runtime, &data_dir, IngestKind::Chat, &cancel)
                        .await?;
                print_report("chat", &report);
            }
        }
        Command::Search {
            patterns,
            window,
            min_matches,
            output,
            debug,
            db,
        } => {
            let runtime = config::resolve_runtime(Overrides {
                db_path: db,
                ..Overrides::default()
            })?;
            let store = ChatStore::open(&runtime.db_path).await?;
            let options = SearchOptions {
                window_size: window,
                min_matches,
            };
            let outcome = search::search(&store, &patterns, options, &cancel).await?;
            let report = render_search_markdown(&patterns, options, &outcome, debug);
            match output {
                Some(path) => {
                    std::fs::write(&path, report)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("{} bursts written to {}", outcome.results.len(), path.display());
                }
                None => print!("{report}"),
            }
        }
        Command::Activity {
            video_ids,
            window_minutes,
            last_n,
            start_date,
            end_date,
            db,
        } => {
            let runtime = config::resolve_runtime(Overrides {
                db_path: db,
                ..Overrides::default()
            })?;
            let store = ChatStore::open(&runtime.db_path).await?;
            let ids = if video_ids.is_empty() {
                store.select_video_ids(last_n, start_date, end_date).await?
            } else {
                video_ids
            };
            if ids.is_empty() {
                println!("no videos matched the selection");
                return Ok(());
            }
            let videos = activity::activity(&store, &ids, window_minutes).await?;
            for video in &videos {
                print_activity(video);
            }
        }
        Command::Coverage { since, db } => {
            let runtime = config::resolve_runtime(Overrides {
                db_path: db,
                ..Overrides::default()
            })?;
            let store = ChatStore::open(&runtime.db_path).await?;
            let today = Utc::now().date_naive();
            let missing = activity::missing_days(&store, since, today).await?;
            if missing.is_empty() {
                println!("no missing days since {since}");
            } else {
                println!("{} missing day(s) since {since}:", missing.len());
                for day in &missing {
                    println!("  {day}");
                }
            }
        }
    }
    Ok(())
}

fn print_report(label: &str, report: &IngestReport) {
    println!(
        "{label}: {} file(s) processed, {} failed, {} messages upserted, {} malformed line(s), {} in-batch duplicate(s)",
        report.files_processed,
        report.files_failed,
        report.messages_upserted,
        report.malformed_lines,
        report.batch_duplicates,
    );
}

/// Renders the burst report as a markdown document with seek links.
fn render_search_markdown(
    patterns: &[String],
    options: SearchOptions,
    outcome: &search::SearchOutcome,
    debug: bool,
) -> String {
    let mut out = String::new();
    out.push_str("# Live chat search results\n\n");
    out.push_str("| Parameter | Value |\n|---|---|\n");
    out.push_str(&format!("| Patterns | {} |\n", escape_cell(&patterns.join(", "))));
    out.push_str(&format!("| Window (seconds) | {} |\n", options.window_size));
    out.push_str(&format!("| Min matches | {} |\n", options.min_matches));
    out.push_str(&format!("| Results found | {} |\n", outcome.results.len()));
    out.push_str(&format!("| Lines searched | {} |\n", outcome.rows_scanned));
    out.push_str(&format!(
        "| Generated at (UTC) | {} |\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!(
        "| Latest live chat | {} |\n\n",
        outcome
            .latest_message
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "n/a".to_string())
    ));

    if debug {
        out.push_str("| Date | Title | Timestamp | Author | Message |\n|---|---|---|---|---|\n");
    } else {
        out.push_str("| Date | Title | Timestamp |\n|---|---|---|\n");
    }
    for event in &outcome.results {
        let date = event
            .release_timestamp
            .map(|ts| ts.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let title = format!(
            "[{}](https://www.youtube.com/watch?v={})",
            escape_cell(&event.title),
            event.video_id
        );
        // Link 10 seconds early so the click lands before the moment.
        let seek = (event.offset_seconds - 10).max(0);
        let stamp = format!(
            "[{}](https://www.youtube.com/watch?v={}&t={}s)",
            format_hms(event.offset_seconds),
            event.video_id,
            seek
        );
        if debug {
            out.push_str(&format!(
                "| {date} | {title} | {stamp} | {} | {} |\n",
                escape_cell(&event.author),
                escape_cell(&event.message)
            ));
        } else {
            out.push_str(&format!("| {date} | {title} | {stamp} |\n"));
        }
    }
    out
}

fn print_activity(video: &activity::VideoActivity) {
    let date = video
        .release_date
        .map(|day| day.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "\n== {date} {} ({}) -- {} messages from {} chatters",
        video.title, video.video_id, video.total_messages, video.total_unique_chatters
    );
    println!("| Window | Chatters | Messages | Top emoji |");
    println!("|---|---|---|---|");
    for window in &video.windows {
        println!(
            "| {}-{} | {} | {} | {} |",
            format_hms(window.start_offset_secs),
            format_hms(window.end_offset_secs),
            window.unique_chatters,
            window.messages,
            window.top_emoji.as_deref().unwrap_or("-")
        );
    }
}

fn format_hms(total_secs: i64) -> String {
    let secs = total_secs.max(0);
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}
