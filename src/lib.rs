#![forbid(unsafe_code)]

//! Core library for the ytlc tools: ingestion of YouTube live-chat replay
//! exports and video descriptor JSON into a local SQLite database, plus the
//! analytical queries that run over the result (burst detection and
//! chatter-activity aggregation).
//!
//! The CLI binary is thin glue; everything with observable behaviour lives
//! in these modules so it can be tested against throwaway databases.

pub mod activity;
pub mod config;
pub mod ingest;
pub mod metadata;
pub mod record;
pub mod search;
pub mod store;
