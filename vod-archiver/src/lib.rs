//! vod-archiver library crate.
//!
//! Per-channel VOD ingestion: catalog backfill, download/transcode/upload
//! processing, retention of local media and chat recording, all coordinated
//! through a shared SQLite store.

pub mod catalog;
pub mod chat;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod processing;
pub mod resilience;
pub mod retention;
pub mod scheduler;
pub mod services;
pub mod utils;
pub mod vault;

pub use error::{Error, Result};
