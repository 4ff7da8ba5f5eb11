//! Repository layer for database access.
//!
//! Each table gets a trait plus an SQLx implementation so jobs can be tested
//! against the real schema and composed behind `Arc<dyn …>`.

pub mod chat;
pub mod kv;
pub mod token;
pub mod vod;

pub use chat::*;
pub use kv::*;
pub use token::*;
pub use vod::*;
