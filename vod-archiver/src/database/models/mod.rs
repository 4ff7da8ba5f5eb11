//! Database models.
//!
//! These models map directly to the database schema. Timestamps are Unix
//! epoch milliseconds (see [`crate::database::time`]).

pub mod chat;
pub mod kv;
pub mod token;
pub mod vod;

pub use chat::*;
pub use kv::*;
pub use token::*;
pub use vod::*;
