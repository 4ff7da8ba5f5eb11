//! VOD catalog discovery.

pub mod client;
pub mod cursor;
pub mod helix;
pub mod job;

pub use client::{CatalogClient, CatalogError, CatalogPage, CatalogVideo};
pub use cursor::{BACKFILL_CURSOR_KEY, BackfillCursor, CursorStore};
pub use helix::HelixClient;
pub use job::{BackfillReport, CatalogBackfillJob};
