//! Per-channel job counters.
//!
//! Counters are always tagged with their channel; there are no global
//! totals. Exporting them is left to whoever reads [`MetricsCollector::snapshot`].

pub mod collector;

pub use collector::{ChannelMetrics, Counter, MetricsCollector, MetricsSnapshot};
