//! Local media retention.

pub mod job;
pub mod policy;

pub use job::{RetentionJob, RetentionReport};
pub use policy::{Decision, RetentionPolicy, SkipReason};
