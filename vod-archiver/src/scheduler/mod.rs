//! Per-channel job supervision and admin triggers.

pub mod supervisor;
pub mod task;
pub mod trigger;

pub use supervisor::{ChannelJobs, ChannelSupervisor, ShutdownReport};
pub use task::{JobKind, TaskId};
pub use trigger::{AdminHandle, TriggerError};
