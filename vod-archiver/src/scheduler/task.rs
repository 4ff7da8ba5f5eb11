//! Job kinds run per channel.

use std::fmt;

use serde::Serialize;

/// The independent jobs of one channel's task set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Catalog,
    Processing,
    Retention,
    Chat,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Catalog => "catalog",
            Self::Processing => "processing",
            Self::Retention => "retention",
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a spawned job task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub channel: String,
    pub kind: JobKind,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.kind)
    }
}
