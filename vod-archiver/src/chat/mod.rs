//! Live chat recording.

pub mod recorder;
pub mod source;
pub mod twitch;

pub use recorder::{ChatRecorder, FlushReport};
pub use source::{ChatError, ChatMessage, ChatSource, ChatStream};
pub use twitch::TwitchChatSource;
