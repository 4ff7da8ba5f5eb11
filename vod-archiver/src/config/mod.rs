//! Application configuration.
//!
//! Loaded once at startup from a JSON file plus environment overrides.
//! Changing configuration requires a restart.

pub mod app;
pub mod loader;
pub mod resolved;

pub use app::{
    AppConfig, BreakerConfig, CatalogConfig, ChannelConfig, ChannelOverrides, ChatConfig,
    CommandConfig, ProcessingConfig, RetentionConfig, VaultConfig,
};
pub use loader::CONFIG_PATH_ENV;
pub use resolved::ResolvedChannelConfig;
