//! Configuration system for family-filter.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (`config/default.toml`)
//! 2. System config: `/etc/family-filter/config.toml`
//! 3. User config: `~/.config/family-filter/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! # Merge Behavior
//!
//! - **Lists** (exempt_users, own_bundle_ids, ...) are **merged** (appended)
//! - **Scalars** (timeouts, log_level, paths) are **overridden** when set
//!
//! ```toml
//! [filter]
//! exempt_users = [1001]
//!
//! [sync]
//! url = "wss://api.family-filter.app/app-socket"
//! reconnect_delay_secs = 30
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use schema::{AppsConfig, Config, ControlConfig, FilterConfig, GeneralConfig, SyncConfig};
