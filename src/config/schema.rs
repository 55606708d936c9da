//! Configuration schema definitions.
//!
//! Every field defaults to its "unset" value (zero, empty, `None`) so that a
//! partial file only overrides what it names. The built-in values live in
//! `config/default.toml` and are loaded by [`Config::embedded`].

use super::error::{ConfigError, ConfigResult};
use crate::filter::DecisionConfig;
use crate::sync::SyncSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const EMBEDDED_DEFAULTS: &str = include_str!("../../config/default.toml");

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Decision engine settings.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Control socket settings.
    #[serde(default)]
    pub control: ControlConfig,

    /// Backend connection settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// App identification settings.
    #[serde(default)]
    pub apps: AppsConfig,
}

impl Config {
    /// Parse the defaults compiled into the binary.
    pub fn embedded() -> ConfigResult<Self> {
        toml::from_str(EMBEDDED_DEFAULTS).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<embedded:default.toml>"),
            source: e,
        })
    }

    /// Merge another config into this one.
    ///
    /// Lists are merged (appended).
    /// Scalars are overridden when the other side sets them.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.filter.merge(other.filter);
        self.control.merge(other.control);
        self.sync.merge(other.sync);
        self.apps.merge(other.apps);
    }

    /// Check values that can't be expressed in the type.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.control.socket_path.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "control.socket_path".to_string(),
                message: "must be set".to_string(),
            });
        }

        let url = url::Url::parse(&self.sync.url).map_err(|e| ConfigError::InvalidValue {
            field: "sync.url".to_string(),
            message: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidValue {
                field: "sync.url".to_string(),
                message: format!("expected ws:// or wss://, got {}://", url.scheme()),
            });
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Decision engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FilterConfig {
    /// uids below this are system accounts.
    #[serde(default)]
    pub system_user_threshold: u32,

    /// Users never filtered.
    #[serde(default)]
    pub exempt_users: Vec<u32>,

    /// Bundle ids of the companion app.
    #[serde(default)]
    pub own_bundle_ids: Vec<String>,

    /// Bundle id prefixes of internal system processes.
    #[serde(default)]
    pub system_bundle_prefixes: Vec<String>,

    /// Maximum number of pending reported decisions.
    #[serde(default)]
    pub decision_bag_capacity: usize,

    /// How often streamed decisions are flushed, in milliseconds.
    #[serde(default)]
    pub report_interval_ms: u64,
}

impl FilterConfig {
    fn merge(&mut self, other: FilterConfig) {
        if other.system_user_threshold != 0 {
            self.system_user_threshold = other.system_user_threshold;
        }
        if other.decision_bag_capacity != 0 {
            self.decision_bag_capacity = other.decision_bag_capacity;
        }
        if other.report_interval_ms != 0 {
            self.report_interval_ms = other.report_interval_ms;
        }

        self.exempt_users.extend(other.exempt_users);
        self.own_bundle_ids.extend(other.own_bundle_ids);
        self.system_bundle_prefixes
            .extend(other.system_bundle_prefixes);
    }

    /// Settings for the decision engine.
    pub fn decision_config(&self) -> DecisionConfig {
        DecisionConfig {
            system_user_threshold: self.system_user_threshold,
            own_bundle_ids: self.own_bundle_ids.clone(),
            system_bundle_prefixes: self.system_bundle_prefixes.clone(),
        }
    }

    /// Streaming flush interval.
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

/// Control socket configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ControlConfig {
    /// Unix socket the filter listens on.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Per-call RPC timeout in milliseconds.
    #[serde(default)]
    pub rpc_timeout_ms: u64,
}

impl ControlConfig {
    fn merge(&mut self, other: ControlConfig) {
        if other.socket_path.is_some() {
            self.socket_path = other.socket_path;
        }
        if other.rpc_timeout_ms != 0 {
            self.rpc_timeout_ms = other.rpc_timeout_ms;
        }
    }

    /// Per-call RPC timeout.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Backend connection configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Backend WebSocket URL.
    #[serde(default)]
    pub url: String,

    /// Seconds between heartbeat pings.
    #[serde(default)]
    pub heartbeat_interval_secs: u64,

    /// Seconds to wait for a pong.
    #[serde(default)]
    pub pong_grace_secs: u64,

    /// Pause after tearing down a connection, in milliseconds.
    #[serde(default)]
    pub teardown_delay_ms: u64,

    /// First state report delay after connecting, in milliseconds.
    #[serde(default)]
    pub early_report_ms: u64,

    /// Additional delay before the final state report, in milliseconds.
    #[serde(default)]
    pub final_report_ms: u64,

    /// Seconds to wait before reconnecting after a disconnect.
    #[serde(default)]
    pub reconnect_delay_secs: u64,
}

impl SyncConfig {
    fn merge(&mut self, other: SyncConfig) {
        if !other.url.is_empty() {
            self.url = other.url;
        }
        if other.heartbeat_interval_secs != 0 {
            self.heartbeat_interval_secs = other.heartbeat_interval_secs;
        }
        if other.pong_grace_secs != 0 {
            self.pong_grace_secs = other.pong_grace_secs;
        }
        if other.teardown_delay_ms != 0 {
            self.teardown_delay_ms = other.teardown_delay_ms;
        }
        if other.early_report_ms != 0 {
            self.early_report_ms = other.early_report_ms;
        }
        if other.final_report_ms != 0 {
            self.final_report_ms = other.final_report_ms;
        }
        if other.reconnect_delay_secs != 0 {
            self.reconnect_delay_secs = other.reconnect_delay_secs;
        }
    }

    /// Settings for the sync channel.
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            url: self.url.clone(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            pong_grace: Duration::from_secs(self.pong_grace_secs),
            teardown_delay: Duration::from_millis(self.teardown_delay_ms),
            early_report: Duration::from_millis(self.early_report_ms),
            final_report: Duration::from_millis(self.final_report_ms),
        }
    }

    /// Delay before reconnecting.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// App identification configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppsConfig {
    /// JSON app-id manifest loaded at filter start-up.
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,
}

impl AppsConfig {
    fn merge(&mut self, other: AppsConfig) {
        if other.manifest_path.is_some() {
            self.manifest_path = other.manifest_path;
        }
    }
}
