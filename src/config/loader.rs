//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. System config: `/etc/family-filter/config.toml`
//! 3. User config: `~/.config/family-filter/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Lists (exempt_users, own_bundle_ids) are **merged** (appended).
//! Scalars (timeouts, log_level) are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::{ConfigError, ConfigResult};
use super::schema::{AppsConfig, Config, ControlConfig, FilterConfig, GeneralConfig};
use crate::cli::{Cli, Commands};

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/family-filter/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "family-filter";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `--config`
    /// file and invalid TOML anywhere are errors.
    pub fn load(&self, cli: &Cli) -> ConfigResult<Config> {
        let mut config = Config::embedded()?;
        debug!("Loaded embedded default configuration");

        if let Some(system_config) = self.load_file(&self.system_path)? {
            config.merge(system_config);
            debug!("Loaded system config from {:?}", self.system_path);
        } else {
            debug!("No system config found at {:?}", self.system_path);
        }

        if let Some(user_config) = self.load_file(&self.user_path)? {
            config.merge(user_config);
            debug!("Loaded user config from {:?}", self.user_path);
        } else {
            debug!("No user config found at {:?}", self.user_path);
        }

        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        config.merge(Self::cli_overrides(cli));
        config.validate()?;
        Ok(config)
    }

    fn cli_overrides(cli: &Cli) -> Config {
        let manifest_path = match &cli.command {
            Commands::Serve { manifest } => manifest.clone(),
            _ => None,
        };
        if !cli.exempt_users.is_empty() {
            debug!("Added {} exempt users from CLI flags", cli.exempt_users.len());
        }

        Config {
            general: GeneralConfig {
                log_level: cli.verbosity_level().unwrap_or_default().to_string(),
            },
            filter: FilterConfig {
                exempt_users: cli.exempt_users.clone(),
                ..Default::default()
            },
            control: ControlConfig {
                socket_path: cli.socket.clone(),
                ..Default::default()
            },
            apps: AppsConfig { manifest_path },
            ..Default::default()
        }
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> ConfigResult<Option<Config>> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
