//! Configuration management with layered loading
//!
//! Precedence (lowest to highest):
//! 1. Compiled defaults
//! 2. Global config: `$XDG_CONFIG_HOME/vrf-ipam/vrf-ipam.toml`
//! 3. Local config: explicit file passed to [`Settings::load`]
//! 4. Environment variables: `IPAM_*` prefix, `__` for nesting

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::application::ApplicationError;
use crate::domain::validate_identifier;

/// Routing domain created at bootstrap and flagged as default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DefaultDomainConfig {
    pub id: String,
    pub description: String,
}

impl Default for DefaultDomainConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            description: "Default routing domain".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawDefaultDomainConfig {
    pub id: Option<String>,
    pub description: Option<String>,
}

/// Raw settings for intermediate parsing (`None` means "not specified, inherit").
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawSettings {
    pub default_domain: RawDefaultDomainConfig,
    pub lock_timeout_ms: Option<u64>,
    pub isolated_domain_prefix: Option<String>,
    pub ingest_threads: Option<usize>,
    pub tree_cancel_check_interval: Option<usize>,
}

/// Unified configuration for the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub default_domain: DefaultDomainConfig,
    /// How long a writer waits for a domain lock before reporting contention
    pub lock_timeout_ms: u64,
    /// Isolated per-resource domains are named `<prefix><resource_id>`
    pub isolated_domain_prefix: String,
    /// Worker threads for batch ingestion (0: one per CPU)
    pub ingest_threads: usize,
    /// Tree builds poll their cancel token once per this many nodes
    pub tree_cancel_check_interval: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_domain: DefaultDomainConfig::default(),
            lock_timeout_ms: 2_000,
            isolated_domain_prefix: "isolated-".into(),
            ingest_threads: 0,
            tree_cancel_check_interval: crate::domain::builder::DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// Get the XDG config directory.
pub fn global_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "vrf-ipam").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the global config file.
pub fn global_config_path() -> Option<PathBuf> {
    global_config_dir().map(|dir| dir.join("vrf-ipam.toml"))
}

/// Load a TOML file into RawSettings for manual merging.
fn load_raw_settings(path: &Path) -> Result<RawSettings, ApplicationError> {
    let content = std::fs::read_to_string(path).map_err(|e| ApplicationError::Config {
        message: format!("read {}: {}", path.display(), e),
    })?;
    toml::from_str(&content).map_err(|e| ApplicationError::Config {
        message: format!("parse {}: {}", path.display(), e),
    })
}

impl Settings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Id of the isolated domain holding non-routable subnets of `resource_id`.
    pub fn isolated_domain_id(&self, resource_id: &str) -> String {
        format!("{}{}", self.isolated_domain_prefix, resource_id)
    }

    /// Overlay wins where it specifies a value.
    fn merge_with(&self, overlay: &RawSettings) -> Self {
        Self {
            default_domain: DefaultDomainConfig {
                id: overlay
                    .default_domain
                    .id
                    .clone()
                    .unwrap_or_else(|| self.default_domain.id.clone()),
                description: overlay
                    .default_domain
                    .description
                    .clone()
                    .unwrap_or_else(|| self.default_domain.description.clone()),
            },
            lock_timeout_ms: overlay.lock_timeout_ms.unwrap_or(self.lock_timeout_ms),
            isolated_domain_prefix: overlay
                .isolated_domain_prefix
                .clone()
                .unwrap_or_else(|| self.isolated_domain_prefix.clone()),
            ingest_threads: overlay.ingest_threads.unwrap_or(self.ingest_threads),
            tree_cancel_check_interval: overlay
                .tree_cancel_check_interval
                .unwrap_or(self.tree_cancel_check_interval),
        }
    }

    /// Load settings with layered precedence.
    ///
    /// # Arguments
    /// * `local` - Optional explicit config file, applied on top of the global one
    pub fn load(local: Option<&Path>) -> Result<Self, ApplicationError> {
        // 1. Start with defaults
        let mut current = Self::default();

        // 2. Global config
        if let Some(global_path) = global_config_path() {
            if global_path.exists() {
                debug!(path = %global_path.display(), "loading global config");
                let raw = load_raw_settings(&global_path)?;
                current = current.merge_with(&raw);
            }
        }

        // 3. Explicit local file must exist when given
        if let Some(path) = local {
            debug!(path = %path.display(), "loading local config");
            let raw = load_raw_settings(path)?;
            current = current.merge_with(&raw);
        }

        // 4. Environment variables
        current = Self::apply_env_overrides(current)?;

        current.validate()?;
        Ok(current)
    }

    /// Apply IPAM_* environment variables as explicit overrides.
    fn apply_env_overrides(settings: Self) -> Result<Self, ApplicationError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("IPAM")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(config_err)?;

        let raw = RawSettings {
            default_domain: RawDefaultDomainConfig {
                id: config.get_string("default_domain.id").ok(),
                description: config.get_string("default_domain.description").ok(),
            },
            lock_timeout_ms: parse_opt(&config, "lock_timeout_ms")?,
            isolated_domain_prefix: config.get_string("isolated_domain_prefix").ok(),
            ingest_threads: parse_opt(&config, "ingest_threads")?,
            tree_cancel_check_interval: parse_opt(&config, "tree_cancel_check_interval")?,
        };
        Ok(settings.merge_with(&raw))
    }

    /// Reject settings the store cannot run with.
    pub fn validate(&self) -> Result<(), ApplicationError> {
        validate_identifier(&self.default_domain.id).map_err(|e| ApplicationError::Config {
            message: format!("default_domain.id: {e}"),
        })?;
        if !self.isolated_domain_prefix.is_empty() {
            validate_identifier(&self.isolated_domain_prefix).map_err(|e| {
                ApplicationError::Config {
                    message: format!("isolated_domain_prefix: {e}"),
                }
            })?;
        }
        if self.tree_cancel_check_interval == 0 {
            return Err(ApplicationError::Config {
                message: "tree_cancel_check_interval must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Show the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ApplicationError> {
        toml::to_string_pretty(self).map_err(|e| ApplicationError::Config {
            message: format!("serialize config: {e}"),
        })
    }

    /// Generate a template config file.
    pub fn template() -> String {
        r#"# vrf-ipam configuration
#
# Locations (by precedence, lowest to highest):
#   Global: ~/.config/vrf-ipam/vrf-ipam.toml
#   Local:  file passed explicitly by the embedding host
#   Env:    IPAM_* environment variables (IPAM_DEFAULT_DOMAIN__ID for nested keys)

# Milliseconds a writer waits for a routing domain lock before giving up
# lock_timeout_ms = 2000

# Non-routable external subnets live in "<prefix><resource_id>"
# isolated_domain_prefix = "isolated-"

# Batch ingestion worker threads (0 = one per CPU)
# ingest_threads = 0

# Tree materialization checks for cancellation every N nodes
# tree_cancel_check_interval = 1024

[default_domain]
# id = "default"
# description = "Default routing domain"
"#
        .to_string()
    }
}

fn parse_opt<T: std::str::FromStr>(config: &Config, key: &str) -> Result<Option<T>, ApplicationError>
where
    T::Err: std::fmt::Display,
{
    match config.get_string(key) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ApplicationError::Config {
                message: format!("{key}={val}: {e}"),
            }),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(config_err(e)),
    }
}

fn config_err(e: ConfigError) -> ApplicationError {
    ApplicationError::Config {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_defaults_when_validating_then_ok() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.lock_timeout(), Duration::from_secs(2));
        assert_eq!(settings.isolated_domain_id("vpc-1"), "isolated-vpc-1");
    }

    #[test]
    fn given_partial_overlay_when_merging_then_unspecified_fields_inherit() {
        let base = Settings::default();
        let overlay = RawSettings {
            default_domain: RawDefaultDomainConfig {
                id: Some("prod".into()),
                description: None,
            },
            lock_timeout_ms: Some(50),
            ..Default::default()
        };

        let merged = base.merge_with(&overlay);

        assert_eq!(merged.default_domain.id, "prod");
        assert_eq!(merged.default_domain.description, base.default_domain.description);
        assert_eq!(merged.lock_timeout_ms, 50);
        assert_eq!(merged.isolated_domain_prefix, base.isolated_domain_prefix);
    }

    #[test]
    fn given_bad_default_domain_id_when_validating_then_config_error() {
        let mut settings = Settings::default();
        settings.default_domain.id = "has space".into();
        assert!(matches!(settings.validate(), Err(ApplicationError::Config { .. })));
    }

    #[test]
    fn given_zero_check_interval_when_validating_then_config_error() {
        let settings = Settings {
            tree_cancel_check_interval: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn given_template_when_parsing_then_yields_defaults() {
        let raw: RawSettings = toml::from_str(&Settings::template()).expect("template parses");
        assert_eq!(Settings::default().merge_with(&raw), Settings::default());
    }
}
