//! Resolver configuration using Figment.
//!
//! Configuration is loaded from (in order of precedence, highest first):
//! 1. Environment variables prefixed with `INSTRUMENT_MODEL_`
//! 2. A TOML file (default: `instrument_model.toml`)
//! 3. Built-in defaults
//!
//! ```text
//! # instrument_model.toml
//! role_policy = "unique"
//! root_classes = ["Microscope"]
//! parallel = false
//! log_level = "info"
//! ```
//!
//! ```text
//! INSTRUMENT_MODEL_ROLE_POLICY=shared
//! INSTRUMENT_MODEL_LOG_LEVEL=debug
//! ```

use crate::store::DEFAULT_ROOT_CLASS;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "instrument_model.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "INSTRUMENT_MODEL_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Whether two components may share a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RolePolicy {
    /// Each role names exactly one component.
    #[default]
    Unique,
    /// Several components may share a role; lookups return all of them.
    Shared,
}

/// Settings for one resolution run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub role_policy: RolePolicy,
    /// Classes whose components must declare a role.
    #[serde(default = "default_root_classes")]
    pub root_classes: Vec<String>,
    /// Create the components of each topological layer concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_root_classes() -> Vec<String> {
    vec![DEFAULT_ROOT_CLASS.to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            role_policy: RolePolicy::default(),
            root_classes: default_root_classes(),
            parallel: false,
            log_level: default_log_level(),
        }
    }
}

impl ResolverConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific TOML file and the environment.
    ///
    /// A missing file is not an error; defaults and environment variables
    /// still apply. After loading, configuration is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(ResolverConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| ConfigError::LoadError(Box::new(e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Root class names are not empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.root_classes.iter().any(|class| class.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "root_classes cannot contain an empty class name".to_string(),
            ));
        }

        Ok(())
    }
}
