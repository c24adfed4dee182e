//! Application configuration loading and validation.
//!
//! The top-level [`Config`] combines the logger settings with the messaging
//! client configuration (`[zmq]`, `[network]`, `[bridge]`, `[[patterns]]`
//! and `[[publish_topics]]` tables under `[client]`). It is read once at
//! startup from a TOML file; runtime changes go through the client's
//! parameter store instead.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::logger::LoggerConfig;

pub mod logger;

/// Environment variable that overrides the configuration path.
pub const CONFIG_ENV: &str = "LBROS_CONFIG";

/// Configuration path used when [`CONFIG_ENV`] is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/lbros/config.toml";

/// Timestamp prefix of the pre-logger print macros.
#[doc(hidden)]
pub fn __timestamp() -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    time::OffsetDateTime::now_utc()
        .format(format)
        .unwrap_or_else(|_| String::from("-"))
}

/// Timestamped console output for messages emitted before the tracing
/// subscriber is installed (configuration loading, logger failures).
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::__timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::__timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::__timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors raised while locating, reading, parsing or validating the
/// configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No configuration file could be located.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// The file is not valid TOML or does not match the expected layout.
    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    /// A value is outside its allowed range.
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Logging subsystem configuration.
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Messaging client configuration.
    #[validate(nested)]
    pub client: lbros_zmq::Config,
}

impl Config {
    /// Locates and loads the configuration file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be found, read, parsed or
    /// validated.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::config_path()?;
        Self::load(&config_path)
    }

    /// Determines the configuration file path.
    ///
    /// Priority:
    /// 1. `LBROS_CONFIG` environment variable
    /// 2. `/etc/lbros/config.toml`
    fn config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found. Set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH}"
        )))
    }

    /// Loads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let config = Self::parse(&fs::read_to_string(path)?)?;
        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn parse(document: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(document).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
