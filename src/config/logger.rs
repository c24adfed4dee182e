//! Logging configuration.
//!
//! ```toml
//! [logger]
//! level = "info"
//! timestamp_format = "rfc3339"      # or "unix", or { custom = "[hour]:[minute]:[second]" }
//!
//! [logger.console]
//! enabled = true
//! format = "compact"                # compact | pretty | json
//!
//! [logger.journald]
//! enabled = false
//! identifier = "lbros"
//! ```

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Console output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Timestamp representation in console log lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    #[default]
    Rfc3339,
    /// Seconds since the epoch with millisecond precision.
    Unix,
    /// A `time` format description, e.g. `[hour]:[minute]:[second]`.
    Custom(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// trace, debug, info, warn or error. `RUST_LOG` takes precedence.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    #[validate(nested)]
    pub journald: Option<JournaldConfig>,

    #[validate(custom(function = "validate_timestamp_format"))]
    pub timestamp_format: TimestampFormat,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            console: Some(ConsoleConfig::default()),
            journald: Some(JournaldConfig::default()),
            timestamp_format: TimestampFormat::default(),
        }
    }
}

fn validate_timestamp_format(format: &TimestampFormat) -> Result<(), ValidationError> {
    let TimestampFormat::Custom(description) = format else {
        return Ok(());
    };
    if description.is_empty() {
        return Err(ValidationError::new("invalid_timestamp_format")
            .with_message("Custom timestamp format cannot be empty".into()));
    }
    time::format_description::parse_owned::<1>(description).map_err(|e| {
        ValidationError::new("invalid_timestamp_format")
            .with_message(format!("Invalid timestamp format: {e}").into())
    })?;
    Ok(())
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level")
            .with_message(format!("Invalid log level: {level}").into())),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub format: LogFormat,
    /// Include the module path of each event.
    pub show_target: bool,
    pub show_thread_ids: bool,
    /// Log span close events with their timings.
    pub show_spans: bool,
    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

/// systemd journald output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JournaldConfig {
    pub enabled: bool,

    /// SYSLOG_IDENTIFIER of journal entries.
    #[validate(length(min = 1, message = "Journald identifier must not be empty"))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: "lbros".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(LoggerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_level() {
        let config = LoggerConfig {
            level: "verbose".into(),
            ..LoggerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_custom_timestamp_must_parse() {
        let mut config = LoggerConfig {
            timestamp_format: TimestampFormat::Custom("[hour]:[minute]".into()),
            ..LoggerConfig::default()
        };
        assert!(config.validate().is_ok());

        config.timestamp_format = TimestampFormat::Custom("[hour".into());
        assert!(config.validate().is_err());

        config.timestamp_format = TimestampFormat::Custom(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_lowercase_names() {
        let config: LoggerConfig = toml::from_str(
            r#"
            timestamp_format = "unix"

            [console]
            format = "pretty"
            "#,
        )
        .unwrap();
        assert_eq!(config.timestamp_format, TimestampFormat::Unix);
        assert_eq!(config.console.unwrap().format, LogFormat::Pretty);
        assert_eq!(config.journald.unwrap().identifier, "lbros");
    }
}
