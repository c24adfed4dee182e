//! Logging initialization.
//!
//! `LoggerManager` validates the `[logger]` section and installs the global
//! `tracing` subscriber with a console layer, a journald layer or both. The
//! messaging client logs through `tracing` only, so everything it emits
//! (socket lifecycle, loop events, message bodies at debug/trace) ends up in
//! whichever outputs are configured here.

use std::{fmt as stdfmt, io};

use thiserror::Error;
use time::{
    format_description::{well_known::Rfc3339, OwnedFormatItem},
    OffsetDateTime,
};
use tracing::instrument;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter, Layer, Registry,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, JournaldConfig, LogFormat, LoggerConfig, TimestampFormat},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// The journald socket could not be opened.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,
}

/// Console timestamps rendered according to [`TimestampFormat`].
#[derive(Clone)]
enum Timestamp {
    Rfc3339,
    Unix,
    Custom(OwnedFormatItem),
}

impl Timestamp {
    fn from_config(format: &TimestampFormat) -> Result<Self, LoggerError> {
        Ok(match format {
            TimestampFormat::Rfc3339 => Timestamp::Rfc3339,
            TimestampFormat::Unix => Timestamp::Unix,
            TimestampFormat::Custom(description) => Timestamp::Custom(
                time::format_description::parse_owned::<1>(description)
                    .map_err(|e| LoggerError::InitializationError(e.to_string()))?,
            ),
        })
    }

    fn render(&self, now: OffsetDateTime) -> Option<String> {
        match self {
            Timestamp::Rfc3339 => now.format(&Rfc3339).ok(),
            Timestamp::Unix => {
                let millis = now.unix_timestamp_nanos() / 1_000_000;
                Some(format!("{}.{:03}", millis / 1000, millis % 1000))
            }
            Timestamp::Custom(items) => now.format(items).ok(),
        }
    }
}

impl FormatTime for Timestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> stdfmt::Result {
        let rendered = self
            .render(OffsetDateTime::now_utc())
            .ok_or(stdfmt::Error)?;
        write!(w, "{rendered}")
    }
}

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// Validates `config` without touching the global subscriber.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;

        Ok(LoggerManager { config })
    }

    /// Installs the global subscriber. Call once, before the client is
    /// created.
    ///
    /// A journald failure is reported and skipped as long as another layer
    /// remains.
    ///
    /// # Errors
    ///
    /// Returns [`LoggerError::NoLayersConfigured`] when no output could be
    /// initialized.
    #[instrument(skip(self))]
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let layers = self.build_layers()?;
        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    fn build_layers(&self) -> Result<Vec<BoxedLayer>, LoggerError> {
        let mut layers = Vec::new();

        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            let timer = Timestamp::from_config(&self.config.timestamp_format)?;
            layers.push(console_layer(console, timer, self.filter()));
        }

        if let Some(journald) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match journald_layer(journald, self.filter()) {
                Ok(layer) => {
                    layers.push(layer);
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                }
            }
        }

        Ok(layers)
    }

    /// `RUST_LOG` wins over the configured level.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }
}

fn console_layer(config: &ConsoleConfig, timer: Timestamp, filter: EnvFilter) -> BoxedLayer {
    let span_events = if config.show_spans {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer()
        .with_timer(timer)
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_span_events(span_events)
        .with_ansi(config.ansi_colors)
        .with_writer(io::stdout);

    match config.format {
        LogFormat::Json => base.json().with_filter(filter).boxed(),
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => base.compact().with_filter(filter).boxed(),
    }
}

fn journald_layer(config: &JournaldConfig, filter: EnvFilter) -> Result<BoxedLayer, LoggerError> {
    let layer = tracing_journald::layer()?.with_syslog_identifier(config.identifier.clone());
    Ok(layer.with_filter(filter).boxed())
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn test_new_rejects_invalid_level() {
        let config = LoggerConfig {
            level: "loud".into(),
            ..LoggerConfig::default()
        };
        assert!(matches!(
            LoggerManager::new(config),
            Err(LoggerError::ValidationError(_))
        ));
    }

    #[test]
    fn test_no_enabled_outputs_builds_no_layers() {
        let config = LoggerConfig {
            console: Some(ConsoleConfig {
                enabled: false,
                ..ConsoleConfig::default()
            }),
            journald: None,
            ..LoggerConfig::default()
        };
        let manager = LoggerManager::new(config).unwrap();
        assert!(manager.build_layers().unwrap().is_empty());
    }

    #[test]
    fn test_console_layer_is_built() {
        let config = LoggerConfig {
            journald: None,
            ..LoggerConfig::default()
        };
        let manager = LoggerManager::new(config).unwrap();
        assert_eq!(manager.build_layers().unwrap().len(), 1);
    }

    #[test]
    fn test_journald_enabled_keeps_console_layer() {
        let config = LoggerConfig {
            journald: Some(JournaldConfig {
                enabled: true,
                identifier: "lbros-test".into(),
            }),
            ..LoggerConfig::default()
        };
        let manager = LoggerManager::new(config).unwrap();
        // One or two layers depending on whether a journal socket exists.
        let layers = manager.build_layers().unwrap();
        assert!(!layers.is_empty());
        assert!(layers.len() <= 2);
    }

    #[test]
    fn test_timestamp_rendering() {
        let now = datetime!(2024-03-01 12:30:45 UTC);

        assert_eq!(
            Timestamp::Rfc3339.render(now).as_deref(),
            Some("2024-03-01T12:30:45Z")
        );
        assert_eq!(
            Timestamp::Unix.render(now).as_deref(),
            Some("1709296245.000")
        );

        let custom = Timestamp::from_config(&TimestampFormat::Custom(
            "[hour]:[minute]:[second]".into(),
        ))
        .unwrap();
        assert_eq!(custom.render(now).as_deref(), Some("12:30:45"));
    }
}
