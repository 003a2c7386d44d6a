//! Logging initialization shared by the drain controller binary.
//!
//! Events are emitted with `tracing`; this module installs the global subscriber. The verbosity defaults
//! to INFO (DEBUG when the controller is started with `--debug`) and can be overridden entirely with an
//! `EnvFilter` directive from the environment.
use serde::Deserialize;
use snafu::ResultExt;
use std::env;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, EnvFilter, Registry};

const TRACING_FILTER_DIRECTIVE_ENV_VAR: &str = "TRACING_FILTER_DIRECTIVE";
const LOGGING_FORMATTER_ENV_VAR: &str = "LOGGING_FORMATTER";
const LOGGING_ANSI_ENABLED_ENV_VAR: &str = "LOGGING_ANSI_ENABLED";

/// The formatter for logging tracing events.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct LogFormatter {
    message_format: MessageFormat,
    ansi_enabled: bool,
}

impl LogFormatter {
    pub fn try_from_env() -> Result<Self> {
        Ok(Self {
            message_format: MessageFormat::try_from_env()?,
            ansi_enabled: ansi_enabled_from_env()?,
        })
    }

    /// Stacks the formatting layer on top of `subscriber`.
    fn layer_onto<S>(&self, subscriber: S) -> Box<dyn Subscriber + Send + Sync>
    where
        S: SubscriberExt + Send + Sync + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        // Each formatter is its own layer type, so the subscriber is boxed per arm.
        let ansi = self.ansi_enabled;
        match self.message_format {
            MessageFormat::Full => Box::new(subscriber.with(fmt::layer().with_ansi(ansi))),
            MessageFormat::Compact => {
                Box::new(subscriber.with(fmt::layer().compact().with_ansi(ansi)))
            }
            MessageFormat::Pretty => Box::new(subscriber.with(fmt::layer().pretty().with_ansi(ansi))),
            MessageFormat::Json => Box::new(subscriber.with(fmt::layer().json().with_ansi(ansi))),
        }
    }
}

fn ansi_enabled_from_env() -> Result<bool> {
    match env::var(LOGGING_ANSI_ENABLED_ENV_VAR) {
        Ok(value) => value
            .to_lowercase()
            .parse()
            .context(error::LogAnsiEnvSnafu { env_value: value }),
        Err(_) => Ok(false),
    }
}

/// The message format for logging tracing events.
///
/// See https://docs.rs/tracing-subscriber/latest/tracing_subscriber/fmt/format/index.html
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Human-readable, single-line logs for each event.
    Full,
    /// A variant of the default formatter optimized for short line lengths.
    Compact,
    /// Pretty-formatted multi-line logs optimized for human readability.
    Pretty,
    /// Newline-delimited JSON logs, the format expected by most log shippers.
    #[default]
    Json,
}

impl MessageFormat {
    pub fn try_from_env() -> Result<Self> {
        match env::var(LOGGING_FORMATTER_ENV_VAR) {
            Ok(formatter) => {
                serde_plain::from_str(&formatter).context(error::LogFormatterEnvSnafu {
                    env_value: formatter.clone(),
                })
            }
            Err(_) => Ok(Default::default()),
        }
    }
}

/// The level used when `TRACING_FILTER_DIRECTIVE` is not set.
pub fn default_level(debug: bool) -> LevelFilter {
    if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

/// Installs the global tracing subscriber.
pub fn init_telemetry(debug: bool) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level(debug).into())
        .with_env_var(TRACING_FILTER_DIRECTIVE_ENV_VAR)
        .from_env_lossy();

    let subscriber = Registry::default().with(env_filter);
    let subscriber = LogFormatter::try_from_env()?.layer_onto(subscriber);

    tracing::subscriber::set_global_default(subscriber)
        .context(error::TracingConfigurationSnafu)?;

    Ok(())
}

pub mod error {
    use std::str::ParseBoolError;

    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum TelemetryConfigError {
        #[snafu(display("Error configuring tracing: '{}'", source))]
        TracingConfiguration {
            source: tracing::subscriber::SetGlobalDefaultError,
        },

        #[snafu(display(
            "Could not parse formatter from environment variable '{}={}': '{}'",
            LOGGING_FORMATTER_ENV_VAR,
            env_value,
            source
        ))]
        LogFormatterEnv {
            source: serde_plain::Error,
            env_value: String,
        },

        #[snafu(display(
            "Could not parse ANSI enablement from environment variable '{}={}': '{}'",
            LOGGING_ANSI_ENABLED_ENV_VAR,
            env_value,
            source
        ))]
        LogAnsiEnv {
            source: ParseBoolError,
            env_value: String,
        },
    }
}

type Result<T> = std::result::Result<T, TelemetryConfigError>;
pub use error::TelemetryConfigError;
