//! Logging setup.
//!
//! The library only emits `tracing` events; installing a subscriber
//! is up to the embedding process. These helpers install the same
//! compact stdout layer the engine uses everywhere else.

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::StateError;
use crate::errors::StateResult;

/// Target all events of this crate are emitted under.
const TARGET: &str = "opstate";

fn get_log_level(level: Option<&str>) -> StateResult<LevelFilter> {
    if let Some(level) = level {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            level => Err(StateError::Logging(format!("Wrong log level: {level}"))),
        }
    } else {
        Ok(LevelFilter::ERROR)
    }
}

/// Log this crate's events at `level` (default `"error"`) to stdout.
pub fn setup_logging(level: Option<&str>) -> StateResult<()> {
    let log_level = get_log_level(level)?;
    let logs = fmt_layer().with_filter(Targets::new().with_target(TARGET, log_level));
    set_global_subscriber(Registry::default().with(logs));
    Ok(())
}

/// Log according to the `RUST_LOG` environment variable.
pub fn setup_logging_from_env() -> StateResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .map_err(|err| StateError::Logging(err.to_string()))?;
    let logs = fmt_layer().with_filter(filter);
    set_global_subscriber(Registry::default().with(logs));
    Ok(())
}

fn fmt_layer<S>() -> tracing_subscriber::fmt::Layer<
    S,
    tracing_subscriber::fmt::format::DefaultFields,
    tracing_subscriber::fmt::format::Format<tracing_subscriber::fmt::format::Compact>,
>
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true)
}

// Utility function used to try to set a global default subscriber,
// logging the error without panicking if it was already set
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if logging was already initialized, which happens
    // when several rules are started in the same process.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_level_parses() {
    assert_eq!(get_log_level(None).ok(), Some(LevelFilter::ERROR));
    assert_eq!(get_log_level(Some("DEBUG")).ok(), Some(LevelFilter::DEBUG));
    assert!(matches!(
        get_log_level(Some("loud")),
        Err(StateError::Logging(_))
    ));
}

#[test]
fn setup_twice_is_not_an_error() {
    assert!(setup_logging(Some("warn")).is_ok());
    assert!(setup_logging(Some("info")).is_ok());
}
