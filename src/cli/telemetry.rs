use anyhow::Result;
use std::env::var;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

pub const LOG_FORMAT_ENV: &str = "AUTH_OFFLOAD_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn from_env() -> Self {
        match var(LOG_FORMAT_ENV) {
            Ok(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

fn filter(verbosity_level: Option<Level>) -> Result<EnvFilter> {
    let verbosity_level = verbosity_level.unwrap_or(Level::ERROR);
    // RUST_LOG=
    Ok(EnvFilter::builder()
        .with_default_directive(verbosity_level.into())
        .from_env_lossy()
        .add_directive("tokio=error".parse()?)
        .add_directive("mio=error".parse()?))
}

/// Initialize logging to stderr, which the parent collects.
///
/// `AUTH_OFFLOAD_LOG_FORMAT=json` switches to one JSON object per line.
///
/// # Errors
///
/// Returns an error if the filter directives are invalid or a global
/// subscriber is already set
pub fn init(verbosity_level: Option<Level>) -> Result<()> {
    let filter = filter(verbosity_level)?;

    match LogFormat::from_env() {
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_target(false)
                .with_writer(std::io::stderr);
            let subscriber = Registry::default().with(fmt_layer).with(filter);
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Text => {
            let fmt_layer = fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .with_thread_ids(false)
                .with_target(false)
                .with_writer(std::io::stderr);
            let subscriber = Registry::default().with(fmt_layer).with(filter);
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_env() {
        temp_env::with_var(LOG_FORMAT_ENV, Some("JSON"), || {
            assert_eq!(LogFormat::from_env(), LogFormat::Json);
        });
        temp_env::with_var(LOG_FORMAT_ENV, Some("pretty"), || {
            assert_eq!(LogFormat::from_env(), LogFormat::Text);
        });
        temp_env::with_var_unset(LOG_FORMAT_ENV, || {
            assert_eq!(LogFormat::from_env(), LogFormat::Text);
        });
    }

    #[test]
    fn test_filter_builds() {
        temp_env::with_var_unset("RUST_LOG", || {
            assert!(filter(None).is_ok());
            assert!(filter(Some(Level::TRACE)).is_ok());
        });
    }
}
