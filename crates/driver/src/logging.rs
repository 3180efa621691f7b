//! Logging setup for the simulator.
//!
//! Set `TOKSTEP_LOG_FORMAT=json` for JSON logs, `RUST_LOG` to control levels
//! (default: info). Logs go to stderr; stdout carries the run summary.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

pub const LOG_FORMAT_ENV: &str = "TOKSTEP_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable logs (default).
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var(LOG_FORMAT_ENV)
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Install the global subscriber. `level` is used when `RUST_LOG` is unset.
pub fn init(level: Option<&str>, format: LogFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("logging subscriber init failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_env() {
        std::env::remove_var(LOG_FORMAT_ENV);
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);

        std::env::set_var(LOG_FORMAT_ENV, "json");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);

        // Case insensitive
        std::env::set_var(LOG_FORMAT_ENV, "JSON");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);

        std::env::set_var(LOG_FORMAT_ENV, "yaml");
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);

        std::env::remove_var(LOG_FORMAT_ENV);
    }
}
