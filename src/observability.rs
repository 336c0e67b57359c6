//! Log subscriber setup.
//!
//! Everything logs through `tracing`; only the binary (and tests that want
//! output) install a subscriber. Logs go to stderr so `status` and `build`
//! can print JSON on stdout.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable selecting the log format.
pub const LOG_FORMAT_ENV: &str = "WARDEN_LOG_FORMAT";

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

static TRACING_INIT: OnceLock<LogFormat> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    /// One JSON object per line, for log shippers.
    Json,
}

impl LogFormat {
    /// Parse a format name; anything unrecognized falls back to compact.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Compact
        }
    }

    pub fn from_env() -> Self {
        std::env::var(LOG_FORMAT_ENV)
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }
}

/// Install the subscriber using the format from the environment.
pub fn init_tracing() -> LogFormat {
    init_tracing_with(LogFormat::from_env())
}

/// Install the subscriber once per process; later calls keep the first
/// format and return it.
pub fn init_tracing_with(format: LogFormat) -> LogFormat {
    *TRACING_INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let registry = tracing_subscriber::registry().with(filter);
        let installed = match format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init(),
            LogFormat::Compact => registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .try_init(),
        };
        // a test harness may already own the global subscriber
        if let Err(err) = installed {
            eprintln!("tracing init skipped: {err}");
        }
        format
    })
}
