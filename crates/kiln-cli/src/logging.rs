//! Logging setup for `kiln` using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `KILN_LOG` environment variable, in `EnvFilter` directive syntax
//!    (e.g. "info" or "warn,kiln_core::index=debug")
//! 3. `log_level` from the config file
//! 4. default to `info`
//!
//! Logs go to STDERR so that stdout stays free for build output.

use anyhow::{anyhow, bail, Result};
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "KILN_LOG";

/// Initialise the global logging subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<&str>, config_level: Option<&str>) -> Result<()> {
    let env_filter = std::env::var(LOG_ENV).ok();
    let directive = resolve_filter(cli_level, env_filter.as_deref(), config_level)?;
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| anyhow!("invalid log filter '{}': {}", directive, e))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to install logger: {}", e))
}

/// An explicit flag must be valid; the softer sources fall through when
/// they hold garbage.
pub fn resolve_filter(
    cli_level: Option<&str>,
    env_filter: Option<&str>,
    config_level: Option<&str>,
) -> Result<String> {
    if let Some(raw) = cli_level {
        return match parse_level_str(raw) {
            Some(level) => Ok(level.to_string()),
            None => bail!("unknown log level '{}'", raw),
        };
    }

    if let Some(raw) = env_filter.filter(|raw| EnvFilter::try_new(raw).is_ok()) {
        return Ok(raw.to_string());
    }

    Ok(config_level
        .and_then(parse_level_str)
        .unwrap_or("info")
        .to_string())
}

fn parse_level_str(s: &str) -> Option<&'static str> {
    match s.trim().to_lowercase().as_str() {
        "error" | "fatal" => Some("error"),
        "warn" | "warning" => Some("warn"),
        "info" => Some("info"),
        "debug" | "verbose" => Some("debug"),
        "trace" => Some("trace"),
        _ => None,
    }
}
