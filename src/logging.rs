//! Tracing subscriber setup for the CLI.
//!
//! Logs go to stderr so `--json` output on stdout stays machine-readable.
//! `RUST_LOG` takes precedence over the level passed on the command line.

use tracing_subscriber::EnvFilter;

pub type LoggingResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Install the global subscriber. Fails if `level` is not a valid filter or
/// a subscriber is already installed.
pub fn init_logging(level: &str) -> LoggingResult {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(init_logging("info=[").is_err());
    }
}
