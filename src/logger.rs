// apiflow — Structured logging via tracing
//
// Logs always go to stderr: stdout carries step progress and `run --json`
// output, which must stay machine-readable.

use std::io::IsTerminal;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable that overrides every other log setting.
pub const LOG_ENV: &str = "APIFLOW_LOG";

/// Filter directives for a `-v` count when `APIFLOW_LOG` is unset.
///
/// HTTP client internals stay at `warn` until `-vvv`, otherwise every
/// request would drown the step log in connection chatter.
pub fn default_directives(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn,apiflow=info",
        1 => "warn,apiflow=debug",
        2 => "info,apiflow=trace,hyper=warn,reqwest=warn",
        _ => "trace",
    }
}

/// Initialize the global tracing subscriber for the CLI.
///
/// Examples:
///   APIFLOW_LOG=debug
///   APIFLOW_LOG=apiflow::workflow::engine=trace,warn
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbosity)));

    fmt()
        .with_env_filter(filter)
        .with_target(verbosity > 0)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(verbosity > 1)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Initialize logger for tests (does not panic if called multiple times).
#[cfg(test)]
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("apiflow=debug"))
        .with_test_writer()
        .try_init();
}
