//! Logging setup.
//!
//! All log output goes to stderr; stdout is reserved for command output.
//! `IDSWAP_LOG` takes an `EnvFilter` directive and overrides `-v`.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "IDSWAP_LOG";

/// Default filter for a given number of `-v` flags.
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "idswap=warn",
        1 => "idswap=info",
        2 => "idswap=debug",
        _ => "trace",
    }
}

pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    // a second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
