//! Tracing setup for the `tierflow` binary.
//!
//! The filter comes from `TIERFLOW_LOG` when set. Otherwise the level is
//! `info`, or `debug` with `--debug` or `TIERFLOW_DEBUG=1`. Logs go to
//! stderr so stdout stays machine-readable.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "TIERFLOW_LOG";
pub const DEBUG_ENV: &str = "TIERFLOW_DEBUG";

fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Filter directive used when `TIERFLOW_LOG` is unset.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "tierflow=debug"
    } else {
        "tierflow=info"
    }
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(debug: bool) {
    let debug = debug || debug_from_env();
    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive(debug)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}
