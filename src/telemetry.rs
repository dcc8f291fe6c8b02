//! Tracing subscriber setup for the binary.
//!
//! Logs go to stderr so that `--json` output on stdout stays parseable.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "VALIDAG_LOG";

/// Default directive: `debug` when requested, `info` otherwise.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "validag=debug"
    } else {
        "validag=info"
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .without_time(),
        )
        .try_init();
}
