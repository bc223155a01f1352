//! Hearth daemon support: HTTP providers and component wiring shared by the
//! `hearth-daemon` tick loop and the `hearth` CLI.

pub mod provider;
pub mod runtime;

pub use runtime::{LoggingHandler, Runtime};

use tracing_subscriber::EnvFilter;

/// Install the stderr subscriber. `RUST_LOG` wins over the default `info`.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
