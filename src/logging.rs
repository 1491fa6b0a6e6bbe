//! Tracing subscriber setup for the `burst-download` binary.
//!
//! `RUST_LOG` always wins. Without it, `-v` raises the crate's level to
//! `debug`, `-vv` to `trace`, and `-q` drops it to `warn`.
//!
//! ```bash
//! RUST_LOG=burst=debug burst-download --url https://host/archive.zip -o out
//! RUST_LOG=burst::zip::processor=trace burst-download ...
//! ```

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter directive for the given verbosity flags.
pub fn default_directive(verbose: u8, quiet: bool) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "burst=warn",
        (false, 0) => "burst=info",
        (false, 1) => "burst=debug",
        (false, _) => "burst=trace",
    }
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(verbose: u8, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, quiet)));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(verbose > 0)
            .with_thread_ids(false)
            .compact(),
    );

    // Ignore the error if a subscriber is already installed (tests).
    let _ = tracing::subscriber::set_global_default(subscriber);
}
