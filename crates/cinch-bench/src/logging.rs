//! Diagnostic logging for the `cinch-bench` binary.
//!
//! Run artifacts under the output directory are the product record and are
//! written regardless of the log filter. This module only controls what
//! reaches stderr.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "warn,cinch_bench=debug"
    } else {
        "warn,cinch_bench=info"
    }
}

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; falls back to `info` for this crate (`debug` with
/// `verbose`) and `warn` for dependencies. Output: stderr, compact format.
///
/// ```bash
/// RUST_LOG=cinch_bench::api=trace cinch-bench run --tasks tasks.json
/// ```
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_crate_level() {
        assert!(default_filter(true).contains("cinch_bench=debug"));
        assert!(default_filter(false).contains("cinch_bench=info"));
    }
}
