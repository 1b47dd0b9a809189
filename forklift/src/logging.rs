//! Operator-facing diagnostics.
//!
//! Log lines go to stderr only and are meant for whoever is watching the run.
//! What a run leaves behind for later inspection lives on disk instead:
//! `metadata.json`, `harness-state/sandbox.log` and any `STUCK.md`. Those are
//! written at every log level, so turning logging down never loses evidence.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
fn default_directive(debug: bool) -> &'static str {
    if debug { "forklift=debug" } else { "forklift=info" }
}

/// Install the global subscriber: compact lines on stderr.
///
/// `RUST_LOG` takes precedence, e.g. `RUST_LOG=forklift::io::git=trace`.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_raises_the_default_level() {
        assert_eq!(default_directive(false), "forklift=info");
        assert_eq!(default_directive(true), "forklift=debug");
    }
}
