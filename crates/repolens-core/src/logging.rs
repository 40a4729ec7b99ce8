//! Tracing subscriber setup for binaries and tests embedding the engine.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global fmt subscriber. `RUST_LOG` overrides the default
/// filter. Calling this again after a subscriber is installed is a no-op,
/// so test harnesses can call it freely. Returns whether this call
/// installed the subscriber.
pub fn init_logging(verbose: bool) -> bool {
    let default_filter = if verbose {
        "repolens_core=debug,info"
    } else {
        "repolens_core=warn,error"
    };
    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    } else {
        EnvFilter::new(default_filter)
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(verbose)
        .with_line_number(verbose);

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(verbose, "repolens logging initialized");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        init_logging(false);
        assert!(!init_logging(true));
    }
}
