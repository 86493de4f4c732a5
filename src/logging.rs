// src/logging.rs
//
// Operator logging setup. RUST_LOG wins when set; otherwise the verbosity
// count picks the default filter.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

/// Default filter directive for a `-v` count.
pub fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "walkctl=debug,info",
        _ => "trace",
    }
}

/// Install the global fmt subscriber once; later calls are no-ops.
pub fn init_tracing(verbose: u8) {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init()
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_filters() {
        assert_eq!(default_directive(0), "info");
        assert_eq!(default_directive(1), "walkctl=debug,info");
        assert_eq!(default_directive(5), "trace");
        // Directives must parse.
        for v in 0..3 {
            assert!(EnvFilter::try_new(default_directive(v)).is_ok());
        }
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing(0);
        init_tracing(2);
    }
}
