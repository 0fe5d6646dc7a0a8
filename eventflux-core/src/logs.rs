use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

#[cfg(feature = "diagnostics")]
pub fn default_log_level() -> &'static str {
    "trace"
}

#[cfg(not(feature = "diagnostics"))]
pub fn default_log_level() -> &'static str {
    "warn"
}

/// Picks the filter directive: `RUST_LOG`, then the configured level,
/// then the build default.
pub fn resolve_filter(configured: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if configured.trim().is_empty() {
        default_log_level()
    } else {
        configured
    };
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(default_log_level()))
}

/// Single initialization function for engine logging.
///
/// Later calls are no-ops, as is the first call when another global
/// subscriber is already installed.
pub fn init_logging(configured: &str) {
    INIT.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(resolve_filter(configured))
            .with_thread_names(true)
            .finish();
        if tracing::subscriber::set_global_default(subscriber).is_ok() {
            tracing::trace!("Logging initialized");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging("debug");
        init_logging("trace");
        tracing::debug!("still alive");
    }

    #[test]
    fn bad_directive_falls_back() {
        // `try_new` rejects malformed directives; the default must be used.
        let filter = resolve_filter("not a [valid directive");
        let _ = filter.to_string();
    }
}
