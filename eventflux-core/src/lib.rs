//! Core building blocks for eventflux.
//!
//! This crate provides:
//! - The descriptor algebra used to address stored data (`descriptor`).
//! - Event metadata and payload types (`metadata`).
//! - Pluggable validation, routing and encoding policies (`policy`).
//! - Completion futures and worker pools shared by producers and consumers.
//! - Global configuration loading and access (`load_config`, `CONF`).
//! - Logging setup and application startup (`initialize`).
pub mod config;
pub mod descriptor;
pub mod error;
pub mod future;
pub mod logs;
pub mod metadata;
pub mod policy;
pub mod pool;

use std::sync::OnceLock;

use tracing::{info, warn};

use crate::{
    config::Config,
    error::{FluxError, Result},
    logs::init_logging,
};

/// Global, singleton configuration instance.
///
/// Initialized by `load_config` or `initialize` and reused thereafter.
pub static CONF: OnceLock<Config> = OnceLock::new();

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "EVENTFLUX_CONFIG";

/// Configuration file looked up when `EVENTFLUX_CONFIG` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "eventflux.toml";

/// Load or retrieve the global configuration.
///
/// Reads the file named by `EVENTFLUX_CONFIG`, or `eventflux.toml` in the
/// working directory, and parses it via `toml`. The first successful load
/// wins; later calls return the stored configuration.
///
/// # Errors
/// Returns `FluxError::Config` if the file cannot be read or parsed, or if
/// its `name` is not `eventflux`.
pub fn load_config() -> Result<&'static Config> {
    if let Some(conf) = CONF.get() {
        return Ok(conf);
    }
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
    let config = Config::from_file(&path)?;
    if config.name != "eventflux" {
        return Err(FluxError::Config(format!(
            "{path}: expected name \"eventflux\", found {:?}",
            config.name
        )));
    }
    Ok(CONF.get_or_init(|| config))
}

/// The global configuration, or defaults when none has been loaded.
pub fn config() -> &'static Config {
    CONF.get_or_init(Config::default)
}

/// Perform global initialization of eventflux.
///
/// - Loads configuration, falling back to defaults when no file is found.
/// - Sets up logging at the configured level.
pub fn initialize() -> &'static Config {
    let loaded = load_config();
    let conf: &'static Config = match &loaded {
        Ok(conf) => *conf,
        Err(_) => config(),
    };
    init_logging(&conf.logging.level);
    if let Err(e) = loaded {
        warn!("using default configuration: {e}");
    }
    info!(
        "eventflux initialized (producer batch_size={}, ordering={:?}, threads={})",
        conf.producer.batch_size, conf.producer.ordering, conf.producer.thread_count
    );
    conf
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn initialize_always_yields_a_config() {
        let conf = initialize();
        assert_eq!(conf.name, "eventflux");
        assert!(std::ptr::eq(conf, config()));
    }
}
