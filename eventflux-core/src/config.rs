use std::{fmt, path::Path, str::FromStr, time::Duration};

use serde::Deserialize;

use crate::error::{FluxError, Result};

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub version: u64,
    pub description: String,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ProducerConfig {
    pub batch_size: BatchSize,
    pub ordering: Ordering,
    pub thread_count: usize,
    pub max_idle_ms: u64,
    pub adaptive_min: usize,
    pub adaptive_max: usize,
    pub adaptive_target_latency_ms: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ConsumerConfig {
    pub batch_size: BatchSize,
    pub thread_count: usize,
    pub check_data: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; empty means the build default.
    pub level: String,
}

/// Batch threshold policy: pinned, or chosen by the adaptive controller.
///
/// Deserializes from `"adaptive"` or a positive integer.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "BatchSizeRepr")]
pub enum BatchSize {
    Adaptive,
    Fixed(usize),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchSizeRepr {
    Count(i64),
    Name(String),
}

impl TryFrom<BatchSizeRepr> for BatchSize {
    type Error = String;

    fn try_from(repr: BatchSizeRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            BatchSizeRepr::Count(n) if n >= 1 => Ok(BatchSize::Fixed(n as usize)),
            BatchSizeRepr::Count(n) => Err(format!("batch_size must be >= 1, got {n}")),
            BatchSizeRepr::Name(s) => s.parse().map_err(|e: FluxError| e.to_string()),
        }
    }
}

impl FromStr for BatchSize {
    type Err = FluxError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("adaptive") {
            return Ok(BatchSize::Adaptive);
        }
        match s.parse::<usize>() {
            Ok(n) if n >= 1 => Ok(BatchSize::Fixed(n)),
            _ => Err(FluxError::Config(format!(
                "batch_size must be \"adaptive\" or a positive integer, got {s:?}"
            ))),
        }
    }
}

impl fmt::Display for BatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchSize::Adaptive => write!(f, "adaptive"),
            BatchSize::Fixed(n) => write!(f, "{n}"),
        }
    }
}

/// Producer ordering discipline.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Ordering {
    /// Batches are appended in push order across all partitions.
    Strict,
    /// Only per-partition append order is preserved.
    Loose,
}

impl FromStr for Ordering {
    type Err = FluxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Ordering::Strict),
            "loose" => Ok(Ordering::Loose),
            other => Err(FluxError::Config(format!(
                "ordering must be \"strict\" or \"loose\", got {other:?}"
            ))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "eventflux".into(),
            version: 1,
            description: "partitioned event streaming".into(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
            batch_size: BatchSize::Adaptive,
            ordering: Ordering::Strict,
            thread_count: 0,
            max_idle_ms: 50,
            adaptive_min: 1,
            adaptive_max: 1024,
            adaptive_target_latency_ms: 10,
        }
    }
}

impl ProducerConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            batch_size: BatchSize::Fixed(16),
            thread_count: 0,
            check_data: false,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| FluxError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| FluxError::Config(format!("read {}: {e}", path.display())))?;
        Config::from_toml_str(&s)
    }

    fn check(&self) -> Result<()> {
        let p = &self.producer;
        if p.adaptive_min == 0 || p.adaptive_min > p.adaptive_max {
            return Err(FluxError::Config(format!(
                "adaptive bounds must satisfy 1 <= min <= max, got [{}, {}]",
                p.adaptive_min, p.adaptive_max
            )));
        }
        if p.max_idle_ms == 0 {
            return Err(FluxError::Config("max_idle_ms must be positive".into()));
        }
        Ok(())
    }
}
