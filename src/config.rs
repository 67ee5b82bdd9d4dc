use crate::error::Error;
use ::config::{Config, ConfigError};
use std::time::Duration;

// ============================================================================
// Namespaced Lookups
// ============================================================================

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, ConfigError>,
{
    if name.is_empty() {
        return getter(config, key);
    }
    // Only a missing namespaced key falls through; a malformed one is an error.
    match getter(config, &format!("{name}.{key}")) {
        Err(ConfigError::NotFound(_)) => getter(config, key),
        found => found,
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

// Missing keys become `None`; anything else that failed stays an error.
fn optional<T>(lookup: Result<T, ConfigError>) -> Result<Option<T>, ConfigError> {
    match lookup {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

// ============================================================================
// Settings
// ============================================================================

const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_MAX_BATCH_SIZE: usize = 64;
const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Tunables read from configuration.
///
/// # Configuration Keys
///
/// - `dispatcher_workers`: number of queue dispatcher threads
/// - `max_batch_size`: frames written per queue visit
/// - `max_frame_size`: largest TCP payload accepted by the decoder
/// - `connect_timeout_ms`: default connect timeout (unset means wait forever)
/// - `request_timeout_ms`: default blocking request timeout (unset means wait forever)
///
/// # Example
///
/// ```toml
/// dispatcher_workers = 2
///
/// [quotes]
/// max_frame_size = 65536
/// request_timeout_ms = 5000
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub dispatcher_workers: usize,
    pub max_batch_size: usize,
    pub max_frame_size: usize,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            dispatcher_workers: parallelism.min(DEFAULT_MAX_WORKERS),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: None,
            request_timeout: None,
        }
    }
}

impl Settings {
    /// Reads settings from the un-namespaced keys of `config`.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads settings with configuration namespacing.
    ///
    /// Lookup order is `{name}.{key}`, then `{key}`, then the default. A key
    /// that is present but does not parse fails with [`Error::Config`].
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();
        let count = |key: &str| optional(get_namespaced_usize(config, name, key));
        let millis = |key: &str| {
            optional(get_namespaced_u64(config, name, key)).map(|ms| ms.map(Duration::from_millis))
        };

        Ok(Self {
            dispatcher_workers: count("dispatcher_workers")?
                .unwrap_or(defaults.dispatcher_workers)
                .max(1),
            max_batch_size: count("max_batch_size")?
                .unwrap_or(defaults.max_batch_size)
                .max(1),
            max_frame_size: count("max_frame_size")?.unwrap_or(defaults.max_frame_size),
            connect_timeout: millis("connect_timeout_ms")?,
            request_timeout: millis("request_timeout_ms")?,
        })
    }
}
