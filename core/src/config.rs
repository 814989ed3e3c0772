//! Handler configuration.
//!
//! Timeouts are fixed. Only the cache location, its size bound, and the
//! platform level can be chosen, either directly or from a JSON document.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the response cache lives and how large it may grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub directory: PathBuf,
    pub max_size: u64,
}

impl CacheConfig {
    /// `None` when there is no directory or `max_size` is not positive.
    pub fn resolve(directory: Option<PathBuf>, max_size: i64) -> Option<Self> {
        let directory = directory?;
        let max_size = u64::try_from(max_size).ok().filter(|&size| size > 0)?;
        Some(Self {
            directory,
            max_size,
        })
    }
}

/// Serialized handler settings.
///
/// ```json
/// { "cache_directory": "/data/tiles", "max_cache_size": 52428800, "platform_api_level": 19 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    pub cache_directory: Option<PathBuf>,
    pub max_cache_size: i64,
    /// Absent means detect the running platform.
    pub platform_api_level: Option<u32>,
}

impl HandlerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn cache(&self) -> Option<CacheConfig> {
        CacheConfig::resolve(self.cache_directory.clone(), self.max_cache_size)
    }
}
