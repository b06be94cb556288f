//! Configuration types for tfsproxy
//!
//! This module defines the deployment configuration consumed by the
//! protocol engine. Every section has serde defaults so a partial TOML
//! file is enough.

use crate::error::{Error, Result};
use crate::types::ServerAddr;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for tfsproxy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upstream (cluster entry points)
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Per-step peer timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Local block location cache
    #[serde(default)]
    pub block_cache: BlockCacheConfig,
    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Segmentation and fan-out
    #[serde(default)]
    pub batch: BatchConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ProxyConfig {
    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.upstream.rc_servers.is_empty() && self.upstream.name_server.is_none() {
            return Err(Error::Configuration(
                "either upstream.rc_servers or upstream.name_server must be set".into(),
            ));
        }
        if self.batch.max_batch_count == 0 {
            return Err(Error::Configuration(
                "batch.max_batch_count must be positive".into(),
            ));
        }
        if self.batch.max_fragment_size == 0 {
            return Err(Error::Configuration(
                "batch.max_fragment_size must be positive".into(),
            ));
        }
        if self.batch.max_read_size == 0 {
            return Err(Error::Configuration(
                "batch.max_read_size must be positive".into(),
            ));
        }
        if self.block_cache.enabled && self.block_cache.capacity == 0 {
            return Err(Error::Configuration(
                "block_cache.capacity must be positive when the cache is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Upstream cluster entry points
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Routing servers, tried round-robin
    #[serde(default)]
    pub rc_servers: Vec<ServerAddr>,
    /// Static name server; skips the routing service when set
    #[serde(default)]
    pub name_server: Option<ServerAddr>,
    /// Root server for the meta table; normally learned from the routing service
    #[serde(default)]
    pub root_server: Option<ServerAddr>,
    /// Application key presented at login
    #[serde(default)]
    pub app_key: String,
    /// Application id for named files, overridden by the login answer
    #[serde(default)]
    pub app_id: u64,
    /// Allow the remote block cache tier when the routing service offers one
    #[serde(default)]
    pub enable_remote_block_cache: bool,
}

/// Peer session timeouts in milliseconds
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_timeout_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub send_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub read_ms: u64,
}

impl TimeoutConfig {
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    #[must_use]
    pub const fn send(&self) -> Duration {
        Duration::from_millis(self.send_ms)
    }

    #[must_use]
    pub const fn read(&self) -> Duration {
        Duration::from_millis(self.read_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_timeout_ms(),
            send_ms: default_timeout_ms(),
            read_ms: default_timeout_ms(),
        }
    }
}

/// Local block location cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum number of cached blocks
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Visit score removed per elapsed second
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
    /// Number of least-recent entries examined per eviction
    #[serde(default = "default_eviction_sample")]
    pub eviction_sample: usize,
    /// Lookups between two hit-ratio log lines
    #[serde(default = "default_stat_interval")]
    pub stat_interval: u64,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_cache_capacity(),
            decay_rate: default_decay_rate(),
            eviction_sample: default_eviction_sample(),
            stat_interval: default_stat_interval(),
        }
    }
}

/// Retry policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Name/routing round trips allowed after a recoverable failure
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_count: default_max_retry_count(),
        }
    }
}

/// Segmentation and fan-out configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Sub-operations in flight per round
    #[serde(default = "default_max_batch_count")]
    pub max_batch_count: usize,
    /// Size of one data segment of a large file
    #[serde(default = "default_max_fragment_size")]
    pub max_fragment_size: u64,
    /// Raw writes above this size are stored as large files
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,
    /// Bytes moved per data server read or write call
    #[serde(default = "default_max_read_size")]
    pub max_read_size: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_count: default_max_batch_count(),
            max_fragment_size: default_max_fragment_size(),
            large_file_threshold: default_large_file_threshold(),
            max_read_size: default_max_read_size(),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

const fn default_timeout_ms() -> u64 {
    3000
}

const fn default_true() -> bool {
    true
}

const fn default_cache_capacity() -> usize {
    100_000
}

const fn default_decay_rate() -> f64 {
    0.1
}

const fn default_eviction_sample() -> usize {
    16
}

const fn default_stat_interval() -> u64 {
    10_000
}

const fn default_max_retry_count() -> u32 {
    2
}

const fn default_max_batch_count() -> usize {
    8
}

const fn default_max_fragment_size() -> u64 {
    2 * 1024 * 1024 // 2 MiB
}

const fn default_large_file_threshold() -> u64 {
    15 * 1024 * 1024 // 15 MiB
}

const fn default_max_read_size() -> u32 {
    512 * 1024 // 512 KiB
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
