//! Delivery settings shared by the facade and every request it creates.

use serde::{Deserialize, Serialize};

use crate::chunk::DEFAULT_CHUNK_SIZE;

/// Default attempts per request before it fails.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default ticks without bytes before an open stream counts as stalled.
pub const DEFAULT_STALL_TIMEOUT_TICKS: u64 = 30;

/// Pack delivery configuration. Every field has a default, so an empty table is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackConfig {
    /// Base URL packs are fetched from.
    #[serde(default = "default_remote_url")]
    pub remote_url: String,
    /// Appended to the pack name to form the file name (default ".pack").
    #[serde(default = "default_pack_suffix")]
    pub pack_suffix: String,
    /// Bytes requested per window (default 1 MiB, 0 means default).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ticks")]
    pub backoff_base_ticks: u64,
    #[serde(default = "default_backoff_max_ticks")]
    pub backoff_max_ticks: u64,
    #[serde(default = "default_stall_timeout_ticks")]
    pub stall_timeout_ticks: u64,
}

fn default_remote_url() -> String {
    "http://127.0.0.1:8080/packs".to_string()
}
fn default_pack_suffix() -> String {
    ".pack".to_string()
}
fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_backoff_base_ticks() -> u64 {
    1
}
fn default_backoff_max_ticks() -> u64 {
    32
}
fn default_stall_timeout_ticks() -> u64 {
    DEFAULT_STALL_TIMEOUT_TICKS
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            remote_url: default_remote_url(),
            pack_suffix: default_pack_suffix(),
            chunk_size: default_chunk_size(),
            max_attempts: default_max_attempts(),
            backoff_base_ticks: default_backoff_base_ticks(),
            backoff_max_ticks: default_backoff_max_ticks(),
            stall_timeout_ticks: default_stall_timeout_ticks(),
        }
    }
}

impl PackConfig {
    /// `{remote_url}/{pack}{pack_suffix}`
    pub fn pack_url(&self, pack: &str) -> String {
        format!(
            "{}/{}{}",
            self.remote_url.trim_end_matches('/'),
            pack,
            self.pack_suffix
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            chunk_size: self.chunk_size,
            max_attempts: self.max_attempts.max(1),
            backoff_base_ticks: self.backoff_base_ticks,
            backoff_max_ticks: self.backoff_max_ticks,
            stall_timeout_ticks: self.stall_timeout_ticks,
        }
    }
}

/// Per-request slice of the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub chunk_size: u64,
    pub max_attempts: u32,
    pub backoff_base_ticks: u64,
    pub backoff_max_ticks: u64,
    /// 0 disables stall detection.
    pub stall_timeout_ticks: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        PackConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Ticks to wait before attempt `failures + 1`: `base * 2^(failures - 1)`, capped.
    pub fn backoff_ticks(&self, failures: u32) -> u64 {
        let factor = 1u64
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u64::MAX);
        self.backoff_base_ticks
            .saturating_mul(factor)
            .min(self.backoff_max_ticks)
    }
}
