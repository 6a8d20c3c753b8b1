//! # Runtime Configuration
//!
//! Plain serde structs with defaults for every key, loadable from TOML:
//!
//! ```toml
//! namespace = "shop"
//! request_timeout_ms = 5000
//! scale_down_interval_ms = 60000
//! keep_alive_interval_ms = 10000
//! codec = "json"
//! static_hosts = ["shop.host.edge-1"]
//! unregistered_field_writes = "reject"
//!
//! [host]
//! reclaim_after_missed_keep_alives = 3
//! max_concurrent_requests = 64
//! ```

use std::path::Path;
use std::time::Duration;

use cloudrpc::Codec;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

/// What a stub does with field writes issued before its object exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldWritePolicy {
    /// Record the writes and replay them once the object is created.
    #[default]
    Buffer,
    /// Fail the write with [`Error::NotRegistered`].
    Reject,
}

/// Client-side settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub namespace: String,
    pub request_timeout_ms: u64,
    pub host_startup_timeout_ms: u64,
    /// `0` disables the periodic scale-down check.
    pub scale_down_interval_ms: u64,
    /// `0` disables keep-alive pings and host-side reclamation.
    pub keep_alive_interval_ms: u64,
    pub codec: Codec,
    pub static_hosts: Vec<String>,
    pub unregistered_field_writes: FieldWritePolicy,
    pub default_host_size: Option<String>,
    pub host: HostSection,
}

/// Host-only knobs, nested under `[host]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSection {
    pub reclaim_after_missed_keep_alives: u32,
    pub max_concurrent_requests: Option<usize>,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            reclaim_after_missed_keep_alives: 3,
            max_concurrent_requests: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            namespace: "cloudrun".into(),
            request_timeout_ms: 30_000,
            host_startup_timeout_ms: 600_000,
            scale_down_interval_ms: 0,
            keep_alive_interval_ms: 0,
            codec: Codec::default(),
            static_hosts: Vec::new(),
            unregistered_field_writes: FieldWritePolicy::default(),
            default_host_size: None,
            host: HostSection::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::Config("namespace must not be empty".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Config("request_timeout_ms must be positive".into()));
        }
        if self.host.reclaim_after_missed_keep_alives == 0 {
            return Err(Error::Config("reclaim_after_missed_keep_alives must be positive".into()));
        }
        if self.host.max_concurrent_requests == Some(0) {
            return Err(Error::Config("max_concurrent_requests must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn host_startup_timeout(&self) -> Duration {
        Duration::from_millis(self.host_startup_timeout_ms)
    }

    pub fn scale_down_interval(&self) -> Option<Duration> {
        (self.scale_down_interval_ms > 0).then(|| Duration::from_millis(self.scale_down_interval_ms))
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0).then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }

    /// Settings for hosts started on the local platform with this config.
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            namespace: self.namespace.clone(),
            codec: self.codec,
            keep_alive_interval_ms: self.keep_alive_interval_ms,
            reclaim_after_missed_keep_alives: self.host.reclaim_after_missed_keep_alives,
            max_concurrent_requests: self.host.max_concurrent_requests,
            callback_timeout_ms: self.request_timeout_ms,
        }
    }
}

/// Settings of one host server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub namespace: String,
    pub codec: Codec,
    pub keep_alive_interval_ms: u64,
    pub reclaim_after_missed_keep_alives: u32,
    pub max_concurrent_requests: Option<usize>,
    /// How long an object waits for a client to answer a callback.
    pub callback_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        RuntimeConfig::default().host_config()
    }
}

impl HostConfig {
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }

    /// Idle time after which an object is reclaimed, if reclamation is on.
    pub fn reclaim_after(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0).then(|| {
            Duration::from_millis(self.keep_alive_interval_ms) * self.reclaim_after_missed_keep_alives.max(1)
        })
    }
}
