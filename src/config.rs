//! Runtime configuration loading.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub limits: Limits,
    pub host: HostConfig,
    pub hub_info: HubInfoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            host: HostConfig::default(),
            hub_info: HubInfoConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Every capacity bound in the runtime. All queues are bounded; hitting a
/// bound is a visible error, never a silent drop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Slots in the event slab; bounds events alive at once.
    pub event_pool_capacity: usize,
    /// Events admitted but not yet distributed.
    pub inbound_queue_capacity: usize,
    /// Distributed events waiting per nanoapp.
    pub nanoapp_inbox_capacity: usize,
    pub max_timers: usize,
    pub max_scan_monitor_subscribers: usize,
    pub max_scan_monitor_transitions: usize,
    /// Host wire frame body bound.
    pub max_frame_bytes: usize,
    /// Nanoapp-to-host message payload bound.
    pub max_msg_len: usize,
    /// Log records buffered before relay to the host.
    pub log_buffer_max_records: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            event_pool_capacity: 96,
            inbound_queue_capacity: 96,
            nanoapp_inbox_capacity: 16,
            max_timers: 32,
            max_scan_monitor_subscribers: 8,
            max_scan_monitor_transitions: 8,
            max_frame_bytes: 64 * 1024,
            max_msg_len: 2048,
            log_buffer_max_records: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub socket_path: PathBuf,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/contexthub/host.sock"),
            reconnect_initial_ms: 500,
            reconnect_max_ms: 5 * 60 * 1000,
            reconnect_max_attempts: 40,
        }
    }
}

/// Static identity reported in hub-info responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubInfoConfig {
    pub name: String,
    pub vendor: String,
    pub toolchain: String,
    pub platform_version: u32,
    pub toolchain_version: u32,
    pub peak_mips: f32,
    pub stopped_power_mw: f32,
    pub sleep_power_mw: f32,
    pub peak_power_mw: f32,
    pub platform_id: u64,
    pub platform_api_version: u32,
}

impl Default for HubInfoConfig {
    fn default() -> Self {
        Self {
            name: "Context Hub".to_string(),
            vendor: "contexthub".to_string(),
            toolchain: "rustc".to_string(),
            platform_version: 1,
            toolchain_version: 1,
            peak_mips: 350.0,
            stopped_power_mw: 0.0,
            sleep_power_mw: 1.0,
            peak_power_mw: 150.0,
            platform_id: 0x0000_0000_0000_0001,
            platform_api_version: 0x0100_0000,
        }
    }
}
