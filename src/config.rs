// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Daemon configuration loading from environment variables and TOML files.
//!
//! Every value is read from an `ACCEL_RM_*` environment variable with a safe
//! default. Invalid values fall back to the default without crashing, and
//! floors are applied afterwards. A TOML file, when given, replaces the
//! defaults; environment variables still take precedence over the file.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `ACCEL_RM_SOCKET` | `/tmp/accel-rm.sock` | IPC socket path |
//! | `ACCEL_RM_LOG_LEVEL` | `info` | Log filter directive |
//! | `ACCEL_RM_LOG_FORMAT` | `json` | `json` or `pretty` |
//! | `ACCEL_RM_LOG_FILE` | unset | Log to this file instead of stderr |
//! | `ACCEL_RM_MAX_CONNECTIONS` | 64 | Max concurrent IPC connections |
//! | `ACCEL_RM_IPC_FRAME_LIMIT` | 1048576 | Max IPC frame size (bytes) |
//! | `ACCEL_RM_SHUTDOWN_TIMEOUT` | 30 | Graceful shutdown timeout (secs) |
//! | `ACCEL_RM_BOOT_DEVICES` | `0` | Devices enabled at startup |
//! | `ACCEL_RM_BOOT_IMAGES` | unset | `device=path` pairs, `any` for any device |
//! | `ACCEL_RM_MAX_LIST_CUS` | 64 | Max CUs in one list request |
//! | `ACCEL_RM_MAX_GROUP_OPTIONS` | 32 | Max option lists per group |
//! | `ACCEL_RM_MAX_CHANNELS_PER_CU` | 64 | Max live channels on one CU |
//! | `ACCEL_RM_MAX_DEVICES` | 128 | Number of device slots |
//! | `ACCEL_RM_MAX_NAME_LEN` | 256 | Max kernel/CU/group name length |
//! | `ACCEL_RM_MAX_PLUGIN_PARAM_LEN` | 16384 | Max plugin buffer length |
//! | `ACCEL_RM_MAX_POOL_LISTS` | 128 | Max copies in one pool request |

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ipc::{ConnectionConfig, IpcServerConfig};
use crate::limits::ManagerLimits;
use crate::telemetry::{LogConfig, LogFormat};
use crate::types::DeviceId;

const DEFAULT_SOCKET: &str = "/tmp/accel-rm.sock";
const DEFAULT_FRAME: usize = 1024 * 1024; // 1 MiB
const MIN_FRAME: usize = 4096; // floor: 4 KiB

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// An image programmed onto a device at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootImage {
    /// Target device, or any enabled idle device when unset.
    #[serde(default)]
    pub device: Option<DeviceId>,
    pub path: PathBuf,
}

impl fmt::Display for BootImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device {
            Some(id) => write!(f, "{}={}", id, self.path.display()),
            None => write!(f, "any={}", self.path.display()),
        }
    }
}

impl FromStr for BootImage {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (device, path) = s.split_once('=').ok_or(())?;
        let path = path.trim();
        if path.is_empty() {
            return Err(());
        }
        let device = match device.trim() {
            "any" | "*" => None,
            id => Some(id.parse::<DeviceId>().map_err(|_| ())?),
        };
        Ok(Self { device, path: PathBuf::from(path) })
    }
}

/// Devices and images brought up before the socket opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    pub devices: Vec<DeviceId>,
    pub images: Vec<BootImage>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self { devices: vec![0], images: Vec::new() }
    }
}

/// All daemon configuration.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub socket_path: PathBuf,
    pub log: LogConfig,
    pub ipc_server: IpcServerConfig,
    pub connections: ConnectionConfig,
    pub shutdown_timeout: Duration,
    pub boot: BootConfig,
    pub limits: ManagerLimits,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET),
            log: LogConfig::default(),
            ipc_server: IpcServerConfig { max_frame_size: DEFAULT_FRAME },
            connections: ConnectionConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
            boot: BootConfig::default(),
            limits: ManagerLimits::default(),
        }
    }
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub socket_path: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_file: Option<String>,
    pub max_connections: usize,
    pub ipc_frame_limit: usize,
    pub shutdown_timeout_secs: u64,
    pub boot_devices: Vec<DeviceId>,
    pub boot_images: Vec<String>,
    pub limits: ManagerLimits,
}

/// On-disk layout. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    socket_path: Option<PathBuf>,
    log_level: Option<String>,
    log_format: Option<LogFormat>,
    log_file: Option<PathBuf>,
    max_connections: Option<usize>,
    ipc_frame_limit: Option<usize>,
    shutdown_timeout_secs: Option<u64>,
    boot_devices: Option<Vec<DeviceId>>,
    boot_images: Option<Vec<BootImage>>,
    limits: Option<ManagerLimits>,
}

impl FileConfig {
    fn into_config(self) -> EnvConfig {
        let mut cfg = EnvConfig::default();
        if let Some(path) = self.socket_path {
            cfg.socket_path = path;
        }
        if let Some(level) = self.log_level {
            cfg.log.level = level;
        }
        if let Some(format) = self.log_format {
            cfg.log.format = format;
        }
        cfg.log.output_path = self.log_file;
        if let Some(n) = self.max_connections {
            cfg.connections.max_connections = n;
        }
        if let Some(n) = self.ipc_frame_limit {
            cfg.ipc_server.max_frame_size = n;
        }
        if let Some(secs) = self.shutdown_timeout_secs {
            cfg.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(devices) = self.boot_devices {
            cfg.boot.devices = devices;
        }
        if let Some(images) = self.boot_images {
            cfg.boot.images = images;
        }
        if let Some(limits) = self.limits {
            cfg.limits = limits;
        }
        cfg
    }
}

/// Parse an env var with `FromStr`, returning `default` on missing or invalid.
fn parse_var<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a comma-separated list. One bad entry discards the whole value.
fn parse_list<T: FromStr>(key: &str, default: Vec<T>) -> Vec<T> {
    let Ok(val) = std::env::var(key) else {
        return default;
    };
    let parsed: Result<Vec<T>, _> = val
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::parse::<T>)
        .collect();
    parsed.unwrap_or(default)
}

fn apply_limits_env(limits: ManagerLimits) -> ManagerLimits {
    ManagerLimits {
        max_list_cus: parse_var("ACCEL_RM_MAX_LIST_CUS", limits.max_list_cus),
        max_group_options: parse_var("ACCEL_RM_MAX_GROUP_OPTIONS", limits.max_group_options),
        max_channels_per_cu: parse_var("ACCEL_RM_MAX_CHANNELS_PER_CU", limits.max_channels_per_cu),
        max_devices: parse_var("ACCEL_RM_MAX_DEVICES", limits.max_devices),
        max_name_len: parse_var("ACCEL_RM_MAX_NAME_LEN", limits.max_name_len),
        max_plugin_param_len: parse_var(
            "ACCEL_RM_MAX_PLUGIN_PARAM_LEN",
            limits.max_plugin_param_len,
        ),
        max_pool_lists: parse_var("ACCEL_RM_MAX_POOL_LISTS", limits.max_pool_lists),
    }
    .sanitized()
}

/// Overlay environment variables on `base`, then apply floors.
fn apply_env(base: EnvConfig) -> EnvConfig {
    let socket_path = std::env::var("ACCEL_RM_SOCKET")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or(base.socket_path);

    let log = LogConfig {
        format: parse_var("ACCEL_RM_LOG_FORMAT", base.log.format),
        level: std::env::var("ACCEL_RM_LOG_LEVEL").unwrap_or(base.log.level),
        output_path: std::env::var("ACCEL_RM_LOG_FILE")
            .ok()
            .map(PathBuf::from)
            .or(base.log.output_path),
    };

    let max_frame_size = parse_var("ACCEL_RM_IPC_FRAME_LIMIT", base.ipc_server.max_frame_size);
    let max_connections = parse_var("ACCEL_RM_MAX_CONNECTIONS", base.connections.max_connections);
    let shutdown_secs = parse_var("ACCEL_RM_SHUTDOWN_TIMEOUT", base.shutdown_timeout.as_secs());

    EnvConfig {
        socket_path,
        log,
        ipc_server: IpcServerConfig { max_frame_size: max_frame_size.max(MIN_FRAME) },
        connections: ConnectionConfig { max_connections: max_connections.max(1) },
        shutdown_timeout: Duration::from_secs(shutdown_secs.max(1)),
        boot: BootConfig {
            devices: parse_list("ACCEL_RM_BOOT_DEVICES", base.boot.devices),
            images: parse_list("ACCEL_RM_BOOT_IMAGES", base.boot.images),
        },
        limits: apply_limits_env(base.limits),
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    apply_env(EnvConfig::default())
}

/// Load configuration from a TOML file, then overlay environment variables.
pub fn load_file(path: &Path) -> Result<EnvConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let file: FileConfig = toml::from_str(&text)?;
    Ok(apply_env(file.into_config()))
}

impl EnvConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            socket_path: self.socket_path.display().to_string(),
            log_level: self.log.level.clone(),
            log_format: self.log.format,
            log_file: self.log.output_path.as_ref().map(|p| p.display().to_string()),
            max_connections: self.connections.max_connections,
            ipc_frame_limit: self.ipc_server.max_frame_size,
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
            boot_devices: self.boot.devices.clone(),
            boot_images: self.boot.images.iter().map(ToString::to_string).collect(),
            limits: self.limits.clone(),
        }
    }
}
