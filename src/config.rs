use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Daemon configuration, read once at startup from a single JSON file.
/// Every field has a default so a missing or partial file still yields a
/// working daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub container: ContainerConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket the RPC listener binds.
    pub socket_path: PathBuf,
    /// Directory holding per-container records and stdio logs.
    pub state_dir: PathBuf,
    /// Worker threads serving RPC requests.
    pub workers: usize,
    /// env_logger filter string.
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/crated.sock"),
            state_dir: PathBuf::from("/var/lib/crated"),
            workers: 4,
            log_level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SysctlEntry {
    pub key: String,
    pub val: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSysfs {
    pub device: String,
    pub sysfs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Bounds the whole launcher handshake.
    pub start_timeout_ms: u64,
    /// IPC sysctls applied inside isolated containers; filled from the host
    /// defaults at daemon start for keys the file does not set.
    pub ipc_sysctl: Vec<SysctlEntry>,
    /// Sysfs paths bind-remounted writable when the matching device is given
    /// to a container.
    pub device_sysfs: Vec<DeviceSysfs>,
    /// Bytes of stdout/stderr kept per container.
    pub stdout_limit: u64,
    /// How long the freezer may stay in Freezing before we report timeout.
    pub freezer_timeout_ms: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 30_000,
            ipc_sysctl: Vec::new(),
            device_sysfs: Vec::new(),
            stdout_limit: 8 * 1024 * 1024,
            freezer_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Whether the daemon programs qdiscs and per-container classes at all.
    pub enable_shaping: bool,
    /// Seconds to wait for address autoconfiguration before exec.
    pub autoconf_timeout_s: u64,
    /// Kernel qdisc installed at the root of each managed link.
    pub device_qdisc: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enable_shaping: false,
            autoconf_timeout_s: 120,
            device_qdisc: "htb".into(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::new(
                ErrorKind::Filesystem,
                format!("cannot read config {}: {e}", path.display()),
            )
        })?;
        serde_json::from_str(&data).map_err(|e| {
            Error::new(
                ErrorKind::InvalidValue,
                format!("cannot parse config {}: {e}", path.display()),
            )
        })
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn ipc_sysctl_value(&self, key: &str) -> Option<&str> {
        self.container
            .ipc_sysctl
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.val.as_str())
    }
}
