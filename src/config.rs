//! Run configuration delivered by the host.
//!
//! The host serializes field names in PascalCase, either into
//! `/pigeon/run.json` on the initramfs or behind the metadata service
//! (see [`crate::mmds`]). Loaded once during boot and read-only afterwards.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::InitError;

/// Root device mounted when the config does not name one.
pub const DEFAULT_ROOT_DEVICE: &str = "/dev/vda";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_config: Option<ImageConfig>,

    /// Replaces the image entrypoint+cmd entirely when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exec_override: Vec<String>,

    /// Single-argument replacement for the image cmd tail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd_override: Option<String>,

    /// `user[:group]` spec taking precedence over the image user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_override: Option<String>,

    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub extra_env: std::collections::HashMap<String, String>,

    #[serde(default, rename = "IPConfigs", skip_serializing_if = "Vec::is_empty")]
    pub ip_configs: Vec<IpConfig>,

    #[serde(default, rename = "MTU", skip_serializing_if = "is_zero")]
    pub mtu: u32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_device: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etc_resolv: Option<EtcResolv>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etc_hosts: Vec<EtcHost>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,

    /// `KEY=VAL` assignments; entries without `=` are ignored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpConfig {
    pub gateway: String,
    #[serde(rename = "IP")]
    pub ip: String,
    pub mask: u8,
}

/// Block device to mount below the workload root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mount {
    pub device_path: String,
    pub mount_path: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EtcResolv {
    #[serde(default)]
    pub nameservers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EtcHost {
    pub host: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub desc: String,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl RunConfig {
    /// Parse the JSON config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InitError> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| InitError::ConfigLoadFailed(format!("read {}: {e}", path.display())))?;
        serde_json::from_slice(&data)
            .map_err(|e| InitError::ConfigLoadFailed(format!("parse {}: {e}", path.display())))
    }

    /// The configured root device, or [`DEFAULT_ROOT_DEVICE`] when absent or
    /// empty.
    pub fn root_dev(&self) -> &str {
        match self.root_device.as_deref() {
            Some(dev) if !dev.is_empty() => dev,
            _ => DEFAULT_ROOT_DEVICE,
        }
    }
}
