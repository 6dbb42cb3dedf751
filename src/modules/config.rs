//! Daemon modes, mount drivers and the per-instance daemon configuration.
//!
//! Each filesystem instance served by a daemon has its own copy of the
//! daemon configuration stored as JSON. The file is re-read before every
//! mount so that edits made by outer tooling are honoured.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::errors::DaemonError;

/// How many filesystem instances one daemon process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonMode {
    /// One process per instance
    #[default]
    Dedicated,
    /// One process for many instances below a single host mountpoint
    Shared,
}

/// Which host mount driver backs the instances of a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsDriver {
    /// All mounts are performed by the daemon through control-plane calls
    #[default]
    Fuse,
    /// Blobs are bound into the kernel cache and erofs is mounted directly
    Fscache,
}

impl fmt::Display for DaemonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonMode::Dedicated => write!(f, "dedicated"),
            DaemonMode::Shared => write!(f, "shared"),
        }
    }
}

impl FromStr for DaemonMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dedicated" => Ok(DaemonMode::Dedicated),
            "shared" => Ok(DaemonMode::Shared),
            _ => Err(anyhow!("invalid daemon mode: {}", s)),
        }
    }
}

impl fmt::Display for FsDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsDriver::Fuse => write!(f, "fuse"),
            FsDriver::Fscache => write!(f, "fscache"),
        }
    }
}

impl FromStr for FsDriver {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fuse" => Ok(FsDriver::Fuse),
            "fscache" => Ok(FsDriver::Fscache),
            _ => Err(anyhow!("invalid fs driver: {}", s)),
        }
    }
}

/// Configuration of a daemon serving instances through FUSE.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FuseDaemonConfig {
    /// Storage backend and cache description
    #[serde(default)]
    pub device: Value,
    /// Metadata mode, usually `direct` or `cached`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    /// Whether data digests are validated on read
    #[serde(default)]
    pub digest_validate: bool,
    /// Whether per-file I/O statistics are collected
    #[serde(default)]
    pub iostats_files: bool,
    /// Whether extended attributes are exposed
    #[serde(default)]
    pub enable_xattr: bool,
    /// Prefetch settings
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub fs_prefetch: Value,
    /// Fields not interpreted here, kept as-is
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Cache section of an fscache blob configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FscacheCacheConfig {
    /// Working directory of the kernel cache
    #[serde(default)]
    pub work_dir: String,
    /// Fields not interpreted here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Blob description of an fscache configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FscacheBlobConfig {
    /// Blob ID
    #[serde(default)]
    pub id: String,
    /// Storage backend type
    #[serde(default)]
    pub backend_type: String,
    /// Storage backend settings
    #[serde(default)]
    pub backend_config: Value,
    /// Cache type, `fscache` for this driver
    #[serde(default)]
    pub cache_type: String,
    /// Cache settings
    #[serde(default)]
    pub cache_config: FscacheCacheConfig,
    /// Path of the image metadata
    #[serde(default)]
    pub metadata_path: String,
}

/// Configuration of a daemon binding blobs into the kernel cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FscacheDaemonConfig {
    /// Object type, `bootstrap` for image metadata
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Object ID
    #[serde(default)]
    pub id: String,
    /// Kernel cache domain the blob is shared in
    #[serde(default)]
    pub domain_id: String,
    /// Blob description
    #[serde(default)]
    pub config: FscacheBlobConfig,
    /// Prefetch settings
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub fs_prefetch: Value,
    /// Fields not interpreted here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Daemon configuration, shaped by the mount driver.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonConfig {
    /// FUSE driver configuration
    Fuse(FuseDaemonConfig),
    /// Fscache driver configuration
    Fscache(FscacheDaemonConfig),
}

impl DaemonConfig {
    /// Loads the configuration for `driver` from a JSON file.
    pub fn load(driver: FsDriver, path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("read daemon configuration {}", path.display()))?;
        Self::from_json(driver, &content)
            .with_context(|| format!("parse daemon configuration {}", path.display()))
    }

    /// Parses the configuration for `driver` from a JSON string.
    pub fn from_json(driver: FsDriver, content: &str) -> Result<Self> {
        Ok(match driver {
            FsDriver::Fuse => DaemonConfig::Fuse(serde_json::from_str(content)?),
            FsDriver::Fscache => DaemonConfig::Fscache(serde_json::from_str(content)?),
        })
    }

    /// Serializes the configuration to the JSON string sent to the daemon.
    pub fn dump_string(&self) -> Result<String> {
        let s = match self {
            DaemonConfig::Fuse(c) => serde_json::to_string(c)?,
            DaemonConfig::Fscache(c) => serde_json::to_string(c)?,
        };
        Ok(s)
    }

    /// Writes the configuration to `path`, creating parent directories.
    pub fn dump_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create configuration dir {}", parent.display()))?;
        }
        fs::write(path, self.dump_string()?)
            .with_context(|| format!("write daemon configuration {}", path.display()))
    }

    /// Driver this configuration belongs to.
    pub fn driver(&self) -> FsDriver {
        match self {
            DaemonConfig::Fuse(_) => FsDriver::Fuse,
            DaemonConfig::Fscache(_) => FsDriver::Fscache,
        }
    }

    /// Returns the fscache variant, failing for FUSE configurations.
    pub fn as_fscache(&self) -> Result<&FscacheDaemonConfig> {
        match self {
            DaemonConfig::Fscache(c) => Ok(c),
            DaemonConfig::Fuse(_) => Err(DaemonError::UnexpectedConfig {
                driver: FsDriver::Fscache.to_string(),
            }
            .into()),
        }
    }
}

impl FscacheDaemonConfig {
    /// Working directory of the kernel cache, if configured.
    pub fn work_dir(&self) -> Option<PathBuf> {
        let dir = &self.config.cache_config.work_dir;
        (!dir.is_empty()).then(|| PathBuf::from(dir))
    }

    /// Path of the image metadata, if configured.
    pub fn metadata_path(&self) -> Option<PathBuf> {
        let p = &self.config.metadata_path;
        (!p.is_empty()).then(|| PathBuf::from(p))
    }
}
