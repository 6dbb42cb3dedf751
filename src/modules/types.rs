//! Data reported by a daemon over its control plane.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operational state of a daemon process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DaemonState {
    /// Not queried yet, or the cache was reset
    #[default]
    Unknown,
    /// Process started, resources not ready
    Init,
    /// All needed resources are ready
    Ready,
    /// Serving filesystem requests
    Running,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DaemonState::Unknown => "UNKNOWN",
            DaemonState::Init => "INIT",
            DaemonState::Ready => "READY",
            DaemonState::Running => "RUNNING",
        };
        f.write_str(s)
    }
}

impl FromStr for DaemonState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(DaemonState::Unknown),
            "INIT" => Ok(DaemonState::Init),
            "READY" => Ok(DaemonState::Ready),
            "RUNNING" => Ok(DaemonState::Running),
            _ => Err(anyhow::anyhow!("invalid daemon state: {}", s)),
        }
    }
}

/// Version and build information of a daemon binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTimeInfo {
    /// Package version
    #[serde(default)]
    pub package_ver: String,
    /// Git commit the binary was built from
    #[serde(default)]
    pub git_commit: String,
    /// Build timestamp
    #[serde(default)]
    pub build_time: String,
    /// Build profile
    #[serde(default)]
    pub profile: String,
    /// Compiler version
    #[serde(default)]
    pub rustc: String,
}

/// Reply to a daemon information request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonInfo {
    /// Daemon ID as known by the process
    #[serde(default)]
    pub id: String,
    /// Build information
    #[serde(default)]
    pub version: BuildTimeInfo,
    /// Current state
    #[serde(default)]
    pub state: DaemonState,
}

impl DaemonInfo {
    /// Reported operational state.
    pub fn daemon_state(&self) -> DaemonState {
        self.state
    }

    /// Reported build information.
    pub fn daemon_version(&self) -> BuildTimeInfo {
        self.version.clone()
    }
}

/// Filesystem-level counters of one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FsMetrics {
    /// Whether per-file accounting is on.
    #[serde(default)]
    pub files_account_enabled: bool,
    /// Whether operation latency is measured.
    #[serde(default)]
    pub measure_latency: bool,
    /// Bytes read.
    #[serde(default)]
    pub data_read: u64,
    /// Read counts bucketed by block size.
    #[serde(default)]
    pub block_count_read: Vec<u64>,
    /// Successful calls per file operation.
    #[serde(default)]
    pub fop_hits: Vec<u64>,
    /// Failed calls per file operation.
    #[serde(default)]
    pub fop_errors: Vec<u64>,
    /// Summed latency per file operation, in microseconds.
    #[serde(default)]
    pub fop_cumulative_latency_total: Vec<u64>,
    /// Read latency histogram.
    #[serde(default)]
    pub read_latency_dist: Vec<u64>,
    /// Files currently open.
    #[serde(default)]
    pub nr_opens: u64,
}

/// One file operation still in flight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InflightMetric {
    /// Worker thread serving the operation.
    #[serde(default)]
    pub thread_name: String,
    /// Operation name.
    #[serde(default)]
    pub fop: String,
    /// Inode the operation works on.
    #[serde(default)]
    pub inode: u64,
    /// Start time, seconds since the epoch.
    #[serde(default)]
    pub timestamp_secs: u64,
}

/// File operations currently in flight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InflightMetrics {
    /// Pending operations.
    #[serde(default)]
    pub values: Vec<InflightMetric>,
}

/// Blob cache counters of one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Blob cache ID.
    #[serde(default)]
    pub id: String,
    /// Backing files of the cache.
    #[serde(default)]
    pub underlying_files: Vec<String>,
    /// Directory holding the cache.
    #[serde(default)]
    pub store_path: String,
    /// Reads partly served from cache.
    #[serde(default)]
    pub partial_hits: u64,
    /// Reads fully served from cache.
    #[serde(default)]
    pub whole_hits: u64,
    /// All reads.
    #[serde(default)]
    pub total: u64,
    /// Cached entries.
    #[serde(default)]
    pub entries_count: u64,
    /// Bytes prefetched.
    #[serde(default)]
    pub prefetch_data_amount: u64,
    /// Prefetch requests issued.
    #[serde(default)]
    pub prefetch_requests_count: u64,
    /// Prefetch worker threads.
    #[serde(default)]
    pub prefetch_workers: u64,
    /// Bytes buffered from the backend.
    #[serde(default)]
    pub buffered_backend_size: u64,
}
