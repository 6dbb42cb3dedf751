//! In-memory collaborators for unit tests.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::client::{ClientBuilder, DaemonClient};
use super::config::FsDriver;
use super::daemon::Daemon;
use super::errors::DaemonError;
use super::mount::Mounter;
use super::supervisor::StateSupervisor;
use super::types::{BuildTimeInfo, CacheMetrics, DaemonInfo, DaemonState, FsMetrics, InflightMetrics};

#[derive(Default)]
struct ClientState {
    state: DaemonState,
    calls: Vec<String>,
    mounts: Vec<String>,
    unbinds: Vec<(String, String)>,
    failing: HashSet<String>,
}

/// Control-plane double recording every call.
#[derive(Clone, Default)]
pub struct FakeClient {
    inner: Arc<Mutex<ClientState>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, state: DaemonState) {
        self.inner.lock().state = state;
    }

    /// Makes every later call of `op` fail. `unbind_blob_release` targets
    /// only unbinds with an empty domain.
    pub fn fail(&self, op: &str) {
        self.inner.lock().failing.insert(op.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.inner.lock().calls.iter().filter(|c| *c == op).count()
    }

    pub fn mounts(&self) -> Vec<String> {
        self.inner.lock().mounts.clone()
    }

    pub fn unbinds(&self) -> Vec<(String, String)> {
        self.inner.lock().unbinds.clone()
    }

    fn record(&self, op: &str, fail_as: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(op.to_string());
        if inner.failing.contains(fail_as) {
            return Err(DaemonError::Protocol {
                op: op.to_string(),
                code: "EIO".to_string(),
                message: format!("{} failed", fail_as),
            }
            .into());
        }
        Ok(())
    }
}

impl DaemonClient for FakeClient {
    fn daemon_info(&self) -> Result<DaemonInfo> {
        self.record("daemon_info", "daemon_info")?;
        Ok(DaemonInfo {
            id: "fake".to_string(),
            version: BuildTimeInfo {
                package_ver: "0.1.0-test".to_string(),
                ..Default::default()
            },
            state: self.inner.lock().state,
        })
    }

    fn mount(&self, mountpoint: &str, _bootstrap: &Path, _config: &str) -> Result<()> {
        self.record("mount", "mount")?;
        self.inner.lock().mounts.push(mountpoint.to_string());
        Ok(())
    }

    fn umount(&self, mountpoint: &str) -> Result<()> {
        self.record("umount", "umount")?;
        self.inner.lock().mounts.retain(|m| m != mountpoint);
        Ok(())
    }

    fn bind_blob(&self, _config: &str) -> Result<()> {
        self.record("bind_blob", "bind_blob")
    }

    fn unbind_blob(&self, domain_id: &str, blob_id: &str) -> Result<()> {
        let fail_as = if domain_id.is_empty() {
            "unbind_blob_release"
        } else {
            "unbind_blob"
        };
        self.record("unbind_blob", fail_as)?;
        self.inner
            .lock()
            .unbinds
            .push((domain_id.to_string(), blob_id.to_string()));
        Ok(())
    }

    fn send_fd(&self) -> Result<()> {
        self.record("send_fd", "send_fd")
    }

    fn take_over(&self) -> Result<()> {
        self.record("take_over", "take_over")
    }

    fn start(&self) -> Result<()> {
        self.record("start", "start")
    }

    fn exit(&self) -> Result<()> {
        self.record("exit", "exit")
    }

    fn fs_metrics(&self, _id: Option<&str>) -> Result<FsMetrics> {
        self.record("fs_metrics", "fs_metrics")?;
        Ok(FsMetrics::default())
    }

    fn inflight_metrics(&self) -> Result<InflightMetrics> {
        self.record("inflight_metrics", "inflight_metrics")?;
        Ok(InflightMetrics::default())
    }

    fn cache_metrics(&self, _id: Option<&str>) -> Result<CacheMetrics> {
        self.record("cache_metrics", "cache_metrics")?;
        Ok(CacheMetrics::default())
    }
}

impl ClientBuilder for FakeClient {
    fn build(&self, _socket: &Path) -> Result<Arc<dyn DaemonClient>> {
        Ok(Arc::new(self.clone()))
    }
}

#[derive(Default)]
struct MounterState {
    mounted: HashSet<PathBuf>,
    calls: Vec<String>,
}

/// Kernel mount double keeping a set of mounted targets.
#[derive(Clone, Default)]
pub struct FakeMounter {
    inner: Arc<Mutex<MounterState>>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_mounted(&self, target: &Path) {
        self.inner.lock().mounted.insert(target.to_path_buf());
    }

    /// Mount and umount calls, in order.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }
}

impl Mounter for FakeMounter {
    fn mount_erofs(
        &self,
        _bootstrap: &Path,
        _domain_id: &str,
        _fscache_id: &str,
        target: &Path,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("mount {}", target.display()));
        if !inner.mounted.insert(target.to_path_buf()) {
            return Err(DaemonError::AlreadyMounted(target.to_path_buf()).into());
        }
        Ok(())
    }

    fn umount(&self, target: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("umount {}", target.display()));
        if inner.mounted.remove(target) {
            Ok(())
        } else {
            Err(anyhow!("{} is not mounted", target.display()))
        }
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self.inner.lock().mounted.contains(target))
    }
}

/// Supervisor double that runs the trigger and counts fetches.
#[derive(Default)]
pub struct RecordingSupervisor {
    pub fetches: Mutex<Vec<Result<(), String>>>,
}

impl StateSupervisor for RecordingSupervisor {
    fn fetch_daemon_states(&self, trigger: &dyn Fn() -> Result<()>) -> Result<()> {
        let result = trigger();
        self.fetches
            .lock()
            .push(result.as_ref().map(|_| ()).map_err(|e| format!("{:#}", e)));
        result
    }
}

/// A daemon below `dir` wired to the given doubles.
pub fn daemon_with(
    dir: &Path,
    driver: FsDriver,
    client: FakeClient,
    mounter: FakeMounter,
) -> Result<Daemon> {
    Daemon::builder()
        .socket_dir(dir.join("socket"))
        .config_dir(dir.join("config"))
        .fs_driver(driver)
        .client_builder(Arc::new(client))
        .mounter(Arc::new(mounter))
        .build()
}

/// Binds the daemon's API socket so connection checks pass.
pub fn listen(d: &Daemon) -> Result<UnixListener> {
    Ok(UnixListener::bind(d.api_socket())?)
}
