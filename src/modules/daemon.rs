//! The daemon aggregate.
//!
//! A [`Daemon`] stands for one externally spawned filesystem service
//! process. It tracks the instances the process serves, caches the state the
//! process last reported and lazily builds the control-plane handle used to
//! talk to it.
//!
//! Two locks are involved and never nested state-then-connection:
//!
//! - the state lock guards the descriptor record, the cached state and the
//!   version info;
//! - the connection lock guards construction and reset of the client, so a
//!   connection attempt waiting for the socket never blocks state readers.
//!
//! The reference count is a plain atomic next to both.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use super::client::{ClientBuilder, DaemonClient, UnixClientBuilder};
use super::config::{DaemonConfig, DaemonMode, FsDriver};
use super::constants::{API_SOCKET_FILE_NAME, CONFIG_FILE_NAME, LOG_FILE_NAME, SHARED_DAEMON_ID};
use super::errors::DaemonError;
use super::instance::{Instance, InstanceRegistry};
use super::mount::{KernelMounter, Mounter};
use super::retry::RetryPolicy;
use super::supervisor::StateSupervisor;
use super::types::{BuildTimeInfo, CacheMetrics, DaemonInfo, DaemonState, FsMetrics, InflightMetrics};

/// Identity and descriptors of a daemon process.
///
/// This is the part of a daemon an outer store persists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonStates {
    /// Unique ID generated for the daemon
    pub id: String,
    /// OS process ID, 0 when unknown
    #[serde(default)]
    pub process_id: i32,
    /// Control socket
    pub api_socket: PathBuf,
    /// Log directory
    #[serde(default)]
    pub log_dir: PathBuf,
    /// Log level passed to the daemon
    #[serde(default)]
    pub log_level: String,
    /// Whether the daemon logs to stdout instead of its log file
    #[serde(default)]
    pub log_to_stdout: bool,
    /// Dedicated or shared
    #[serde(default)]
    pub daemon_mode: DaemonMode,
    /// Mount driver
    #[serde(default)]
    pub fs_driver: FsDriver,
    /// Host mountpoint, only used by the fuse driver
    #[serde(default)]
    pub mountpoint: PathBuf,
    /// Worker thread hint
    #[serde(default)]
    pub thread_num: usize,
    /// Directory holding per-instance configuration files
    #[serde(default)]
    pub config_dir: PathBuf,
    /// Supervisor socket used for failover
    #[serde(default)]
    pub supervisor_path: Option<PathBuf>,
}

struct RuntimeState {
    states: DaemonStates,
    state: DaemonState,
    version: BuildTimeInfo,
    startup_cpu_utilization: f64,
}

/// A managed filesystem service process.
pub struct Daemon {
    id: String,
    inner: Mutex<RuntimeState>,
    instances: InstanceRegistry,
    ref_count: AtomicI32,
    client: Mutex<Option<Arc<dyn DaemonClient>>>,
    client_builder: Arc<dyn ClientBuilder>,
    mounter: Arc<dyn Mounter>,
    supervisor: Option<Arc<dyn StateSupervisor>>,
    config: Option<DaemonConfig>,
    retry: RetryPolicy,
}

/// Builds a [`Daemon`].
pub struct DaemonBuilder {
    states: DaemonStates,
    socket_dir: Option<PathBuf>,
    config_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    ref_count: i32,
    client_builder: Option<Arc<dyn ClientBuilder>>,
    mounter: Option<Arc<dyn Mounter>>,
    supervisor: Option<Arc<dyn StateSupervisor>>,
    config: Option<DaemonConfig>,
    retry: RetryPolicy,
}

impl Default for DaemonBuilder {
    fn default() -> Self {
        Self::from_states(DaemonStates::default())
    }
}

impl DaemonBuilder {
    /// Starts from a previously recorded descriptor, e.g. on recovery.
    pub fn from_states(states: DaemonStates) -> Self {
        Self {
            states,
            socket_dir: None,
            config_dir: None,
            log_dir: None,
            ref_count: 0,
            client_builder: None,
            mounter: None,
            supervisor: None,
            config: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Uses a fixed ID instead of a generated one.
    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.states.id = id.into();
        self
    }

    /// Records the OS process ID.
    pub fn pid(mut self, pid: i32) -> Self {
        self.states.process_id = pid;
        self
    }

    /// Places the control socket at `<dir>/<id>/api.sock`.
    pub fn socket_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    /// Uses an explicit control socket path.
    pub fn api_socket<P: Into<PathBuf>>(mut self, sock: P) -> Self {
        self.states.api_socket = sock.into();
        self
    }

    /// Keeps per-instance configuration below `<dir>/<id>/`.
    pub fn config_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Writes daemon logs below `<dir>/<id>/`.
    pub fn log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Log level passed to the daemon.
    pub fn log_level<S: Into<String>>(mut self, level: S) -> Self {
        self.states.log_level = level.into();
        self
    }

    /// Lets the daemon log to stdout.
    pub fn log_to_stdout(mut self, yes: bool) -> Self {
        self.states.log_to_stdout = yes;
        self
    }

    /// Dedicated or shared.
    pub fn daemon_mode(mut self, mode: DaemonMode) -> Self {
        self.states.daemon_mode = mode;
        self
    }

    /// Mount driver.
    pub fn fs_driver(mut self, driver: FsDriver) -> Self {
        self.states.fs_driver = driver;
        self
    }

    /// Host mountpoint for the fuse driver.
    pub fn mountpoint<P: Into<PathBuf>>(mut self, mountpoint: P) -> Self {
        self.states.mountpoint = mountpoint.into();
        self
    }

    /// Worker thread hint.
    pub fn thread_num(mut self, n: usize) -> Self {
        self.states.thread_num = n;
        self
    }

    /// Initial reference count, e.g. when recovering attached instances.
    pub fn ref_count(mut self, n: i32) -> Self {
        self.ref_count = n.max(0);
        self
    }

    /// Supervisor receiving state snapshots for failover.
    pub fn supervisor(mut self, su: Arc<dyn StateSupervisor>) -> Self {
        self.supervisor = Some(su);
        self
    }

    /// Records the supervisor socket path.
    pub fn supervisor_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.states.supervisor_path = Some(path.into());
        self
    }

    /// Control-plane handle factory.
    pub fn client_builder(mut self, builder: Arc<dyn ClientBuilder>) -> Self {
        self.client_builder = Some(builder);
        self
    }

    /// Kernel mount driver.
    pub fn mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = Some(mounter);
        self
    }

    /// Daemon configuration template.
    pub fn config(mut self, config: DaemonConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Retry discipline for bounded waits.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Creates the daemon, preparing its directories.
    pub fn build(self) -> Result<Daemon> {
        let mut states = self.states;
        if states.id.is_empty() {
            states.id = match states.daemon_mode {
                DaemonMode::Shared => SHARED_DAEMON_ID.to_string(),
                DaemonMode::Dedicated => Uuid::new_v4().to_string(),
            };
        }

        if let Some(dir) = self.socket_dir {
            let dir = dir.join(&states.id);
            fs::create_dir_all(&dir)
                .with_context(|| format!("create socket dir {}", dir.display()))?;
            states.api_socket = dir.join(API_SOCKET_FILE_NAME);
        }
        if let Some(dir) = self.config_dir {
            let dir = dir.join(&states.id);
            fs::create_dir_all(&dir)
                .with_context(|| format!("create config dir {}", dir.display()))?;
            states.config_dir = dir;
        }
        if let Some(dir) = self.log_dir {
            let dir = dir.join(&states.id);
            fs::create_dir_all(&dir)
                .with_context(|| format!("create log dir {}", dir.display()))?;
            states.log_dir = dir;
        }

        if states.api_socket.as_os_str().is_empty() {
            bail!("daemon {} has no api socket", states.id);
        }
        if let Some(cfg) = &self.config {
            if cfg.driver() != states.fs_driver {
                return Err(DaemonError::UnexpectedConfig {
                    driver: states.fs_driver.to_string(),
                }
                .into());
            }
        }

        debug!(
            "new daemon {} mode {} driver {} socket {}",
            states.id,
            states.daemon_mode,
            states.fs_driver,
            states.api_socket.display()
        );

        Ok(Daemon {
            id: states.id.clone(),
            inner: Mutex::new(RuntimeState {
                states,
                state: DaemonState::Unknown,
                version: BuildTimeInfo::default(),
                startup_cpu_utilization: 0.0,
            }),
            instances: InstanceRegistry::new(),
            ref_count: AtomicI32::new(self.ref_count),
            client: Mutex::new(None),
            client_builder: self
                .client_builder
                .unwrap_or_else(|| Arc::new(UnixClientBuilder)),
            mounter: self.mounter.unwrap_or_else(|| Arc::new(KernelMounter)),
            supervisor: self.supervisor,
            config: self.config,
            retry: self.retry,
        })
    }
}

impl Daemon {
    /// Starts building a daemon.
    pub fn builder() -> DaemonBuilder {
        DaemonBuilder::default()
    }

    /// Daemon ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// OS process ID, 0 when unknown.
    pub fn pid(&self) -> i32 {
        self.inner.lock().states.process_id
    }

    /// Records the OS process ID, e.g. after (re)spawning the process.
    pub fn set_pid(&self, pid: i32) {
        self.inner.lock().states.process_id = pid;
    }

    /// Copy of the descriptor record.
    pub fn states(&self) -> DaemonStates {
        self.inner.lock().states.clone()
    }

    /// Control socket path.
    pub fn api_socket(&self) -> PathBuf {
        self.inner.lock().states.api_socket.clone()
    }

    /// Log file of the daemon.
    pub fn log_file(&self) -> PathBuf {
        self.inner.lock().states.log_dir.join(LOG_FILE_NAME)
    }

    /// Configuration file of an instance, or of the daemon itself when
    /// `instance_id` is empty.
    pub fn config_file(&self, instance_id: &str) -> PathBuf {
        let dir = self.inner.lock().states.config_dir.clone();
        if instance_id.is_empty() {
            dir.join(CONFIG_FILE_NAME)
        } else {
            dir.join(instance_id).join(CONFIG_FILE_NAME)
        }
    }

    /// Worker thread hint.
    pub fn thread_num(&self) -> usize {
        self.inner.lock().states.thread_num
    }

    /// Host mountpoint, empty when the daemon does not own one.
    pub fn host_mountpoint(&self) -> PathBuf {
        self.inner.lock().states.mountpoint.clone()
    }

    /// Mount driver.
    pub fn fs_driver(&self) -> FsDriver {
        self.inner.lock().states.fs_driver
    }

    /// Dedicated or shared.
    pub fn daemon_mode(&self) -> DaemonMode {
        self.inner.lock().states.daemon_mode
    }

    /// Whether one process serves many instances.
    pub fn is_shared_daemon(&self) -> bool {
        self.daemon_mode() == DaemonMode::Shared
    }

    /// Version last reported by the process.
    pub fn version(&self) -> BuildTimeInfo {
        self.inner.lock().version.clone()
    }

    /// CPU utilization sampled while the process was starting.
    pub fn startup_cpu_utilization(&self) -> f64 {
        self.inner.lock().startup_cpu_utilization
    }

    /// Records the startup CPU utilization sample.
    pub fn set_startup_cpu_utilization(&self, value: f64) {
        self.inner.lock().startup_cpu_utilization = value;
    }

    /// Daemon configuration template, if any.
    pub fn config(&self) -> Option<&DaemonConfig> {
        self.config.as_ref()
    }

    /// Stores the configuration template as the configuration of `instance_id`.
    pub fn write_instance_config(&self, instance_id: &str) -> Result<PathBuf> {
        let cfg = self
            .config
            .as_ref()
            .ok_or_else(|| anyhow!("daemon {} has no configuration", self.id))?;
        let path = self.config_file(instance_id);
        cfg.dump_file(&path)?;
        Ok(path)
    }

    pub(crate) fn mounter(&self) -> &dyn Mounter {
        self.mounter.as_ref()
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub(crate) fn lock_states(&self) -> MappedMutexGuard<'_, DaemonStates> {
        MutexGuard::map(self.inner.lock(), |inner| &mut inner.states)
    }

    /// Increments the reference count.
    pub fn inc_ref(&self) -> i32 {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the reference count, never below zero.
    pub fn dec_ref(&self) -> i32 {
        match self
            .ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| (v > 0).then(|| v - 1))
        {
            Ok(prev) => prev - 1,
            Err(_) => {
                warn!("daemon {} reference count is already zero", self.id);
                0
            }
        }
    }

    /// Current reference count.
    pub fn get_ref(&self) -> i32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Attaches an instance and stamps its daemon ID.
    pub fn add_instance(&self, instance: Arc<Instance>) {
        instance.set_daemon_id(&self.id);
        // Counted before it becomes visible to remove_instance.
        self.inc_ref();
        if !self.instances.add(instance) {
            self.dec_ref();
        }
    }

    /// Detaches an instance.
    pub fn remove_instance(&self, snapshot_id: &str) -> Option<Arc<Instance>> {
        let removed = self.instances.remove(snapshot_id);
        if removed.is_some() {
            self.dec_ref();
        } else {
            debug!("daemon {} has no instance {}", self.id, snapshot_id);
        }
        removed
    }

    /// Instances served by this daemon.
    pub fn instances(&self) -> &InstanceRegistry {
        &self.instances
    }

    /// Queries the process for its state and caches the result.
    pub fn query_state(&self) -> Result<DaemonState> {
        self.query_state_within(self.retry)
    }

    fn query_state_within(&self, retry: RetryPolicy) -> Result<DaemonState> {
        let client = self.client_within(retry).context("get daemon state")?;
        let info = client
            .daemon_info()
            .with_context(|| format!("query daemon {} state", self.id))?;
        let state = info.daemon_state();

        let mut inner = self.inner.lock();
        inner.state = state;
        inner.version = info.daemon_version();
        Ok(state)
    }

    /// Cached state, no I/O.
    pub fn state(&self) -> DaemonState {
        self.inner.lock().state
    }

    /// Forgets the cached state.
    pub fn reset_state(&self) {
        self.inner.lock().state = DaemonState::Unknown;
    }

    /// Waits until the process reports `expected`, bounded by the retry policy.
    pub fn wait_until_state(&self, expected: DaemonState) -> Result<()> {
        self.retry.run(|| {
            if self.state() == expected {
                return Ok(());
            }

            // A single socket check per round.
            let state = self
                .query_state_within(RetryPolicy::new(1, self.retry.delay))
                .with_context(|| format!("wait until daemon is {}", expected))?;
            if state != expected {
                bail!(
                    "daemon {} is not {} yet, current state {}",
                    self.id,
                    expected,
                    state
                );
            }
            Ok(())
        })
    }

    /// Returns the control-plane handle, building it on first use.
    pub fn client(&self) -> Result<Arc<dyn DaemonClient>> {
        self.client_within(self.retry)
    }

    fn client_within(&self, retry: RetryPolicy) -> Result<Arc<dyn DaemonClient>> {
        let mut client = self.client.lock();
        if let Some(c) = client.as_ref() {
            return Ok(c.clone());
        }

        let sock = self.api_socket();
        // The socket file may be left over by a dead daemon.
        if let Err(e) = self.wait_until_socket_existed(&sock, retry) {
            debug!("daemon {} socket is not ready: {:#}", self.id, e);
            return Err(DaemonError::SocketNotFound {
                socket: sock,
                pid: self.pid(),
            }
            .into());
        }

        let built = self
            .client_builder
            .build(&sock)
            .with_context(|| format!("create daemon {} client", self.id))?;
        *client = Some(built.clone());
        Ok(built)
    }

    /// Drops the cached handle; the next [`Daemon::client`] builds a new one.
    pub fn reset_client(&self) {
        *self.client.lock() = None;
    }

    fn wait_until_socket_existed(&self, sock: &Path, retry: RetryPolicy) -> Result<()> {
        retry.run(|| {
            let meta = fs::metadata(sock)
                .with_context(|| format!("stat socket {}", sock.display()))?;
            if !meta.file_type().is_socket() {
                bail!("file {} is not a socket", sock.display());
            }
            UnixStream::connect(sock)
                .with_context(|| format!("connect to socket {}", sock.display()))?;
            Ok(())
        })
    }

    /// Notifies the supervisor so it holds an up-to-date state snapshot.
    ///
    /// Failures are logged only.
    pub fn send_states(&self) {
        let Some(su) = &self.supervisor else {
            return;
        };
        let result = su.fetch_daemon_states(&|| {
            self.do_send_states()
                .with_context(|| format!("send daemon {} states", self.id))
        });
        if let Err(e) = result {
            warn!("daemon {} does not support sending states, {:#}", self.id, e);
        }
    }

    fn do_send_states(&self) -> Result<()> {
        let client = self
            .client()
            .with_context(|| format!("send states {}", self.id))?;
        client.send_fd().context("request to send states")
    }

    /// Makes a freshly started process adopt its predecessor's state.
    pub fn take_over(&self) -> Result<()> {
        let client = self
            .client()
            .with_context(|| format!("takeover daemon {}", self.id))?;
        client.take_over().context("request to take over")?;
        info!("daemon {} took over", self.id);
        Ok(())
    }

    /// Asks the process to begin serving.
    pub fn start(&self) -> Result<()> {
        let client = self
            .client()
            .with_context(|| format!("start daemon {}", self.id))?;
        client.start().context("request to start service")
    }

    /// Asks the process to exit gracefully.
    pub fn exit(&self) -> Result<()> {
        let client = self
            .client()
            .with_context(|| format!("exit daemon {}", self.id))?;
        client.exit().context("request to exit service")
    }

    /// Daemon information, without touching the cached state.
    pub fn daemon_info(&self) -> Result<DaemonInfo> {
        let client = self.client().context("get daemon information")?;
        client.daemon_info()
    }

    /// Filesystem counters of one instance, or of all when `id` is `None`.
    pub fn fs_metrics(&self, id: Option<&str>) -> Result<FsMetrics> {
        let client = self.client().context("get fs metrics")?;
        client.fs_metrics(id)
    }

    /// Operations in flight.
    pub fn inflight_metrics(&self) -> Result<InflightMetrics> {
        let client = self.client().context("get inflight metrics")?;
        client.inflight_metrics()
    }

    /// Blob cache counters of one instance, or of all when `id` is `None`.
    pub fn cache_metrics(&self, id: Option<&str>) -> Result<CacheMetrics> {
        let client = self.client().context("get cache metrics")?;
        client.cache_metrics(id)
    }
}
