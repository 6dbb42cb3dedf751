//! Termination of a daemon process and cleanup of what it leaves behind.

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use super::config::FsDriver;
use super::daemon::Daemon;

impl Daemon {
    /// Sends SIGTERM to the daemon process.
    ///
    /// A daemon whose PID was lost (recorded as 0) cannot be signalled; the
    /// caller falls back to unmounting its mountpoints.
    pub fn terminate(&self) -> Result<()> {
        let states = self.lock_states();
        let pid = states.process_id;
        if pid <= 0 {
            warn!(
                "daemon {} has no known pid, skip signalling it",
                states.id
            );
            return Ok(());
        }

        signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
            .with_context(|| format!("send SIGTERM signal to process {}", pid))?;
        info!("sent SIGTERM to daemon {} process {}", states.id, pid);
        Ok(())
    }

    /// Blocks until the daemon process exits, then until its host
    /// mountpoint is gone.
    ///
    /// A process that is not our child (the manager restarted since it was
    /// spawned) is not an error.
    pub fn wait(&self) -> Result<()> {
        let pid = self.pid();
        if pid <= 0 {
            debug!("daemon {} has no known pid, nothing to wait for", self.id());
            return Ok(());
        }

        loop {
            match waitpid(Pid::from_raw(pid), None) {
                Ok(status) => {
                    info!("daemon {} process {} exited, {:?}", self.id(), pid, status);
                    break;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    debug!("process {} is not a child of ours", pid);
                    break;
                }
                Err(e) => {
                    error!("failed to wait for process {}, {}", pid, e);
                    return Ok(());
                }
            }
        }

        let mountpoint = self.host_mountpoint();
        if !mountpoint.as_os_str().is_empty() {
            if let Err(e) = self.wait_until_unmounted(&mountpoint) {
                error!("umount {}, {:#}", mountpoint.display(), e);
            }
        }
        Ok(())
    }

    fn wait_until_unmounted(&self, mountpoint: &Path) -> Result<()> {
        self.retry_policy().run(|| {
            if self.mounter().is_mounted(mountpoint)? {
                bail!("{} is still mounted", mountpoint.display());
            }
            Ok(())
        })
    }

    /// Tears down what a dead daemon left behind before a new one starts.
    ///
    /// Every step is best-effort: failures are logged and the next step runs.
    pub fn clear_vestige(&self) {
        match self.fs_driver() {
            FsDriver::Fscache => {
                for instance in self.instances().list() {
                    let mountpoint = instance.mountpoint();
                    if let Err(e) = self.mounter().umount(mountpoint) {
                        warn!("Can't umount {}, {:#}", mountpoint.display(), e);
                    }
                }
            }
            FsDriver::Fuse => {
                let mountpoint = self.host_mountpoint();
                if mountpoint.as_os_str().is_empty() {
                    debug!("daemon {} owns no host mountpoint", self.id());
                } else {
                    info!("Unmounting {} when clear vestige", mountpoint.display());
                    if let Err(e) = self.mounter().umount(&mountpoint) {
                        warn!("Can't umount {}, {:#}", mountpoint.display(), e);
                    }
                }
            }
        }

        // A leftover socket with no listener is what a new daemon takes as
        // a request to fail over.
        let sock = self.api_socket();
        match fs::remove_file(&sock) {
            Ok(()) => debug!("removed residual socket {}", sock.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Can't delete residual unix socket {}, {}", sock.display(), e),
        }

        self.reset_client();
    }
}
