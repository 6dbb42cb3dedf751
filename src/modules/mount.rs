//! Mount orchestration for instances served by a daemon.
//!
//! Callers use [`Daemon::shared_mount`] and [`Daemon::shared_umount`]
//! whatever the driver is:
//!
//! - `fuse`: the daemon mounts the instance below its host mountpoint when
//!   asked over the control plane.
//! - `fscache`: the blob is bound into the kernel cache over the control
//!   plane, then erofs is mounted directly by this process.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use procfs::process::Process;
use sha2::{Digest, Sha256};
use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use super::config::{DaemonConfig, FsDriver};
use super::constants::{ANNO_FSCACHE_DOMAIN_ID, ANNO_FSCACHE_ID, DEFAULT_PERMISSION};
use super::daemon::Daemon;
use super::errors::DaemonError;
use super::instance::Instance;

/// Direct kernel mount operations.
pub trait Mounter: Send + Sync {
    /// Mounts erofs backed by the fscache object `fscache_id` on `target`.
    ///
    /// Fails with [`DaemonError::AlreadyMounted`] when the target is busy.
    fn mount_erofs(
        &self,
        bootstrap: &Path,
        domain_id: &str,
        fscache_id: &str,
        target: &Path,
    ) -> Result<()>;

    /// Unmounts `target`.
    fn umount(&self, target: &Path) -> Result<()>;

    /// Whether `target` is currently a mountpoint.
    fn is_mounted(&self, target: &Path) -> Result<bool>;
}

/// [`Mounter`] issuing mount syscalls on the host.
#[derive(Debug, Clone, Default)]
pub struct KernelMounter;

impl Mounter for KernelMounter {
    fn mount_erofs(
        &self,
        bootstrap: &Path,
        domain_id: &str,
        fscache_id: &str,
        target: &Path,
    ) -> Result<()> {
        let opts = if domain_id.is_empty() {
            format!("fsid={}", fscache_id)
        } else {
            format!("domain_id={},fsid={}", domain_id, fscache_id)
        };
        info!(
            "Mount erofs to {} with options {} (bootstrap {})",
            target.display(),
            opts,
            bootstrap.display()
        );

        match mount(
            Some("erofs"),
            target,
            Some("erofs"),
            MsFlags::empty(),
            Some(opts.as_str()),
        ) {
            Ok(()) => Ok(()),
            Err(Errno::EBUSY) => Err(DaemonError::AlreadyMounted(target.to_path_buf()).into()),
            Err(e) => Err(e).with_context(|| format!("mount erofs to {}", target.display())),
        }
    }

    fn umount(&self, target: &Path) -> Result<()> {
        umount2(target, MntFlags::empty())
            .with_context(|| format!("umount {}", target.display()))
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let target = match fs::canonicalize(target) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("resolve {}", target.display())),
        };
        let mounts = Process::myself()
            .and_then(|p| p.mountinfo())
            .context("read mountinfo")?;
        Ok(mounts.into_iter().any(|m| m.mount_point == target))
    }
}

/// Kernel cache object ID derived from a snapshot ID.
pub fn fscache_id(snapshot_id: &str) -> String {
    let digest = Sha256::digest(format!("lilypad-snapshot-{}", snapshot_id).as_bytes());
    hex::encode(digest)
}

fn ensure_dir(path: &Path) -> Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(DEFAULT_PERMISSION)
        .create(path)
        .with_context(|| format!("create directory {}", path.display()))
}

fn fscache_annotations(instance: &Instance) -> Result<(String, String), DaemonError> {
    let annotation = |key: &'static str| {
        instance
            .annotation(key)
            .ok_or_else(|| DaemonError::MissingAnnotation {
                snapshot_id: instance.snapshot_id.clone(),
                key,
            })
    };
    Ok((annotation(ANNO_FSCACHE_DOMAIN_ID)?, annotation(ANNO_FSCACHE_ID)?))
}

impl Daemon {
    /// Mounts `instance` through the daemon's driver.
    ///
    /// The supervisor, if any, is sent a fresh state snapshot afterwards,
    /// whether the mount succeeded or not.
    pub fn shared_mount(&self, instance: &Instance) -> Result<()> {
        let result = match self.fs_driver() {
            FsDriver::Fscache => self
                .shared_erofs_mount(instance)
                .with_context(|| format!("mount erofs instance {}", instance.snapshot_id)),
            FsDriver::Fuse => self
                .shared_fuse_mount(instance)
                .with_context(|| format!("mount instance {}", instance.snapshot_id)),
        };
        self.send_states();
        result
    }

    /// Unmounts `instance` through the daemon's driver.
    pub fn shared_umount(&self, instance: &Instance) -> Result<()> {
        let result = match self.fs_driver() {
            FsDriver::Fscache => self
                .shared_erofs_umount(instance)
                .with_context(|| format!("umount erofs instance {}", instance.snapshot_id)),
            FsDriver::Fuse => self
                .shared_fuse_umount(instance)
                .with_context(|| format!("umount instance {}", instance.snapshot_id)),
        };
        self.send_states();
        result
    }

    fn reload_instance_config(&self, instance: &Instance) -> Result<DaemonConfig> {
        let path = self.config_file(&instance.snapshot_id);
        DaemonConfig::load(self.fs_driver(), &path)
            .with_context(|| format!("reload instance configuration {}", path.display()))
    }

    fn shared_fuse_mount(&self, instance: &Instance) -> Result<()> {
        let client = self.client()?;
        let bootstrap = instance.bootstrap_file()?;
        let cfg = self
            .reload_instance_config(instance)?
            .dump_string()
            .context("dump instance configuration")?;

        client
            .mount(&instance.rela_mountpoint(), &bootstrap, &cfg)
            .context("request to mount instance")?;
        info!(
            "daemon {} mounted instance {} at {}",
            self.id(),
            instance.snapshot_id,
            instance.rela_mountpoint()
        );
        Ok(())
    }

    fn shared_fuse_umount(&self, instance: &Instance) -> Result<()> {
        let client = self.client()?;
        client
            .umount(&instance.rela_mountpoint())
            .context("request to umount instance")?;
        info!(
            "daemon {} unmounted instance {}",
            self.id(),
            instance.snapshot_id
        );
        Ok(())
    }

    fn shared_erofs_mount(&self, instance: &Instance) -> Result<()> {
        let client = self
            .client()
            .with_context(|| format!("bind blob {}", self.id()))?;

        ensure_dir(&instance.fscache_work_dir())?;

        let cfg = self.reload_instance_config(instance)?;
        let cfg_str = cfg.dump_string().context("dump instance configuration")?;
        client
            .bind_blob(&cfg_str)
            .context("request to bind fscache blob")?;

        let mountpoint = instance.mountpoint();
        ensure_dir(mountpoint)?;

        let bootstrap = instance.bootstrap_file()?;
        let fscache_id = fscache_id(&instance.snapshot_id);
        let domain_id = cfg.as_fscache()?.domain_id.clone();

        instance.add_annotation(ANNO_FSCACHE_DOMAIN_ID, &domain_id);
        instance.add_annotation(ANNO_FSCACHE_ID, &fscache_id);

        match self
            .mounter()
            .mount_erofs(&bootstrap, &domain_id, &fscache_id, mountpoint)
        {
            Ok(()) => Ok(()),
            // A restarted manager finds mounts left behind by its predecessor.
            Err(e) if super::errors::is_already_mounted(&e) => {
                warn!("erofs mountpoint {} has been mounted", mountpoint.display());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn shared_erofs_umount(&self, instance: &Instance) -> Result<()> {
        let client = self
            .client()
            .with_context(|| format!("unbind blob {}", self.id()))?;

        // Without annotations nothing was bound, or it was already released.
        let (domain_id, fscache_id) = match fscache_annotations(instance) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("{}, skip unbinding", e);
                return Ok(());
            }
        };

        client
            .unbind_blob(&domain_id, &fscache_id)
            .with_context(|| {
                format!(
                    "request to unbind fscache blob, domain {}, fscache {}",
                    domain_id, fscache_id
                )
            })?;

        let mountpoint = instance.mountpoint();
        self.mounter()
            .umount(mountpoint)
            .with_context(|| format!("umount erofs mountpoint {}", mountpoint.display()))?;

        // Releases the bootstrap cache file.
        if let Err(e) = client.unbind_blob("", &fscache_id) {
            warn!("delete bootstrap {} err {:#}", fscache_id, e);
        }

        instance.remove_annotation(ANNO_FSCACHE_DOMAIN_ID);
        instance.remove_annotation(ANNO_FSCACHE_ID);
        debug!(
            "daemon {} released fscache {} of instance {}",
            self.id(),
            fscache_id,
            instance.snapshot_id
        );
        Ok(())
    }
}
