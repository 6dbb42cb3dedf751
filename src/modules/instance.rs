//! Filesystem instances and the registry a daemon keeps them in.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::errors::DaemonError;

/// One mounted container image layer served by a daemon.
#[derive(Debug)]
pub struct Instance {
    /// Snapshot ID, unique per instance
    pub snapshot_id: String,
    /// Image the snapshot belongs to
    pub image_id: String,
    /// Snapshot working directory
    pub snapshot_dir: PathBuf,
    /// Absolute mountpoint of the instance on the host
    pub mountpoint: PathBuf,
    daemon_id: RwLock<String>,
    annotations: RwLock<HashMap<String, String>>,
}

impl Instance {
    /// Creates an instance not yet attached to any daemon.
    pub fn new<S, P, M>(snapshot_id: S, image_id: S, snapshot_dir: P, mountpoint: M) -> Self
    where
        S: Into<String>,
        P: Into<PathBuf>,
        M: Into<PathBuf>,
    {
        Self {
            snapshot_id: snapshot_id.into(),
            image_id: image_id.into(),
            snapshot_dir: snapshot_dir.into(),
            mountpoint: mountpoint.into(),
            daemon_id: RwLock::new(String::new()),
            annotations: RwLock::new(HashMap::new()),
        }
    }

    /// ID of the daemon serving this instance, empty when detached.
    pub fn daemon_id(&self) -> String {
        self.daemon_id.read().clone()
    }

    pub(crate) fn set_daemon_id(&self, id: &str) {
        *self.daemon_id.write() = id.to_string();
    }

    /// Mountpoint relative to the daemon's host mountpoint.
    pub fn rela_mountpoint(&self) -> String {
        format!("/{}", self.snapshot_id)
    }

    /// Absolute mountpoint on the host.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Working directory used by the fscache driver.
    pub fn fscache_work_dir(&self) -> PathBuf {
        self.snapshot_dir.join("fs")
    }

    /// Locates the bootstrap (image metadata) file of this instance.
    pub fn bootstrap_file(&self) -> Result<PathBuf, DaemonError> {
        let fs_dir = self.fscache_work_dir();
        [fs_dir.join("image").join("image.boot"), fs_dir.join("image.boot")]
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| DaemonError::BootstrapNotFound(self.snapshot_dir.clone()))
    }

    /// Records a driver-specific annotation.
    pub fn add_annotation(&self, key: &str, value: &str) {
        self.annotations
            .write()
            .insert(key.to_string(), value.to_string());
    }

    /// Reads an annotation.
    pub fn annotation(&self, key: &str) -> Option<String> {
        self.annotations.read().get(key).cloned()
    }

    /// Drops an annotation, returning its previous value.
    pub fn remove_annotation(&self, key: &str) -> Option<String> {
        self.annotations.write().remove(key)
    }

    /// Copy of all annotations.
    pub fn annotations(&self) -> HashMap<String, String> {
        self.annotations.read().clone()
    }
}

/// Concurrency-safe set of instances keyed by snapshot ID.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, Arc<Instance>>>,
}

impl InstanceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an instance. Returns false if the snapshot ID was already present,
    /// in which case the stored instance is replaced.
    pub fn add(&self, instance: Arc<Instance>) -> bool {
        self.instances
            .write()
            .insert(instance.snapshot_id.clone(), instance)
            .is_none()
    }

    /// Removes an instance, returning it if it was present.
    pub fn remove(&self, snapshot_id: &str) -> Option<Arc<Instance>> {
        self.instances.write().remove(snapshot_id)
    }

    /// Looks an instance up.
    pub fn get(&self, snapshot_id: &str) -> Option<Arc<Instance>> {
        self.instances.read().get(snapshot_id).cloned()
    }

    /// Snapshot of the current instances, ordered by snapshot ID.
    pub fn list(&self) -> Vec<Arc<Instance>> {
        let mut list: Vec<_> = self.instances.read().values().cloned().collect();
        list.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        list
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    /// True when no instance is registered.
    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::thread;

    fn instance(id: &str) -> Arc<Instance> {
        Arc::new(Instance::new(id, "image", format!("/snapshots/{}", id), format!("/mnt/{}", id)))
    }

    #[test]
    fn test_add_remove_list() {
        let registry = InstanceRegistry::new();
        assert!(registry.add(instance("b")));
        assert!(registry.add(instance("a")));
        assert!(!registry.add(instance("a")));

        let ids: Vec<_> = registry.list().iter().map(|i| i.snapshot_id.clone()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("b").is_some());
    }

    #[test]
    fn test_concurrent_add_remove() {
        let registry = Arc::new(InstanceRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("{}-{}", t, i);
                        registry.add(instance(&id));
                        if i % 2 == 0 {
                            registry.remove(&id);
                        }
                        let _ = registry.list();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 25);
    }

    #[test]
    fn test_bootstrap_lookup() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let inst = Instance::new("s1", "image", dir.path(), "/mnt/s1");
        assert!(matches!(
            inst.bootstrap_file(),
            Err(DaemonError::BootstrapNotFound(_))
        ));

        fs::create_dir_all(dir.path().join("fs"))?;
        fs::write(dir.path().join("fs").join("image.boot"), b"boot")?;
        assert_eq!(inst.bootstrap_file()?, dir.path().join("fs").join("image.boot"));

        fs::create_dir_all(dir.path().join("fs").join("image"))?;
        fs::write(dir.path().join("fs").join("image").join("image.boot"), b"boot")?;
        assert_eq!(
            inst.bootstrap_file()?,
            dir.path().join("fs").join("image").join("image.boot")
        );
        assert_eq!(inst.rela_mountpoint(), "/s1");
        Ok(())
    }

    #[test]
    fn test_annotations() {
        let inst = instance("s1");
        inst.add_annotation("k", "v");
        assert_eq!(inst.annotation("k").as_deref(), Some("v"));
        assert_eq!(inst.remove_annotation("k").as_deref(), Some("v"));
        assert!(inst.annotations().is_empty());
    }
}
