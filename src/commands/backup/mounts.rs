#[cfg(unix)]
use std::os::unix::fs::DirBuilderExt;
use std::{
    collections::BTreeMap,
    fs::DirBuilder,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::anyhow;
use tracing as log;

use crate::{error::BackupError, prism::PrismPort, tooling::MountPort};

#[derive(Debug, Clone)]
pub struct MountedContainer {
    pub name: String,
    pub path: PathBuf,
    pub mounted: bool,
}

#[derive(Debug, Default)]
pub struct TeardownReport {
    pub unmounted: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

impl TeardownReport {
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Maps storage container ids to read-only NFS mounts under `mount_root`.
///
/// Each container is mounted at most once per run and unmounted by
/// [`MountManager::teardown_all`], or on drop if teardown never ran.
pub struct MountManager {
    prism: Arc<dyn PrismPort>,
    nfs: Arc<dyn MountPort>,
    server: String,
    mount_root: PathBuf,
    containers: BTreeMap<String, MountedContainer>,
}

impl MountManager {
    pub fn new(
        prism: Arc<dyn PrismPort>,
        nfs: Arc<dyn MountPort>,
        server: impl Into<String>,
        mount_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prism,
            nfs,
            server: server.into(),
            mount_root: mount_root.into(),
            containers: BTreeMap::new(),
        }
    }

    /// Local directory holding the contents of container `container_uuid`.
    pub fn resolve_path(&mut self, container_uuid: &str) -> Result<PathBuf, BackupError> {
        if let Some(c) = self.containers.get(container_uuid) {
            return Ok(c.path.clone());
        }

        let name = self.prism.container_name(container_uuid)?;
        let path = self.mount_point(&name)?;
        create_mount_dir(&path)?;

        let busy = self.nfs.is_mounted(&path).map_err(|source| BackupError::MountFailure {
            export: self.export(&name),
            path: path.clone(),
            source,
        })?;
        if busy {
            return Err(BackupError::MountConflict { path });
        }

        let export = self.export(&name);
        log::info!("[mount] {} -> {}", export, path.display());
        self.nfs
            .mount_ro(&export, &path)
            .map_err(|source| BackupError::MountFailure {
                export,
                path: path.clone(),
                source,
            })?;

        self.containers.insert(
            container_uuid.to_string(),
            MountedContainer {
                name,
                path: path.clone(),
                mounted: true,
            },
        );
        Ok(path)
    }

    /// Unmounts everything this manager mounted, carrying on past failures.
    pub fn teardown_all(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        for c in self.containers.values_mut().filter(|c| c.mounted) {
            c.mounted = false;
            match self.nfs.unmount(&c.path) {
                Ok(()) => {
                    log::info!("[mount] unmounted {} from {}", c.name, c.path.display());
                    report.unmounted.push(c.path.clone());
                }
                Err(e) => {
                    log::error!("[mount] umount {} failed: {e:#}", c.path.display());
                    report.failures.push((c.path.clone(), format!("{e:#}")));
                }
            }
        }
        report
    }

    /// `mount_root/<name>`; the name must be a single plain path component.
    fn mount_point(&self, container_name: &str) -> Result<PathBuf, BackupError> {
        let plain = !container_name.is_empty()
            && container_name != "."
            && container_name != ".."
            && !container_name.contains(['/', '\0']);
        if !plain {
            return Err(BackupError::MountFailure {
                export: self.export(container_name),
                path: self.mount_root.clone(),
                source: anyhow!("refusing container name {container_name:?}"),
            });
        }
        Ok(self.mount_root.join(container_name))
    }

    #[inline]
    fn export(&self, container_name: &str) -> String {
        format!("{}:/{}", self.server, container_name)
    }
}

impl Drop for MountManager {
    fn drop(&mut self) {
        if self.containers.values().any(|c| c.mounted) {
            log::warn!("[mount] teardown did not run, unmounting leftovers");
            let _ = self.teardown_all();
        }
    }
}

fn create_mount_dir(path: &Path) -> Result<(), BackupError> {
    let mut b = DirBuilder::new();
    b.recursive(true);
    #[cfg(unix)]
    {
        b.mode(0o750);
    }
    b.create(path)
        .map_err(|e| BackupError::io(format!("create mount point {}", path.display()), e))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
    };

    use anyhow::{Result, bail};
    use tempfile::TempDir;

    use super::*;
    use crate::prism::testing::FakePrism;

    /// Keeps its own mount table; paths in `preexisting` start out mounted.
    #[derive(Default)]
    pub struct MockNfs {
        pub table: Mutex<HashSet<PathBuf>>,
        pub mounts: Mutex<Vec<(String, PathBuf)>>,
        pub unmounts: Mutex<Vec<PathBuf>>,
        pub fail_mount: bool,
        pub fail_unmount: HashSet<PathBuf>,
    }

    impl MockNfs {
        pub fn mount_count(&self) -> usize {
            self.mounts.lock().unwrap().len()
        }

        pub fn preexisting(self, path: PathBuf) -> Self {
            self.table.lock().unwrap().insert(path);
            self
        }
    }

    impl MountPort for MockNfs {
        fn is_mounted(&self, path: &Path) -> Result<bool> {
            Ok(self.table.lock().unwrap().contains(path))
        }

        fn mount_ro(&self, export: &str, path: &Path) -> Result<()> {
            if self.fail_mount {
                bail!("mount.nfs: access denied by server");
            }
            self.mounts
                .lock()
                .unwrap()
                .push((export.to_string(), path.to_path_buf()));
            self.table.lock().unwrap().insert(path.to_path_buf());
            Ok(())
        }

        fn unmount(&self, path: &Path) -> Result<()> {
            self.unmounts.lock().unwrap().push(path.to_path_buf());
            if self.fail_unmount.contains(path) {
                bail!("umount: target is busy");
            }
            self.table.lock().unwrap().remove(path);
            Ok(())
        }
    }

    pub fn prism_with_containers(pairs: &[(&str, &str)]) -> FakePrism {
        FakePrism {
            containers: pairs
                .iter()
                .map(|(id, name)| (id.to_string(), name.to_string()))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        }
    }

    fn manager(prism: Arc<FakePrism>, nfs: Arc<MockNfs>, root: &Path) -> MountManager {
        MountManager::new(prism, nfs, "10.0.0.10", root)
    }

    #[test]
    fn resolve_path_mounts_once_and_caches() {
        let tmp = TempDir::new().unwrap();
        let prism = Arc::new(prism_with_containers(&[("ctr-1", "default-ctr")]));
        let nfs = Arc::new(MockNfs::default());
        let mut mm = manager(prism.clone(), nfs.clone(), tmp.path());

        let a = mm.resolve_path("ctr-1").unwrap();
        let b = mm.resolve_path("ctr-1").unwrap();

        assert_eq!(a, b);
        assert_eq!(a, tmp.path().join("default-ctr"));
        assert!(a.is_dir());
        assert_eq!(nfs.mount_count(), 1);
        assert_eq!(prism.count("container_name"), 1);
        assert_eq!(
            nfs.mounts.lock().unwrap()[0].0,
            "10.0.0.10:/default-ctr".to_string()
        );

        let report = mm.teardown_all();
        assert_eq!(report.unmounted, vec![a]);
        assert!(report.is_clean());
    }

    #[test]
    #[cfg(unix)]
    fn mount_dir_is_created_0750() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let prism = Arc::new(prism_with_containers(&[("ctr-1", "c1")]));
        let mut mm = manager(prism, Arc::new(MockNfs::default()), tmp.path());
        let p = mm.resolve_path("ctr-1").unwrap();
        let mode = std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        // umask may only clear bits
        assert_eq!(mode & !0o750, 0);
    }

    #[test]
    fn already_mounted_path_is_a_conflict() {
        let tmp = TempDir::new().unwrap();
        let prism = Arc::new(prism_with_containers(&[("ctr-1", "c1")]));
        let nfs = Arc::new(MockNfs::default().preexisting(tmp.path().join("c1")));
        let mut mm = manager(prism, nfs.clone(), tmp.path());

        let err = mm.resolve_path("ctr-1").unwrap_err();
        assert!(matches!(err, BackupError::MountConflict { .. }), "{err:?}");
        assert_eq!(nfs.mount_count(), 0);

        // Nothing of ours to undo.
        assert!(mm.teardown_all().unmounted.is_empty());
    }

    #[test]
    fn unknown_container_propagates_api_error() {
        let tmp = TempDir::new().unwrap();
        let prism = Arc::new(FakePrism::default());
        let mut mm = manager(prism, Arc::new(MockNfs::default()), tmp.path());
        let err = mm.resolve_path("ctr-x").unwrap_err();
        assert!(matches!(err, BackupError::Api { status: 404, .. }), "{err:?}");
    }

    #[test]
    fn container_names_cannot_leave_the_mount_root() {
        let tmp = TempDir::new().unwrap();
        let outside = tmp.path().join("outside");
        let root = tmp.path().join("mnt");
        let ids = ["c0", "c1", "c2", "c3", "c4", "c5"];
        let names = [outside.to_str().unwrap(), "", ".", "..", "../etc", "a/b"];
        let pairs: Vec<_> = ids.into_iter().zip(names).collect();
        let prism = Arc::new(prism_with_containers(&pairs));
        let nfs = Arc::new(MockNfs::default());
        let mut mm = manager(prism, nfs.clone(), &root);

        for id in ids {
            match mm.resolve_path(id) {
                Err(BackupError::MountFailure { path, .. }) => assert_eq!(path, root),
                other => panic!("{id}: unexpected: {other:?}"),
            }
        }
        assert_eq!(nfs.mount_count(), 0);
        assert!(!outside.exists());
    }

    #[test]
    fn mount_failure_is_typed_and_not_cached() {
        let tmp = TempDir::new().unwrap();
        let prism = Arc::new(prism_with_containers(&[("ctr-1", "c1")]));
        let nfs = Arc::new(MockNfs {
            fail_mount: true,
            ..Default::default()
        });
        let mut mm = manager(prism.clone(), nfs, tmp.path());

        match mm.resolve_path("ctr-1") {
            Err(BackupError::MountFailure { export, .. }) => assert_eq!(export, "10.0.0.10:/c1"),
            other => panic!("unexpected: {other:?}"),
        }
        let _ = mm.resolve_path("ctr-1");
        assert_eq!(prism.count("container_name"), 2);
    }

    #[test]
    fn teardown_continues_past_failures() {
        let tmp = TempDir::new().unwrap();
        let prism = Arc::new(prism_with_containers(&[
            ("ctr-1", "c1"),
            ("ctr-2", "c2"),
            ("ctr-3", "c3"),
        ]));
        let nfs = Arc::new(MockNfs {
            fail_unmount: [tmp.path().join("c1")].into_iter().collect(),
            ..Default::default()
        });
        let mut mm = manager(prism, nfs.clone(), tmp.path());
        for id in ["ctr-1", "ctr-2", "ctr-3"] {
            mm.resolve_path(id).unwrap();
        }

        let report = mm.teardown_all();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, tmp.path().join("c1"));
        assert_eq!(report.unmounted.len(), 2);

        // Exactly once: a second teardown and the drop are no-ops.
        assert!(mm.teardown_all().unmounted.is_empty());
        drop(mm);
        assert_eq!(nfs.unmounts.lock().unwrap().len(), 3);
    }

    #[test]
    fn drop_unmounts_leftovers() {
        let tmp = TempDir::new().unwrap();
        let prism = Arc::new(prism_with_containers(&[("ctr-1", "c1")]));
        let nfs = Arc::new(MockNfs::default());
        {
            let mut mm = manager(prism, nfs.clone(), tmp.path());
            mm.resolve_path("ctr-1").unwrap();
        }
        assert_eq!(
            nfs.unmounts.lock().unwrap().as_slice(),
            &[tmp.path().join("c1")]
        );
    }
}
