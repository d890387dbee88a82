#[cfg(unix)]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::{
    collections::HashSet,
    fmt,
    fs::{DirBuilder, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use time::OffsetDateTime;
use tracing as log;

use super::{
    mounts::{MountManager, TeardownReport},
    target::VirtualMachineBackupTarget,
};
use crate::{
    disk::DiskAddress,
    error::BackupError,
    prism::{PrismPort, SnapshotDescriptor, TaskInfo},
    tooling::TransferPort,
    utils::time::{now, snapshot_stamp},
};

pub const DESCRIPTOR_FILE: &str = "ahv_vm";

/// Where a VM backup stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Start,
    SnapshotCreate,
    SnapshotPoll,
    Validate,
    Transfer(DiskAddress),
    Delete,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Start => f.write_str("start"),
            Stage::SnapshotCreate => f.write_str("snapshot-create"),
            Stage::SnapshotPoll => f.write_str("snapshot-poll"),
            Stage::Validate => f.write_str("validate"),
            Stage::Transfer(addr) => write!(f, "transfer {addr}"),
            Stage::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    Succeeded {
        snapshot_name: String,
        disks: Vec<DiskAddress>,
        warnings: Vec<String>,
    },
    /// Nothing selected, nothing touched.
    Skipped,
    Failed {
        stage: Stage,
        error: BackupError,
        /// Name of the snapshot left on the cluster, once the creation task
        /// has reported it.
        snapshot: Option<String>,
    },
    /// An earlier VM failed and the run stopped before this one.
    NotAttempted,
}

#[derive(Debug)]
pub struct VmReport {
    pub vm: String,
    pub outcome: Outcome,
}

impl VmReport {
    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Outcome::Failed { .. })
    }

    pub fn not_attempted(vm: &str) -> Self {
        Self {
            vm: vm.to_string(),
            outcome: Outcome::NotAttempted,
        }
    }
}

/// Hands out `<vm>_backup_<YYYYMMDD_HHMM>`, suffixed `_2`, `_3`, ... when the
/// name was already issued in this run or its directory already exists.
#[derive(Debug, Default)]
pub struct SnapshotNamer {
    issued: HashSet<String>,
}

impl SnapshotNamer {
    pub fn next(&mut self, vm: &str, backup_root: &Path, at: OffsetDateTime) -> String {
        let base = format!("{vm}_backup_{}", snapshot_stamp(at));
        let mut name = base.clone();
        let mut n = 1;
        while self.issued.contains(&name) || backup_root.join(&name).exists() {
            n += 1;
            name = format!("{base}_{n}");
        }
        self.issued.insert(name.clone());
        name
    }
}

enum State {
    Start,
    SnapshotRequested,
    SnapshotPolling { task: String },
    SnapshotValidated { task: TaskInfo },
    DiskTransferring {
        snapshot: SnapshotDescriptor,
        dir: PathBuf,
        next: usize,
    },
    SnapshotDeleteRequested { snapshot_uuid: String },
    DeletePolling { task: String },
    Done,
}

impl State {
    fn stage(&self, disks: &[DiskAddress]) -> Stage {
        match self {
            State::Start | State::Done => Stage::Start,
            State::SnapshotRequested => Stage::SnapshotCreate,
            State::SnapshotPolling { .. } => Stage::SnapshotPoll,
            State::SnapshotValidated { .. } => Stage::Validate,
            State::DiskTransferring { next, .. } => disks
                .get(*next)
                .cloned()
                .map(Stage::Transfer)
                .unwrap_or(Stage::Delete),
            State::SnapshotDeleteRequested { .. } | State::DeletePolling { .. } => Stage::Delete,
        }
    }
}

/// Per-VM facts gathered while the state machine runs.
struct Progress<'t> {
    target: &'t VirtualMachineBackupTarget,
    vm_uuid: &'t str,
    snapshot_name: Option<String>,
    snapshot_uuid: Option<String>,
    copied: Vec<DiskAddress>,
    warnings: Vec<String>,
}

/// One backup run: shared mounts and names across all VMs of the run.
pub struct BackupRun {
    prism: Arc<dyn PrismPort>,
    rsync: Arc<dyn TransferPort>,
    mounts: MountManager,
    namer: SnapshotNamer,
    backup_root: PathBuf,
    clock: fn() -> OffsetDateTime,
}

impl BackupRun {
    pub fn new(
        prism: Arc<dyn PrismPort>,
        rsync: Arc<dyn TransferPort>,
        mounts: MountManager,
        backup_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prism,
            rsync,
            mounts,
            namer: SnapshotNamer::default(),
            backup_root: backup_root.into(),
            clock: now,
        }
    }

    pub fn backup_vm(&mut self, target: &VirtualMachineBackupTarget) -> VmReport {
        let report = |outcome| VmReport {
            vm: target.name.clone(),
            outcome,
        };

        let Some(vm_uuid) = target.uuid() else {
            return report(Outcome::Failed {
                stage: Stage::Start,
                error: BackupError::ValidationMismatch {
                    detail: format!("VM {} was never resolved on the cluster", target.name),
                },
                snapshot: None,
            });
        };

        let mut p = Progress {
            target,
            vm_uuid,
            snapshot_name: None,
            snapshot_uuid: None,
            copied: Vec::new(),
            warnings: Vec::new(),
        };

        let mut state = State::Start;
        loop {
            if matches!(state, State::Done) {
                break;
            }
            let stage = state.stage(&target.disks);
            state = match self.step(state, &mut p) {
                Ok(next) => next,
                Err(error) => {
                    log::error!(
                        "[backup] {} failed at {stage}: snapshot={} id={}: {}",
                        target.name,
                        p.snapshot_name.as_deref().unwrap_or("-"),
                        p.snapshot_uuid.as_deref().unwrap_or("-"),
                        error_chain(&error)
                    );
                    return report(Outcome::Failed {
                        stage,
                        error,
                        snapshot: p.snapshot_uuid.and(p.snapshot_name),
                    });
                }
            };
        }

        match p.snapshot_name {
            None => {
                log::info!("[backup] {}: no disks selected, skipped", target.name);
                report(Outcome::Skipped)
            }
            Some(snapshot_name) => {
                log::info!(
                    "[backup] {}: {} disk(s) saved as {snapshot_name}",
                    target.name,
                    p.copied.len()
                );
                report(Outcome::Succeeded {
                    snapshot_name,
                    disks: p.copied,
                    warnings: p.warnings,
                })
            }
        }
    }

    /// Unmounts every container mounted during the run.
    pub fn finish(mut self) -> TeardownReport {
        self.mounts.teardown_all()
    }

    fn step(&mut self, state: State, p: &mut Progress<'_>) -> Result<State, BackupError> {
        let target = p.target;
        let vm = target.name.as_str();
        match state {
            State::Start => {
                if target.disks.is_empty() {
                    Ok(State::Done)
                } else {
                    Ok(State::SnapshotRequested)
                }
            }

            State::SnapshotRequested => {
                let name = self.namer.next(vm, &self.backup_root, (self.clock)());
                log::info!("[backup] {vm}: creating snapshot {name}");
                p.snapshot_name = Some(name.clone());
                let task = self.prism.create_snapshot(p.vm_uuid, &name)?;
                Ok(State::SnapshotPolling { task })
            }

            State::SnapshotPolling { task } => {
                let task = self.prism.poll_task(&task)?;
                Ok(State::SnapshotValidated { task })
            }

            State::SnapshotValidated { task } => {
                let name = p.snapshot_name.clone().unwrap_or_default();
                let snapshot = self.validate(&task, &name, p)?;
                let dir = self.backup_root.join(&name);
                persist_descriptor(&dir, &snapshot)?;
                Ok(State::DiskTransferring {
                    snapshot,
                    dir,
                    next: 0,
                })
            }

            State::DiskTransferring {
                snapshot,
                dir,
                next,
            } => {
                let Some(addr) = target.disks.get(next) else {
                    return Ok(State::SnapshotDeleteRequested {
                        snapshot_uuid: snapshot.uuid,
                    });
                };
                self.transfer_disk(&snapshot, &dir, addr, vm)?;
                p.copied.push(addr.clone());
                Ok(State::DiskTransferring {
                    snapshot,
                    dir,
                    next: next + 1,
                })
            }

            State::SnapshotDeleteRequested { snapshot_uuid } => {
                log::info!("[backup] {vm}: deleting snapshot {snapshot_uuid}");
                match self.prism.delete_snapshot(&snapshot_uuid) {
                    Ok(task) => Ok(State::DeletePolling { task }),
                    Err(e) => {
                        p.warn(format!("snapshot {snapshot_uuid} not deleted: {e}"));
                        Ok(State::Done)
                    }
                }
            }

            State::DeletePolling { task } => {
                if let Err(e) = self.prism.poll_task(&task) {
                    let id = p.snapshot_uuid.as_deref().unwrap_or("-").to_string();
                    p.warn(format!("snapshot {id} deletion did not complete: {e}"));
                }
                Ok(State::Done)
            }

            State::Done => Ok(State::Done),
        }
    }

    /// The snapshot must be the one we asked for, of the VM we asked about.
    fn validate(
        &self,
        task: &TaskInfo,
        name: &str,
        p: &mut Progress<'_>,
    ) -> Result<SnapshotDescriptor, BackupError> {
        let uuid = task
            .snapshot_uuid(name)
            .ok_or_else(|| BackupError::ValidationMismatch {
                detail: format!("task {} reported no snapshot named {name}", task.uuid),
            })?;
        p.snapshot_uuid = Some(uuid.to_string());

        let snapshot = self.prism.get_snapshot(uuid)?;
        let mut problems = Vec::new();
        if snapshot.deleted {
            problems.push("marked deleted".to_string());
        }
        if snapshot.snapshot_name != name {
            problems.push(format!("name {} != {name}", snapshot.snapshot_name));
        }
        if snapshot.vm_uuid != p.vm_uuid {
            problems.push(format!("vm uuid {} != {}", snapshot.vm_uuid, p.vm_uuid));
        }
        if snapshot.vm_name() != p.target.name {
            problems.push(format!(
                "vm name {} != {}",
                snapshot.vm_name(),
                p.target.name
            ));
        }
        if !problems.is_empty() {
            return Err(BackupError::ValidationMismatch {
                detail: format!("snapshot {uuid}: {}", problems.join(", ")),
            });
        }
        log::debug!("[backup] {}: snapshot {uuid} validated", p.target.name);
        Ok(snapshot)
    }

    fn transfer_disk(
        &mut self,
        snapshot: &SnapshotDescriptor,
        dir: &Path,
        addr: &DiskAddress,
        vm: &str,
    ) -> Result<(), BackupError> {
        let not_found = || BackupError::DiskNotFound {
            vm: vm.to_string(),
            disk: addr.clone(),
            snapshot: snapshot.snapshot_name.clone(),
        };
        let (disk_uuid, container_uuid) = snapshot
            .disk(addr)
            .ok_or_else(not_found)?
            .clone_source()
            .ok_or_else(not_found)?;

        let container = self.mounts.resolve_path(container_uuid)?;
        let src = container.join(snapshot.vdisk_path(disk_uuid));
        let dst = dir.join(addr.to_string());

        log::info!("[backup] {vm}: {addr} <- {}", src.display());
        self.rsync
            .copy(&src, &dst)
            .map_err(|source| BackupError::TransferFailure { src, dst, source })
    }
}

impl Progress<'_> {
    fn warn(&mut self, msg: String) {
        log::warn!("[backup] {}: {msg}", self.target.name);
        self.warnings.push(msg);
    }
}

/// Renders an error together with its sources, `a: b: c`.
fn error_chain(e: &BackupError) -> String {
    let mut out = e.to_string();
    let mut cur: Option<&dyn std::error::Error> = std::error::Error::source(e);
    while let Some(s) = cur {
        out.push_str(": ");
        out.push_str(&s.to_string());
        cur = s.source();
    }
    out
}

/// Writes `<dir>/ahv_vm`, tab-indented, creating `dir` if needed.
pub fn persist_descriptor(dir: &Path, snapshot: &SnapshotDescriptor) -> Result<PathBuf, BackupError> {
    let mut b = DirBuilder::new();
    b.recursive(true);
    #[cfg(unix)]
    {
        b.mode(0o750);
    }
    b.create(dir)
        .map_err(|e| BackupError::io(format!("create {}", dir.display()), e))?;

    let mut buf = Vec::new();
    let mut ser = Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"\t"));
    snapshot.serialize(&mut ser).map_err(|e| {
        BackupError::io(format!("serialize snapshot {}", snapshot.uuid), e.into())
    })?;
    buf.push(b'\n');

    let path = dir.join(DESCRIPTOR_FILE);
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        opts.mode(0o640);
    }
    opts.open(&path)
        .and_then(|mut f| f.write_all(&buf))
        .map_err(|e| BackupError::io(format!("write {}", path.display()), e))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Mutex};

    use anyhow::{Result, bail};
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use ::time::macros::datetime;

    use super::*;
    use crate::{
        commands::backup::{mounts::tests::MockNfs, target::tests::vm},
        config::VmPlan,
        prism::testing::FakePrism,
    };

    #[derive(Default)]
    struct MockRsync {
        copies: Mutex<Vec<(PathBuf, PathBuf)>>,
        fail_on: Option<String>,
    }

    impl MockRsync {
        fn count(&self) -> usize {
            self.copies.lock().unwrap().len()
        }
    }

    impl TransferPort for MockRsync {
        fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
            let leaf = dst.file_name().unwrap().to_string_lossy().to_string();
            if self.fail_on.as_deref() == Some(leaf.as_str()) {
                bail!("rsync exited with 23");
            }
            self.copies
                .lock()
                .unwrap()
                .push((src.to_path_buf(), dst.to_path_buf()));
            fs::write(dst, src.display().to_string())?;
            Ok(())
        }
    }

    fn clone_disk(bus: &str, idx: u32, disk: &str, ctr: &str) -> Value {
        json!({
            "diskAddress": {"deviceBus": bus, "deviceIndex": idx},
            "vmDiskClone": {"vmDiskUuid": disk, "containerUuid": ctr, "minimumSize": 1024}
        })
    }

    fn create_disk(bus: &str, idx: u32) -> Value {
        json!({
            "diskAddress": {"deviceBus": bus, "deviceIndex": idx},
            "vmDiskCreate": {"containerUuid": "ctr-1", "size": 1024}
        })
    }

    fn snapshot_tpl(vm_uuid: &str, vm_name: &str, disks: Vec<Value>) -> SnapshotDescriptor {
        serde_json::from_value(json!({
            "uuid": "tpl",
            "groupUuid": format!("grp-{vm_uuid}"),
            "vmUuid": vm_uuid,
            "snapshotName": "tpl",
            "vmCreateSpecification": {"name": vm_name, "numVcpus": 2, "vmDisks": disks}
        }))
        .unwrap()
    }

    fn target(uuid: &str, name: &str, disks: &[&str]) -> VirtualMachineBackupTarget {
        let mut t = VirtualMachineBackupTarget::new(&VmPlan {
            name: name.into(),
            disks: disks.iter().map(|d| d.parse().unwrap()).collect(),
        });
        t.attach(vm(uuid, name, &[]));
        t
    }

    struct Harness {
        tmp: TempDir,
        prism: Arc<FakePrism>,
        nfs: Arc<MockNfs>,
        rsync: Arc<MockRsync>,
    }

    impl Harness {
        fn new(prism: FakePrism) -> Self {
            Self::with_rsync(prism, MockRsync::default())
        }

        fn with_rsync(prism: FakePrism, rsync: MockRsync) -> Self {
            let tmp = TempDir::new().unwrap();
            fs::create_dir(tmp.path().join("backup")).unwrap();
            Self {
                tmp,
                prism: Arc::new(prism),
                nfs: Arc::new(MockNfs::default()),
                rsync: Arc::new(rsync),
            }
        }

        fn root(&self) -> PathBuf {
            self.tmp.path().join("backup")
        }

        fn run(&self) -> BackupRun {
            let mounts = MountManager::new(
                self.prism.clone(),
                self.nfs.clone(),
                "10.0.0.10",
                self.tmp.path().join("mnt"),
            );
            let mut run = BackupRun::new(self.prism.clone(), self.rsync.clone(), mounts, self.root());
            run.clock = || datetime!(2024-03-07 04:09:30 UTC);
            run
        }
    }

    fn cluster(templates: Vec<SnapshotDescriptor>) -> FakePrism {
        FakePrism {
            templates: templates
                .into_iter()
                .map(|t| (t.vm_uuid.clone(), t))
                .collect(),
            containers: [("ctr-1".to_string(), "default-ctr".to_string())]
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn two_disks_are_copied_and_snapshot_deleted() {
        let h = Harness::new(cluster(vec![snapshot_tpl(
            "vm-1",
            "web01",
            vec![
                clone_disk("scsi", 0, "disk-a", "ctr-1"),
                clone_disk("scsi", 1, "disk-b", "ctr-1"),
            ],
        )]));
        let mut run = h.run();

        let report = run.backup_vm(&target("vm-1", "web01", &["scsi.0", "scsi.1"]));
        let Outcome::Succeeded {
            snapshot_name,
            disks,
            warnings,
        } = &report.outcome
        else {
            panic!("unexpected: {report:?}");
        };
        assert_eq!(snapshot_name, "web01_backup_20240307_0409");
        assert_eq!(disks.len(), 2);
        assert!(warnings.is_empty());

        let dir = h.root().join(snapshot_name);
        assert_eq!(dir_entries(&dir), vec!["ahv_vm", "scsi.0", "scsi.1"]);
        let src = fs::read_to_string(dir.join("scsi.1")).unwrap();
        assert!(
            src.ends_with("mnt/default-ctr/.acropolis/snapshot/grp-vm-1/vmdisk/disk-b"),
            "{src}"
        );

        let snap_uuid = format!("snap-{snapshot_name}");
        assert_eq!(h.prism.count(&format!("delete_snapshot {snap_uuid}")), 1);
        assert_eq!(h.prism.count("get_task task-delete-"), 1);
        assert!(run.finish().is_clean());
    }

    #[test]
    fn missing_disk_fails_fast_and_keeps_snapshot() {
        let h = Harness::new(cluster(vec![snapshot_tpl(
            "vm-2",
            "db01",
            vec![clone_disk("scsi", 0, "disk-a", "ctr-1")],
        )]));
        let mut run = h.run();

        let report = run.backup_vm(&target("vm-2", "db01", &["scsi.2"]));
        match &report.outcome {
            Outcome::Failed {
                stage,
                error: BackupError::DiskNotFound { disk, .. },
                snapshot: Some(snapshot),
            } => {
                assert_eq!(*stage, Stage::Transfer(DiskAddress::new("scsi", 2)));
                assert_eq!(disk.to_string(), "scsi.2");
                assert_eq!(dir_entries(&h.root().join(snapshot)), vec!["ahv_vm"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(report.is_failure());
        assert_eq!(h.rsync.count(), 0);
        assert_eq!(h.prism.count("delete_snapshot"), 0);
    }

    #[test]
    fn failed_snapshot_task_surfaces_detail_and_touches_nothing() {
        let mut prism = cluster(vec![]);
        prism.fail_create_task = Some(("kInternalError".into(), "disk busy".into()));
        let h = Harness::new(prism);
        let mut run = h.run();

        let report = run.backup_vm(&target("vm-1", "web01", &["scsi.0"]));
        match &report.outcome {
            Outcome::Failed {
                stage: Stage::SnapshotPoll,
                error: BackupError::TaskFailure { detail, .. },
                ..
            } => assert_eq!(detail, "disk busy"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(
            matches!(report.outcome, Outcome::Failed { snapshot: None, .. }),
            "no snapshot exists to point at: {report:?}"
        );
        assert_eq!(h.nfs.mount_count(), 0);
        assert_eq!(h.rsync.count(), 0);
        assert!(dir_entries(&h.root()).is_empty());
    }

    #[test]
    fn shared_container_is_mounted_once_per_run() {
        let h = Harness::new(cluster(vec![
            snapshot_tpl("vm-1", "web01", vec![clone_disk("scsi", 0, "disk-a", "ctr-1")]),
            snapshot_tpl("vm-2", "web02", vec![clone_disk("scsi", 0, "disk-b", "ctr-1")]),
        ]));
        let mut run = h.run();

        for t in [
            target("vm-1", "web01", &["scsi.0"]),
            target("vm-2", "web02", &["scsi.0"]),
        ] {
            let report = run.backup_vm(&t);
            assert!(matches!(report.outcome, Outcome::Succeeded { .. }), "{report:?}");
        }
        assert_eq!(h.nfs.mount_count(), 1);
        assert_eq!(h.rsync.count(), 2);

        let teardown = run.finish();
        assert_eq!(teardown.unmounted.len(), 1);
    }

    #[test]
    fn foreign_snapshot_is_rejected_before_any_transfer() {
        // The cluster answers with a snapshot of another VM.
        let mut tpl = snapshot_tpl("vm-1", "web01", vec![clone_disk("scsi", 0, "d", "ctr-1")]);
        tpl.vm_uuid = "vm-9".into();
        let mut prism = cluster(vec![]);
        prism.templates.insert("vm-1".into(), tpl);
        let h = Harness::new(prism);
        let mut run = h.run();

        let report = run.backup_vm(&target("vm-1", "web01", &["scsi.0"]));
        match &report.outcome {
            Outcome::Failed {
                stage: Stage::Validate,
                error: BackupError::ValidationMismatch { detail },
                ..
            } => assert!(detail.contains("vm-9"), "{detail}"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.rsync.count(), 0);
        assert_eq!(h.prism.count("delete_snapshot"), 0);
        assert!(dir_entries(&h.root()).is_empty());
    }

    #[test]
    fn snapshot_of_renamed_vm_is_rejected() {
        let h = Harness::new(cluster(vec![snapshot_tpl(
            "vm-1",
            "web01-old",
            vec![clone_disk("scsi", 0, "d", "ctr-1")],
        )]));
        let mut run = h.run();

        let report = run.backup_vm(&target("vm-1", "web01", &["scsi.0"]));
        match &report.outcome {
            Outcome::Failed {
                stage: Stage::Validate,
                error: BackupError::ValidationMismatch { detail },
                ..
            } => {
                assert!(detail.contains("vm name web01-old != web01"), "{detail}");
                assert!(!detail.contains("vm uuid"), "{detail}");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.rsync.count(), 0);
        assert_eq!(h.prism.count("delete_snapshot"), 0);
        assert!(dir_entries(&h.root()).is_empty());
    }

    #[test]
    fn aborted_snapshot_task_names_no_snapshot() {
        let h = Harness::new(cluster(vec![]));
        let mut run = h.run();
        h.prism.script(
            "task-create-web01_backup_20240307_0409",
            vec![crate::prism::testing::task("x", 0, "Aborted")],
        );
        let report = run.backup_vm(&target("vm-1", "web01", &["scsi.0"]));
        assert!(
            matches!(
                report.outcome,
                Outcome::Failed {
                    stage: Stage::SnapshotPoll,
                    snapshot: None,
                    ..
                }
            ),
            "{report:?}"
        );
    }

    #[test]
    fn snapshot_without_entity_is_a_mismatch() {
        let h = Harness::new(cluster(vec![]));
        let mut run = h.run();
        // Unknown tasks complete at once with no entities.
        h.prism.script(
            "task-create-web01_backup_20240307_0409",
            vec![crate::prism::testing::task("x", 100, "Succeeded")],
        );
        let report = run.backup_vm(&target("vm-1", "web01", &["scsi.0"]));
        assert!(
            matches!(
                report.outcome,
                Outcome::Failed {
                    error: BackupError::ValidationMismatch { .. },
                    ..
                }
            ),
            "{report:?}"
        );
    }

    #[test]
    fn empty_selection_is_skipped_without_api_calls() {
        let h = Harness::new(cluster(vec![]));
        let mut run = h.run();
        let report = run.backup_vm(&target("vm-1", "web01", &[]));
        assert!(matches!(report.outcome, Outcome::Skipped));
        assert!(h.prism.calls().is_empty());
    }

    #[test]
    fn created_disk_has_no_image_to_copy() {
        let h = Harness::new(cluster(vec![snapshot_tpl(
            "vm-1",
            "web01",
            vec![create_disk("scsi", 0)],
        )]));
        let mut run = h.run();
        let report = run.backup_vm(&target("vm-1", "web01", &["scsi.0"]));
        assert!(
            matches!(
                report.outcome,
                Outcome::Failed {
                    error: BackupError::DiskNotFound { .. },
                    ..
                }
            ),
            "{report:?}"
        );
        assert_eq!(h.nfs.mount_count(), 0);
    }

    #[test]
    fn transfer_failure_stops_remaining_disks() {
        let tpl = snapshot_tpl(
            "vm-1",
            "web01",
            vec![
                clone_disk("scsi", 0, "disk-a", "ctr-1"),
                clone_disk("scsi", 1, "disk-b", "ctr-1"),
            ],
        );
        let h = Harness::with_rsync(
            cluster(vec![tpl]),
            MockRsync {
                fail_on: Some("scsi.0".into()),
                ..Default::default()
            },
        );
        let mut run = h.run();
        let report = run.backup_vm(&target("vm-1", "web01", &["scsi.0", "scsi.1"]));
        match &report.outcome {
            Outcome::Failed {
                stage,
                error: BackupError::TransferFailure { dst, .. },
                ..
            } => {
                assert_eq!(stage.to_string(), "transfer scsi.0");
                assert!(dst.ends_with("scsi.0"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(h.rsync.count(), 0);
        assert_eq!(h.prism.count("delete_snapshot"), 0);
    }

    #[test]
    fn delete_failure_is_only_a_warning() {
        let mut prism = cluster(vec![snapshot_tpl(
            "vm-1",
            "web01",
            vec![clone_disk("scsi", 0, "disk-a", "ctr-1")],
        )]);
        prism.fail_delete = true;
        let h = Harness::new(prism);
        let mut run = h.run();

        let report = run.backup_vm(&target("vm-1", "web01", &["scsi.0"]));
        match &report.outcome {
            Outcome::Succeeded { warnings, .. } => {
                assert_eq!(warnings.len(), 1);
                assert!(warnings[0].contains("not deleted"), "{warnings:?}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn failed_delete_task_is_only_a_warning() {
        let h = Harness::new(cluster(vec![snapshot_tpl(
            "vm-1",
            "web01",
            vec![clone_disk("scsi", 0, "disk-a", "ctr-1")],
        )]));
        let mut failed = crate::prism::testing::task("del", 30, "Failed");
        failed.meta_response.error = Some("kInvalidState".into());
        failed.meta_response.error_detail = Some("snapshot in use".into());
        h.prism.script(
            "task-delete-snap-web01_backup_20240307_0409",
            vec![failed],
        );
        let mut run = h.run();

        let report = run.backup_vm(&target("vm-1", "web01", &["scsi.0"]));
        match &report.outcome {
            Outcome::Succeeded {
                disks, warnings, ..
            } => {
                assert_eq!(disks.len(), 1);
                assert_eq!(warnings.len(), 1);
                assert!(warnings[0].contains("did not complete"), "{warnings:?}");
                assert!(warnings[0].contains("snapshot in use"), "{warnings:?}");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(!report.is_failure());
        assert_eq!(h.rsync.count(), 1);
    }

    #[test]
    fn unresolved_target_fails_at_start() {
        let h = Harness::new(cluster(vec![]));
        let mut run = h.run();
        let t = VirtualMachineBackupTarget::new(&VmPlan {
            name: "ghost".into(),
            disks: vec![DiskAddress::new("scsi", 0)],
        });
        let report = run.backup_vm(&t);
        assert!(matches!(
            report.outcome,
            Outcome::Failed {
                stage: Stage::Start,
                ..
            }
        ));
        assert!(h.prism.calls().is_empty());
    }

    #[test]
    fn namer_suffixes_repeats_and_existing_dirs() {
        let tmp = TempDir::new().unwrap();
        let at = datetime!(2024-03-07 04:09:59 UTC);
        fs::create_dir(tmp.path().join("db01_backup_20240307_0409")).unwrap();

        let mut namer = SnapshotNamer::default();
        assert_eq!(namer.next("web01", tmp.path(), at), "web01_backup_20240307_0409");
        assert_eq!(namer.next("web01", tmp.path(), at), "web01_backup_20240307_0409_2");
        assert_eq!(namer.next("web01", tmp.path(), at), "web01_backup_20240307_0409_3");
        assert_eq!(namer.next("db01", tmp.path(), at), "db01_backup_20240307_0409_2");
    }

    #[test]
    fn descriptor_is_tab_indented_and_reloadable() {
        let tmp = TempDir::new().unwrap();
        let snap = snapshot_tpl("vm-1", "web01", vec![clone_disk("scsi", 0, "d", "ctr-1")]);
        let path = persist_descriptor(&tmp.path().join("s"), &snap).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\n\t\""), "{text}");
        let back: SnapshotDescriptor = serde_json::from_str(&text).unwrap();
        assert_eq!(back, snap);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode & !0o640, 0);
        }
    }
}
