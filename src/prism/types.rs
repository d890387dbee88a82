use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::disk::DiskAddress;

#[derive(Debug, Deserialize)]
pub(crate) struct VmList {
    #[serde(default)]
    pub entities: Vec<VmDescriptor>,
}

/// A VM as listed by the AHV API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmDescriptor {
    pub uuid: String,
    pub config: VmConfig,
    #[serde(default)]
    pub state: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmConfig {
    pub name: String,
    #[serde(default)]
    pub vm_disks: Vec<VmDisk>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmDisk {
    pub addr: DiskAddress,
    #[serde(default)]
    pub is_cdrom: bool,
    #[serde(default)]
    pub is_empty: bool,
    #[serde(default)]
    pub vm_disk_size: Option<u64>,
}

impl VmDescriptor {
    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn disk(&self, addr: &DiskAddress) -> Option<&VmDisk> {
        self.config.vm_disks.iter().find(|d| &d.addr == addr)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SnapshotSpecList<'a> {
    pub snapshot_specs: [SnapshotSpec<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SnapshotSpec<'a> {
    pub vm_uuid: &'a str,
    pub snapshot_name: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TaskCreated {
    pub task_uuid: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContainerInfo {
    pub name: String,
}

/// Point-in-time description of a VM as captured by a snapshot.
///
/// Serializes back to the same wire layout the API returns, which is also the
/// layout of the `ahv_vm` file written next to the disk images. Keys this
/// crate does not interpret are carried in `extra` so nothing is lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDescriptor {
    pub uuid: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub logical_timestamp: i64,
    #[serde(default)]
    pub created_time: i64,
    pub group_uuid: String,
    pub vm_uuid: String,
    pub snapshot_name: String,
    pub vm_create_specification: VmSpec,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub num_vcpus: Option<u32>,
    #[serde(default)]
    pub num_cores_per_vcpu: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub vm_disks: Vec<SnapshotDisk>,
    #[serde(default)]
    pub vm_nics: Vec<VmNic>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmNic {
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub network_uuid: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSnapshotDisk", into = "RawSnapshotDisk")]
pub struct SnapshotDisk {
    pub address: DiskAddress,
    pub provisioning: DiskProvisioning,
    pub is_cdrom: bool,
    pub is_thin_provisioned: Option<bool>,
    pub is_scsi_pass_through: Option<bool>,
    pub extra: Map<String, Value>,
}

/// How a snapshot would bring a disk back to life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskProvisioning {
    /// Cloned from an existing vdisk; the only kind with an image to copy.
    Clone(DiskClone),
    /// Created fresh in a container.
    Create(DiskCreate),
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskClone {
    #[serde(default)]
    pub vm_disk_uuid: String,
    #[serde(default)]
    pub container_uuid: String,
    #[serde(default)]
    pub minimum_size: Option<u64>,
    /// `imagePath`, `minimumSizeMb`, `snapshotGroupId`, `vmdisk_uuid`,
    /// `ndfs_filepath` and whatever else the cluster sends.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskCreate {
    #[serde(default)]
    pub container_uuid: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SnapshotDescriptor {
    #[inline]
    pub fn vm_name(&self) -> &str {
        &self.vm_create_specification.name
    }

    pub fn disk(&self, addr: &DiskAddress) -> Option<&SnapshotDisk> {
        self.vm_create_specification
            .vm_disks
            .iter()
            .find(|d| &d.address == addr)
    }

    /// Path of a cloned vdisk relative to its container's NFS export.
    pub fn vdisk_path(&self, disk_uuid: &str) -> String {
        format!(".acropolis/snapshot/{}/vmdisk/{}", self.group_uuid, disk_uuid)
    }
}

impl SnapshotDisk {
    /// `(disk_uuid, container_uuid)` when the disk has an image to copy.
    pub fn clone_source(&self) -> Option<(&str, &str)> {
        match &self.provisioning {
            DiskProvisioning::Clone(c)
                if !c.vm_disk_uuid.is_empty() && !c.container_uuid.is_empty() =>
            {
                Some((c.vm_disk_uuid.as_str(), c.container_uuid.as_str()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSnapshotDisk {
    disk_address: DiskAddress,
    #[serde(default)]
    is_cdrom: Option<bool>,
    #[serde(default)]
    is_empty: Option<bool>,
    #[serde(default)]
    vm_disk_create: Option<DiskCreate>,
    #[serde(default)]
    vm_disk_clone: Option<DiskClone>,
    #[serde(default)]
    is_scsi_pass_through: Option<bool>,
    #[serde(default)]
    is_thin_provisioned: Option<bool>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<RawSnapshotDisk> for SnapshotDisk {
    fn from(raw: RawSnapshotDisk) -> Self {
        let provisioning = match (raw.vm_disk_clone, raw.vm_disk_create) {
            (Some(c), _) => DiskProvisioning::Clone(c),
            (None, Some(c)) => DiskProvisioning::Create(c),
            (None, None) => DiskProvisioning::Empty,
        };
        Self {
            address: raw.disk_address,
            provisioning,
            is_cdrom: raw.is_cdrom.unwrap_or(false),
            is_thin_provisioned: raw.is_thin_provisioned,
            is_scsi_pass_through: raw.is_scsi_pass_through,
            extra: raw.extra,
        }
    }
}

impl From<SnapshotDisk> for RawSnapshotDisk {
    fn from(d: SnapshotDisk) -> Self {
        let (vm_disk_clone, vm_disk_create, is_empty) = match d.provisioning {
            DiskProvisioning::Clone(c) => (Some(c), None, false),
            DiskProvisioning::Create(c) => (None, Some(c), false),
            DiskProvisioning::Empty => (None, None, true),
        };
        Self {
            disk_address: d.address,
            is_cdrom: Some(d.is_cdrom),
            is_empty: Some(is_empty),
            vm_disk_create,
            vm_disk_clone,
            is_scsi_pass_through: d.is_scsi_pass_through,
            is_thin_provisioned: d.is_thin_provisioned,
            extra: d.extra,
        }
    }
}

/// An asynchronous server-side operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub uuid: String,
    #[serde(default)]
    pub operation_type: String,
    #[serde(default)]
    pub percentage_complete: u32,
    #[serde(default)]
    pub progress_status: TaskStatus,
    #[serde(default)]
    pub meta_response: TaskMetaResponse,
    #[serde(default)]
    pub entity_list: Vec<TaskEntity>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetaResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEntity {
    pub uuid: String,
    pub entity_type: String,
    #[serde(default)]
    pub entity_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Other(String),
}

impl From<String> for TaskStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Queued" | "Pending" => TaskStatus::Pending,
            "Running" => TaskStatus::Running,
            "Succeeded" => TaskStatus::Succeeded,
            "Failed" | "Aborted" => TaskStatus::Failed,
            _ => TaskStatus::Other(s),
        }
    }
}

impl TaskInfo {
    /// Id of the snapshot entity named `name`, if the task reported one.
    pub fn snapshot_uuid(&self, name: &str) -> Option<&str> {
        self.entity_list
            .iter()
            .find(|e| e.entity_type == "Snapshot" && e.entity_name.as_deref() == Some(name))
            .map(|e| e.uuid.as_str())
    }

    pub fn error_code(&self) -> String {
        self.meta_response.error.clone().unwrap_or_default()
    }

    pub fn error_detail(&self) -> String {
        self.meta_response.error_detail.clone().unwrap_or_default()
    }
}
