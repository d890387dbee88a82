//! Client side of the Prism control-plane API.

use std::{
    thread,
    time::{Duration, Instant},
};

use tracing as log;

use crate::error::BackupError;

pub mod http;
pub mod types;

pub use http::{PrismHttp, PrismSettings};
pub use types::{SnapshotDescriptor, TaskInfo, TaskStatus, VmDescriptor};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How task polling waits. Without a timeout it waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

pub trait PrismPort: Send + Sync {
    fn list_vms(&self) -> Result<Vec<VmDescriptor>, BackupError>;
    /// Returns the id of the task creating the snapshot.
    fn create_snapshot(&self, vm_uuid: &str, name: &str) -> Result<String, BackupError>;
    /// Returns the id of the task deleting the snapshot.
    fn delete_snapshot(&self, snapshot_uuid: &str) -> Result<String, BackupError>;
    fn get_snapshot(&self, snapshot_uuid: &str) -> Result<SnapshotDescriptor, BackupError>;
    fn get_task(&self, task_uuid: &str) -> Result<TaskInfo, BackupError>;
    fn container_name(&self, container_uuid: &str) -> Result<String, BackupError>;

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy::default()
    }

    fn poll_task(&self, task_uuid: &str) -> Result<TaskInfo, BackupError> {
        self.poll_task_with(task_uuid, &self.poll_policy())
    }

    /// Re-fetches the task until it fails or reaches 100%.
    fn poll_task_with(&self, task_uuid: &str, policy: &PollPolicy) -> Result<TaskInfo, BackupError> {
        log::debug!("[prism] polling task {task_uuid} for completion");
        let start = Instant::now();

        loop {
            let task = self.get_task(task_uuid)?;
            if task.progress_status == TaskStatus::Failed {
                return Err(BackupError::TaskFailure {
                    code: task.error_code(),
                    detail: task.error_detail(),
                });
            }
            if task.percentage_complete >= 100 {
                return Ok(task);
            }

            let waited = start.elapsed();
            if let Some(limit) = policy.timeout
                && waited >= limit
            {
                return Err(BackupError::TaskTimeout {
                    task: task_uuid.to_string(),
                    waited,
                });
            }

            log::info!(
                "[prism] waiting for {} ({task_uuid}): {}% after {}s",
                task.operation_type,
                task.percentage_complete,
                waited.as_secs()
            );
            thread::sleep(policy.interval);
        }
    }
}
