use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};

use crate::utils::process::{CmdSpec, Runner, StdioSpec};

pub const REQ_BINS: &[&str] = &["mount", "umount", "mountpoint"];

pub trait MountPort: Send + Sync {
    fn is_mounted(&self, path: &Path) -> Result<bool>;
    /// Read-only NFS mount of `export` (`<server>:/<share>`) on `path`.
    fn mount_ro(&self, export: &str, path: &Path) -> Result<()>;
    fn unmount(&self, path: &Path) -> Result<()>;
}

type DynRunner = dyn Runner + Send + Sync;

pub struct NfsCli {
    runner: Arc<DynRunner>,
}

impl NfsCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }

    #[inline]
    fn mountpoint_q(&self, path: &Path) -> CmdSpec {
        CmdSpec::new("mountpoint")
            .arg("-q")
            .arg(path.display().to_string())
            .stdout(StdioSpec::Null)
            .stderr(StdioSpec::Null)
    }

    #[inline]
    fn mount_nfs_ro(&self, export: &str, path: &Path) -> CmdSpec {
        CmdSpec::new("mount")
            .args(["-t", "nfs", "-o", "ro"])
            .arg(export)
            .arg(path.display().to_string())
    }

    #[inline]
    fn umount(&self, path: &Path) -> CmdSpec {
        CmdSpec::new("umount").arg(path.display().to_string())
    }
}

impl MountPort for NfsCli {
    fn is_mounted(&self, path: &Path) -> Result<bool> {
        self.runner
            .probe(&self.mountpoint_q(path))
            .with_context(|| format!("mountpoint -q {}", path.display()))
    }

    fn mount_ro(&self, export: &str, path: &Path) -> Result<()> {
        self.runner
            .run(&self.mount_nfs_ro(export, path))
            .with_context(|| format!("mount -t nfs -o ro {export} {}", path.display()))
    }

    fn unmount(&self, path: &Path) -> Result<()> {
        self.runner
            .run(&self.umount(path))
            .with_context(|| format!("umount {}", path.display()))
    }
}
