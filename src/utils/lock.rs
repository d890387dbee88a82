#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use fs2::FileExt;

const LOCK_FILE: &str = ".ahvtools.lock";

/// Exclusive run lock on a backup root. Released on drop.
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock").field("path", &self.path).finish()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl RunLock {
    pub fn try_acquire(backup_root: &Path) -> Result<Self> {
        let path = backup_root.join(LOCK_FILE);
        let file = open_lockfile(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!("[lock] acquired {}", path.display());
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                bail!(
                    "another backup run holds the lock on {}",
                    path.display()
                )
            }
            Err(e) => Err(e).with_context(|| format!("flock {}", path.display())),
        }
    }
}

fn open_lockfile(path: &Path) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        opts.mode(0o640);
    }
    opts.open(path)
        .with_context(|| format!("open lockfile {}", path.display()))
}
