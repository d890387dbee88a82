use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};

use crate::utils::process::{CmdSpec, Runner, StdioSpec};

pub const REQ_BINS: &[&str] = &["rsync"];

pub trait TransferPort: Send + Sync {
    /// One copy attempt, progress streamed to the operator's terminal.
    fn copy(&self, src: &Path, dst: &Path) -> Result<()>;
}

type DynRunner = dyn Runner + Send + Sync;

pub struct RsyncCli {
    runner: Arc<DynRunner>,
}

impl RsyncCli {
    pub fn new(runner: Arc<DynRunner>) -> Self {
        Self { runner }
    }

    /// `-P` keeps partial files for a manual resume and shows progress.
    #[inline]
    fn rsync(&self, src: &Path, dst: &Path) -> CmdSpec {
        CmdSpec::new("rsync")
            .args(["-P", "--sparse"])
            .arg(src.display().to_string())
            .arg(dst.display().to_string())
            .stdout(StdioSpec::Inherit)
            .stderr(StdioSpec::Inherit)
    }
}

impl TransferPort for RsyncCli {
    fn copy(&self, src: &Path, dst: &Path) -> Result<()> {
        tracing::info!("[rsync] {} -> {}", src.display(), dst.display());
        self.runner
            .run(&self.rsync(src, dst))
            .with_context(|| format!("rsync {} {}", src.display(), dst.display()))
    }
}
