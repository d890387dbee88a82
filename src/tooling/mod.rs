use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;

use crate::{
    prism::{PrismHttp, PrismPort, PrismSettings},
    utils::{bins::ensure_bins, process::Runner},
};

pub mod nfs;
pub mod rsync;

pub use nfs::{MountPort, NfsCli};
pub use rsync::{RsyncCli, TransferPort};

/// The external collaborators of a backup run, behind their ports.
pub struct Toolbox {
    prism: Arc<dyn PrismPort>,
    nfs: Arc<dyn MountPort>,
    rsync: Arc<dyn TransferPort>,
}

impl Toolbox {
    /// Checks local binaries, then connects to Prism.
    pub fn connect(prism: &PrismSettings, runner: Arc<dyn Runner + Send + Sync>) -> Result<Self> {
        ensure_required_bins()?;
        Self::connect_api_only(prism, runner)
    }

    /// Skips the binary check, for commands that never mount or copy.
    pub fn connect_api_only(
        prism: &PrismSettings,
        runner: Arc<dyn Runner + Send + Sync>,
    ) -> Result<Self> {
        let prism: Arc<dyn PrismPort> = Arc::new(PrismHttp::connect(prism)?);
        let nfs = Arc::new(NfsCli::new(runner.clone())) as Arc<dyn MountPort>;
        let rsync = Arc::new(RsyncCli::new(runner)) as Arc<dyn TransferPort>;
        Ok(Self { prism, nfs, rsync })
    }

    #[inline]
    pub fn prism(&self) -> Arc<dyn PrismPort> {
        self.prism.clone()
    }
    #[inline]
    pub fn nfs(&self) -> Arc<dyn MountPort> {
        self.nfs.clone()
    }
    #[inline]
    pub fn rsync(&self) -> Arc<dyn TransferPort> {
        self.rsync.clone()
    }
}

fn ensure_required_bins() -> Result<()> {
    let all: BTreeSet<&'static str> = nfs::REQ_BINS
        .iter()
        .chain(rsync::REQ_BINS)
        .copied()
        .collect();
    ensure_bins(all)
}
