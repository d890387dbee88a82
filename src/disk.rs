use std::{fmt, str::FromStr, sync::LazyLock};

use anyhow::{Error, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

static ADDR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z][a-z0-9]*)\.([0-9]{1,5})$").expect("static disk address regex")
});

/// A virtual disk slot on a VM, written `<bus>.<index>` (e.g. `scsi.0`).
///
/// The display form is the only key used to match a disk between the live
/// VM configuration and a snapshot of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiskAddress {
    #[serde(rename = "deviceBus")]
    pub bus: String,
    #[serde(rename = "deviceIndex")]
    pub index: u32,
}

impl DiskAddress {
    pub fn new(bus: impl Into<String>, index: u32) -> Self {
        Self {
            bus: bus.into(),
            index,
        }
    }
}

impl fmt::Display for DiskAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.bus, self.index)
    }
}

impl FromStr for DiskAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let caps = ADDR_RE
            .captures(&s)
            .ok_or_else(|| anyhow!("bad disk address '{s}': expected <bus>.<index>, e.g. scsi.0"))?;
        let index: u32 = caps[2]
            .parse()
            .map_err(|_| anyhow!("bad disk index in '{s}'"))?;
        Ok(Self::new(&caps[1], index))
    }
}
