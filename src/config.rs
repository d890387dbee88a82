use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use config as cfg;
use serde::{Deserialize, Serialize};

use crate::{
    disk::DiskAddress,
    prism::{PollPolicy, PrismSettings},
};

const DEFAULT_MOUNT_ROOT: &str = "/mnt/ntnx";
const DEFAULT_POLL_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub prism: Prism,
    pub backup: Backup,
    pub vms: Vec<VmPlan>,
}

#[derive(Debug, Clone)]
pub struct Prism {
    pub host: String,
    pub username: String,
    pub password: Option<String>,
    pub verify_tls: bool,
    pub poll: PollPolicy,
}

#[derive(Debug, Clone)]
pub struct Backup {
    pub root: PathBuf,
    pub mount_root: PathBuf,
    /// Address of the controller VM that serves the container exports.
    pub cvm_addr: String,
    pub keep_going: bool,
}

/// One VM to back up, with the disk slots to export, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPlan {
    pub name: String,
    pub disks: Vec<DiskAddress>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let raw: RawConfig = cfg::Config::builder()
            .add_source(cfg::File::from(path))
            .build()
            .with_context(|| format!("load {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("deserialize {}", path.display()))?;

        let n = config_helpers::Normalizer { base_dir };
        let prism = Self::build_prism(&n, raw.prism)?;
        let backup = Self::build_backup(&n, raw.backup)?;
        let vms = Self::build_vms(&n, raw.vms)?;

        Ok(Self { prism, backup, vms })
    }

    fn build_prism(n: &config_helpers::Normalizer<'_>, raw: RawPrism) -> Result<Prism> {
        let host = n
            .trim_opt(raw.host)
            .ok_or_else(|| anyhow!("[prism] host must not be empty"))?;
        let username = n
            .trim_opt(raw.username)
            .ok_or_else(|| anyhow!("[prism] username must not be empty"))?;
        let password = match n.trim_opt(raw.password_file).map(|s| n.resolve(&s)) {
            Some(p) => Some(
                n.read_secret(&p)
                    .with_context(|| format!("read Prism password from {}", p.display()))?,
            ),
            None => None,
        };

        let interval = raw.poll_interval_secs.unwrap_or(DEFAULT_POLL_SECS);
        if interval == 0 {
            bail!("[prism] poll_interval_secs must be greater than 0");
        }
        let timeout = match raw.task_timeout_secs {
            Some(0) => bail!("[prism] task_timeout_secs must be greater than 0 when set"),
            Some(s) => Some(Duration::from_secs(s)),
            None => None,
        };

        Ok(Prism {
            host,
            username,
            password,
            verify_tls: raw.verify_tls.unwrap_or(false),
            poll: PollPolicy {
                interval: Duration::from_secs(interval),
                timeout,
            },
        })
    }

    fn build_backup(n: &config_helpers::Normalizer<'_>, raw: RawBackup) -> Result<Backup> {
        let root = n
            .trim_opt(raw.root)
            .map(|s| n.resolve(&s))
            .ok_or_else(|| anyhow!("[backup] root must not be empty"))?;
        let mount_root = n
            .trim_opt(raw.mount_root)
            .map(|s| n.resolve(&s))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNT_ROOT));
        if root.starts_with(&mount_root) || mount_root.starts_with(&root) {
            bail!(
                "[backup] root ({}) and mount_root ({}) must not nest",
                root.display(),
                mount_root.display()
            );
        }
        let cvm_addr = n
            .trim_opt(raw.cvm_addr)
            .ok_or_else(|| anyhow!("[backup] cvm_addr must not be empty"))?;

        Ok(Backup {
            root,
            mount_root,
            cvm_addr,
            keep_going: raw.keep_going.unwrap_or(false),
        })
    }

    fn build_vms(n: &config_helpers::Normalizer<'_>, raw: Vec<RawVm>) -> Result<Vec<VmPlan>> {
        if raw.is_empty() {
            bail!("define at least one VM under [[vms]]");
        }

        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(raw.len());
        for v in raw {
            let name = n
                .trim_opt(v.name)
                .ok_or_else(|| anyhow!("[[vms]] name must not be empty"))?;
            if !seen.insert(name.clone()) {
                bail!("duplicate VM '{}' in [[vms]]", name);
            }

            let mut disk_seen = BTreeSet::new();
            let mut disks = Vec::with_capacity(v.disks.len());
            for d in n.trim_list(v.disks) {
                let addr: DiskAddress = d
                    .parse()
                    .with_context(|| format!("[[vms]] '{name}': disk '{d}'"))?;
                if !disk_seen.insert(addr.clone()) {
                    bail!("[[vms]] '{}': disk {} listed twice", name, addr);
                }
                disks.push(addr);
            }
            out.push(VmPlan { name, disks });
        }
        Ok(out)
    }

    /// Applies `--username` / `--password`, which win over the file.
    pub fn override_credentials(&mut self, username: Option<&str>, password: Option<&str>) {
        if let Some(u) = username.map(str::trim).filter(|u| !u.is_empty()) {
            self.prism.username = u.to_string();
        }
        if let Some(p) = password.filter(|p| !p.is_empty()) {
            self.prism.password = Some(p.to_string());
        }
    }

    pub fn prism_settings(&self) -> Result<PrismSettings> {
        let password = self.prism.password.clone().ok_or_else(|| {
            anyhow!("no Prism password; set [prism].password_file or pass --password")
        })?;
        Ok(PrismSettings {
            host: self.prism.host.clone(),
            username: self.prism.username.clone(),
            password,
            verify_tls: self.prism.verify_tls,
            poll: self.prism.poll,
        })
    }

    pub fn to_redacted_toml(&self) -> Result<String> {
        #[derive(Serialize)]
        struct PrismOut<'a> {
            host: &'a str,
            username: &'a str,
            password: &'static str,
            verify_tls: bool,
            poll_interval_secs: u64,
            #[serde(skip_serializing_if = "Option::is_none")]
            task_timeout_secs: Option<u64>,
        }
        #[derive(Serialize)]
        struct BackupOut {
            root: String,
            mount_root: String,
            cvm_addr: String,
            keep_going: bool,
        }
        #[derive(Serialize)]
        struct VmOut<'a> {
            name: &'a str,
            disks: Vec<String>,
        }
        #[derive(Serialize)]
        struct Out<'a> {
            prism: PrismOut<'a>,
            backup: BackupOut,
            vms: Vec<VmOut<'a>>,
        }

        let out = Out {
            prism: PrismOut {
                host: &self.prism.host,
                username: &self.prism.username,
                password: if self.prism.password.is_some() {
                    "<redacted>"
                } else {
                    "<none>"
                },
                verify_tls: self.prism.verify_tls,
                poll_interval_secs: self.prism.poll.interval.as_secs(),
                task_timeout_secs: self.prism.poll.timeout.map(|t| t.as_secs()),
            },
            backup: BackupOut {
                root: self.backup.root.display().to_string(),
                mount_root: self.backup.mount_root.display().to_string(),
                cvm_addr: self.backup.cvm_addr.clone(),
                keep_going: self.backup.keep_going,
            },
            vms: self
                .vms
                .iter()
                .map(|v| VmOut {
                    name: &v.name,
                    disks: v.disks.iter().map(ToString::to_string).collect(),
                })
                .collect(),
        };
        Ok(toml::to_string_pretty(&out)?)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    prism: RawPrism,
    backup: RawBackup,
    #[serde(default)]
    vms: Vec<RawVm>,
}

#[derive(Debug, Deserialize)]
struct RawPrism {
    host: Option<String>,
    username: Option<String>,
    password_file: Option<String>,
    verify_tls: Option<bool>,
    poll_interval_secs: Option<u64>,
    task_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawBackup {
    root: Option<String>,
    mount_root: Option<String>,
    cvm_addr: Option<String>,
    keep_going: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawVm {
    name: Option<String>,
    #[serde(default)]
    disks: Vec<String>,
}

mod config_helpers {
    use std::{
        fs,
        path::{Path, PathBuf},
    };

    use anyhow::Result;

    pub(super) struct Normalizer<'a> {
        pub base_dir: &'a Path,
    }

    impl<'a> Normalizer<'a> {
        #[inline]
        pub fn trim_opt(&self, s: Option<String>) -> Option<String> {
            s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        }

        #[inline]
        pub fn resolve(&self, p: &str) -> PathBuf {
            let pb = PathBuf::from(p.trim());
            if pb.is_absolute() {
                pb
            } else {
                self.base_dir.join(pb)
            }
        }

        pub fn read_secret(&self, p: &Path) -> Result<String> {
            let mut s = String::from_utf8(fs::read(p)?)?;
            while s.ends_with('\n') || s.ends_with('\r') {
                s.pop();
            }
            Ok(s)
        }

        /// Trimmed, empties dropped, order and repeats kept.
        pub fn trim_list(&self, items: Vec<String>) -> Vec<String> {
            items
                .into_iter()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        }
    }
}
