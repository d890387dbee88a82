use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use tracing as log;

use crate::{
    AppCtx,
    config::Config,
    tooling::Toolbox,
    ui,
    utils::{lock::RunLock, process::ProcessRunner},
};

pub mod mounts;
pub mod orchestrator;
pub mod target;

use mounts::{MountManager, TeardownReport};
use orchestrator::{BackupRun, VmReport};
use target::{VirtualMachineBackupTarget, resolve_targets};

#[derive(Debug, Args)]
pub struct BackupArgs {
    #[command(subcommand)]
    pub cmd: BackupCmd,
}

impl BackupArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        self.cmd.run(ctx)
    }
}

#[derive(Debug, Subcommand)]
pub enum BackupCmd {
    /// Snapshot, export and clean up every configured VM.
    Run(BackupRunArgs),
    /// Resolve the configured VMs and show what a run would copy.
    Plan,
}

impl BackupCmd {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        match self {
            BackupCmd::Run(args) => args.run(ctx),
            BackupCmd::Plan => plan(ctx),
        }
    }
}

#[derive(Args, Debug)]
pub struct BackupRunArgs {
    /// Do not ask for confirmation.
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Continue with the next VM after a failure.
    #[arg(long)]
    pub keep_going: bool,
}

impl BackupRunArgs {
    pub fn run(&self, ctx: &AppCtx) -> Result<()> {
        let cfg = &ctx.cfg;
        let _lock = RunLock::try_acquire(&cfg.backup.root)?;

        let tools = Toolbox::connect(&cfg.prism_settings()?, Arc::new(ProcessRunner::new()))?;
        let prism = tools.prism();

        let vms = prism.list_vms().context("list VMs")?;
        let targets = resolve_targets(&cfg.vms, &vms)?;
        ui::print_plan(&targets);

        if !self.yes && !ui::confirm("Start backup?")? {
            log::info!("[backup] aborted by operator");
            return Ok(());
        }

        let mounts = MountManager::new(
            prism.clone(),
            tools.nfs(),
            cfg.backup.cvm_addr.clone(),
            cfg.backup.mount_root.clone(),
        );
        let mut run = BackupRun::new(prism, tools.rsync(), mounts, cfg.backup.root.clone());

        let keep_going = self.keep_going || cfg.backup.keep_going;
        let reports = drive(&targets, keep_going, |t| run.backup_vm(t));
        let teardown = run.finish();

        ui::print_report(&reports, &teardown);
        summarize(&reports, &teardown)
    }
}

fn plan(ctx: &AppCtx) -> Result<()> {
    let tools = Toolbox::connect_api_only(
        &ctx.cfg.prism_settings()?,
        Arc::new(ProcessRunner::new()),
    )?;
    let vms = tools.prism().list_vms().context("list VMs")?;
    let targets = resolve_targets(&ctx.cfg.vms, &vms)?;
    ui::print_plan(&targets);
    log_layout(&ctx.cfg, &targets);
    Ok(())
}

fn log_layout(cfg: &Config, targets: &[VirtualMachineBackupTarget]) {
    log::info!(
        "[backup] plan -> root={}, mounts={}, server={}, vms={}",
        cfg.backup.root.display(),
        cfg.backup.mount_root.display(),
        cfg.backup.cvm_addr,
        targets.len()
    );
    for t in targets {
        for d in &t.disks {
            log::info!(
                "[backup]   {}/{d} -> {}/{}_backup_<stamp>/{d}",
                t.name,
                cfg.backup.root.display(),
                t.name
            );
        }
    }
}

/// Runs `backup` over the targets in order. Without `keep_going` the first
/// failure stops the run and the remaining VMs are reported as not attempted.
fn drive<F>(targets: &[VirtualMachineBackupTarget], keep_going: bool, mut backup: F) -> Vec<VmReport>
where
    F: FnMut(&VirtualMachineBackupTarget) -> VmReport,
{
    let mut reports = Vec::with_capacity(targets.len());
    let mut stopped = false;
    for t in targets {
        if stopped {
            reports.push(VmReport::not_attempted(&t.name));
            continue;
        }
        log::info!("[backup] ==> {}", t.name);
        let report = backup(t);
        if report.is_failure() && !keep_going {
            log::warn!("[backup] stopping after failure of {}", t.name);
            stopped = true;
        }
        reports.push(report);
    }
    reports
}

fn summarize(reports: &[VmReport], teardown: &TeardownReport) -> Result<()> {
    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| r.is_failure())
        .map(|r| r.vm.as_str())
        .collect();
    if !teardown.is_clean() {
        log::warn!(
            "[backup] {} container(s) could not be unmounted",
            teardown.failures.len()
        );
    }
    if !failed.is_empty() {
        bail!("backup failed for: {}", failed.join(", "));
    }
    log::info!("[backup] done");
    Ok(())
}
