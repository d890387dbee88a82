use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use prettytable::{Cell, Row, Table};

use crate::{
    commands::backup::{
        mounts::TeardownReport,
        orchestrator::{Outcome, VmReport},
        target::VirtualMachineBackupTarget,
    },
    utils::units::format_bytes,
};

fn join_disks<T: ToString>(disks: &[T]) -> String {
    if disks.is_empty() {
        "<none>".to_string()
    } else {
        disks
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub fn plan_table(targets: &[VirtualMachineBackupTarget]) -> Table {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("VM"),
        Cell::new("UUID"),
        Cell::new("State"),
        Cell::new("Disks"),
        Cell::new("Size"),
    ]));

    let mut total = 0u64;
    for t in targets {
        total += t.estimated_size;
        table.add_row(Row::new(vec![
            Cell::new(&t.name),
            Cell::new(t.uuid().unwrap_or("-")),
            Cell::new(
                t.vm
                    .as_ref()
                    .and_then(|v| v.state.as_deref())
                    .unwrap_or("-"),
            ),
            Cell::new(&join_disks(&t.disks)),
            Cell::new(&format_bytes(t.estimated_size)),
        ]));
    }
    table.add_row(Row::new(vec![
        Cell::new("total"),
        Cell::new(""),
        Cell::new(""),
        Cell::new(""),
        Cell::new(&format_bytes(total)),
    ]));
    table
}

pub fn print_plan(targets: &[VirtualMachineBackupTarget]) {
    if targets.is_empty() {
        tracing::info!("<no VMs>");
    } else {
        plan_table(targets).printstd();
    }
}

pub fn report_table(reports: &[VmReport]) -> Table {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("VM"),
        Cell::new("Result"),
        Cell::new("Snapshot"),
        Cell::new("Detail"),
    ]));

    for r in reports {
        let (result, snapshot, detail) = match &r.outcome {
            Outcome::Succeeded {
                snapshot_name,
                disks,
                warnings,
            } => {
                let mut detail = join_disks(disks);
                for w in warnings {
                    detail.push_str("\nwarning: ");
                    detail.push_str(w);
                }
                ("ok", snapshot_name.clone(), detail)
            }
            Outcome::Skipped => ("skipped", "-".into(), "no disks selected".into()),
            Outcome::Failed {
                stage,
                error,
                snapshot,
            } => (
                "FAILED",
                snapshot.clone().unwrap_or_else(|| "-".into()),
                format!("{} at {stage}: {error}", error.kind()),
            ),
            Outcome::NotAttempted => ("not attempted", "-".into(), String::new()),
        };
        table.add_row(Row::new(vec![
            Cell::new(&r.vm),
            Cell::new(result),
            Cell::new(&snapshot),
            Cell::new(&detail),
        ]));
    }
    table
}

pub fn print_report(reports: &[VmReport], teardown: &TeardownReport) {
    report_table(reports).printstd();

    for (path, err) in &teardown.failures {
        tracing::warn!("[mount] still mounted: {} ({err})", path.display());
    }
}

/// Asks a yes/no question on stdin; anything but `y`/`yes` is a no.
pub fn confirm(prompt: &str) -> Result<bool> {
    let stdin = io::stdin();
    confirm_from(prompt, &mut stdin.lock(), &mut io::stdout())
}

fn confirm_from(prompt: &str, input: &mut dyn BufRead, out: &mut dyn Write) -> Result<bool> {
    write!(out, "{prompt} [y/N] ")?;
    out.flush()?;
    let mut line = String::new();
    input.read_line(&mut line).context("read confirmation")?;
    Ok(matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}
