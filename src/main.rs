use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;
mod disk;
mod error;
mod prism;
mod tooling;
mod ui;
mod utils;

use commands::backup;
use config::Config;

pub struct AppCtx {
    pub debug: bool,
    pub cfg: Config,
}

#[derive(Parser, Debug)]
#[command(
    name = "ahvtools",
    about = "Crash-consistent VM disk backups from a Nutanix AHV cluster",
    arg_required_else_help = false,
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[arg(long, default_value = "./config.toml", global = true)]
    config: PathBuf,

    #[arg(long, global = true)]
    debug: bool,

    #[arg(long, global = true)]
    check_config: bool,

    #[arg(long, global = true)]
    print_config: bool,

    /// Prism user, overrides [prism].username.
    #[arg(long, global = true)]
    username: Option<String>,

    /// Prism password, overrides [prism].password_file.
    #[arg(long, global = true)]
    password: Option<String>,

    /// Append log output to this file as well as stderr.
    #[arg(long, global = true, default_value = utils::logging::DEFAULT_LOG_FILE)]
    log_file: PathBuf,

    #[arg(long, global = true)]
    no_log_file: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    Backup(backup::BackupArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.command.is_none() && !cli.check_config && !cli.print_config {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    }
    let log_file = (!cli.no_log_file).then_some(cli.log_file.as_path());
    let _log_guard = utils::logging::init(cli.debug, log_file)?;

    let mut cfg = Config::load(&cli.config)?;
    cfg.override_credentials(cli.username.as_deref(), cli.password.as_deref());

    if cli.check_config {
        cfg.prism_settings()?;
        tracing::info!("config OK");
        return Ok(());
    }
    if cli.print_config {
        println!("{}", cfg.to_redacted_toml()?);
        return Ok(());
    }

    let Some(cmd) = cli.command else {
        let mut cmd = Cli::command();
        cmd.print_help()?;
        println!();
        return Ok(());
    };

    let ctx = AppCtx {
        debug: cli.debug,
        cfg,
    };
    if ctx.debug {
        tracing::debug!("prism settings: {:?}", ctx.cfg.prism_settings().ok());
    }

    match cmd {
        Cmd::Backup(args) => args.run(&ctx),
    }
}
