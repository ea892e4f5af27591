// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod script;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fdtable_core::FdTableConfig;
use fdtable_logging::CliLoggingArgs;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::script::{parse_script, Session};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run scripted file syscalls against per-process descriptor tables"
)]
struct Cli {
    #[command(flatten)]
    logging: CliLoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a script, one `<pid> <op> <args>` line per syscall
    Run {
        /// Script path, or '-' for stdin
        script: PathBuf,
        /// TOML file with descriptor-table limits; a missing file means defaults
        #[arg(long)]
        config: Option<PathBuf>,
        /// Stop at the first failing syscall
        #[arg(long)]
        fail_fast: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.logging.init("fdtable-sim")?;
    match cli.command {
        Command::Run {
            script,
            config,
            fail_fast,
        } => run(&script, config.as_deref(), fail_fast),
    }
}

fn run(script_path: &Path, config_path: Option<&Path>, fail_fast: bool) -> Result<()> {
    let mut session = Session::new(load_config(config_path)?);
    let source = read_script(script_path)?;
    let lines = parse_script(&source)?;
    tracing::info!(
        lines = lines.len(),
        max_open_files = session.config().limits.max_open_files,
        "running script"
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let summary = session.run(&lines, &mut out, fail_fast)?;
    out.flush()?;
    tracing::info!(
        executed = summary.executed,
        failed = summary.failed,
        open_handles = session.storage().open_handle_count(),
        "script finished"
    );
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<FdTableConfig> {
    let Some(path) = path else {
        return Ok(FdTableConfig::default());
    };
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(FdTableConfig::default());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    FdTableConfig::from_toml_str(&text)
        .with_context(|| format!("invalid config {}", path.display()))
}

fn read_script(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).context("failed to read script from stdin")?;
        return Ok(buf);
    }
    if path.is_dir() {
        bail!("{} is a directory", path.display());
    }
    fs::read_to_string(path).with_context(|| format!("failed to read script {}", path.display()))
}
