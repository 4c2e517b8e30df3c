//! Installer entrypoint: load config, open or create the run state, and drive
//! the stage pipeline across every host.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

mod dispatch;
mod pipeline;
mod report;
mod scripts;
#[path = "runtime_config.rs"]
mod runtime_config;
#[path = "child_process.rs"]
mod child_process;
#[path = "shutdown_signal.rs"]
mod shutdown_signal;

use crate::child_process::ProcessRunner;
use crate::dispatch::{CancelToken, Dispatcher};
use crate::pipeline::{stages_for, Pipeline, StageOptions};
use crate::report::{ColorChoice, Reporter};
use crate::runtime_config::{init_tracing, load_config};
use crate::shutdown_signal::cancel_on_signal;
use stagecoach_core::{CommandBuilder, InstallStatus, InstallerConfig, RunMode};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to config.toml
    #[arg(long, default_value = "genconf/config.toml")]
    config: PathBuf,

    /// Override the install state file location
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Front-end that owns this run (interactive or unattended)
    #[arg(long, default_value = "interactive")]
    mode: RunMode,

    /// Skip prerequisite installation
    #[arg(long)]
    offline: bool,

    /// Elide optional stages
    #[arg(long)]
    skip_optional: bool,

    /// Colorize progress output
    #[arg(long, value_enum, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,

    /// Validate configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let config = load_config(&args).context("load config")?;

    init_tracing(&config);
    info!(config = %args.config.display(), "configuration loaded");
    if stagecoach_core::util::diagnostic_mode() {
        info!(
            limit = stagecoach_core::util::log_limit(),
            "diagnostic logging enabled (snippets capped; newlines stripped)"
        );
    }

    config.validate().context("validate config")?;
    if args.check {
        info!("configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    install(&args, &config).await
}

async fn install(args: &Args, config: &InstallerConfig) -> Result<ExitCode> {
    let mut status =
        InstallStatus::open(&config.state_file, args.mode).context("open install state")?;
    if !status.is_initialized() {
        status
            .initialize(&config.host_groups())
            .context("initialize install state")?;
    }
    info!(
        mode = %args.mode,
        run_id = status.run_id().unwrap_or_default(),
        stage = status.current_stage(),
        "install state ready"
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(report::forward(
        events_rx,
        Reporter::stdout(args.color),
    ));

    let cancel = CancelToken::new();
    let signals = tokio::spawn(cancel_on_signal(cancel.clone()));

    let dispatcher = Dispatcher::new(
        ProcessRunner::new(),
        CommandBuilder::new(config.connection_options()),
        config.ssh_parallelism,
        config.process_timeout(),
    )
    .with_observers(Some(events_tx), cancel);
    let pipeline = Pipeline::new(
        dispatcher,
        StageOptions::from_config(config),
        stages_for(args.mode),
        args.skip_optional || config.offline,
    );

    let result = pipeline.run(&mut status).await;
    signals.abort();
    // Closes the progress channel so the reporter drains and returns.
    drop(pipeline);
    let mut reporter = reporter.await.context("join progress reporter")?;

    let summary = result.context("run install pipeline")?;
    reporter.summary(&summary).context("write summary")?;
    Ok(if summary.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
