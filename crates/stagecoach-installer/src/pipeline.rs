//! Stage definitions and the resumable stage pipeline.
//!
//! A stage is a named builder that appends actions to a chain. The pipeline
//! walks the fixed stage list for the run mode, dispatches the chain to every
//! active host that has not finished the stage yet, records each host's result
//! in the state store, and checkpoints before moving on.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use stagecoach_core::{
    Chain, ClusterPackages, InstallStatus, InstallerConfig, ManifestError, Node, PollPolicy,
    RunMode, StateError, POST_MARKER, PRE_MARKER, REMOTE_WORK_DIR,
};

use crate::dispatch::{
    ActionRunner, DispatchError, Dispatcher, HostOutcome, HostReport, ProgressEvent,
};
use crate::scripts::{materialize_prereqs, PREREQS_MARKER};

pub const INSTALL_SCRIPT_NAME: &str = "dcos_install.sh";
pub const DIAGNOSTIC_COMMAND: [&str; 3] = ["sudo", "/opt/mesosphere/bin/3dt", "-diag"];
/// How long postflight waits for a host to report healthy.
pub const DIAGNOSTIC_CEILING: Duration = Duration::from_secs(900);
pub const DIAGNOSTIC_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{what} not found at {path}")]
    MissingInput { what: &'static str, path: PathBuf },
    #[error("bootstrap id is not set; set bootstrap_id in the config or BOOTSTRAP_ID in the environment")]
    MissingBootstrapId,
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("failed to write prerequisites script: {0}")]
    Script(#[source] io::Error),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("state file records unknown stage {0:?}")]
    UnknownStage(String),
}

/// Local inputs the stage builders read.
#[derive(Debug, Clone)]
pub struct StageOptions {
    pub serve_dir: PathBuf,
    pub install_script: PathBuf,
    pub cluster_packages_file: PathBuf,
    pub bootstrap_id: Option<String>,
    pub offline: bool,
    /// Where embedded scripts are written before being copied out.
    pub script_dir: PathBuf,
    pub work_dir: String,
}

impl StageOptions {
    pub fn from_config(config: &InstallerConfig) -> Self {
        let script_dir = config
            .state_file
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        Self {
            install_script: config.serve_dir.join(INSTALL_SCRIPT_NAME),
            serve_dir: config.serve_dir.clone(),
            cluster_packages_file: config.cluster_packages_file.clone(),
            bootstrap_id: config.bootstrap_id.clone(),
            offline: config.offline,
            script_dir,
            work_dir: REMOTE_WORK_DIR.to_string(),
        }
    }

    fn remote(&self, relative: &str) -> String {
        format!("{}/{}", self.work_dir.trim_end_matches('/'), relative)
    }
}

pub type StageBuilder = fn(&mut Chain, &StageOptions) -> Result<(), PipelineError>;

#[derive(Clone, Copy)]
pub struct Stage {
    pub name: &'static str,
    pub optional: bool,
    build: StageBuilder,
}

impl Stage {
    pub const fn new(name: &'static str, optional: bool, build: StageBuilder) -> Self {
        Self {
            name,
            optional,
            build,
        }
    }

    pub fn build(&self, chain: &mut Chain, options: &StageOptions) -> Result<(), PipelineError> {
        (self.build)(chain, options)
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("optional", &self.optional)
            .finish()
    }
}

pub fn stages_for(mode: RunMode) -> Vec<Stage> {
    match mode {
        RunMode::Interactive => vec![
            Stage::new("prerequisites", true, add_prerequisites),
            Stage::new("preflight", false, add_preflight),
            Stage::new("install", false, add_install),
            Stage::new("postflight", false, add_postflight),
        ],
        RunMode::Unattended => vec![
            Stage::new("preflight", false, add_preflight_unattended),
            Stage::new("install", false, add_install),
            Stage::new("postflight", false, add_postflight),
        ],
    }
}

fn add_prerequisites(chain: &mut Chain, options: &StageOptions) -> Result<(), PipelineError> {
    let script = materialize_prereqs(&options.script_dir).map_err(PipelineError::Script)?;
    chain.copy_and_run(script, Vec::new(), false, "Installing prerequisites");
    Ok(())
}

fn add_preflight(chain: &mut Chain, options: &StageOptions) -> Result<(), PipelineError> {
    require_file("install script", &options.install_script)?;
    chain.copy_and_run(
        &options.install_script,
        vec!["{role}".to_string(), "--preflight-only".to_string()],
        true,
        "Running preflight checks",
    );
    Ok(())
}

fn add_preflight_unattended(
    chain: &mut Chain,
    options: &StageOptions,
) -> Result<(), PipelineError> {
    if options.offline {
        info!("offline mode; not installing prerequisites");
    } else {
        add_prerequisites(chain, options)?;
    }
    add_preflight(chain, options)
}

fn add_install(chain: &mut Chain, options: &StageOptions) -> Result<(), PipelineError> {
    let bootstrap_id = options
        .bootstrap_id
        .as_deref()
        .ok_or(PipelineError::MissingBootstrapId)?;
    let tarball_name = format!("{bootstrap_id}.bootstrap.tar.xz");
    let tarball = options.serve_dir.join("bootstrap").join(&tarball_name);
    require_file("bootstrap tarball", &tarball)?;
    require_file("install script", &options.install_script)?;
    let packages = ClusterPackages::load(&options.cluster_packages_file)?;
    for (_, entry) in packages.iter() {
        require_file("package", &options.serve_dir.join(&entry.filename))?;
    }

    chain.add_execute(
        ["mkdir", "-p", options.remote("bootstrap").as_str()],
        "Creating bootstrap directory",
    );
    chain.add_copy(
        tarball,
        format!("bootstrap/{tarball_name}"),
        "Copying bootstrap tarball",
    );
    chain.add_copy(
        &options.install_script,
        INSTALL_SCRIPT_NAME,
        "Copying install script",
    );
    for (name, entry) in packages.iter() {
        let package_dir = format!("packages/{name}");
        let file_name = Path::new(&entry.filename)
            .file_name()
            .map(|file| file.to_string_lossy().into_owned())
            .unwrap_or_else(|| entry.filename.clone());
        chain.add_execute(
            ["mkdir", "-p", options.remote(&package_dir).as_str()],
            format!("Creating package directory {name}"),
        );
        chain.add_copy(
            options.serve_dir.join(&entry.filename),
            format!("{package_dir}/{file_name}"),
            format!("Copying package {name}"),
        );
    }
    chain.add_run(
        INSTALL_SCRIPT_NAME,
        vec!["{role}".to_string()],
        true,
        "Installing on host",
    );
    Ok(())
}

fn add_postflight(chain: &mut Chain, _options: &StageOptions) -> Result<(), PipelineError> {
    chain
        .add_execute(DIAGNOSTIC_COMMAND, "Waiting for host to come up")
        .with_poll(PollPolicy {
            ceiling: DIAGNOSTIC_CEILING,
            interval: DIAGNOSTIC_INTERVAL,
        });
    chain.add_execute(
        ["sudo", "rm", "-f", PREREQS_MARKER],
        "Removing prerequisites flag",
    );
    Ok(())
}

fn require_file(what: &'static str, path: &Path) -> Result<(), PipelineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PipelineError::MissingInput {
            what,
            path: path.to_path_buf(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed { stage: String },
    Cancelled { stage: String },
}

#[derive(Debug, Clone)]
pub struct StageReport {
    pub stage: String,
    /// Optional stage not run; markers advanced anyway.
    pub elided: bool,
    /// Hosts that had already finished this stage in an earlier invocation.
    pub already_done: Vec<String>,
    pub hosts: Vec<HostReport>,
}

impl StageReport {
    pub fn failures(&self) -> impl Iterator<Item = &HostReport> {
        self.hosts
            .iter()
            .filter(|report| matches!(report.outcome, HostOutcome::Failed { .. }))
    }

    fn cancelled(&self) -> bool {
        self.hosts
            .iter()
            .any(|report| report.outcome == HostOutcome::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stages: Vec<StageReport>,
    pub outcome: RunOutcome,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

pub struct Pipeline<R> {
    dispatcher: Dispatcher<R>,
    options: StageOptions,
    stages: Vec<Stage>,
    skip_optional: bool,
}

impl<R: ActionRunner> Pipeline<R> {
    pub fn new(
        dispatcher: Dispatcher<R>,
        options: StageOptions,
        stages: Vec<Stage>,
        skip_optional: bool,
    ) -> Self {
        Self {
            dispatcher,
            options,
            stages,
            skip_optional,
        }
    }

    /// Run from the recorded stage to the end, or until a mandatory stage fails.
    ///
    /// On success the state file is removed. On failure or cancellation it is
    /// left at the stage that stopped the run so the next invocation resumes
    /// there.
    pub async fn run(&self, status: &mut InstallStatus) -> Result<RunSummary, PipelineError> {
        if !status.is_initialized() {
            return Err(StateError::NotInitialized.into());
        }
        let start = self.resume_index(status.current_stage())?;
        let mut reports = Vec::new();

        for stage in &self.stages[start..] {
            if self.dispatcher.cancel_token().is_cancelled() {
                return Ok(RunSummary {
                    stages: reports,
                    outcome: RunOutcome::Cancelled {
                        stage: stage.name.to_string(),
                    },
                });
            }
            status.set_current_stage(stage.name);
            let report = self.run_stage(stage, status).await?;
            let failed = report.failures().count();
            let cancelled = report.cancelled();
            reports.push(report);

            if cancelled {
                return Ok(RunSummary {
                    stages: reports,
                    outcome: RunOutcome::Cancelled {
                        stage: stage.name.to_string(),
                    },
                });
            }
            if failed > 0 {
                if !stage.optional {
                    warn!(stage = stage.name, failed, "stage failed; stopping");
                    return Ok(RunSummary {
                        stages: reports,
                        outcome: RunOutcome::Failed {
                            stage: stage.name.to_string(),
                        },
                    });
                }
                warn!(stage = stage.name, failed, "optional stage failed on some hosts; continuing");
            }
        }

        status.set_current_stage(POST_MARKER);
        status.checkpoint()?;
        InstallStatus::reset(status.path())?;
        info!("all stages completed");
        Ok(RunSummary {
            stages: reports,
            outcome: RunOutcome::Completed,
        })
    }

    fn resume_index(&self, current: &str) -> Result<usize, PipelineError> {
        match current {
            PRE_MARKER => Ok(0),
            POST_MARKER => Ok(self.stages.len()),
            name => self
                .stages
                .iter()
                .position(|stage| stage.name == name)
                .ok_or_else(|| PipelineError::UnknownStage(name.to_string())),
        }
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        status: &mut InstallStatus,
    ) -> Result<StageReport, PipelineError> {
        let active = status.get_active_nodes();
        let mut report = StageReport {
            stage: stage.name.to_string(),
            elided: false,
            already_done: Vec::new(),
            hosts: Vec::new(),
        };

        if stage.optional && self.skip_optional {
            info!(stage = stage.name, "skipping optional stage");
            for node in &active {
                status.update(&node.id(), stage.name, POST_MARKER)?;
            }
            status.checkpoint()?;
            report.elided = true;
            return Ok(report);
        }

        let mut pending: Vec<Node> = Vec::new();
        for node in active {
            let id = node.id();
            if status.host(&id).is_some_and(|host| host.completed(stage.name)) {
                report.already_done.push(id);
            } else {
                pending.push(node);
            }
        }

        info!(
            stage = stage.name,
            hosts = pending.len(),
            already_done = report.already_done.len(),
            "starting stage"
        );
        self.dispatcher.emit(ProgressEvent::StageStarted {
            stage: stage.name.to_string(),
            hosts: pending.len(),
        });

        if !pending.is_empty() {
            let chain = self.stage_chain(stage)?;
            for node in &pending {
                status.update(&node.id(), stage.name, PRE_MARKER)?;
            }
            status.checkpoint()?;

            let pairs = pending
                .into_iter()
                .map(|node| (node, chain.clone()))
                .collect();
            report.hosts = self.dispatcher.dispatch(pairs).await?;

            for host in &report.hosts {
                let id = host.node.id();
                match &host.outcome {
                    HostOutcome::Success => status.update(&id, stage.name, POST_MARKER)?,
                    HostOutcome::Failed { step, .. } => status.update(&id, stage.name, step)?,
                    HostOutcome::Cancelled => {}
                }
            }
        }
        status.checkpoint()?;

        self.dispatcher.emit(ProgressEvent::StageFinished {
            stage: stage.name.to_string(),
            failed: report.failures().count(),
        });
        Ok(report)
    }

    /// The stage's actions wrapped in work directory setup and cleanup.
    fn stage_chain(&self, stage: &Stage) -> Result<Chain, PipelineError> {
        let builder = self.dispatcher.builder();
        let mut body = Chain::new();
        stage.build(&mut body, &self.options)?;

        let mut chain = Chain::new();
        builder.add_setup(&mut chain);
        chain.append(body);
        builder.add_cleanup(&mut chain);
        Ok(chain)
    }
}
