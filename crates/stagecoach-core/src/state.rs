//! Durable per-host install progress.
//!
//! The state file is the only record of an in-progress install: its presence
//! means a run is underway and a later invocation resumes it. Writes go through
//! a temp file in the same directory followed by an fsync and a rename, so a
//! crash leaves either the previous record or the new one on disk.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{role_tags, roles};
use crate::model::{Node, NodeParseError, Tags};

/// Stage/step marker for "before any stage ran".
pub const PRE_MARKER: &str = "_pre";
/// Stage/step marker for "finished".
pub const POST_MARKER: &str = "_post";

#[derive(Debug, Error)]
pub enum StateError {
    #[error(
        "can't start a new install, existing install progress found; to start a new install \
         remove {path}, to resume the in-progress install run the {mode} installer"
    )]
    AlreadyInitialized { path: PathBuf, mode: RunMode },
    #[error("host {0} is listed more than once")]
    DuplicateHost(String),
    #[error("unknown host {0}")]
    UnknownHost(String),
    #[error(
        "host {host} cannot be changed because it is in install stage {stage} \
         which isn't the current stage: {current}"
    )]
    StageMismatch {
        host: String,
        stage: String,
        current: String,
    },
    #[error(
        "hosts must be installed entirely using a single install method; install was started \
         with `{found}` but the current installer is `{expected}`"
    )]
    RunModeMismatch { expected: RunMode, found: RunMode },
    #[error(
        "loaded data from a different installer run than expected: expected `{expected}` but \
         got `{found}`; are two copies of the installer running?"
    )]
    RunIdMismatch { expected: String, found: String },
    #[error("install state has not been initialized")]
    NotInitialized,
    #[error("state file {path} was removed while the install was running")]
    Vanished { path: PathBuf },
    #[error("invalid host {host} in state file: {source}")]
    InvalidHost {
        host: String,
        #[source]
        source: NodeParseError,
    },
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize install state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Which front-end owns a run. Fixed for the lifetime of a run id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[serde(alias = "cli")]
    Interactive,
    #[serde(alias = "web")]
    Unattended,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Interactive => "interactive",
            RunMode::Unattended => "unattended",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "interactive" | "cli" => Ok(RunMode::Interactive),
            "unattended" | "web" => Ok(RunMode::Unattended),
            other => Err(format!(
                "unknown run mode {other:?} (expected interactive or unattended)"
            )),
        }
    }
}

/// Host lists by role, exactly as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostGroups {
    pub masters: Vec<String>,
    pub agents: Vec<String>,
    pub public_agents: Vec<String>,
}

impl HostGroups {
    fn tagged(&self) -> impl Iterator<Item = (&String, &'static str)> {
        self.masters
            .iter()
            .map(|host| (host, roles::MASTER))
            .chain(self.agents.iter().map(|host| (host, roles::AGENT)))
            .chain(
                self.public_agents
                    .iter()
                    .map(|host| (host, roles::PUBLIC_AGENT)),
            )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    pub stage: String,
    pub step: String,
    pub skip: bool,
    pub tags: Tags,
}

impl HostState {
    fn fresh(tags: Tags) -> Self {
        Self {
            stage: PRE_MARKER.to_string(),
            step: PRE_MARKER.to_string(),
            skip: false,
            tags,
        }
    }

    /// True once the host finished `stage`.
    pub fn completed(&self, stage: &str) -> bool {
        self.stage == stage && self.step == POST_MARKER
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedHost {
    pub id: String,
    #[serde(flatten)]
    pub state: HostState,
}

/// On-disk shape of the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_mode: RunMode,
    pub run_id: String,
    pub current_stage: String,
    pub hosts: Vec<PersistedHost>,
}

impl RunRecord {
    pub fn read(path: &Path) -> Result<Self, StateError> {
        let contents = fs::read_to_string(path).map_err(|source| StateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| StateError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
struct HostRecord {
    state: HostState,
    node: Node,
}

/// In-memory view of the state file, owned by the coordinating task.
#[derive(Debug)]
pub struct InstallStatus {
    path: PathBuf,
    run_mode: RunMode,
    run_id: Option<String>,
    current_stage: String,
    hosts: IndexMap<String, HostRecord>,
}

impl InstallStatus {
    /// Open the store at `path`, loading and validating any existing record.
    pub fn open(path: impl Into<PathBuf>, run_mode: RunMode) -> Result<Self, StateError> {
        let mut status = Self {
            path: path.into(),
            run_mode,
            run_id: None,
            current_stage: PRE_MARKER.to_string(),
            hosts: IndexMap::new(),
        };
        if status.path.exists() {
            status.reload()?;
            info!(
                path = %status.path.display(),
                stage = %status.current_stage,
                hosts = status.hosts.len(),
                "resuming install"
            );
        }
        Ok(status)
    }

    /// Start a new run. Never overwrites an existing state file.
    pub fn initialize(&mut self, groups: &HostGroups) -> Result<(), StateError> {
        if self.path.exists() {
            return Err(self.already_initialized());
        }

        let mut hosts = IndexMap::new();
        for (host, role) in groups.tagged() {
            let tags = role_tags(role);
            let node = Node::parse(host, tags.clone()).map_err(|source| {
                StateError::InvalidHost {
                    host: host.clone(),
                    source,
                }
            })?;
            // Keyed by the normalized `host[:port]` form the dispatcher reports.
            let id = node.id();
            if hosts.contains_key(&id) {
                return Err(StateError::DuplicateHost(id));
            }
            hosts.insert(
                id,
                HostRecord {
                    state: HostState::fresh(tags),
                    node,
                },
            );
        }

        let record = RunRecord {
            run_mode: self.run_mode,
            run_id: Uuid::new_v4().simple().to_string(),
            current_stage: PRE_MARKER.to_string(),
            hosts: persisted_hosts(&hosts),
        };
        let file = self.write_temp(&record)?;
        file.persist_noclobber(&self.path).map_err(|err| {
            if err.error.kind() == io::ErrorKind::AlreadyExists {
                self.already_initialized()
            } else {
                StateError::Write {
                    path: self.path.clone(),
                    source: err.error,
                }
            }
        })?;

        info!(
            path = %self.path.display(),
            run_id = %record.run_id,
            hosts = hosts.len(),
            "initialized install state"
        );
        self.run_id = Some(record.run_id);
        self.current_stage = record.current_stage;
        self.hosts = hosts;
        Ok(())
    }

    pub fn update(&mut self, host_id: &str, stage: &str, step: &str) -> Result<(), StateError> {
        let host = self.host_mut(host_id)?;
        host.state.stage = stage.to_string();
        host.state.step = step.to_string();
        Ok(())
    }

    /// Change a host's skip flag; only allowed while it sits in the current stage.
    pub fn mark_skip(&mut self, host_id: &str, skip: bool) -> Result<(), StateError> {
        let current = self.current_stage.clone();
        let host = self.host_mut(host_id)?;
        if host.state.skip == skip {
            return Ok(());
        }
        if host.state.stage != current {
            return Err(StateError::StageMismatch {
                host: host_id.to_string(),
                stage: host.state.stage.clone(),
                current,
            });
        }
        host.state.skip = skip;
        debug!(host = host_id, skip, "updated host skip flag");
        Ok(())
    }

    /// Hosts that still take part in the install, in configuration order.
    pub fn get_active_nodes(&self) -> Vec<Node> {
        self.hosts
            .values()
            .filter(|host| !host.state.skip)
            .map(|host| host.node.clone())
            .collect()
    }

    /// Persist the in-memory record, refusing to replace a file that now
    /// belongs to another run or has been removed underneath us.
    pub fn checkpoint(&self) -> Result<(), StateError> {
        let record = self.record()?;
        self.check_on_disk_run(&record.run_id)?;
        let file = self.write_temp(&record)?;
        file.persist(&self.path).map_err(|err| StateError::Write {
            path: self.path.clone(),
            source: err.error,
        })?;
        debug!(
            path = %self.path.display(),
            stage = %self.current_stage,
            "checkpointed install state"
        );
        Ok(())
    }

    /// Re-read the state file, refusing records from another run or front-end.
    pub fn reload(&mut self) -> Result<(), StateError> {
        let record = RunRecord::read(&self.path)?;
        if record.run_mode != self.run_mode {
            return Err(StateError::RunModeMismatch {
                expected: self.run_mode,
                found: record.run_mode,
            });
        }
        if let Some(expected) = self.run_id.as_deref() {
            if expected != record.run_id {
                return Err(StateError::RunIdMismatch {
                    expected: expected.to_string(),
                    found: record.run_id,
                });
            }
        }

        let mut hosts = IndexMap::new();
        for host in record.hosts {
            if hosts.contains_key(&host.id) {
                return Err(StateError::DuplicateHost(host.id));
            }
            let node = Node::parse(&host.id, host.state.tags.clone()).map_err(|source| {
                StateError::InvalidHost {
                    host: host.id.clone(),
                    source,
                }
            })?;
            hosts.insert(
                host.id,
                HostRecord {
                    state: host.state,
                    node,
                },
            );
        }

        self.run_id = Some(record.run_id);
        self.current_stage = record.current_stage;
        self.hosts = hosts;
        Ok(())
    }

    pub fn set_current_stage(&mut self, stage: &str) {
        self.current_stage = stage.to_string();
    }

    pub fn current_stage(&self) -> &str {
        &self.current_stage
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_initialized(&self) -> bool {
        self.run_id.is_some()
    }

    pub fn host(&self, host_id: &str) -> Option<&HostState> {
        self.hosts.get(host_id).map(|host| &host.state)
    }

    pub fn hosts(&self) -> impl Iterator<Item = (&str, &HostState)> {
        self.hosts
            .iter()
            .map(|(id, host)| (id.as_str(), &host.state))
    }

    pub fn record(&self) -> Result<RunRecord, StateError> {
        let run_id = self.run_id.clone().ok_or(StateError::NotInitialized)?;
        Ok(RunRecord {
            run_mode: self.run_mode,
            run_id,
            current_stage: self.current_stage.clone(),
            hosts: persisted_hosts(&self.hosts),
        })
    }

    /// Finish the run: the state file is removed so the next start is fresh.
    pub fn complete(self) -> Result<(), StateError> {
        Self::reset(&self.path)?;
        info!(path = %self.path.display(), "install complete; removed state file");
        Ok(())
    }

    /// Delete a state file. Returns whether one existed.
    pub fn reset(path: &Path) -> Result<bool, StateError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StateError::Write {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn check_on_disk_run(&self, run_id: &str) -> Result<(), StateError> {
        if !self.path.exists() {
            return Err(StateError::Vanished {
                path: self.path.clone(),
            });
        }
        let on_disk = RunRecord::read(&self.path)?;
        if on_disk.run_id != run_id {
            return Err(StateError::RunIdMismatch {
                expected: run_id.to_string(),
                found: on_disk.run_id,
            });
        }
        Ok(())
    }

    fn host_mut(&mut self, host_id: &str) -> Result<&mut HostRecord, StateError> {
        self.hosts
            .get_mut(host_id)
            .ok_or_else(|| StateError::UnknownHost(host_id.to_string()))
    }

    fn already_initialized(&self) -> StateError {
        StateError::AlreadyInitialized {
            path: self.path.clone(),
            mode: self.run_mode,
        }
    }

    fn write_temp(&self, record: &RunRecord) -> Result<NamedTempFile, StateError> {
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(write_err)?;

        let mut file = NamedTempFile::new_in(dir).map_err(write_err)?;
        let contents = serde_json::to_vec_pretty(record)?;
        file.write_all(&contents).map_err(write_err)?;
        file.as_file().sync_all().map_err(write_err)?;
        Ok(file)
    }
}

fn persisted_hosts(hosts: &IndexMap<String, HostRecord>) -> Vec<PersistedHost> {
    hosts
        .iter()
        .map(|(id, host)| PersistedHost {
            id: id.clone(),
            state: host.state.clone(),
        })
        .collect()
}
