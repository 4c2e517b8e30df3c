//! Configuration types and defaults for Stagecoach.
//!
//! Keeps schema definitions in one place for easier auditing.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{ConnectionOptions, REMOTE_WORK_DIR};
use crate::model::{Tags, ROLE_TAG};
use crate::state::HostGroups;

/// Top-level configuration loaded from config.toml.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub log_level: Option<String>,
    pub master_list: Vec<String>,
    pub agent_list: Vec<String>,
    pub public_agent_list: Vec<String>,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub ssh_key_path: PathBuf,
    pub ssh_parallelism: usize,
    /// Per-action timeout in seconds.
    pub process_timeout: u64,
    /// Extra flags appended to every ssh/scp invocation, split on whitespace.
    pub extra_ssh_options: String,
    pub ssh_binary_path: PathBuf,
    pub scp_binary_path: PathBuf,
    /// Skip prerequisite installation (air-gapped hosts).
    pub offline: bool,
    /// Directory holding the generated install script, bootstrap tarball, and packages.
    pub serve_dir: PathBuf,
    pub cluster_packages_file: PathBuf,
    /// Falls back to the BOOTSTRAP_ID environment variable.
    pub bootstrap_id: Option<String>,
    pub state_file: PathBuf,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            log_level: None,
            master_list: Vec::new(),
            agent_list: Vec::new(),
            public_agent_list: Vec::new(),
            ssh_user: String::new(),
            ssh_port: 22,
            ssh_key_path: PathBuf::from("genconf/ssh_key"),
            ssh_parallelism: 20,
            process_timeout: 120,
            extra_ssh_options: String::new(),
            ssh_binary_path: PathBuf::from("/usr/bin/ssh"),
            scp_binary_path: PathBuf::from("/usr/bin/scp"),
            offline: false,
            serve_dir: PathBuf::from("genconf/serve"),
            cluster_packages_file: PathBuf::from("genconf/cluster_packages.json"),
            bootstrap_id: None,
            state_file: PathBuf::from("genconf/install_state.json"),
        }
    }
}

/// Role tag values understood by the generated install script.
pub mod roles {
    pub const MASTER: &str = "master";
    pub const AGENT: &str = "slave";
    pub const PUBLIC_AGENT: &str = "slave_public";
}

impl InstallerConfig {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout)
    }

    pub fn extra_ssh_options(&self) -> Vec<String> {
        self.extra_ssh_options
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            user: self.ssh_user.clone(),
            default_port: self.ssh_port,
            key_path: self.ssh_key_path.clone(),
            extra_options: self.extra_ssh_options(),
            ssh_binary: self.ssh_binary_path.clone(),
            scp_binary: self.scp_binary_path.clone(),
            work_dir: REMOTE_WORK_DIR.to_string(),
        }
    }

    pub fn host_groups(&self) -> HostGroups {
        HostGroups {
            masters: self.master_list.clone(),
            agents: self.agent_list.clone(),
            public_agents: self.public_agent_list.clone(),
        }
    }
}

pub fn role_tags(role: &str) -> Tags {
    let mut tags = Tags::new();
    tags.insert(ROLE_TAG.to_string(), role.to_string());
    tags
}
