//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use super::config_validate::{render_issues, ValidationIssue};
use super::InstallerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFailed(String),
    #[error("failed to parse config: {0}")]
    ParseFailed(String),
    #[error("invalid configuration:\n{}", render_issues(.0))]
    Invalid(Vec<ValidationIssue>),
}

impl InstallerConfig {
    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|err| ConfigError::ReadFailed(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration text and fill in environment-dependent defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config: InstallerConfig =
            toml::from_str(contents).map_err(|err| ConfigError::ParseFailed(err.to_string()))?;
        config.apply_runtime_defaults();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_unset_fields() {
        let config = InstallerConfig::from_toml_str(
            r#"
            ssh_user = "centos"
            master_list = ["10.0.0.1"]
            agent_list = ["10.0.0.2", "10.0.0.3:2222"]
            "#,
        )
        .expect("config");

        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.ssh_parallelism, 20);
        assert_eq!(config.process_timeout, 120);
        assert_eq!(config.ssh_key_path, Path::new("genconf/ssh_key"));
        assert!(config.public_agent_list.is_empty());

        let groups = config.host_groups();
        assert_eq!(groups.masters, vec!["10.0.0.1"]);
        assert_eq!(groups.agents, vec!["10.0.0.2", "10.0.0.3:2222"]);
    }

    #[test]
    fn extra_options_split_on_whitespace() {
        let config = InstallerConfig::from_toml_str(
            r#"
            ssh_user = "core"
            extra_ssh_options = "-oLogLevel=ERROR   -4"
            "#,
        )
        .expect("config");
        assert_eq!(config.extra_ssh_options(), vec!["-oLogLevel=ERROR", "-4"]);
        assert_eq!(config.connection_options().extra_options.len(), 2);
    }

    #[test]
    fn parse_errors_are_reported() {
        let err = InstallerConfig::from_toml_str("ssh_port = \"twenty\"").expect_err("invalid");
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }
}
