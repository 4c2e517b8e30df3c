//! Remote host identity and per-action execution results.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Routing metadata attached to a host (for example `role = "master"`).
pub type Tags = BTreeMap<String, String>;

/// Tag key carrying the host role passed to the install script.
pub const ROLE_TAG: &str = "role";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeParseError {
    #[error("host address is empty")]
    Empty,
    #[error(
        "expected <address> or <address>:<port> but found more than one colon in {0:?} \
         (IPv6 addresses are not supported)"
    )]
    TooManyColons(String),
    #[error("invalid port in host {0:?}")]
    InvalidPort(String),
}

/// A remote install target.
///
/// Identity is the address plus the optional port. Tags are carried along for
/// argument interpolation only and never take part in equality or hashing.
#[derive(Debug, Clone)]
pub struct Node {
    address: String,
    port: Option<u16>,
    tags: Tags,
}

impl Node {
    /// Parse `host` or `host:port` and attach the given tags.
    pub fn parse(host: &str, tags: Tags) -> Result<Self, NodeParseError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(NodeParseError::Empty);
        }
        let mut parts = host.split(':');
        let address = parts.next().unwrap_or_default();
        let port = parts.next();
        if parts.next().is_some() {
            return Err(NodeParseError::TooManyColons(host.to_string()));
        }
        if address.is_empty() {
            return Err(NodeParseError::Empty);
        }
        let port = match port {
            Some(value) => Some(
                value
                    .parse::<u16>()
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or_else(|| NodeParseError::InvalidPort(host.to_string()))?,
            ),
            None => None,
        };
        Ok(Self {
            address: address.to_string(),
            port,
            tags,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn role(&self) -> Option<&str> {
        self.tag(ROLE_TAG)
    }

    /// Stable host identifier in the same `host[:port]` form it was parsed from.
    pub fn id(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.address, port),
            None => self.address.clone(),
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl FromStr for Node {
    type Err = NodeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value, Tags::new())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())?;
        if !self.tags.is_empty() {
            let rendered = self
                .tags
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(",");
            write!(f, " [{rendered}]")?;
        }
        Ok(())
    }
}

/// Outcome of one action attempt on one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub argv: Vec<String>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Absent when the process timed out and was killed, or never started.
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
    /// Description of the chain step that produced this result.
    pub stage: String,
    /// Number of process runs behind this result (more than one for polled steps).
    pub attempts: u32,
    pub timed_out: bool,
    pub duration: Duration,
    /// Spawn or I/O failure reported by the orchestrator itself.
    pub error: Option<String>,
}

impl ExecutionResult {
    /// A result for an action that never produced a process.
    pub fn not_started(argv: Vec<String>, stage: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            argv,
            stage: stage.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.error.is_none() && !self.timed_out
    }

    /// Short human-readable reason for a failed result.
    pub fn failure_reason(&self) -> String {
        if let Some(error) = self.error.as_deref() {
            return error.to_string();
        }
        if self.timed_out {
            return format!("timed out after {:.1}s", self.duration.as_secs_f64());
        }
        match self.exit_code {
            Some(0) => "succeeded".to_string(),
            Some(code) => format!("exited with status {code}"),
            None => "terminated without exit status".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_address() {
        let node: Node = "10.0.0.1".parse().expect("node");
        assert_eq!(node.address(), "10.0.0.1");
        assert_eq!(node.port(), None);
        assert_eq!(node.id(), "10.0.0.1");
    }

    #[test]
    fn parses_address_with_port() {
        let node: Node = "10.0.0.1:2222".parse().expect("node");
        assert_eq!(node.address(), "10.0.0.1");
        assert_eq!(node.port(), Some(2222));
        assert_eq!(node.id(), "10.0.0.1:2222");
    }

    #[test]
    fn rejects_more_than_one_colon() {
        assert_eq!(
            "10.0.0.1:2222:3".parse::<Node>(),
            Err(NodeParseError::TooManyColons("10.0.0.1:2222:3".to_string()))
        );
        assert!(matches!(
            "fe80::1".parse::<Node>(),
            Err(NodeParseError::TooManyColons(_))
        ));
    }

    #[test]
    fn rejects_bad_ports_and_empty_hosts() {
        assert!(matches!(
            "10.0.0.1:ssh".parse::<Node>(),
            Err(NodeParseError::InvalidPort(_))
        ));
        assert!(matches!(
            "10.0.0.1:70000".parse::<Node>(),
            Err(NodeParseError::InvalidPort(_))
        ));
        assert_eq!("  ".parse::<Node>(), Err(NodeParseError::Empty));
        assert_eq!(":22".parse::<Node>(), Err(NodeParseError::Empty));
    }

    #[test]
    fn identity_ignores_tags() {
        let mut tags = Tags::new();
        tags.insert(ROLE_TAG.to_string(), "master".to_string());
        let tagged = Node::parse("10.0.0.1", tags).expect("node");
        let bare: Node = "10.0.0.1".parse().expect("node");
        assert_eq!(tagged, bare);
        assert_eq!(tagged.role(), Some("master"));

        let other_port: Node = "10.0.0.1:22".parse().expect("node");
        assert_ne!(bare, other_port);
    }

    #[test]
    fn failure_reason_prefers_orchestrator_errors() {
        let result = ExecutionResult::not_started(vec!["scp".into()], "Copying", "spawn failed");
        assert!(!result.succeeded());
        assert_eq!(result.failure_reason(), "spawn failed");

        let exited = ExecutionResult {
            exit_code: Some(3),
            ..ExecutionResult::default()
        };
        assert_eq!(exited.failure_reason(), "exited with status 3");
    }
}
