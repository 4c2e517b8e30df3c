//! Translation of logical actions into `ssh`/`scp` argument vectors.
//!
//! Everything here is pure: no processes are started and no files are read.
//! Every invocation carries the same non-interactive connection options so a
//! remote host can never stall a worker on a prompt.

use std::path::PathBuf;

use thiserror::Error;

use crate::chain::{Action, Chain};
use crate::model::Node;

/// Remote scratch directory that every stage chain works in.
pub const REMOTE_WORK_DIR: &str = "/opt/dcos_install_tmp";
/// Seconds `ssh`/`scp` wait for the TCP connection before giving up.
pub const CONNECT_TIMEOUT_SECS: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("argument {template:?} references tag {tag:?} which host {host} does not carry")]
    MissingTag {
        template: String,
        tag: String,
        host: String,
    },
    #[error("argument {template:?} has an unterminated placeholder")]
    Unterminated { template: String },
    #[error("argument {template:?} has an unmatched closing brace")]
    UnmatchedClose { template: String },
}

/// Connection settings shared by every host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub user: String,
    pub default_port: u16,
    pub key_path: PathBuf,
    pub extra_options: Vec<String>,
    pub ssh_binary: PathBuf,
    pub scp_binary: PathBuf,
    pub work_dir: String,
}

impl ConnectionOptions {
    pub fn new(user: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            default_port: 22,
            key_path: key_path.into(),
            extra_options: Vec::new(),
            ssh_binary: PathBuf::from("ssh"),
            scp_binary: PathBuf::from("scp"),
            work_dir: REMOTE_WORK_DIR.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    options: ConnectionOptions,
}

impl CommandBuilder {
    pub fn new(options: ConnectionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn work_dir(&self) -> &str {
        &self.options.work_dir
    }

    /// Build the exact argv that performs `action` against `node`.
    pub fn build(&self, node: &Node, action: &Action) -> Result<Vec<String>, TemplateError> {
        match action {
            Action::Copy {
                local_path,
                remote_path,
            } => {
                let mut argv = vec![
                    self.options.scp_binary.to_string_lossy().into_owned(),
                    format!("-P{}", self.port_for(node)),
                ];
                argv.extend(self.base_args());
                argv.push(local_path.to_string_lossy().into_owned());
                argv.push(format!(
                    "{}:{}",
                    self.destination(node),
                    self.remote_path(remote_path)
                ));
                Ok(argv)
            }
            Action::Run {
                remote_path,
                args,
                parameterized,
            } => {
                let mut command = vec!["bash".to_string(), self.remote_path(remote_path)];
                if *parameterized {
                    for arg in args {
                        command.push(interpolate(arg, node)?);
                    }
                } else {
                    command.extend(args.iter().cloned());
                }
                Ok(self.ssh(node, command))
            }
            Action::RunExternal { argv } => Ok(self.ssh(node, argv.iter().cloned())),
        }
    }

    /// Append the steps that create the work directory owned by the ssh user.
    pub fn add_setup(&self, chain: &mut Chain) {
        let work_dir = self.work_dir().to_string();
        chain.add_execute(
            ["sudo", "mkdir", "-p", work_dir.as_str()],
            "Creating temporary work directory",
        );
        chain.add_execute(
            ["sudo", "chown", self.options.user.as_str(), work_dir.as_str()],
            format!("Ensuring {} owns temporary work directory", self.options.user),
        );
    }

    /// Append the step that removes the work directory.
    pub fn add_cleanup(&self, chain: &mut Chain) {
        chain.add_execute(
            ["sudo", "rm", "-rf", self.work_dir()],
            "Cleaning up temporary work directory",
        );
    }

    /// Resolve a work-directory relative path to its absolute remote form.
    pub fn remote_path(&self, relative: &str) -> String {
        let relative = relative.trim_start_matches('/');
        let work_dir = self.work_dir().trim_end_matches('/');
        if relative.is_empty() {
            work_dir.to_string()
        } else {
            format!("{work_dir}/{relative}")
        }
    }

    fn ssh(&self, node: &Node, command: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut argv = vec![self.options.ssh_binary.to_string_lossy().into_owned()];
        argv.extend(self.base_args());
        argv.push("-p".to_string());
        argv.push(self.port_for(node).to_string());
        // Force a remote tty so sudo never refuses to run for lack of one.
        argv.push("-tt".to_string());
        argv.push(self.destination(node));
        argv.extend(command);
        argv
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("-oConnectTimeout={CONNECT_TIMEOUT_SECS}"),
            "-oStrictHostKeyChecking=no".to_string(),
            "-oUserKnownHostsFile=/dev/null".to_string(),
            "-oBatchMode=yes".to_string(),
            "-oPasswordAuthentication=no".to_string(),
            "-i".to_string(),
            self.options.key_path.to_string_lossy().into_owned(),
        ];
        args.extend(self.options.extra_options.iter().cloned());
        args
    }

    fn port_for(&self, node: &Node) -> u16 {
        node.port().unwrap_or(self.options.default_port)
    }

    fn destination(&self, node: &Node) -> String {
        format!("{}@{}", self.options.user, node.address())
    }
}

/// Replace `{tag}` placeholders with the node's tag values.
///
/// `{{` and `}}` produce literal braces. A placeholder naming a tag the node
/// does not carry is an error rather than an empty substitution.
pub fn interpolate(template: &str, node: &Node) -> Result<String, TemplateError> {
    let mut rendered = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                rendered.push('{');
            }
            '{' => {
                let mut tag = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => tag.push(c),
                        None => {
                            return Err(TemplateError::Unterminated {
                                template: template.to_string(),
                            })
                        }
                    }
                }
                let value = node.tag(&tag).ok_or_else(|| TemplateError::MissingTag {
                    template: template.to_string(),
                    tag: tag.clone(),
                    host: node.id(),
                })?;
                rendered.push_str(value);
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                rendered.push('}');
            }
            '}' => {
                return Err(TemplateError::UnmatchedClose {
                    template: template.to_string(),
                })
            }
            other => rendered.push(other),
        }
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Tags, ROLE_TAG};

    fn builder() -> CommandBuilder {
        let mut options = ConnectionOptions::new("centos", "genconf/ssh_key");
        options.extra_options = vec!["-oLogLevel=ERROR".to_string()];
        CommandBuilder::new(options)
    }

    fn master(host: &str) -> Node {
        let mut tags = Tags::new();
        tags.insert(ROLE_TAG.to_string(), "master".to_string());
        Node::parse(host, tags).expect("node")
    }

    const BASE: [&str; 8] = [
        "-oConnectTimeout=10",
        "-oStrictHostKeyChecking=no",
        "-oUserKnownHostsFile=/dev/null",
        "-oBatchMode=yes",
        "-oPasswordAuthentication=no",
        "-i",
        "genconf/ssh_key",
        "-oLogLevel=ERROR",
    ];

    #[test]
    fn copy_uses_default_port_and_work_dir() {
        let argv = builder()
            .build(
                &master("10.0.0.1"),
                &Action::Copy {
                    local_path: PathBuf::from("genconf/serve/dcos_install.sh"),
                    remote_path: "dcos_install.sh".to_string(),
                },
            )
            .expect("argv");

        let mut expected = vec!["scp".to_string(), "-P22".to_string()];
        expected.extend(BASE.iter().map(|s| s.to_string()));
        expected.push("genconf/serve/dcos_install.sh".to_string());
        expected.push("centos@10.0.0.1:/opt/dcos_install_tmp/dcos_install.sh".to_string());
        assert_eq!(argv, expected);
    }

    #[test]
    fn run_interpolates_role_and_uses_node_port() {
        let argv = builder()
            .build(
                &master("10.0.0.1:2222"),
                &Action::Run {
                    remote_path: "dcos_install.sh".to_string(),
                    args: vec!["{role}".to_string(), "--preflight-only".to_string()],
                    parameterized: true,
                },
            )
            .expect("argv");

        let mut expected = vec!["ssh".to_string()];
        expected.extend(BASE.iter().map(|s| s.to_string()));
        expected.extend(
            [
                "-p",
                "2222",
                "-tt",
                "centos@10.0.0.1",
                "bash",
                "/opt/dcos_install_tmp/dcos_install.sh",
                "master",
                "--preflight-only",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        assert_eq!(argv, expected);
    }

    #[test]
    fn unparameterized_run_keeps_braces() {
        let argv = builder()
            .build(
                &master("10.0.0.1"),
                &Action::Run {
                    remote_path: "script.sh".to_string(),
                    args: vec!["{role}".to_string()],
                    parameterized: false,
                },
            )
            .expect("argv");
        assert_eq!(argv.last().map(String::as_str), Some("{role}"));
    }

    #[test]
    fn run_external_passes_argv_through() {
        let argv = builder()
            .build(
                &master("10.0.0.1"),
                &Action::RunExternal {
                    argv: vec!["sudo".into(), "rm".into(), "-f".into(), "/opt/marker".into()],
                },
            )
            .expect("argv");
        assert_eq!(
            &argv[argv.len() - 5..],
            &["centos@10.0.0.1", "sudo", "rm", "-f", "/opt/marker"]
        );
    }

    #[test]
    fn missing_tag_fails_closed() {
        let node: Node = "10.0.0.2".parse().expect("node");
        let err = builder()
            .build(
                &node,
                &Action::Run {
                    remote_path: "dcos_install.sh".to_string(),
                    args: vec!["{role}".to_string()],
                    parameterized: true,
                },
            )
            .expect_err("missing tag");
        assert_eq!(
            err,
            TemplateError::MissingTag {
                template: "{role}".to_string(),
                tag: "role".to_string(),
                host: "10.0.0.2".to_string(),
            }
        );
    }

    #[test]
    fn interpolate_handles_escapes_and_malformed_templates() {
        let node = master("10.0.0.1");
        assert_eq!(
            interpolate("{{literal}} {role}", &node).expect("rendered"),
            "{literal} master"
        );
        assert!(matches!(
            interpolate("{role", &node),
            Err(TemplateError::Unterminated { .. })
        ));
        assert!(matches!(
            interpolate("role}", &node),
            Err(TemplateError::UnmatchedClose { .. })
        ));
    }

    #[test]
    fn setup_and_cleanup_manage_work_dir() {
        let builder = builder();
        let mut chain = Chain::new();
        builder.add_setup(&mut chain);
        builder.add_cleanup(&mut chain);

        let argvs: Vec<_> = chain
            .iter()
            .map(|step| match &step.action {
                Action::RunExternal { argv } => argv.join(" "),
                other => panic!("unexpected action {other:?}"),
            })
            .collect();
        assert_eq!(
            argvs,
            vec![
                "sudo mkdir -p /opt/dcos_install_tmp",
                "sudo chown centos /opt/dcos_install_tmp",
                "sudo rm -rf /opt/dcos_install_tmp",
            ]
        );
    }

    #[test]
    fn remote_path_is_rooted_at_work_dir() {
        let builder = builder();
        assert_eq!(
            builder.remote_path("packages/dcos-config"),
            "/opt/dcos_install_tmp/packages/dcos-config"
        );
        assert_eq!(
            builder.remote_path("/bootstrap"),
            "/opt/dcos_install_tmp/bootstrap"
        );
    }
}
