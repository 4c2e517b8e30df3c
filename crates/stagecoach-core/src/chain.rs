//! Logical remote actions and the per-host chains that sequence them.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// One unit of remote work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Transfer a local file into the remote work directory.
    Copy {
        local_path: PathBuf,
        /// Destination relative to the remote work directory.
        remote_path: String,
    },
    /// Run a previously copied script under `bash`.
    Run {
        /// Script location relative to the remote work directory.
        remote_path: String,
        args: Vec<String>,
        /// Interpolate `{tag}` placeholders in `args` from the host's tags.
        parameterized: bool,
    },
    /// Run an arbitrary command over the remote shell as-is.
    RunExternal { argv: Vec<String> },
}

/// Re-run a step until it succeeds or `ceiling` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub ceiling: Duration,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStep {
    pub action: Action,
    pub description: String,
    /// Overrides the dispatcher-wide per-action timeout.
    pub timeout: Option<Duration>,
    pub poll: Option<PollPolicy>,
}

impl ChainStep {
    pub fn new(action: Action, description: impl Into<String>) -> Self {
        Self {
            action,
            description: description.into(),
            timeout: None,
            poll: None,
        }
    }

    pub fn with_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_poll(&mut self, poll: PollPolicy) -> &mut Self {
        self.poll = Some(poll);
        self
    }
}

/// Ordered actions for one host within one stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chain {
    steps: Vec<ChainStep>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: ChainStep) -> &mut ChainStep {
        self.steps.push(step);
        let last = self.steps.len() - 1;
        &mut self.steps[last]
    }

    pub fn add_copy(
        &mut self,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        description: impl Into<String>,
    ) -> &mut ChainStep {
        self.push(ChainStep::new(
            Action::Copy {
                local_path: local_path.into(),
                remote_path: remote_path.into(),
            },
            description,
        ))
    }

    pub fn add_run(
        &mut self,
        remote_path: impl Into<String>,
        args: Vec<String>,
        parameterized: bool,
        description: impl Into<String>,
    ) -> &mut ChainStep {
        self.push(ChainStep::new(
            Action::Run {
                remote_path: remote_path.into(),
                args,
                parameterized,
            },
            description,
        ))
    }

    pub fn add_execute<I, S>(&mut self, argv: I, description: impl Into<String>) -> &mut ChainStep
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(ChainStep::new(
            Action::RunExternal {
                argv: argv.into_iter().map(Into::into).collect(),
            },
            description,
        ))
    }

    /// Copy a script into the work directory under its file name, then run it.
    pub fn copy_and_run(
        &mut self,
        local_path: impl AsRef<Path>,
        args: Vec<String>,
        parameterized: bool,
        description: impl Into<String>,
    ) -> &mut ChainStep {
        let local_path = local_path.as_ref();
        let file_name = remote_name(local_path);
        let description = description.into();
        self.add_copy(local_path, file_name.clone(), format!("Copying {file_name}"));
        self.add_run(file_name, args, parameterized, description)
    }

    /// Append every step of `other` after the current steps.
    pub fn append(&mut self, other: Chain) {
        self.steps.extend(other.steps);
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainStep> {
        self.steps.iter()
    }
}

fn remote_name(local_path: &Path) -> String {
    local_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| local_path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_and_run_targets_the_copied_file_name() {
        let mut chain = Chain::new();
        chain.copy_and_run(
            "genconf/serve/dcos_install.sh",
            vec!["{role}".to_string(), "--preflight-only".to_string()],
            true,
            "Running preflight checks",
        );

        assert_eq!(chain.len(), 2);
        assert_eq!(
            chain.steps()[0].action,
            Action::Copy {
                local_path: PathBuf::from("genconf/serve/dcos_install.sh"),
                remote_path: "dcos_install.sh".to_string(),
            }
        );
        assert_eq!(chain.steps()[0].description, "Copying dcos_install.sh");
        assert_eq!(
            chain.steps()[1].action,
            Action::Run {
                remote_path: "dcos_install.sh".to_string(),
                args: vec!["{role}".to_string(), "--preflight-only".to_string()],
                parameterized: true,
            }
        );
    }

    #[test]
    fn step_overrides_apply_to_last_step() {
        let mut chain = Chain::new();
        chain.add_execute(["true"], "first");
        chain
            .add_execute(["sudo", "probe"], "probe")
            .with_timeout(Duration::from_secs(5))
            .with_poll(PollPolicy {
                ceiling: Duration::from_secs(30),
                interval: Duration::from_secs(1),
            });

        assert_eq!(chain.steps()[0].timeout, None);
        assert_eq!(chain.steps()[1].timeout, Some(Duration::from_secs(5)));
        assert!(chain.steps()[1].poll.is_some());
    }
}
