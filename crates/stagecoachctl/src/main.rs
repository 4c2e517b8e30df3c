//! Command-line control surface for an in-progress install's state file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use stagecoach_core::{HostState, InstallStatus, RunMode, RunRecord};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the install state file
    #[arg(long, default_value = "genconf/install_state.json")]
    state_file: PathBuf,

    /// Expected run mode; defaults to the one recorded in the state file
    #[arg(long)]
    mode: Option<RunMode>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the current stage and every host's progress
    Status,
    /// Leave a host out of the remaining stages
    Skip { host: String },
    /// Bring a skipped host back
    Unskip { host: String },
    /// Delete the state file so the next install starts fresh
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Status => {
            let status = open(&args.state_file, args.mode)?;
            print!("{}", render_status(&status));
        }
        Command::Skip { host } => {
            set_skip(&args.state_file, args.mode, &host, true)?;
            println!("{host} will be skipped");
        }
        Command::Unskip { host } => {
            set_skip(&args.state_file, args.mode, &host, false)?;
            println!("{host} will be included");
        }
        Command::Reset { yes } => {
            if !yes {
                bail!(
                    "reset discards all install progress in {}; pass --yes to confirm",
                    args.state_file.display()
                );
            }
            let removed = InstallStatus::reset(&args.state_file).context("remove state file")?;
            if removed {
                println!("removed {}", args.state_file.display());
            } else {
                println!("no install in progress");
            }
        }
    }

    Ok(())
}

fn open(path: &Path, mode: Option<RunMode>) -> Result<InstallStatus> {
    if !path.exists() {
        bail!("no install in progress ({} not found)", path.display());
    }
    let mode = match mode {
        Some(mode) => mode,
        None => RunRecord::read(path).context("read state file")?.run_mode,
    };
    InstallStatus::open(path, mode).context("load state file")
}

fn set_skip(path: &Path, mode: Option<RunMode>, host: &str, skip: bool) -> Result<()> {
    let mut status = open(path, mode)?;
    status.mark_skip(host, skip)?;
    status.checkpoint().context("write state file")?;
    Ok(())
}

fn render_status(status: &InstallStatus) -> String {
    let mut out = format!(
        "run {} ({}), current stage: {}\n",
        status.run_id().unwrap_or("-"),
        status.run_mode(),
        status.current_stage()
    );
    for (id, host) in status.hosts() {
        out.push_str(&format!("- {id} {}\n", describe(host)));
    }
    out
}

fn describe(host: &HostState) -> String {
    let role = host.tags.get("role").map(String::as_str).unwrap_or("-");
    let skip = if host.skip { " (skipped)" } else { "" };
    format!("[{role}] {}/{}{skip}", host.stage, host.step)
}

#[cfg(test)]
mod tests {
    use super::*;

    use stagecoach_core::HostGroups;

    fn started(dir: &Path) -> PathBuf {
        let path = dir.join("install_state.json");
        let mut status = InstallStatus::open(&path, RunMode::Unattended).expect("open");
        status
            .initialize(&HostGroups {
                masters: vec!["10.0.0.1".to_string()],
                agents: vec!["10.0.0.2".to_string()],
                public_agents: Vec::new(),
            })
            .expect("initialize");
        path
    }

    #[test]
    fn skip_persists_using_recorded_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = started(dir.path());

        set_skip(&path, None, "10.0.0.2", true).expect("skip");
        let status = open(&path, None).expect("reopen");
        assert!(status.host("10.0.0.2").expect("host").skip);

        let rendered = render_status(&status);
        assert!(rendered.contains("(unattended), current stage: _pre"));
        assert!(rendered.contains("- 10.0.0.2 [slave] _pre/_pre (skipped)"));
    }

    #[test]
    fn wrong_mode_and_unknown_hosts_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = started(dir.path());

        assert!(open(&path, Some(RunMode::Interactive)).is_err());
        assert!(set_skip(&path, None, "10.9.9.9", true).is_err());
        assert!(open(&dir.path().join("missing.json"), None).is_err());
    }
}
