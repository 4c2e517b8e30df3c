//! Terminal progress and summary output.

use std::io::{self, IsTerminal, Write};

use clap::ValueEnum;
use crossterm::queue;
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};
use tokio::sync::mpsc;
use tracing::warn;

use stagecoach_core::util::tail_snippet;

use crate::dispatch::{HostOutcome, ProgressEvent};
use crate::pipeline::{RunOutcome, RunSummary};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    /// `Auto` colors only when stdout is a terminal.
    pub fn enabled(self) -> bool {
        match self {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => io::stdout().is_terminal(),
        }
    }
}

pub struct Reporter<W> {
    out: W,
    color: bool,
}

impl Reporter<io::Stdout> {
    pub fn stdout(choice: ColorChoice) -> Self {
        Self::new(io::stdout(), choice.enabled())
    }
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self { out, color }
    }

    pub fn event(&mut self, event: &ProgressEvent) -> io::Result<()> {
        match event {
            ProgressEvent::StageStarted { stage, hosts } => {
                self.styled(&format!("==> {stage}"), Some(Color::Cyan), true)?;
                self.plain(&format!(" ({hosts} host{})\n", plural(*hosts)))?;
            }
            ProgressEvent::StageFinished { stage, failed } if *failed > 0 => {
                self.styled(
                    &format!("==> {stage}: {failed} host{} failed\n", plural(*failed)),
                    Some(Color::Red),
                    true,
                )?;
            }
            ProgressEvent::StageFinished { .. } | ProgressEvent::HostStarted { .. } => {}
            ProgressEvent::StepStarted {
                host,
                step,
                index,
                total,
            } => {
                self.styled(
                    &format!("    {host} [{}/{total}] {step}\n", index + 1),
                    None,
                    false,
                )?;
            }
            ProgressEvent::StepFinished {
                host,
                step,
                succeeded: false,
                exit_code,
                attempts,
            } => {
                let code = exit_code.map_or_else(|| "none".to_string(), |code| code.to_string());
                self.styled(
                    &format!("    {host} {step} failed (exit {code}, attempts {attempts})\n"),
                    Some(Color::Red),
                    false,
                )?;
            }
            ProgressEvent::StepFinished { .. } => {}
            ProgressEvent::HostFinished { host, outcome } => {
                self.plain(&format!("  {host} "))?;
                match outcome {
                    HostOutcome::Success => self.styled("ok\n", Some(Color::Green), true)?,
                    HostOutcome::Failed { step, reason } => self.styled(
                        &format!("FAILED at {step}: {reason}\n"),
                        Some(Color::Red),
                        true,
                    )?,
                    HostOutcome::Cancelled => {
                        self.styled("cancelled\n", Some(Color::Yellow), true)?
                    }
                }
            }
        }
        self.out.flush()
    }

    /// Final report: per-host failure detail and the overall result.
    pub fn summary(&mut self, summary: &RunSummary) -> io::Result<()> {
        for stage in &summary.stages {
            for report in stage.failures() {
                let HostOutcome::Failed { step, reason } = &report.outcome else {
                    continue;
                };
                self.plain("\n")?;
                self.styled(
                    &format!("{} failed {} at {step}\n", report.node, stage.stage),
                    Some(Color::Red),
                    true,
                )?;
                self.plain(&format!("  reason: {reason}\n"))?;
                if let Some(result) = report.last_result() {
                    if !result.argv.is_empty() {
                        self.plain(&format!("  command: {}\n", result.argv.join(" ")))?;
                    }
                    if !result.stderr.is_empty() {
                        self.plain(&format!("  stderr: {}\n", tail_snippet(&result.stderr)))?;
                    }
                    if !result.stdout.is_empty() {
                        self.plain(&format!("  stdout: {}\n", tail_snippet(&result.stdout)))?;
                    }
                }
            }
        }

        self.plain("\n")?;
        match &summary.outcome {
            RunOutcome::Completed => {
                self.styled("Install completed on all hosts.\n", Some(Color::Green), true)?
            }
            RunOutcome::Failed { stage } => self.styled(
                &format!(
                    "Install stopped at stage {stage}. Fix or skip the failed hosts and run again to resume.\n"
                ),
                Some(Color::Red),
                true,
            )?,
            RunOutcome::Cancelled { stage } => self.styled(
                &format!("Install cancelled during stage {stage}. Run again to resume.\n"),
                Some(Color::Yellow),
                true,
            )?,
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn plain(&mut self, text: &str) -> io::Result<()> {
        self.out.write_all(text.as_bytes())
    }

    fn styled(&mut self, text: &str, color: Option<Color>, bold: bool) -> io::Result<()> {
        if !self.color {
            return self.plain(text);
        }
        if let Some(color) = color {
            queue!(self.out, SetForegroundColor(color))?;
        }
        if bold {
            queue!(self.out, SetAttribute(Attribute::Bold))?;
        } else if color.is_none() {
            queue!(self.out, SetAttribute(Attribute::Dim))?;
        }
        queue!(
            self.out,
            Print(text),
            SetAttribute(Attribute::Reset),
            ResetColor
        )
    }
}

fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

/// Print events until every sender is gone, then hand the reporter back.
pub async fn forward<W: Write>(
    mut events: mpsc::UnboundedReceiver<ProgressEvent>,
    mut reporter: Reporter<W>,
) -> Reporter<W> {
    while let Some(event) = events.recv().await {
        if let Err(err) = reporter.event(&event) {
            warn!(?err, "failed to write progress");
        }
    }
    reporter
}
