//! Bounded-concurrency execution of per-host chains.
//!
//! Every host's chain runs on its own task, strictly in order; at most
//! `parallelism` hosts are in flight at once and a freed slot is refilled
//! immediately. A failing, timing out, or panicking host never affects the
//! others, and every host handed in comes back with a terminal outcome.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use stagecoach_core::util::{log_snippet, tail_snippet};
use stagecoach_core::{Chain, CommandBuilder, ExecutionResult, Node, PollPolicy, TemplateError};

/// Executes one prepared argv with a deadline.
///
/// The process-backed implementation lives in `child_process`; tests swap in
/// scripted runners.
pub trait ActionRunner: Send + Sync + 'static {
    fn run(
        &self,
        argv: Vec<String>,
        timeout: Duration,
    ) -> impl Future<Output = ExecutionResult> + Send;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to prepare commands for host {host}: {source}")]
    Template {
        host: String,
        #[source]
        source: TemplateError,
    },
}

/// Cooperative cancellation shared by the dispatcher and the signal handler.
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    Success,
    Failed { step: String, reason: String },
    /// Cancellation arrived before the chain finished.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct HostReport {
    pub node: Node,
    pub results: Vec<ExecutionResult>,
    pub outcome: HostOutcome,
}

impl HostReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == HostOutcome::Success
    }

    pub fn last_result(&self) -> Option<&ExecutionResult> {
        self.results.last()
    }

    fn failed(node: Node, step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node,
            results: Vec::new(),
            outcome: HostOutcome::Failed {
                step: step.into(),
                reason: reason.into(),
            },
        }
    }
}

/// Progress stream for reporters. Stage events come from the pipeline.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    StageStarted {
        stage: String,
        hosts: usize,
    },
    StageFinished {
        stage: String,
        failed: usize,
    },
    HostStarted {
        host: String,
    },
    StepStarted {
        host: String,
        step: String,
        index: usize,
        total: usize,
    },
    StepFinished {
        host: String,
        step: String,
        succeeded: bool,
        exit_code: Option<i32>,
        attempts: u32,
    },
    HostFinished {
        host: String,
        outcome: HostOutcome,
    },
}

#[derive(Debug, Clone)]
struct PreparedStep {
    argv: Vec<String>,
    description: String,
    timeout: Duration,
    poll: Option<PollPolicy>,
}

#[derive(Debug)]
struct HostJob {
    node: Node,
    steps: Vec<PreparedStep>,
}

/// State shared by every worker task.
struct Shared<R> {
    runner: R,
    events: Option<mpsc::UnboundedSender<ProgressEvent>>,
    cancel: CancelToken,
}

impl<R> Shared<R> {
    fn emit(&self, event: ProgressEvent) {
        if let Some(events) = self.events.as_ref() {
            let _ = events.send(event);
        }
    }
}

pub struct Dispatcher<R> {
    shared: Arc<Shared<R>>,
    builder: CommandBuilder,
    parallelism: usize,
    timeout: Duration,
}

impl<R: ActionRunner> Dispatcher<R> {
    pub fn new(runner: R, builder: CommandBuilder, parallelism: usize, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                runner,
                events: None,
                cancel: CancelToken::new(),
            }),
            builder,
            parallelism: parallelism.max(1),
            timeout,
        }
    }

    /// Attach a progress channel and a cancellation token. Call before dispatching.
    pub fn with_observers(
        mut self,
        events: Option<mpsc::UnboundedSender<ProgressEvent>>,
        cancel: CancelToken,
    ) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.events = events;
            shared.cancel = cancel;
        }
        self
    }

    pub fn builder(&self) -> &CommandBuilder {
        &self.builder
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.shared.cancel
    }

    pub(crate) fn emit(&self, event: ProgressEvent) {
        self.shared.emit(event);
    }

    /// Run every chain on its host and return one report per host, in input order.
    ///
    /// All commands are built up front, so a template error aborts before any
    /// process starts.
    pub async fn dispatch(
        &self,
        pairs: Vec<(Node, Chain)>,
    ) -> Result<Vec<HostReport>, DispatchError> {
        let jobs = self.prepare(pairs)?;
        Ok(self.run_jobs(jobs).await)
    }

    fn prepare(&self, pairs: Vec<(Node, Chain)>) -> Result<Vec<HostJob>, DispatchError> {
        pairs
            .into_iter()
            .map(|(node, chain)| {
                let steps = chain
                    .iter()
                    .map(|step| {
                        let argv = self.builder.build(&node, &step.action).map_err(|source| {
                            DispatchError::Template {
                                host: node.id(),
                                source,
                            }
                        })?;
                        Ok(PreparedStep {
                            argv,
                            description: step.description.clone(),
                            timeout: step.timeout.unwrap_or(self.timeout),
                            poll: step.poll,
                        })
                    })
                    .collect::<Result<Vec<_>, DispatchError>>()?;
                Ok(HostJob { node, steps })
            })
            .collect()
    }

    async fn run_jobs(&self, jobs: Vec<HostJob>) -> Vec<HostReport> {
        let total = jobs.len();
        let mut reports: Vec<Option<HostReport>> = (0..total).map(|_| None).collect();
        let mut pending = jobs.into_iter().enumerate();
        let mut in_flight: HashMap<usize, Node> = HashMap::new();
        let mut workers = JoinSet::new();
        let mut peak = 0usize;

        loop {
            while workers.len() < self.parallelism && !self.shared.cancel.is_cancelled() {
                let Some((index, job)) = pending.next() else {
                    break;
                };
                in_flight.insert(index, job.node.clone());
                let shared = Arc::clone(&self.shared);
                workers.spawn(async move {
                    let report = AssertUnwindSafe(run_host(&shared, job)).catch_unwind().await;
                    (index, report)
                });
                peak = peak.max(workers.len());
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            let (index, report) = match joined {
                Ok((index, Ok(report))) => (index, report),
                Ok((index, Err(panic))) => {
                    let Some(node) = in_flight.get(&index).cloned() else {
                        continue;
                    };
                    let reason = format!("worker panicked: {}", panic_message(panic.as_ref()));
                    warn!(host = %node.id(), %reason, "host worker failed");
                    (index, HostReport::failed(node, "worker", reason))
                }
                Err(err) => {
                    // Unreachable in practice: panics are caught inside the task.
                    warn!(?err, "host worker task ended abnormally");
                    continue;
                }
            };
            in_flight.remove(&index);
            self.finish(&report);
            reports[index] = Some(report);
        }

        // Hosts whose task vanished without a report.
        for (index, node) in in_flight.drain() {
            let report = HostReport::failed(node, "worker", "worker task ended without a result");
            self.finish(&report);
            reports[index] = Some(report);
        }

        // Never started because cancellation arrived first.
        for (index, job) in pending {
            let report = HostReport {
                node: job.node,
                results: Vec::new(),
                outcome: HostOutcome::Cancelled,
            };
            self.finish(&report);
            reports[index] = Some(report);
        }

        debug!(hosts = total, peak, "dispatch round finished");
        reports.into_iter().flatten().collect()
    }

    fn finish(&self, report: &HostReport) {
        self.shared.emit(ProgressEvent::HostFinished {
            host: report.node.id(),
            outcome: report.outcome.clone(),
        });
    }
}

async fn run_host<R: ActionRunner>(shared: &Shared<R>, job: HostJob) -> HostReport {
    let host = job.node.id();
    shared.emit(ProgressEvent::HostStarted { host: host.clone() });

    let total = job.steps.len();
    let mut results = Vec::with_capacity(total);
    let mut outcome = HostOutcome::Success;
    for (index, step) in job.steps.into_iter().enumerate() {
        if shared.cancel.is_cancelled() {
            info!(host = %host, step = %step.description, "cancelled before step");
            outcome = HostOutcome::Cancelled;
            break;
        }
        shared.emit(ProgressEvent::StepStarted {
            host: host.clone(),
            step: step.description.clone(),
            index,
            total,
        });
        debug!(host = %host, step = %step.description, argv = ?step.argv, "running step");

        let (result, interrupted) = match run_step(shared, &step).await {
            StepRun::Finished(result) => (result, false),
            StepRun::Interrupted(result) => (result, true),
        };
        let succeeded = result.succeeded();
        shared.emit(ProgressEvent::StepFinished {
            host: host.clone(),
            step: step.description.clone(),
            succeeded,
            exit_code: result.exit_code,
            attempts: result.attempts,
        });

        if interrupted && !succeeded {
            info!(host = %host, step = %step.description, "cancelled while polling");
            outcome = HostOutcome::Cancelled;
            results.push(result);
            break;
        }
        if !succeeded {
            let reason = result.failure_reason();
            warn!(
                host = %host,
                step = %step.description,
                exit_code = ?result.exit_code,
                pid = ?result.pid,
                %reason,
                stderr = %tail_snippet(&result.stderr),
                stdout = %tail_snippet(&result.stdout),
                "step failed"
            );
            outcome = HostOutcome::Failed {
                step: step.description,
                reason,
            };
            results.push(result);
            break;
        }
        results.push(result);
    }

    HostReport {
        node: job.node,
        results,
        outcome,
    }
}

enum StepRun {
    Finished(ExecutionResult),
    /// Cancellation cut a poll short; carries the last attempt.
    Interrupted(ExecutionResult),
}

/// One step, re-run under its poll policy until it succeeds or runs out of time.
async fn run_step<R: ActionRunner>(shared: &Shared<R>, step: &PreparedStep) -> StepRun {
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        let mut result = shared.runner.run(step.argv.clone(), step.timeout).await;
        attempts += 1;
        result.stage = step.description.clone();
        result.attempts = attempts;

        let Some(poll) = step.poll else {
            return StepRun::Finished(result);
        };
        result.duration = started.elapsed();
        if result.succeeded() {
            return StepRun::Finished(result);
        }
        if result.duration >= poll.ceiling {
            debug!(
                step = %step.description,
                attempts,
                output = %log_snippet(&result.stdout.join(" ")),
                "poll gave up"
            );
            return StepRun::Finished(result);
        }
        if shared.cancel.is_cancelled() {
            return StepRun::Interrupted(result);
        }
        let remaining = poll.ceiling.saturating_sub(result.duration);
        tokio::select! {
            _ = tokio::time::sleep(poll.interval.min(remaining)) => {}
            _ = shared.cancel.cancelled() => return StepRun::Interrupted(result),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
