//! Subprocess execution for remote actions.
//!
//! Each action runs as its own `ssh`/`scp` child with a pseudo-terminal on
//! stdin, captured stdout/stderr, and a hard deadline.

use std::future::Future;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use stagecoach_core::ExecutionResult;

use crate::dispatch::ActionRunner;

/// Time a child gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_millis(600);
const HOST_KEY_WARNING: &str = "Warning: Permanently added";

/// Runs actions as local subprocesses.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace: Duration,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            grace: TERMINATE_GRACE,
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRunner for ProcessRunner {
    fn run(
        &self,
        argv: Vec<String>,
        deadline: Duration,
    ) -> impl Future<Output = ExecutionResult> + Send {
        run_process(argv, deadline, self.grace)
    }
}

async fn run_process(argv: Vec<String>, deadline: Duration, grace: Duration) -> ExecutionResult {
    let started = Instant::now();
    if argv.is_empty() {
        return ExecutionResult::not_started(argv, "", "empty command");
    }
    let program = argv[0].clone();

    let pty = pty::open();
    let spawned = {
        let mut command = Command::new(&program);
        command
            .args(&argv[1..])
            .env("TERM", "linux")
            .stdin(pty.stdin())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.spawn()
    };
    let mut child = match spawned {
        Ok(child) => child,
        Err(err) => {
            let error = format!("failed to start {program}: {err}");
            let mut result = ExecutionResult::not_started(argv, "", error);
            result.duration = started.elapsed();
            return result;
        }
    };

    let pid = child.id();
    debug!(pid, program = %program, "spawned action process");
    let stdout = child.stdout.take().map(Capture::spawn);
    let stderr = child.stderr.take().map(Capture::spawn);

    let mut result = ExecutionResult {
        argv,
        pid,
        attempts: 1,
        ..ExecutionResult::default()
    };
    match timeout(deadline, child.wait()).await {
        Ok(Ok(status)) => result.exit_code = status.code(),
        Ok(Err(err)) => result.error = Some(format!("failed to wait for process: {err}")),
        Err(_) => {
            warn!(
                pid,
                timeout_secs = deadline.as_secs_f64(),
                "action timed out; terminating"
            );
            result.timed_out = true;
            terminate_child(&mut child, pid, grace).await;
        }
    }
    drop(pty);

    let (stdout, stderr) = tokio::join!(collect(stdout, grace), collect(stderr, grace));
    result.stdout = split_lines(&stdout);
    result.stderr = filter_stderr(&stderr);
    result.duration = started.elapsed();
    result
}

/// Output gathered by a background reader into a buffer the caller can
/// drain at any time, so abandoning the reader keeps what already arrived.
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl Capture {
    fn spawn<S: AsyncRead + Unpin + Send + 'static>(stream: S) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let reader = tokio::spawn(read_into(stream, Arc::clone(&buffer)));
        Self { buffer, reader }
    }

    fn take(&self) -> String {
        let bytes = self
            .buffer
            .lock()
            .map(|mut buffer| std::mem::take(&mut *buffer))
            .unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

async fn read_into<S: AsyncRead + Unpin>(mut stream: S, buffer: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(read) => match buffer.lock() {
                Ok(mut buffer) => buffer.extend_from_slice(&chunk[..read]),
                Err(_) => break,
            },
            Err(err) => {
                debug!(?err, "output stream read failed");
                break;
            }
        }
    }
}

/// Readers finish once every holder of the pipe exits. A stray grandchild
/// keeping it open costs the grace period, after which the reader is dropped
/// and whatever it had read is returned.
async fn collect(capture: Option<Capture>, grace: Duration) -> String {
    let Some(mut capture) = capture else {
        return String::new();
    };
    if timeout(grace, &mut capture.reader).await.is_err() {
        debug!("output pipe still held open; keeping partial output");
        capture.reader.abort();
    }
    capture.take()
}

async fn terminate_child(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) {
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        if timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    warn!(pid, "force killing unresponsive action process");
    if let Err(err) = child.kill().await {
        warn!(?err, pid, "failed to kill action process");
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect()
}

/// Drop the host-key notice ssh prints for every unknown host; keep the rest in order.
pub fn filter_stderr(text: &str) -> Vec<String> {
    split_lines(text)
        .into_iter()
        .filter(|line| !line.starts_with(HOST_KEY_WARNING))
        .collect()
}

#[cfg(unix)]
mod pty {
    use std::os::fd::{FromRawFd, OwnedFd};
    use std::process::Stdio;
    use std::ptr;

    use tracing::debug;

    /// Master side stays open until the child has exited.
    pub(super) struct Pty {
        _master: Option<OwnedFd>,
        slave: Option<OwnedFd>,
    }

    pub(super) fn open() -> Pty {
        let mut master: libc::c_int = -1;
        let mut slave: libc::c_int = -1;
        let rc = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                ptr::null_mut::<libc::c_char>(),
                ptr::null_mut::<libc::termios>(),
                ptr::null_mut::<libc::winsize>(),
            )
        };
        if rc != 0 {
            debug!("no pseudo-terminal available; using null stdin");
            return Pty {
                _master: None,
                slave: None,
            };
        }
        unsafe {
            libc::fcntl(master, libc::F_SETFD, libc::FD_CLOEXEC);
            libc::fcntl(slave, libc::F_SETFD, libc::FD_CLOEXEC);
            Pty {
                _master: Some(OwnedFd::from_raw_fd(master)),
                slave: Some(OwnedFd::from_raw_fd(slave)),
            }
        }
    }

    impl Pty {
        pub(super) fn stdin(&self) -> Stdio {
            match self.slave.as_ref().and_then(|fd| fd.try_clone().ok()) {
                Some(fd) => Stdio::from(fd),
                None => Stdio::null(),
            }
        }
    }
}

#[cfg(not(unix))]
mod pty {
    use std::process::Stdio;

    pub(super) struct Pty;

    pub(super) fn open() -> Pty {
        Pty
    }

    impl Pty {
        pub(super) fn stdin(&self) -> Stdio {
            Stdio::null()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn stderr_filter_drops_host_key_warnings() {
        let stderr = "Warning: Permanently added '10.0.0.1' (ECDSA) to the list of known hosts.\r\n\
                      mkdir: cannot create directory\r\n\
                      Warning: Permanently added '10.0.0.1' (ECDSA)\n\
                      second line\n";
        assert_eq!(
            filter_stderr(stderr),
            vec!["mkdir: cannot create directory", "second line"]
        );
        assert!(filter_stderr("").is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let result = ProcessRunner::new()
            .run(
                sh("echo out; echo err >&2; echo $TERM; exit 3"),
                Duration::from_secs(10),
            )
            .await;

        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout, vec!["out", "linux"]);
        assert_eq!(result.stderr, vec!["err"]);
        assert!(result.pid.is_some());
        assert!(!result.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_leaves_no_exit_code() {
        let started = Instant::now();
        let result = ProcessRunner::new()
            .run(sh("echo before; sleep 30"), Duration::from_millis(300))
            .await;

        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(!result.succeeded());
        assert_eq!(result.stdout, vec!["before"]);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_survives_a_grandchild_holding_the_pipes() {
        let started = Instant::now();
        let result = ProcessRunner::new()
            .run(
                sh("echo hello; echo oops >&2; (sleep 5 &)"),
                Duration::from_secs(10),
            )
            .await;

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, vec!["hello"]);
        assert_eq!(result.stderr, vec!["oops"]);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn missing_binary_is_reported_not_panicked() {
        let result = ProcessRunner::new()
            .run(
                vec!["/nonexistent/stagecoach-ssh".to_string()],
                Duration::from_secs(1),
            )
            .await;
        assert_eq!(result.exit_code, None);
        assert!(result
            .error
            .as_deref()
            .unwrap_or_default()
            .starts_with("failed to start"));
    }
}
