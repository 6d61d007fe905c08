//! Command execution

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

use crate::error::RunnerError;
use crate::reporter::{TaskEvent, TaskReporter};
use crate::task::TaskId;

/// One command to run
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub id: &'a TaskId,
    pub command: &'a str,
    /// Working directory
    pub cwd: &'a Path,
    pub env: &'a BTreeMap<String, String>,
}

/// What a finished command produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes task commands
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Program that interprets commands; part of every cache key
    fn executable(&self) -> &str;

    /// Run one command to completion.
    ///
    /// `cancel` flips to `true` when the run is stopped; a runner may kill the
    /// process and return [`RunnerError::Cancelled`], or let it finish.
    async fn run(
        &self,
        request: RunRequest<'_>,
        reporter: &dyn TaskReporter,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutput, RunnerError>;
}

/// Runs commands through the platform shell
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    kill_on_cancel: bool,
}

impl ShellRunner {
    /// Create a runner; with `kill_on_cancel` running processes are killed
    /// when the run is stopped
    pub fn new(kill_on_cancel: bool) -> Self {
        Self { kill_on_cancel }
    }

    fn shell() -> (&'static str, &'static str) {
        if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        }
    }
}

#[async_trait]
impl TaskRunner for ShellRunner {
    fn executable(&self) -> &str {
        Self::shell().0
    }

    async fn run(
        &self,
        request: RunRequest<'_>,
        reporter: &dyn TaskReporter,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunOutput, RunnerError> {
        let (shell, flag) = Self::shell();
        let start = Instant::now();
        debug!(task = %request.id, command = request.command, "spawning");

        let mut child = Command::new(shell)
            .arg(flag)
            .arg(request.command)
            .current_dir(request.cwd)
            .envs(request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn {
                command: request.command.to_string(),
                source: e,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let id = request.id;

        // The child is owned by this future; dropping it kills the process.
        let run = async move {
            let (stdout, stderr) = tokio::join!(
                read_lines(stdout, id, false, reporter),
                read_lines(stderr, id, true, reporter)
            );
            let status = child.wait().await.map_err(RunnerError::Wait)?;
            Ok(RunOutput {
                exit_code: status.code(),
                stdout,
                stderr,
                duration: start.elapsed(),
            })
        };

        if !self.kill_on_cancel {
            return run.await;
        }

        tokio::select! {
            result = run => result,
            _ = cancelled(&mut cancel) => {
                debug!(task = %id, "killing cancelled task");
                Err(RunnerError::Cancelled)
            }
        }
    }
}

async fn read_lines<R>(
    stream: Option<R>,
    id: &TaskId,
    is_stderr: bool,
    reporter: &dyn TaskReporter,
) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return String::new();
    };

    let mut captured = String::new();
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        reporter.report(&TaskEvent::Output {
            id: id.clone(),
            line: line.clone(),
            is_stderr,
            replayed: false,
        });
        captured.push_str(&line);
        captured.push('\n');
    }
    captured
}

/// Resolves once the flag is set; never if the sender goes away
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
