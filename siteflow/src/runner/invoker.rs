//! Launching the external tool as a child process.

use crate::cancellation::CancellationToken;
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// How long to wait for pipe readers after a kill.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// One command line to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Executable.
    pub program: String,
    /// Full argument list.
    pub args: Vec<String>,
    /// Kill the process after this long.
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    /// The command line as a single display string.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Why a process was stopped before it exited on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// The timeout elapsed.
    TimedOut(Duration),
    /// Cancellation was requested.
    Cancelled,
}

/// What a finished process left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; `None` when killed or terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Set when the process was killed.
    pub interruption: Option<Interruption>,
}

impl ToolOutput {
    /// A clean exit with the given code.
    #[must_use]
    pub fn exited(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: stdout.into(),
            stderr: stderr.into(),
            interruption: None,
        }
    }

    /// Returns true for exit status 0 without interruption.
    #[must_use]
    pub fn success(&self) -> bool {
        self.interruption.is_none() && self.exit_code == Some(0)
    }
}

/// Runs a tool invocation to completion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Runs the command, honoring its timeout and the cancellation token.
    ///
    /// # Errors
    ///
    /// Only when the process cannot be started or awaited. A non-zero exit is
    /// an `Ok` output.
    async fn invoke(
        &self,
        invocation: &ToolInvocation,
        cancel: Arc<CancellationToken>,
    ) -> io::Result<ToolOutput>;
}

/// Invokes the tool through `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalTool;

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::warn!(error = %e, "Failed to read tool output");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[async_trait]
impl ToolInvoker for ExternalTool {
    async fn invoke(
        &self,
        invocation: &ToolInvocation,
        cancel: Arc<CancellationToken>,
    ) -> io::Result<ToolOutput> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        let timeout = invocation.timeout;
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };

        let (status, interruption) = tokio::select! {
            status = child.wait() => (Some(status?), None),
            () = deadline => (None, timeout.map(Interruption::TimedOut)),
            () = cancel.cancelled() => (None, Some(Interruption::Cancelled)),
        };

        if let Some(reason) = interruption {
            tracing::warn!(command = %invocation.command_line(), ?reason, "Killing tool process");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill tool process");
            }
        }

        let stdout = tokio::time::timeout(PIPE_DRAIN_GRACE, stdout_task)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        let stderr = tokio::time::timeout(PIPE_DRAIN_GRACE, stderr_task)
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();

        Ok(ToolOutput {
            exit_code: status.and_then(|s| s.code()),
            stdout,
            stderr,
            interruption,
        })
    }
}
