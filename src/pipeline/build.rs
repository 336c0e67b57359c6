//! Running the build tool and the build hooks.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{Error, Result};

/// Lines of tool output kept for the build report.
pub const OUTPUT_TAIL_LINES: usize = 50;

/// Bounded tail of tool output.
#[derive(Debug, Clone, Default)]
pub struct OutputTail {
    lines: VecDeque<String>,
}

impl OutputTail {
    pub fn push(&mut self, line: String) {
        if self.lines.len() == OUTPUT_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn into_vec(self) -> Vec<String> {
        self.lines.into()
    }
}

/// Run `program` with `args` in `working_dir`, streaming output into `tail`.
/// Cancelling kills the process and returns [`Error::Cancelled`].
pub async fn run_tool(
    label: &str,
    program: &Path,
    args: &[&str],
    working_dir: &Path,
    cancel: &CancellationToken,
    tail: &mut OutputTail,
) -> Result<()> {
    tracing::info!(tool = label, program = %program.display(), ?args, "starting tool");

    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::unavailable(format!("cannot run {}: {}", program.display(), e)))?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(label, stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(label, stderr, tx);
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            tracing::info!(tool = label, "cancellation requested; killing tool");
            if let Err(e) = child.kill().await {
                tracing::warn!(tool = label, error = %e, "failed to kill tool");
            }
            return Err(Error::cancelled(format!("{} cancelled", label)));
        }
    };

    // drain what the readers still hold; a lingering grandchild may keep a pipe open
    while let Ok(Some(line)) = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        tail.push(line);
    }

    if status.success() {
        tracing::info!(tool = label, "tool finished");
        Ok(())
    } else {
        Err(Error::internal(format!("{} failed ({})", label, status)))
    }
}

fn forward_lines<R>(label: &str, stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let label = label.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(tool = %label, "{}", line);
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// Run a hook script if it exists. A missing hook succeeds.
pub async fn run_hook(
    hook: &Path,
    working_dir: &Path,
    cancel: &CancellationToken,
    tail: &mut OutputTail,
) -> Result<()> {
    if !hook.is_file() {
        tracing::debug!(hook = %hook.display(), "no hook installed");
        return Ok(());
    }
    let label = hook
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "hook".to_string());
    run_tool(&label, hook, &[], working_dir, cancel, tail).await
}
