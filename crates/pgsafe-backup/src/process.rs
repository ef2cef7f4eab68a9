//! Running external tools under a cancellation token.

use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ToolError;

/// Only the tail of stderr is kept in error messages
const STDERR_TAIL: usize = 2048;

/// Run `cmd` to completion. The child is killed if `cancel` fires first.
pub(crate) async fn run_tool(
    mut cmd: Command,
    program: &str,
    cancel: &CancellationToken,
) -> Result<(), ToolError> {
    if cancel.is_cancelled() {
        return Err(ToolError::Cancelled {
            program: program.to_string(),
        });
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| ToolError::Spawn {
        program: program.to_string(),
        source,
    })?;
    debug!(program, pid = ?child.id(), "spawned");

    // dropping the wait future drops the child, which kills it
    let waited = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(ToolError::Cancelled { program: program.to_string() });
        }
        out = child.wait_with_output() => out,
    };
    let output = waited.map_err(|source| ToolError::Io {
        context: format!("waiting for {program}"),
        source,
    })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let start = stderr
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| stderr.len() - i <= STDERR_TAIL)
        .unwrap_or(stderr.len());
    Err(ToolError::Exit {
        program: program.to_string(),
        status: output.status,
        stderr: stderr[start..].to_string(),
    })
}
