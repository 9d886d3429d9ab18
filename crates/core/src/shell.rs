use std::{ffi::OsStr, path::Path, process::Stdio};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::debug;

use crate::error::{Result, ServiceError};

/// Runs a command to completion, failing on a non-zero exit status.
pub async fn exec<I, S>(program: &Path, args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    exec_and_process_output(program, args, |_, _| {}).await
}

/// Runs a command, passing every output line to `on_line` as
/// `(line, is_error)`. Stderr lines are delivered after stdout.
pub async fn exec_and_process_output<I, S, F>(program: &Path, args: I, mut on_line: F) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
    F: FnMut(&str, bool),
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let command_text = format!("{:?}", cmd.as_std());
    debug!("Executing command: {}", command_text);

    let output = cmd.output().await.map_err(|error| ServiceError::CommandFailed {
        command: command_text.clone(),
        reason: error.to_string(),
    })?;

    let mut stdout_lines = BufReader::new(output.stdout.as_slice()).lines();
    while let Some(line) = stdout_lines.next_line().await? {
        on_line(&line, false);
    }
    let mut stderr_lines = BufReader::new(output.stderr.as_slice()).lines();
    while let Some(line) = stderr_lines.next_line().await? {
        on_line(&line, true);
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match stderr.trim() {
            "" => format!("exited with {}", output.status),
            text => format!("exited with {}: {}", output.status, text),
        };
        return Err(ServiceError::CommandFailed {
            command: command_text,
            reason,
        }
        .into());
    }
    Ok(())
}
