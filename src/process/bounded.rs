use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use nix::sys::signal::Signal;
use tokio::task::JoinHandle;

use super::command::{signal_group, split_lines};
use super::{CommandSpec, ProcessResult, ProcessRunner};
use crate::error::{EngineError, Result};

impl ProcessRunner {
    /// Run `cmd` to completion, killing its process group once `timeout` elapses.
    ///
    /// Output is captured into anonymous temp files and only read after the
    /// child has terminated, so a chatty child can never block on a full pipe.
    /// Spawn and wait failures are reported through `ProcessResult::error`.
    pub async fn run(&self, cmd: &CommandSpec, timeout: Duration) -> Result<ProcessResult> {
        if timeout.is_zero() {
            return Err(EngineError::usage("timeout must be greater than zero"));
        }
        let description = cmd.describe();

        let (stdout_file, stderr_file, stdout, stderr) = match capture_files() {
            Ok(files) => files,
            Err(e) => {
                return Ok(ProcessResult::failed(format!(
                    "Failed to create output capture files: {e}"
                )));
            }
        };

        let mut command = cmd.build();
        command.stdout(stdout).stderr(stderr);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn '{description}': {e}");
                return Ok(ProcessResult::failed(format!(
                    "Failed to spawn '{description}': {e}"
                )));
            }
        };
        let pid = child.id();
        debug!("Started '{description}' (pid {pid:?}, timeout {timeout:?})");

        let (status, killed) = tokio::select! {
            status = child.wait() => (status, false),
            () = tokio::time::sleep(timeout) => {
                warn!("'{description}' exceeded {timeout:?}, killing process group");
                if let Some(pid) = pid {
                    signal_group(pid, Signal::SIGKILL);
                }
                let _ = child.start_kill();
                (child.wait().await, true)
            }
        };
        // Take down anything the command left behind in its group.
        if let Some(pid) = pid {
            signal_group(pid, Signal::SIGKILL);
        }

        let (exit_code, error) = match status {
            Ok(status) => (status.code(), false),
            Err(e) => {
                warn!("Failed to wait for '{description}': {e}");
                (None, true)
            }
        };

        Ok(ProcessResult {
            exit_code,
            killed,
            stdout: read_capture(stdout_file),
            stderr: read_capture(stderr_file),
            error,
        })
    }

    /// Schedule a bounded `run` after `delay` and hand its result to `callback`.
    pub fn run_delayed<F>(
        &self,
        cmd: CommandSpec,
        delay: Duration,
        timeout: Duration,
        callback: F,
    ) -> Result<JoinHandle<()>>
    where
        F: FnOnce(ProcessResult) + Send + 'static,
    {
        if timeout.is_zero() {
            return Err(EngineError::usage("timeout must be greater than zero"));
        }
        let runner = self.clone();
        Ok(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match runner.run(&cmd, timeout).await {
                Ok(result) => callback(result),
                Err(e) => warn!("Delayed command '{}' did not run: {e}", cmd.describe()),
            }
        }))
    }
}

fn capture_files() -> std::io::Result<(File, File, Stdio, Stdio)> {
    let stdout = tempfile::tempfile()?;
    let stderr = tempfile::tempfile()?;
    let stdout_child = Stdio::from(stdout.try_clone()?);
    let stderr_child = Stdio::from(stderr.try_clone()?);
    Ok((stdout, stderr, stdout_child, stderr_child))
}

fn read_capture(mut file: File) -> Vec<String> {
    let mut buf = Vec::new();
    let read = file
        .seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut buf));
    if let Err(e) = read {
        warn!("Failed to read captured output: {e}");
    }
    split_lines(&buf)
}
