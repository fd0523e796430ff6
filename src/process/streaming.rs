use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use nix::sys::signal::Signal;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::command::signal_group;
use super::{CommandSpec, ProcessRunner, StreamEvent, StreamExit};
use crate::error::{EngineError, Result};

/// Receives every output line of a streaming execution.
pub type OutputCallback = Arc<dyn Fn(StreamEvent) -> anyhow::Result<()> + Send + Sync>;
/// Receives the terminal event of a streaming execution, exactly once.
pub type DoneCallback = Box<dyn FnOnce(StreamExit) -> anyhow::Result<()> + Send>;

/// Control handle for a running streaming execution.
#[derive(Clone)]
pub struct StreamHandle {
    pid: Option<u32>,
    stop: CancellationToken,
    kill: CancellationToken,
    exit: watch::Receiver<Option<StreamExit>>,
}

impl StreamHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process group to terminate, escalating to SIGKILL after the grace period.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Force-kill the process group.
    pub fn kill(&self) {
        self.kill.cancel();
        self.stop.cancel();
    }

    /// False once the completion callback has fired.
    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    pub fn exit(&self) -> Option<StreamExit> {
        *self.exit.borrow()
    }

    pub async fn wait(&self) -> StreamExit {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(value) => (*value).unwrap_or_default(),
            // Supervisor vanished without publishing (runtime shutdown).
            Err(_) => StreamExit::default(),
        }
    }
}

impl ProcessRunner {
    /// Start `cmd` and deliver its output line by line.
    ///
    /// `on_done` fires exactly once after the process has exited and both
    /// output readers have drained. Errors and panics from either callback are
    /// logged and never reach the caller.
    pub fn run_streaming(
        &self,
        cmd: &CommandSpec,
        on_output: OutputCallback,
        on_done: DoneCallback,
    ) -> Result<StreamHandle> {
        let description = cmd.describe();
        let mut command = cmd.build();
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            command: description.clone(),
            source,
        })?;
        let pid = child.id();
        debug!("Streaming '{description}' (pid {pid:?})");

        let readers = [
            tokio::spawn(drain(child.stdout.take(), StreamEvent::Stdout, on_output.clone())),
            tokio::spawn(drain(child.stderr.take(), StreamEvent::Stderr, on_output)),
        ];

        let stop = CancellationToken::new();
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        let supervisor = Supervisor {
            description,
            pid,
            stop: stop.clone(),
            kill: kill.clone(),
            grace: self.stop_grace,
        };
        tokio::spawn(supervisor.run(child, readers, on_done, exit_tx));

        Ok(StreamHandle {
            pid,
            stop,
            kill,
            exit: exit_rx,
        })
    }
}

async fn drain<R>(reader: Option<R>, wrap: fn(String) -> StreamEvent, on_output: OutputCallback)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut segments = BufReader::new(reader).split(b'\n');
    loop {
        match segments.next_segment().await {
            Ok(Some(mut bytes)) => {
                if bytes.last() == Some(&b'\r') {
                    bytes.pop();
                }
                let event = wrap(String::from_utf8_lossy(&bytes).into_owned());
                match catch_unwind(AssertUnwindSafe(|| on_output(event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Output callback failed: {e:#}"),
                    Err(_) => warn!("Output callback panicked"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read process output: {e}");
                break;
            }
        }
    }
}

struct Supervisor {
    description: String,
    pid: Option<u32>,
    stop: CancellationToken,
    kill: CancellationToken,
    grace: Duration,
}

impl Supervisor {
    async fn run(
        self,
        mut child: Child,
        readers: [JoinHandle<()>; 2],
        on_done: DoneCallback,
        exit_tx: watch::Sender<Option<StreamExit>>,
    ) {
        let (status, killed) = tokio::select! {
            status = child.wait() => (status.ok(), false),
            () = self.stop.cancelled() => self.terminate(&mut child).await,
        };
        if let Some(pid) = self.pid {
            signal_group(pid, Signal::SIGKILL);
        }

        // Rendezvous: the readers see EOF once every holder of the pipes is gone.
        for reader in readers {
            if let Err(e) = reader.await {
                warn!("Output reader for '{}' ended abnormally: {e}", self.description);
            }
        }

        let exit = StreamExit {
            exit_code: status.and_then(|s| s.code()),
            killed,
        };
        debug!("'{}' finished: {exit:?}", self.description);

        match catch_unwind(AssertUnwindSafe(|| on_done(exit))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Completion callback for '{}' failed: {e:#}", self.description),
            Err(_) => warn!("Completion callback for '{}' panicked", self.description),
        }
        exit_tx.send_replace(Some(exit));
    }

    async fn terminate(&self, child: &mut Child) -> (Option<ExitStatus>, bool) {
        let hard = self.kill.is_cancelled();
        if let Some(pid) = self.pid {
            signal_group(pid, if hard { Signal::SIGKILL } else { Signal::SIGTERM });
        }
        if hard {
            return (child.wait().await.ok(), true);
        }
        // Err(true): kill requested during the grace period, Err(false): grace expired.
        let waited = tokio::select! {
            status = child.wait() => Ok(status.ok()),
            () = self.kill.cancelled() => Err(true),
            () = tokio::time::sleep(self.grace) => Err(false),
        };
        match waited {
            Ok(status) => (status, false),
            Err(requested) => {
                if requested {
                    debug!("Kill requested while '{}' was stopping", self.description);
                } else {
                    warn!(
                        "'{}' ignored SIGTERM for {:?}, killing process group",
                        self.description, self.grace
                    );
                }
                if let Some(pid) = self.pid {
                    signal_group(pid, Signal::SIGKILL);
                }
                (child.wait().await.ok(), true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn collecting() -> (OutputCallback, Arc<Mutex<Vec<StreamEvent>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let cb: OutputCallback = Arc::new(move |event| {
            sink.lock().unwrap().push(event);
            Ok(())
        });
        (cb, lines)
    }

    #[tokio::test]
    async fn delivers_lines_and_exit_code() {
        let (on_output, lines) = collecting();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = ProcessRunner::new()
            .run_streaming(
                &CommandSpec::shell("echo one; echo two >&2; exit 4"),
                on_output,
                Box::new(move |exit| {
                    let _ = tx.send(exit);
                    Ok(())
                }),
            )
            .unwrap();

        let exit = handle.wait().await;
        assert_eq!(exit, StreamExit { exit_code: Some(4), killed: false });
        assert_eq!(rx.await.unwrap(), exit);
        assert!(!handle.is_running());

        let lines = lines.lock().unwrap();
        assert!(lines.contains(&StreamEvent::Stdout("one".into())));
        assert!(lines.contains(&StreamEvent::Stderr("two".into())));
    }

    #[tokio::test]
    async fn kill_terminates_group_and_reports_killed() {
        let (on_output, _) = collecting();
        let handle = ProcessRunner::new()
            .run_streaming(
                &CommandSpec::shell("sleep 30 & sleep 30"),
                on_output,
                Box::new(|_| Ok(())),
            )
            .unwrap();
        assert!(handle.is_running());

        handle.kill();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(exit.killed);
        assert_eq!(exit.exit_code, None);
    }

    #[tokio::test]
    async fn stop_escalates_when_sigterm_is_ignored() {
        let (on_output, _) = collecting();
        let handle = ProcessRunner::new()
            .with_stop_grace(Duration::from_millis(200))
            .run_streaming(
                &CommandSpec::shell("trap '' TERM; sleep 30"),
                on_output,
                Box::new(|_| Ok(())),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(exit.killed);
    }

    #[tokio::test]
    async fn kill_during_grace_period_does_not_wait_it_out() {
        let (on_output, _) = collecting();
        let handle = ProcessRunner::new()
            .with_stop_grace(Duration::from_secs(60))
            .run_streaming(
                &CommandSpec::shell("trap '' TERM; sleep 30"),
                on_output,
                Box::new(|_| Ok(())),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(handle.is_running());

        handle.kill();
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(exit.killed);
    }

    #[tokio::test]
    async fn failing_output_callback_still_completes_once() {
        let done_calls = Arc::new(AtomicUsize::new(0));
        let done_clone = Arc::clone(&done_calls);
        let handle = ProcessRunner::new()
            .run_streaming(
                &CommandSpec::shell("echo a; echo b; echo c"),
                Arc::new(|_| Err(anyhow::anyhow!("consumer gone"))),
                Box::new(move |_| {
                    done_clone.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("also failing")
                }),
            )
            .unwrap();

        let exit = handle.wait().await;
        assert_eq!(exit.exit_code, Some(0));
        assert_eq!(done_calls.load(Ordering::SeqCst), 1);
    }
}
