//! Command descriptions and execution results.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use log::warn;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

/// What to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// Interpreted by `/bin/sh -c`.
    Shell(String),
    Exec { program: PathBuf, args: Vec<String> },
}

/// A command to run: program, working directory and environment overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: Program,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn shell(line: impl Into<String>) -> Self {
        Self {
            program: Program::Shell(line.into()),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn exec<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: Program::Exec {
                program: program.into(),
                args: args.into_iter().map(Into::into).collect(),
            },
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Human readable command line for logs.
    pub fn describe(&self) -> String {
        match &self.program {
            Program::Shell(line) => line.clone(),
            Program::Exec { program, args } => {
                let mut out = program.display().to_string();
                for arg in args {
                    out.push(' ');
                    out.push_str(arg);
                }
                out
            }
        }
    }

    /// Build a tokio command leading its own process group.
    pub(crate) fn build(&self) -> tokio::process::Command {
        let mut cmd = match &self.program {
            Program::Shell(line) => {
                let mut cmd = tokio::process::Command::new("/bin/sh");
                cmd.arg("-c").arg(line);
                cmd
            }
            Program::Exec { program, args } => {
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(args);
                cmd
            }
        };
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.env)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        cmd
    }
}

/// Outcome of a bounded execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    /// `None` when the process was terminated by a signal or never ran.
    pub exit_code: Option<i32>,
    pub killed: bool,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// The command could not be started or waited on.
    pub error: bool,
}

impl ProcessResult {
    pub(crate) fn failed(message: String) -> Self {
        Self {
            error: true,
            stderr: vec![message],
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        !self.error && !self.killed && self.exit_code == Some(0)
    }
}

/// One line of output from a streaming execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Stdout(String),
    Stderr(String),
}

impl StreamEvent {
    pub fn line(&self) -> &str {
        match self {
            StreamEvent::Stdout(line) | StreamEvent::Stderr(line) => line,
        }
    }
}

/// Terminal event of a streaming execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamExit {
    pub exit_code: Option<i32>,
    pub killed: bool,
}

/// Signal every process in the group led by `pid`. A vanished group is not an error.
pub(crate) fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send {signal} to process group {pid}: {e}"),
    }
}

pub(crate) fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_owned)
        .collect()
}
