//! External command execution.
//!
//! Two modes share one spawning path: bounded runs with a hard timeout, and
//! streaming runs that deliver output lines as they arrive and can be stopped
//! or killed from outside. Every child leads its own process group and the
//! whole group is signalled when an execution ends.

mod bounded;
mod command;
mod streaming;

use std::time::Duration;

pub use command::{CommandSpec, ProcessResult, Program, StreamEvent, StreamExit};
pub(crate) use command::signal_group;
pub use streaming::{DoneCallback, OutputCallback, StreamHandle};

/// How long a streaming child gets between SIGTERM and SIGKILL after `stop()`.
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    stop_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}
