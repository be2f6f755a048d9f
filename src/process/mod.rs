//! Execution units running one agent each.
//!
//! A [`Process`] is started from a [`ProcessSpec`], whose [`Backend`] selects the
//! implementation:
//!
//! - [`LocalProcess`]: a direct child process, in its own process group, optionally contained
//!   by a memory cgroup (Linux) or watched by a memory poller.
//! - [`ContainerProcess`]: a container managed with the `docker` client, with the agent's
//!   working directory copied in and its command executed inside it.
//!
//! Output is split into lines by reader threads as soon as it arrives, and input goes through a
//! writer thread. Reads and writes take a deadline; the time budget supplies it.

use std::{
    fmt::Debug,
    fs::{self, File},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;

use crate::{
    constraints::{ContainerOptions, ProcessOptions},
    error::{AgentError, WriteError},
    timed::TimeoutError,
};

#[cfg(unix)]
mod container;
mod input;
mod lines;
mod local;
mod registry;

#[cfg(unix)]
pub use container::ContainerProcess;
pub use local::LocalProcess;
pub use registry::{ProcessRegistry, RegistryKey};

pub(crate) use lines::{line_channel, LineQueue, Mirror};

/// Which output stream to read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Where commands come from.
    Stdout,
    /// Diagnostics, never read as commands.
    Stderr,
}

/// Result of a pause or resume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    /// The process really was suspended or continued.
    Applied,
    /// The backend cannot suspend processes here: nothing happened, and the agent keeps
    /// running (and paying wall-clock time) between its turns.
    Unsupported,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exited by itself with this code.
    Code(i32),
    /// Terminated by this signal.
    Signal(i32),
    /// Killed for exceeding its memory ceiling.
    OutOfMemory,
    /// Terminated by [`Process::close`].
    Closed,
    /// Ended, but the backend could not tell how.
    Unknown,
}

impl ExitReason {
    /// The error an agent reports when its process ended without being asked to.
    pub fn into_error(self, memory_limit: Option<u64>) -> AgentError {
        match self {
            ExitReason::OutOfMemory => AgentError::ResourceLimit {
                limit_bytes: memory_limit.unwrap_or_default(),
            },
            ExitReason::Code(code) => AgentError::PrematureExit { code: Some(code) },
            ExitReason::Signal(_) | ExitReason::Closed | ExitReason::Unknown => {
                AgentError::PrematureExit { code: None }
            }
        }
    }
}

/// Capabilities shared by every execution backend.
///
/// All methods take `&self` so that a process can be shared between its agent and a
/// [`ProcessRegistry`].
pub trait Process: Send + Sync + Debug {
    /// Name used in logs.
    fn label(&self) -> &str;

    /// Write `line` followed by a newline to the process input, giving up at `deadline`.
    fn write_line(&self, line: &str, deadline: Option<Instant>) -> Result<(), WriteError>;

    /// Wait until a full line is available on `stream`, or `deadline` passes.
    ///
    /// `Ok(None)` means the stream ended. Without a deadline this may block forever.
    fn read_line(
        &self,
        stream: OutputStream,
        deadline: Option<Instant>,
    ) -> Result<Option<String>, TimeoutError>;

    /// A line that is already available on `stream`, without waiting.
    fn try_read_line(&self, stream: OutputStream) -> Option<String>;

    /// Suspend execution without losing state.
    fn pause(&self) -> Result<Suspension, AgentError>;

    /// Continue a paused process.
    fn resume(&self) -> Result<Suspension, AgentError>;

    /// Forcibly terminate the process and its descendants. Idempotent.
    fn close(&self) -> Result<(), AgentError>;

    /// True once [`Process::close`] has been called.
    fn is_closed(&self) -> bool;

    /// Wait up to `max` for the process to end. The exit is logged once, the first time it is
    /// observed.
    fn wait_exit(&self, max: Duration) -> Option<ExitReason>;
}

/// Tagged backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Backend {
    /// Plain subprocess of the current process.
    #[default]
    Local,
    /// Isolated container.
    Container(ContainerOptions),
}

/// Everything needed to start a process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Name used in logs and thread names.
    pub label: String,
    /// Executable or interpreter.
    pub command: String,
    /// Arguments of `command`.
    pub args: Vec<String>,
    /// Directory the process runs in. Copied into the container by the container backend.
    pub working_dir: Option<PathBuf>,
    /// Memory ceiling and time limits.
    pub options: ProcessOptions,
    /// Where the process runs.
    pub backend: Backend,
    /// Run without cgroup containment when cgroups are unavailable.
    pub allow_uncontained: bool,
}

/// How output streams are handled.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    /// Emit a pending partial line at the end of each read chunk instead of waiting for its
    /// newline.
    pub flush_partial_lines: bool,
    /// Mirror stderr lines into the logs.
    pub stderr_to_tracing: bool,
    /// Append stderr lines to this file.
    pub stderr_log: Option<PathBuf>,
}

impl StreamOptions {
    pub(crate) fn stderr_mirror(&self, label: &str) -> anyhow::Result<Option<Mirror>> {
        let file = match &self.stderr_log {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)
                        .with_context(|| format!("could not create {}", dir.display()))?;
                }
                Some(
                    File::options()
                        .create(true)
                        .append(true)
                        .open(path)
                        .with_context(|| format!("could not open {}", path.display()))?,
                )
            }
            None => None,
        };
        if file.is_none() && !self.stderr_to_tracing {
            return Ok(None);
        }
        Ok(Some(Mirror {
            label: label.to_string(),
            to_tracing: self.stderr_to_tracing,
            file,
        }))
    }
}

/// Start a process on the backend selected by `spec`.
pub fn start(spec: &ProcessSpec, streams: &StreamOptions) -> Result<Arc<dyn Process>, AgentError> {
    match &spec.backend {
        Backend::Local => Ok(Arc::new(LocalProcess::start(spec, streams)?)),
        #[cfg(unix)]
        Backend::Container(options) => Ok(Arc::new(ContainerProcess::start(
            spec, options, streams,
        )?)),
        #[cfg(not(unix))]
        Backend::Container(_) => Err(AgentError::Spawn(anyhow::anyhow!(
            "the container backend is only available on unix"
        ))),
    }
}
