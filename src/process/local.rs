use std::{
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use tracing::{debug, error, instrument, trace, warn};

use super::{
    input::{spawn_writer, InputPipe},
    line_channel,
    lines::spawn_reader,
    ExitReason, LineQueue, OutputStream, Process, ProcessSpec, StreamOptions, Suspension,
};
use crate::{
    cgroup_manager::MemoryCgroup,
    error::{AgentError, WriteError},
    timed::TimeoutError,
};

const CLEANUP_DURATION: Duration = Duration::from_secs(1);
const WATCH_INTERVAL: Duration = Duration::from_millis(50);

/// A child process of the current program.
///
/// On unix the child leads its own process group, so that pausing or killing it reaches every
/// process it spawned. With a memory limit the child is moved into a dedicated cgroup (Linux),
/// or watched by a polling thread when uncontained execution is allowed.
#[derive(Debug)]
pub struct LocalProcess {
    label: String,
    pid: u32,
    child: Mutex<Child>,
    stdin: InputPipe,
    stdout: LineQueue,
    stderr: LineQueue,
    cgroup: Mutex<Option<MemoryCgroup>>,
    memory_exceeded: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    exit: OnceLock<ExitReason>,
}

impl LocalProcess {
    /// Spawn the process and its stream threads, applying the memory ceiling.
    #[instrument(skip_all, fields(agent = %spec.label))]
    pub fn start(spec: &ProcessSpec, streams: &StreamOptions) -> Result<LocalProcess, AgentError> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("command '{}' could not be launched", spec.command))
            .map_err(AgentError::Spawn)?;
        let pid = child.id();
        debug!(pid, command = %spec.command, "process spawned");

        let memory_exceeded = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let cgroup = match spec.options.memory_limit() {
            None => None,
            Some(limit) => match MemoryCgroup::attach(pid, limit) {
                Ok(cgroup) => Some(cgroup),
                Err(e) if spec.allow_uncontained => {
                    warn!("could not contain process, watching its memory instead: {e:#}");
                    if let Err(e) = spawn_memory_watcher(
                        pid,
                        limit,
                        memory_exceeded.clone(),
                        closed.clone(),
                    ) {
                        kill_child(&mut child);
                        return Err(AgentError::Spawn(e));
                    }
                    None
                }
                Err(e) => {
                    kill_child(&mut child);
                    return Err(AgentError::Spawn(e.context(
                        "memory limit requires a cgroup; allow uncontained execution to run without",
                    )));
                }
            },
        };

        let (stdout_sink, stdout) = line_channel(streams.flush_partial_lines, false, None);
        let mirror = streams
            .stderr_mirror(&spec.label)
            .map_err(AgentError::Spawn)?;
        let (stderr_sink, stderr) = line_channel(streams.flush_partial_lines, true, mirror);

        let pipes = child
            .stdin
            .take()
            .zip(child.stdout.take())
            .zip(child.stderr.take())
            .ok_or_else(|| anyhow!("child streams were not captured"))
            .and_then(|((input, out), err)| {
                spawn_reader(format!("{}-stdout", spec.label), out, stdout_sink)
                    .context("could not spawn stdout reader")?;
                spawn_reader(format!("{}-stderr", spec.label), err, stderr_sink)
                    .context("could not spawn stderr reader")?;
                spawn_writer(format!("{}-stdin", spec.label), input)
                    .context("could not spawn stdin writer")
            });
        let stdin = match pipes {
            Ok(stdin) => stdin,
            Err(e) => {
                kill_child(&mut child);
                return Err(AgentError::Spawn(e));
            }
        };

        Ok(LocalProcess {
            label: spec.label.clone(),
            pid,
            child: Mutex::new(child),
            stdin,
            stdout,
            stderr,
            cgroup: Mutex::new(cgroup),
            memory_exceeded,
            closed,
            exit: OnceLock::new(),
        })
    }

    /// Pid of the child, which is also its process group id on unix.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn queue(&self, stream: OutputStream) -> &LineQueue {
        match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) -> nix::Result<()> {
        let group = nix::unistd::Pid::from_raw(self.pid as i32);
        nix::sys::signal::killpg(group, signal)
    }

    fn classify(&self, status: std::process::ExitStatus) -> ExitReason {
        let oom = self.memory_exceeded.load(Ordering::Acquire)
            || self
                .cgroup
                .lock()
                .expect("poisoned")
                .as_ref()
                .is_some_and(MemoryCgroup::oom_killed);
        if oom {
            return ExitReason::OutOfMemory;
        }
        if let Some(code) = status.code() {
            return ExitReason::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitReason::Signal(signal);
            }
        }
        ExitReason::Unknown
    }

    fn record_exit(&self, reason: ExitReason) -> ExitReason {
        *self.exit.get_or_init(|| {
            match reason {
                ExitReason::Code(0) | ExitReason::Closed => {
                    debug!(agent = %self.label, ?reason, "process exited")
                }
                _ => warn!(agent = %self.label, ?reason, "process exited abnormally"),
            }
            reason
        })
    }
}

impl Process for LocalProcess {
    fn label(&self) -> &str {
        &self.label
    }

    fn write_line(&self, line: &str, deadline: Option<Instant>) -> Result<(), WriteError> {
        trace!(agent = %self.label, "> {line}");
        self.stdin.write_line(line, deadline)
    }

    fn read_line(
        &self,
        stream: OutputStream,
        deadline: Option<Instant>,
    ) -> Result<Option<String>, TimeoutError> {
        self.queue(stream).recv(deadline)
    }

    fn try_read_line(&self, stream: OutputStream) -> Option<String> {
        self.queue(stream).try_recv()
    }

    fn pause(&self) -> Result<Suspension, AgentError> {
        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGSTOP)
                .map_err(|e| AgentError::Process(anyhow!("could not pause process: {e}")))?;
            Ok(Suspension::Applied)
        }
        #[cfg(not(unix))]
        {
            warn!(agent = %self.label, "process suspension is not supported on this platform");
            Ok(Suspension::Unsupported)
        }
    }

    fn resume(&self) -> Result<Suspension, AgentError> {
        #[cfg(unix)]
        {
            self.signal_group(nix::sys::signal::Signal::SIGCONT)
                .map_err(|e| AgentError::Process(anyhow!("could not resume process: {e}")))?;
            Ok(Suspension::Applied)
        }
        #[cfg(not(unix))]
        {
            Ok(Suspension::Unsupported)
        }
    }

    #[instrument(skip(self), fields(agent = %self.label))]
    fn close(&self) -> Result<(), AgentError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stdin.close();

        let mut result = Ok(());
        if let Some(cgroup) = self.cgroup.lock().expect("poisoned").take() {
            if let Err(e) = cgroup.kill(CLEANUP_DURATION) {
                result = Err(AgentError::Process(e));
            }
        }
        #[cfg(unix)]
        {
            // the group outlives its leader if a descendant is still running
            if let Err(e) = self.signal_group(nix::sys::signal::Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    trace!("could not kill process group: {e}");
                }
            }
        }

        let mut child = self.child.lock().expect("poisoned");
        let status = match child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                if let Err(e) = child.kill() {
                    trace!("kill: {e}");
                }
                child.wait().ok()
            }
        };
        drop(child);

        let reason = match status {
            // exited by itself before being closed
            Some(status) if self.exit.get().is_none() && !was_killed(&status) => {
                self.classify(status)
            }
            _ => ExitReason::Closed,
        };
        self.record_exit(reason);
        result
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn wait_exit(&self, max: Duration) -> Option<ExitReason> {
        if let Some(reason) = self.exit.get() {
            return Some(*reason);
        }
        let deadline = Instant::now() + max;
        loop {
            let status = self.child.lock().expect("poisoned").try_wait();
            match status {
                Ok(Some(status)) => return Some(self.record_exit(self.classify(status))),
                Ok(None) => {}
                Err(e) => {
                    error!(agent = %self.label, "could not query process status: {e}");
                    return Some(self.record_exit(ExitReason::Unknown));
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(10).min(max / 10).max(Duration::from_millis(1)));
        }
    }
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(agent = %self.label, "could not clean up process: {e}");
        }
    }
}

fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    {
        let group = nix::unistd::Pid::from_raw(child.id() as i32);
        let _ = nix::sys::signal::killpg(group, nix::sys::signal::Signal::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn was_killed(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(nix::sys::signal::Signal::SIGKILL as i32)
}

#[cfg(not(unix))]
fn was_killed(_status: &std::process::ExitStatus) -> bool {
    true
}

/// Poll the resident memory of `pid` and kill its process group above `limit` bytes.
fn spawn_memory_watcher(
    pid: u32,
    limit: u64,
    exceeded: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    thread::Builder::new()
        .name(format!("memory-watcher-{pid}"))
        .spawn(move || {
            let target = Pid::from_u32(pid);
            let mut sys = System::new();
            while !closed.load(Ordering::Acquire) {
                sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
                let Some(process) = sys.process(target) else {
                    return;
                };
                let used = process.memory();
                if used > limit {
                    warn!(pid, used, limit, "memory limit exceeded, killing process");
                    exceeded.store(true, Ordering::Release);
                    #[cfg(unix)]
                    {
                        let group = nix::unistd::Pid::from_raw(pid as i32);
                        let _ = nix::sys::signal::killpg(group, nix::sys::signal::Signal::SIGKILL);
                    }
                    #[cfg(not(unix))]
                    {
                        process.kill();
                    }
                    return;
                }
                thread::sleep(WATCH_INTERVAL);
            }
        })
        .context("could not spawn memory watcher")?;
    Ok(())
}
