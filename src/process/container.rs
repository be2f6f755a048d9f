use std::{
    ffi::OsStr,
    path::Path,
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context};
use tracing::{debug, error, info, instrument, trace, warn};

use super::{
    input::{spawn_writer, InputPipe},
    line_channel,
    lines::spawn_reader,
    ExitReason, LineQueue, OutputStream, Process, ProcessSpec, StreamOptions, Suspension,
};
use crate::{
    constraints::ContainerOptions,
    error::{AgentError, WriteError},
    timed::TimeoutError,
};

/// Where the agent's working directory is copied inside the container.
const CODE_DIR: &str = "/code";

/// An agent command executed inside a dedicated container.
///
/// The container runs a keep-alive command; the agent itself is started with `docker exec`, whose
/// client forwards the agent's streams. Pause and resume use `docker pause`, which needs the
/// freezer cgroup: when the runtime refuses, the agent keeps running between turns and
/// [`Suspension::Unsupported`] is returned.
#[derive(Debug)]
pub struct ContainerProcess {
    label: String,
    docker: Docker,
    container_id: String,
    exec: Mutex<Child>,
    stdin: InputPipe,
    stdout: LineQueue,
    stderr: LineQueue,
    closed: AtomicBool,
    exit: OnceLock<ExitReason>,
}

impl ContainerProcess {
    /// Create and start the container, copy the working directory in and run the agent.
    #[instrument(skip_all, fields(agent = %spec.label))]
    pub fn start(
        spec: &ProcessSpec,
        options: &ContainerOptions,
        streams: &StreamOptions,
    ) -> Result<ContainerProcess, AgentError> {
        let docker = Docker::new(options);
        let args = create_args(spec, options, &unique_name(&options.name))
            .map_err(AgentError::Spawn)?;
        let container_id = docker.run(&args).map_err(AgentError::Spawn)?;
        debug!(container = %container_id, "container created");

        match Self::attach(spec, streams, docker.clone(), container_id.clone()) {
            Ok(process) => Ok(process),
            Err(e) => {
                if let Err(e) = docker.remove(&container_id) {
                    error!(container = %container_id, "could not remove container: {e:#}");
                }
                Err(AgentError::Spawn(e))
            }
        }
    }

    fn attach(
        spec: &ProcessSpec,
        streams: &StreamOptions,
        docker: Docker,
        container_id: String,
    ) -> anyhow::Result<ContainerProcess> {
        if let Some(dir) = &spec.working_dir {
            let source = format!("{}/.", dir.display());
            let target = format!("{container_id}:{CODE_DIR}");
            docker
                .run(["cp", source.as_str(), target.as_str()])
                .context("could not copy the working directory")?;
        }
        docker.run(["start", container_id.as_str()])?;

        let mut exec = docker
            .command(exec_args(spec, &container_id))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("could not run docker exec")?;

        let (stdout_sink, stdout) = line_channel(streams.flush_partial_lines, false, None);
        let mirror = streams.stderr_mirror(&spec.label)?;
        let (stderr_sink, stderr) = line_channel(streams.flush_partial_lines, true, mirror);
        let pipes = exec
            .stdin
            .take()
            .zip(exec.stdout.take())
            .zip(exec.stderr.take())
            .ok_or_else(|| anyhow!("exec streams were not captured"))
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
                let _ = exec.kill();
                let _ = exec.wait();
                return Err(e);
            }
        };

        info!(container = %container_id, "agent started in container");
        Ok(ContainerProcess {
            label: spec.label.clone(),
            docker,
            container_id,
            exec: Mutex::new(exec),
            stdin,
            stdout,
            stderr,
            closed: AtomicBool::new(false),
            exit: OnceLock::new(),
        })
    }

    /// Id of the container, as reported by the runtime.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    fn queue(&self, stream: OutputStream) -> &LineQueue {
        match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        }
    }

    fn suspend(&self, action: &str) -> Suspension {
        match self.docker.run([action, self.container_id.as_str()]) {
            Ok(_) => Suspension::Applied,
            Err(e) => {
                warn!(agent = %self.label, "container {action} unsupported, agent keeps running: {e:#}");
                Suspension::Unsupported
            }
        }
    }

    fn oom_killed(&self) -> bool {
        self.docker
            .run(["inspect", "--format", "{{json .State}}", self.container_id.as_str()])
            .and_then(|state| oom_killed(&state))
            .unwrap_or_else(|e| {
                debug!(agent = %self.label, "could not inspect container: {e:#}");
                false
            })
    }

    fn record_exit(&self, reason: ExitReason) -> ExitReason {
        *self.exit.get_or_init(|| {
            match reason {
                ExitReason::Code(0) | ExitReason::Closed => {
                    debug!(agent = %self.label, ?reason, "container agent exited")
                }
                _ => warn!(agent = %self.label, ?reason, "container agent exited abnormally"),
            }
            reason
        })
    }
}

impl Process for ContainerProcess {
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
        Ok(self.suspend("pause"))
    }

    fn resume(&self) -> Result<Suspension, AgentError> {
        Ok(self.suspend("unpause"))
    }

    #[instrument(skip(self), fields(agent = %self.label))]
    fn close(&self) -> Result<(), AgentError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stdin.close();
        self.record_exit(ExitReason::Closed);
        let removed = self.docker.remove(&self.container_id);

        let mut exec = self.exec.lock().expect("poisoned");
        if let Ok(None) = exec.try_wait() {
            if let Err(e) = exec.kill() {
                trace!("kill docker exec: {e}");
            }
        }
        let _ = exec.wait();
        removed.map_err(AgentError::Process)
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
            let status = self.exec.lock().expect("poisoned").try_wait();
            match status {
                Ok(Some(status)) => {
                    let reason = if self.oom_killed() {
                        ExitReason::OutOfMemory
                    } else {
                        status.code().map_or(ExitReason::Unknown, ExitReason::Code)
                    };
                    return Some(self.record_exit(reason));
                }
                Ok(None) => {}
                Err(e) => {
                    error!(agent = %self.label, "could not query docker exec: {e}");
                    return Some(self.record_exit(ExitReason::Unknown));
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for ContainerProcess {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(agent = %self.label, "could not clean up container: {e}");
        }
    }
}

/// The `docker` client, pointed at the configured daemon socket.
#[derive(Debug, Clone)]
struct Docker {
    host: String,
}

impl Docker {
    fn new(options: &ContainerOptions) -> Docker {
        Docker {
            host: format!("unix://{}", options.socket_path.display()),
        }
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new("docker");
        command.env("DOCKER_HOST", &self.host).args(args);
        command
    }

    /// Run a docker subcommand to completion and return its trimmed stdout.
    fn run<I, S>(&self, args: I) -> anyhow::Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let name = args
            .first()
            .map(|arg| {
                let arg: &OsStr = arg.as_ref();
                arg.to_string_lossy().into_owned()
            })
            .unwrap_or_default();
        let output = self
            .command(&args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("could not run docker {name}"))?;
        if !output.status.success() {
            bail!(
                "docker {name} failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn remove(&self, container_id: &str) -> anyhow::Result<()> {
        match self.run(["rm", "--force", container_id]) {
            Ok(_) => {
                debug!(container = %container_id, "container removed");
                Ok(())
            }
            // already gone, or being removed by the runtime
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn is_gone(err: &anyhow::Error) -> bool {
    let message = format!("{err:#}");
    message.contains("No such container") || message.contains("already in progress")
}

/// Arguments of `docker create` for one agent.
fn create_args(
    spec: &ProcessSpec,
    options: &ContainerOptions,
    name: &str,
) -> anyhow::Result<Vec<String>> {
    let mut args: Vec<String> = [
        "create",
        "--name",
        name,
        "--rm",
        "--network",
        "none",
        "--cap-drop",
        "ALL",
        "--security-opt",
        "no-new-privileges",
        "--workdir",
        CODE_DIR,
    ]
    .map(str::to_string)
    .to_vec();
    args.extend(["--pids-limit".to_string(), options.pids_limit.to_string()]);
    if let Some(profile) = &options.seccomp_profile {
        if !profile.is_file() {
            bail!("seccomp profile {} does not exist", profile.display());
        }
        args.extend([
            "--security-opt".to_string(),
            format!("seccomp={}", profile.display()),
        ]);
    }
    if let Some(bytes) = spec.options.memory_limit() {
        args.extend([
            "--memory".to_string(),
            format!("{bytes}b"),
            "--memory-swap".to_string(),
            format!("{bytes}b"),
        ]);
    }
    args.extend([
        options.image.clone(),
        "sleep".to_string(),
        "infinity".to_string(),
    ]);
    Ok(args)
}

/// Arguments of the `docker exec` running the agent.
fn exec_args(spec: &ProcessSpec, container_id: &str) -> Vec<String> {
    let working_dir = spec.working_dir.as_deref();
    let mut args = vec![
        "exec".to_string(),
        "--interactive".to_string(),
        "--workdir".to_string(),
        CODE_DIR.to_string(),
        container_id.to_string(),
        container_path(&spec.command, working_dir),
    ];
    args.extend(spec.args.iter().map(|arg| container_path(arg, working_dir)));
    args
}

/// `State.OOMKilled` of a container state as printed by `docker inspect`.
fn oom_killed(state: &str) -> anyhow::Result<bool> {
    let state: serde_json::Value =
        serde_json::from_str(state).context("container state is not json")?;
    Ok(state["OOMKilled"].as_bool().unwrap_or(false))
}

/// Host paths inside the working directory, rewritten to their location in the container.
fn container_path(arg: &str, working_dir: Option<&Path>) -> String {
    working_dir
        .and_then(|dir| Path::new(arg).strip_prefix(dir).ok())
        .map(|rel| Path::new(CODE_DIR).join(rel).to_string_lossy().into_owned())
        .unwrap_or_else(|| arg.to_string())
}

fn unique_name(prefix: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "{}_{}_{}",
        sanitize_name(prefix),
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Container names only allow `[a-zA-Z0-9_.-]`.
fn sanitize_name(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        name
    } else {
        format!("agent{name}")
    }
}
