use std::{
    collections::VecDeque,
    fmt::Display,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    configuration::{EngineOptions, FinishPolicy},
    constraints::ProcessOptions,
    error::{AgentError, TimeoutKind, WriteError},
    process::{
        self, Backend, ExitReason, OutputStream, Process, ProcessRegistry, ProcessSpec,
        RegistryKey, StreamOptions, Suspension,
    },
    timed::{TimeBudget, TimeoutError},
};

/// How long an agent whose output ended may take to report its exit status.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Sequential id of an agent inside a match, starting at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(pub u32);

impl Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of an agent.
///
/// `Uninitialized -> Ready -> Running <-> Stopped`, and from any of them to `Crashed` or
/// `Killed`, which are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// Not started yet.
    Uninitialized,
    /// Process started, no turn taken.
    Ready,
    /// Currently taking a turn.
    Running,
    /// Paused between two turns.
    Stopped,
    /// Broke the protocol or its limits: timeout, resource limit, unusable streams.
    Crashed,
    /// Terminated on purpose, or exited by itself.
    Killed,
}

/// Where an agent comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSource {
    /// Executable, or script when `command` is set.
    pub path: PathBuf,
    /// Display name, `agent_<id>` when not set.
    pub name: Option<String>,
    /// Interpreter running `path`, e.g. `python3`.
    pub command: Option<String>,
    /// Extra arguments given to the agent.
    pub args: Vec<String>,
}

impl AgentSource {
    /// An agent run directly from `path`.
    pub fn new(path: impl Into<PathBuf>) -> AgentSource {
        AgentSource {
            path: path.into(),
            name: None,
            command: None,
            args: Vec::new(),
        }
    }

    /// Set the display name.
    pub fn with_name(self, name: &str) -> AgentSource {
        AgentSource {
            name: Some(name.to_string()),
            ..self
        }
    }

    /// Run the path with this interpreter.
    pub fn with_command(self, command: &str) -> AgentSource {
        AgentSource {
            command: Some(command.to_string()),
            ..self
        }
    }

    /// Set extra command-line arguments.
    pub fn with_args(self, args: &[&str]) -> AgentSource {
        AgentSource {
            args: args.iter().map(|a| a.to_string()).collect(),
            ..self
        }
    }
}

impl From<&str> for AgentSource {
    fn from(path: &str) -> Self {
        AgentSource::new(path)
    }
}

impl From<PathBuf> for AgentSource {
    fn from(path: PathBuf) -> Self {
        AgentSource::new(path)
    }
}

impl From<&Path> for AgentSource {
    fn from(path: &Path) -> Self {
        AgentSource::new(path)
    }
}

impl<P: Into<PathBuf>> From<(P, &str)> for AgentSource {
    fn from((path, name): (P, &str)) -> Self {
        AgentSource::new(path).with_name(name)
    }
}

/// Build one agent per source, with ids `0..n` in order.
///
/// Fails if `sources` is empty or if any path does not exist. Nothing is started.
pub fn generate_agents<S: Into<AgentSource>>(
    sources: impl IntoIterator<Item = S>,
    options: &ProcessOptions,
    backend: &Backend,
) -> Result<Vec<Agent>, AgentError> {
    let agents = sources
        .into_iter()
        .enumerate()
        .map(|(i, source)| -> Result<Agent, AgentError> {
            let mut source: AgentSource = source.into();
            source.path = std::fs::canonicalize(&source.path)
                .map_err(|_| AgentError::MissingExecutable(source.path.clone()))?;
            Ok(Agent::new(
                AgentId(i as u32),
                source,
                options.clone(),
                backend.clone(),
            ))
        })
        .collect::<Result<Vec<_>, AgentError>>()?;
    if agents.is_empty() {
        return Err(AgentError::NoAgents);
    }
    Ok(agents)
}

/// One bot taking part in a match: its process, its status and its time budget.
#[derive(Debug)]
pub struct Agent {
    id: AgentId,
    name: String,
    source: AgentSource,
    options: ProcessOptions,
    backend: Backend,
    status: AgentStatus,
    process: Option<Arc<dyn Process>>,
    registration: Option<(Arc<ProcessRegistry>, RegistryKey)>,
    budget: TimeBudget,
    /// False from the moment the current turn is complete until the next one starts.
    accepting: bool,
    /// Output received after a turn was complete, owed to the next turn.
    overflow: VecDeque<String>,
    suspension: Option<Suspension>,
}

impl Agent {
    /// A new, not yet started agent.
    pub fn new(id: AgentId, source: AgentSource, options: ProcessOptions, backend: Backend) -> Agent {
        let name = source
            .name
            .clone()
            .unwrap_or_else(|| format!("agent_{id}"));
        Agent {
            id,
            name,
            source,
            options,
            backend,
            status: AgentStatus::Uninitialized,
            process: None,
            registration: None,
            budget: TimeBudget::unlimited(),
            accepting: false,
            overflow: VecDeque::new(),
            suspension: None,
        }
    }

    /// Id of the agent in its match.
    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn status(&self) -> AgentStatus {
        self.status
    }

    /// Where the agent was built from.
    pub fn source(&self) -> &AgentSource {
        &self.source
    }

    /// Time budget, unlimited until the agent starts.
    pub fn budget(&self) -> &TimeBudget {
        &self.budget
    }

    /// True only once the agent was killed.
    pub fn is_terminated(&self) -> bool {
        self.status == AgentStatus::Killed
    }

    /// True while the agent can take turns.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            AgentStatus::Ready | AgentStatus::Running | AgentStatus::Stopped
        )
    }

    /// Whether output is currently counted for a turn.
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Result of the last pause or resume, `None` before the first one.
    pub fn suspension(&self) -> Option<Suspension> {
        self.suspension
    }

    /// The running process, `None` before the start and after the end.
    pub fn process(&self) -> Option<&Arc<dyn Process>> {
        self.process.as_ref()
    }

    fn process_spec(&self, options: &EngineOptions) -> ProcessSpec {
        let path = self.source.path.to_string_lossy().into_owned();
        let (command, mut args) = match &self.source.command {
            Some(command) => (command.clone(), vec![path]),
            None => (path, Vec::new()),
        };
        args.extend(self.source.args.iter().cloned());
        ProcessSpec {
            label: self.name.clone(),
            command,
            args,
            working_dir: self.source.path.parent().map(Path::to_path_buf),
            options: self.options.clone(),
            backend: self.backend.clone(),
            allow_uncontained: options.allow_uncontained,
        }
    }

    fn stream_options(&self, options: &EngineOptions) -> StreamOptions {
        StreamOptions {
            flush_partial_lines: options.finish_policy() == FinishPolicy::LineCount
                && !options.lines().wait_for_newline,
            stderr_to_tracing: options.debug_agent_stderr,
            stderr_log: options
                .error_log_dir
                .as_ref()
                .map(|dir| dir.join(format!("agent_{}.log", self.id))),
        }
    }

    /// Spawn the process. The agent is `Ready` afterwards, or `Crashed` if it could not start.
    #[instrument(skip_all, fields(agent = %self.name))]
    pub fn start(
        &mut self,
        options: &EngineOptions,
        registry: &Arc<ProcessRegistry>,
    ) -> Result<(), AgentError> {
        if self.status != AgentStatus::Uninitialized {
            return Err(AgentError::NotActive(self.status));
        }
        let process = match process::start(&self.process_spec(options), &self.stream_options(options))
        {
            Ok(process) => process,
            Err(e) => {
                error!("agent could not be started: {e}");
                self.status = AgentStatus::Crashed;
                return Err(e);
            }
        };
        let key = registry.add(process.clone());
        self.registration = Some((registry.clone(), key));
        self.process = Some(process);

        self.budget = if options.timeout().active {
            TimeBudget::new(
                self.options.per_step_or(options.timeout().max),
                self.options.overage,
            )
        } else {
            TimeBudget::unlimited()
        };
        self.status = AgentStatus::Ready;
        info!(id = self.id.0, "agent ready");
        Ok(())
    }

    /// Suspend the process between turns. A process that cannot be paused ends the agent.
    pub fn pause(&mut self) -> Result<Suspension, AgentError> {
        let process = self.active_process()?;
        let suspension = process.pause().inspect_err(|e| self.fail(e))?;
        self.suspension = Some(suspension);
        if self.status == AgentStatus::Running {
            self.status = AgentStatus::Stopped;
        }
        Ok(suspension)
    }

    /// Continue a paused process.
    pub fn resume(&mut self) -> Result<Suspension, AgentError> {
        let process = self.active_process()?;
        let suspension = process.resume()?;
        self.suspension = Some(suspension);
        if self.status == AgentStatus::Stopped {
            self.status = AgentStatus::Running;
        }
        Ok(suspension)
    }

    fn active_process(&self) -> Result<Arc<dyn Process>, AgentError> {
        match &self.process {
            Some(process) if self.is_active() => Ok(process.clone()),
            _ => Err(AgentError::NotActive(self.status)),
        }
    }

    /// Write `message` to the agent outside of a turn.
    ///
    /// The agent has its turn allowance to take the message; failing to is fatal.
    pub fn send(&mut self, message: &str) -> Result<(), AgentError> {
        let process = self.active_process()?;
        let allowance = self.budget.allowance();
        let deadline = allowance.and_then(|a| Instant::now().checked_add(a));
        write_input(
            process.as_ref(),
            message,
            deadline,
            allowance.unwrap_or(Duration::MAX),
            self.options.memory_limit(),
        )
        .inspect_err(|e| self.fail(e))
    }

    /// Give the agent its turn: write `input`, then collect its output lines until the finish
    /// policy is met. The agent is paused again before returning.
    ///
    /// A fatal error ends the agent: it is `Crashed` or `Killed` afterwards and its process is
    /// closed.
    #[instrument(skip_all, fields(agent = %self.name))]
    pub fn take_turn(
        &mut self,
        input: &[String],
        options: &EngineOptions,
    ) -> Result<Vec<String>, AgentError> {
        let process = self.active_process()?;
        match self.run_turn(process.as_ref(), input, options) {
            Ok(lines) => {
                if let Err(e) = process.pause() {
                    // an exited process surfaces on its next turn
                    warn!("could not pause agent: {e}");
                }
                self.status = AgentStatus::Stopped;
                Ok(lines)
            }
            Err(e) => {
                if e.is_fatal() {
                    self.fail(&e);
                }
                Err(e)
            }
        }
    }

    fn run_turn(
        &mut self,
        process: &dyn Process,
        input: &[String],
        options: &EngineOptions,
    ) -> Result<Vec<String>, AgentError> {
        let memory_limit = self.options.memory_limit();
        match process.resume() {
            Ok(suspension) => self.suspension = Some(suspension),
            Err(e) => {
                return Err(process
                    .wait_exit(EXIT_GRACE)
                    .map(|reason| reason.into_error(memory_limit))
                    .unwrap_or(e))
            }
        }
        self.status = AgentStatus::Running;

        if options.finish_policy() == FinishPolicy::FinishSymbol {
            while let Some(line) = process.try_read_line(OutputStream::Stdout) {
                trace!("discarding late output '{line}'");
            }
        }

        self.accepting = true;
        self.budget.set_timeout_reason("waiting for commands");
        let allowance = self.budget.allowance().unwrap_or(Duration::MAX);
        let overflow = &mut self.overflow;
        let lines = self.budget.run(|deadline| {
            for line in input {
                write_input(process, line, deadline, allowance, memory_limit)?;
            }
            collect_lines(overflow, process, deadline, options, allowance, memory_limit)
        });
        self.accepting = false;
        let lines = lines?;

        while let Some(line) = process.try_read_line(OutputStream::Stdout) {
            match options.finish_policy() {
                FinishPolicy::FinishSymbol => {
                    debug!("output after finish symbol discarded: '{line}'")
                }
                FinishPolicy::LineCount => self.overflow.push_back(line),
            }
        }
        debug!(lines = lines.len(), "turn complete");
        Ok(lines)
    }

    /// Record a fatal error: mark the agent and close its process.
    pub fn fail(&mut self, err: &AgentError) {
        if !self.is_active() {
            return;
        }
        self.status = match err {
            AgentError::PrematureExit { .. } => AgentStatus::Killed,
            _ => AgentStatus::Crashed,
        };
        error!(agent = %self.name, status = ?self.status, "{err}");
        self.close_process();
    }

    /// Kill the agent. Idempotent.
    pub fn terminate(&mut self) {
        if self.status != AgentStatus::Killed {
            debug!(agent = %self.name, "terminating agent");
        }
        self.status = AgentStatus::Killed;
        self.close_process();
    }

    fn close_process(&mut self) {
        self.accepting = false;
        if let Some(process) = self.process.take() {
            if let Err(e) = process.close() {
                error!(agent = %self.name, "could not close process: {e}");
            }
        }
        if let Some((registry, key)) = self.registration.take() {
            registry.remove(key);
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.close_process();
    }
}

/// Write one input line before `deadline`. A closed input means the process is gone, and its
/// exit is reported instead.
fn write_input(
    process: &dyn Process,
    line: &str,
    deadline: Option<Instant>,
    allowance: Duration,
    memory_limit: Option<u64>,
) -> Result<(), AgentError> {
    process.write_line(line, deadline).map_err(|e| match e {
        WriteError::Timeout => AgentError::Timeout(TimeoutKind::Deadline { allowance }),
        WriteError::Closed(reason) => process
            .wait_exit(EXIT_GRACE)
            .map(|exit| exit.into_error(memory_limit))
            .unwrap_or(AgentError::Write(reason)),
    })
}

/// Read output lines until the finish policy is met.
///
/// Lines owed from the previous turn come first. Empty lines are skipped. The finish symbol
/// ends the turn under both policies and is never part of it.
fn collect_lines(
    overflow: &mut VecDeque<String>,
    process: &dyn Process,
    deadline: Option<Instant>,
    options: &EngineOptions,
    allowance: Duration,
    memory_limit: Option<u64>,
) -> Result<Vec<String>, AgentError> {
    let max = match options.finish_policy() {
        FinishPolicy::FinishSymbol => usize::MAX,
        FinishPolicy::LineCount => options.lines().max,
    };
    let mut lines = Vec::new();
    while lines.len() < max {
        let line = match overflow.pop_front() {
            Some(line) => line,
            None => match process.read_line(OutputStream::Stdout, deadline) {
                Ok(Some(line)) => line,
                Ok(None) => {
                    let reason = process
                        .wait_exit(EXIT_GRACE)
                        .unwrap_or(ExitReason::Unknown);
                    return Err(reason.into_error(memory_limit));
                }
                Err(TimeoutError {}) => {
                    return Err(AgentError::Timeout(TimeoutKind::Deadline { allowance }))
                }
            },
        };
        trace!("< {line}");
        if line == options.finish_symbol() {
            break;
        }
        if line.is_empty() {
            continue;
        }
        lines.push(line);
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Serves a fixed output, then either ends or never answers again.
    #[derive(Debug)]
    struct ScriptedProcess {
        output: Mutex<VecDeque<String>>,
        ends: bool,
        input: Result<(), WriteError>,
        pause_fails: bool,
    }

    impl ScriptedProcess {
        fn new(output: &[&str], ends: bool) -> ScriptedProcess {
            ScriptedProcess {
                output: Mutex::new(output.iter().map(|l| l.to_string()).collect()),
                ends,
                input: Ok(()),
                pause_fails: false,
            }
        }

        fn with_input(self, input: Result<(), WriteError>) -> ScriptedProcess {
            ScriptedProcess { input, ..self }
        }

        fn with_failing_pause(self) -> ScriptedProcess {
            ScriptedProcess {
                pause_fails: true,
                ..self
            }
        }
    }

    impl Process for ScriptedProcess {
        fn label(&self) -> &str {
            "scripted"
        }
        fn write_line(&self, _line: &str, _deadline: Option<Instant>) -> Result<(), WriteError> {
            self.input.clone()
        }
        fn read_line(
            &self,
            _stream: OutputStream,
            _deadline: Option<Instant>,
        ) -> Result<Option<String>, TimeoutError> {
            match self.output.lock().unwrap().pop_front() {
                Some(line) => Ok(Some(line)),
                None if self.ends => Ok(None),
                None => Err(TimeoutError {}),
            }
        }
        fn try_read_line(&self, _stream: OutputStream) -> Option<String> {
            self.output.lock().unwrap().pop_front()
        }
        fn pause(&self) -> Result<Suspension, AgentError> {
            if self.pause_fails {
                return Err(AgentError::Process(anyhow::anyhow!("no such process")));
            }
            Ok(Suspension::Applied)
        }
        fn resume(&self) -> Result<Suspension, AgentError> {
            Ok(Suspension::Applied)
        }
        fn close(&self) -> Result<(), AgentError> {
            Ok(())
        }
        fn is_closed(&self) -> bool {
            false
        }
        fn wait_exit(&self, _max: Duration) -> Option<ExitReason> {
            Some(ExitReason::Code(2))
        }
    }

    fn running(process: ScriptedProcess) -> Agent {
        let mut agent = Agent::new(
            AgentId(0),
            AgentSource::new("/bin/sh"),
            ProcessOptions::default(),
            Backend::Local,
        );
        agent.process = Some(Arc::new(process));
        agent.budget = TimeBudget::new(Duration::from_millis(100), Duration::from_millis(100));
        agent.status = AgentStatus::Ready;
        agent
    }

    fn collect(
        overflow: &mut VecDeque<String>,
        process: &ScriptedProcess,
        options: &EngineOptions,
    ) -> Result<Vec<String>, AgentError> {
        collect_lines(overflow, process, None, options, Duration::from_secs(1), None)
    }

    #[test]
    fn finish_symbol_ends_the_turn() {
        let process = ScriptedProcess::new(&["R", "", "move 1", "D_FINISH", "S"], false);
        let lines = collect(&mut VecDeque::new(), &process, &EngineOptions::new()).unwrap();
        assert_eq!(lines, vec!["R", "move 1"]);
        assert_eq!(process.try_read_line(OutputStream::Stdout).as_deref(), Some("S"));
    }

    #[test]
    fn line_count_caps_the_turn() {
        let options = EngineOptions::new().with_finish_policy(FinishPolicy::LineCount);
        let process = ScriptedProcess::new(&["R", "S"], false);
        let mut overflow = VecDeque::new();
        assert_eq!(collect(&mut overflow, &process, &options).unwrap(), vec!["R"]);
        assert_eq!(collect(&mut overflow, &process, &options).unwrap(), vec!["S"]);
    }

    #[test]
    fn overflow_comes_first() {
        let options = EngineOptions::new()
            .with_finish_policy(FinishPolicy::LineCount)
            .with_max_lines(2);
        let process = ScriptedProcess::new(&["C"], false);
        let mut overflow = VecDeque::from(["A".to_string(), "B".to_string()]);
        assert_eq!(
            collect(&mut overflow, &process, &options).unwrap(),
            vec!["A", "B"]
        );
        assert!(collect(&mut overflow, &process, &options)
            .unwrap_err()
            .is_timeout());
    }

    #[test]
    fn finish_symbol_also_ends_line_count_turns() {
        let options = EngineOptions::new()
            .with_finish_policy(FinishPolicy::LineCount)
            .with_max_lines(5);
        let process = ScriptedProcess::new(&["R", "D_FINISH", "S"], false);
        assert_eq!(
            collect(&mut VecDeque::new(), &process, &options).unwrap(),
            vec!["R"]
        );
    }

    #[test]
    fn silence_is_a_deadline_timeout() {
        let process = ScriptedProcess::new(&["R"], false);
        let err = collect(&mut VecDeque::new(), &process, &EngineOptions::new()).unwrap_err();
        assert!(matches!(
            err,
            AgentError::Timeout(TimeoutKind::Deadline { .. })
        ));
    }

    #[test]
    fn end_of_output_is_a_premature_exit() {
        let process = ScriptedProcess::new(&["R"], true);
        let err = collect(&mut VecDeque::new(), &process, &EngineOptions::new()).unwrap_err();
        assert!(matches!(err, AgentError::PrematureExit { code: Some(2) }));
    }

    #[test]
    fn closed_input_reports_the_exit() {
        let process = ScriptedProcess::new(&[], true)
            .with_input(Err(WriteError::Closed("Broken pipe".to_string())));
        let mut agent = running(process);
        let err = agent
            .take_turn(&["state".to_string()], &EngineOptions::new())
            .unwrap_err();
        assert!(matches!(err, AgentError::PrematureExit { code: Some(2) }), "{err}");
        assert_eq!(agent.status(), AgentStatus::Killed);
    }

    #[test]
    fn unconsumed_input_is_a_timeout() {
        let process = ScriptedProcess::new(&["R", "D_FINISH"], false)
            .with_input(Err(WriteError::Timeout));
        let mut agent = running(process);
        let err = agent
            .take_turn(&["state".to_string()], &EngineOptions::new())
            .unwrap_err();
        assert!(matches!(
            err,
            AgentError::Timeout(TimeoutKind::Deadline { .. })
        ));
        assert_eq!(agent.status(), AgentStatus::Crashed);
        assert!(agent.budget().is_exhausted());
    }

    #[test]
    fn failed_pause_ends_the_agent() {
        let mut agent = running(ScriptedProcess::new(&[], false).with_failing_pause());
        assert!(agent.pause().is_err());
        assert_eq!(agent.status(), AgentStatus::Crashed);
        assert!(!agent.is_active());
        assert!(agent.process().is_none());
    }

    #[test]
    fn generate_agents_assigns_ids_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.sh");
        let b = dir.path().join("b.sh");
        std::fs::write(&a, "").unwrap();
        std::fs::write(&b, "").unwrap();

        let agents = generate_agents(
            vec![AgentSource::from(a.as_path()), AgentSource::from((b, "bravo"))],
            &ProcessOptions::default(),
            &Backend::Local,
        )
        .unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].id(), AgentId(0));
        assert_eq!(agents[0].name(), "agent_0");
        assert_eq!(agents[1].id(), AgentId(1));
        assert_eq!(agents[1].name(), "bravo");
        assert!(agents
            .iter()
            .all(|a| a.status() == AgentStatus::Uninitialized && !a.is_active()));
    }

    #[test]
    fn generate_agents_rejects_bad_input() {
        let none: Vec<&str> = vec![];
        assert!(matches!(
            generate_agents(none, &ProcessOptions::default(), &Backend::Local),
            Err(AgentError::NoAgents)
        ));
        assert!(matches!(
            generate_agents(
                ["/no/such/bot"],
                &ProcessOptions::default(),
                &Backend::Local
            ),
            Err(AgentError::MissingExecutable(_))
        ));
    }

    #[test]
    fn unstarted_agent_refuses_turns() {
        let mut agent = Agent::new(
            AgentId(0),
            AgentSource::new("/bin/sh"),
            ProcessOptions::default(),
            Backend::Local,
        );
        let err = agent.take_turn(&[], &EngineOptions::new()).unwrap_err();
        assert!(matches!(
            err,
            AgentError::NotActive(AgentStatus::Uninitialized)
        ));
        assert!(!err.is_fatal());
        agent.terminate();
        agent.terminate();
        assert!(agent.is_terminated());
    }
}
