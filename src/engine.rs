//! The match-facing side of the runtime.
//!
//! An [`Engine`] drives a set of [`Agent`]s through a match: it starts them, gives every active
//! agent its turn for each step and turns their output into [`Command`]s. Turns of different
//! agents run concurrently on their own threads, so a slow agent never delays another one's
//! commands.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use tracing::{debug, error, info, instrument, warn};

use crate::{
    agent::{Agent, AgentId, AgentStatus},
    configuration::EngineOptions,
    error::AgentError,
    logger::init_logger,
    process::ProcessRegistry,
};

/// One instruction from one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Agent that sent the command.
    pub agent_id: AgentId,
    /// Raw command text, without the delimiter.
    pub command: String,
}

/// Input lines of one step.
///
/// Every agent receives the shared lines first, then its own.
#[derive(Debug, Clone, Default)]
pub struct StepInput {
    shared: Vec<String>,
    per_agent: HashMap<AgentId, Vec<String>>,
}

impl StepInput {
    /// A step without input.
    pub fn new() -> StepInput {
        StepInput::default()
    }

    /// Lines written to every agent.
    pub fn broadcast<S: Into<String>>(lines: impl IntoIterator<Item = S>) -> StepInput {
        StepInput {
            shared: lines.into_iter().map(Into::into).collect(),
            per_agent: HashMap::new(),
        }
    }

    /// Add lines written to `agent` only.
    pub fn with_agent_input<S: Into<String>>(
        mut self,
        agent: AgentId,
        lines: impl IntoIterator<Item = S>,
    ) -> StepInput {
        self.per_agent
            .entry(agent)
            .or_default()
            .extend(lines.into_iter().map(Into::into));
        self
    }

    /// Everything `agent` receives this step.
    pub fn for_agent(&self, agent: AgentId) -> Vec<String> {
        let mut lines = self.shared.clone();
        if let Some(own) = self.per_agent.get(&agent) {
            lines.extend(own.iter().cloned());
        }
        lines
    }
}

/// What one step produced.
#[derive(Debug, Default)]
pub struct StepOutcome {
    /// Commands of every agent, grouped by agent in id order, in output order within an agent.
    pub commands: Vec<Command>,
    /// Agents whose turn failed. Fatal errors already ended the agent.
    pub failures: Vec<(AgentId, AgentError)>,
}

impl StepOutcome {
    /// Commands sent by `agent`, in order.
    pub fn commands_of(&self, agent: AgentId) -> Vec<&str> {
        self.commands
            .iter()
            .filter(|c| c.agent_id == agent)
            .map(|c| c.command.as_str())
            .collect()
    }

    /// Why the turn of `agent` failed, if it did.
    pub fn failure_of(&self, agent: AgentId) -> Option<&AgentError> {
        self.failures
            .iter()
            .find(|(id, _)| *id == agent)
            .map(|(_, e)| e)
    }
}

/// Split raw output lines into commands. Empty commands are dropped.
pub fn split_commands(lines: &[String], delimiter: &str) -> Vec<String> {
    lines
        .iter()
        .flat_map(|line| {
            if delimiter.is_empty() {
                vec![line.as_str()]
            } else {
                line.split(delimiter).collect()
            }
        })
        .filter(|command| !command.is_empty())
        .map(str::to_string)
        .collect()
}

/// Runs the command protocol for one match.
#[derive(Debug)]
pub struct Engine {
    options: EngineOptions,
    registry: Arc<ProcessRegistry>,
    kill_off: AtomicBool,
}

impl Engine {
    /// Create an engine with its own process registry. Installs the file logger when
    /// [`EngineOptions::with_log`] is set.
    pub fn new(options: EngineOptions) -> Engine {
        Engine::with_registry(options, Arc::new(ProcessRegistry::new()))
    }

    /// Create an engine registering its processes in `registry`.
    pub fn with_registry(options: EngineOptions, registry: Arc<ProcessRegistry>) -> Engine {
        if options.log {
            match init_logger(options.log_dir()) {
                Ok(path) => info!(path = %path.display(), "logging to file"),
                Err(e) => warn!("file logging disabled: {e:#}"),
            }
        }
        Engine {
            options,
            registry,
            kill_off: AtomicBool::new(false),
        }
    }

    /// Protocol options of this match.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Processes started by this engine.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// True once [`Engine::kill_all`] ran.
    pub fn is_killed_off(&self) -> bool {
        self.kill_off.load(Ordering::Acquire)
    }

    /// Start every uninitialized agent and pause it until its first turn.
    ///
    /// Agents that fail to start are `Crashed` and reported; the others are not affected.
    #[instrument(skip_all)]
    pub fn initialize_agents(&self, agents: &mut [Agent]) -> Vec<(AgentId, AgentError)> {
        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = agents
                .iter_mut()
                .filter(|agent| agent.status() == AgentStatus::Uninitialized)
                .map(|agent| {
                    let id = agent.id();
                    (id, s.spawn(move || self.initialize_agent(agent)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(id, handle)| (id, join_turn(handle)))
                .collect()
        });
        let failures: Vec<_> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();
        info!(failures = failures.len(), "agents initialized");
        failures
    }

    fn initialize_agent(&self, agent: &mut Agent) -> Result<(), AgentError> {
        if self.is_killed_off() {
            agent.terminate();
            return Ok(());
        }
        agent.start(&self.options, &self.registry)?;
        if self.is_killed_off() {
            agent.terminate();
            return Ok(());
        }
        // a failed pause already ended the agent
        agent.pause()?;
        Ok(())
    }

    /// Give every active agent its turn for this step and collect their commands.
    #[instrument(skip_all)]
    pub fn collect_commands(&self, input: &StepInput, agents: &mut [Agent]) -> StepOutcome {
        let results: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = agents
                .iter_mut()
                .filter(|agent| agent.is_active())
                .map(|agent| {
                    let id = agent.id();
                    let lines = input.for_agent(id);
                    let options = &self.options;
                    (id, s.spawn(move || agent.take_turn(&lines, options)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(id, handle)| (id, join_turn(handle)))
                .collect()
        });

        let mut outcome = StepOutcome::default();
        for (agent_id, result) in results {
            match result {
                Ok(lines) => outcome.commands.extend(
                    split_commands(&lines, self.options.delimiter())
                        .into_iter()
                        .map(|command| Command { agent_id, command }),
                ),
                Err(e) => {
                    if e.is_timeout() {
                        if let Some(callback) = &self.options.timeout().callback {
                            callback(agent_id, &e);
                        }
                    }
                    outcome.failures.push((agent_id, e));
                }
            }
        }
        debug!(
            commands = outcome.commands.len(),
            failures = outcome.failures.len(),
            "step collected"
        );
        outcome
    }

    /// Terminate the agents the match declared finished.
    pub fn handle_agents(&self, agents: &mut [Agent], finished: &[AgentId]) {
        for agent in agents.iter_mut().filter(|a| finished.contains(&a.id())) {
            agent.terminate();
        }
    }

    /// Write `message` to `agent` outside of a turn. Returns false if it could not be delivered.
    pub fn send(&self, agent: &mut Agent, message: &str) -> bool {
        match agent.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(agent = agent.name(), "message not delivered: {e}");
                false
            }
        }
    }

    /// Pause every active agent.
    pub fn stop(&self, agents: &mut [Agent]) {
        for agent in agents.iter_mut().filter(|a| a.is_active()) {
            if let Err(e) = agent.pause() {
                warn!(agent = agent.name(), "could not pause agent: {e}");
            }
        }
    }

    /// Resume every active agent.
    pub fn resume(&self, agents: &mut [Agent]) {
        for agent in agents.iter_mut().filter(|a| a.is_active()) {
            if let Err(e) = agent.resume() {
                warn!(agent = agent.name(), "could not resume agent: {e}");
            }
        }
    }

    /// Terminate one agent.
    pub fn kill(&self, agent: &mut Agent) {
        agent.terminate();
    }

    /// Close every process registered with this engine, including those of agents still
    /// starting up, which are killed as soon as they exist.
    pub fn kill_all(&self) -> usize {
        self.kill_off.store(true, Ordering::Release);
        self.registry.close_all()
    }

    /// Terminate `agents`, then close anything left in the registry.
    pub fn kill_and_clean(&self, agents: &mut [Agent]) {
        self.kill_off.store(true, Ordering::Release);
        for agent in agents.iter_mut() {
            agent.terminate();
        }
        let leftovers = self.registry.close_all();
        if leftovers > 0 {
            warn!(leftovers, "processes were left behind by their agents");
        }
    }
}

fn join_turn<T>(
    handle: thread::ScopedJoinHandle<'_, Result<T, AgentError>>,
) -> Result<T, AgentError> {
    handle.join().unwrap_or_else(|_| {
        error!("agent thread panicked");
        Err(AgentError::Process(anyhow::anyhow!("agent thread panicked")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|l| l.to_string()).collect()
    }

    #[test]
    fn commands_are_split_on_the_delimiter() {
        assert_eq!(
            split_commands(&lines(&["move a b 3,run 24 d,"]), ","),
            vec!["move a b 3", "run 24 d"]
        );
        assert_eq!(
            split_commands(&lines(&["a;;b", "c"]), ";"),
            vec!["a", "b", "c"]
        );
        assert_eq!(split_commands(&lines(&["a,b"]), ""), vec!["a,b"]);
    }

    #[test]
    fn step_input_per_agent() {
        let input = StepInput::broadcast(["turn 1"]).with_agent_input(AgentId(1), ["you are 1"]);
        assert_eq!(input.for_agent(AgentId(0)), vec!["turn 1"]);
        assert_eq!(input.for_agent(AgentId(1)), vec!["turn 1", "you are 1"]);
    }

    #[test]
    fn outcome_lookup() {
        let outcome = StepOutcome {
            commands: vec![
                Command {
                    agent_id: AgentId(0),
                    command: "R".to_string(),
                },
                Command {
                    agent_id: AgentId(1),
                    command: "S".to_string(),
                },
            ],
            failures: vec![(AgentId(2), AgentError::NoAgents)],
        };
        assert_eq!(outcome.commands_of(AgentId(1)), vec!["S"]);
        assert!(outcome.failure_of(AgentId(2)).is_some());
        assert!(outcome.failure_of(AgentId(0)).is_none());
    }

    #[test]
    fn engine_without_agents() {
        let engine = Engine::new(EngineOptions::new());
        let mut agents: Vec<Agent> = vec![];
        assert!(engine.initialize_agents(&mut agents).is_empty());
        let outcome = engine.collect_commands(&StepInput::new(), &mut agents);
        assert!(outcome.commands.is_empty());
        assert_eq!(engine.kill_all(), 0);
        assert!(engine.is_killed_off());
    }
}
