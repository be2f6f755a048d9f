//! # Match Runtime
//!
//! Runs bot programs ("agents") during a match and talks to them with a line based protocol.
//!
//! It provides:
//! - Process backends: plain subprocesses ([`LocalProcess`](crate::process::LocalProcess)) and
//!   containers ([`ContainerProcess`](crate::process::ContainerProcess)), behind the
//!   [`Process`](crate::process::Process) trait
//! - Per-agent time budgets with a shared overage pool ([`TimeBudget`](crate::timed::TimeBudget))
//! - The turn protocol: finish symbol or line count policies, command splitting
//!   ([`Engine`](crate::engine::Engine))
//! - A small tokenizer for agent output ([`ParsedCommand`](crate::parser::ParsedCommand))
//! - Memory limits enforced through Linux cgroups v2, a memory watcher, or the container runtime
//!
//! Each agent runs as a separate OS process (or container), paused between its turns so that
//! it neither uses CPU nor advances its own clock while other agents play.
//!
//! # Documentation Overview
//!
//! - For the turn loop and how output becomes commands, see the [`engine`] module.
//! - For protocol settings, see [`EngineOptions`](crate::configuration::EngineOptions).
//! - For time and memory limits, see [`constraints`].
//! - For the agent lifecycle, see [`Agent`](crate::agent::Agent) and
//!   [`AgentStatus`](crate::agent::AgentStatus).
//!
//! # Usage Example
//!
//! ```no_run
//! use std::time::Duration;
//! use match_runtime::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let process_options = ProcessOptionsBuilder::new()
//!         .with_per_step(Duration::from_millis(200))
//!         .with_overage(Duration::from_secs(5))
//!         .build()?;
//!
//!     let mut agents = generate_agents(
//!         [("bots/rock.py", "rock"), ("bots/paper.py", "paper")]
//!             .map(|(path, name)| AgentSource::new(path).with_name(name).with_command("python3")),
//!         &process_options,
//!         &Backend::Local,
//!     )?;
//!
//!     let engine = Engine::new(EngineOptions::new().with_allow_uncontained(true));
//!     engine.initialize_agents(&mut agents);
//!
//!     for round in 0..3 {
//!         let step = engine.collect_commands(&StepInput::broadcast([format!("round {round}")]), &mut agents);
//!         for command in &step.commands {
//!             let mut parsed = ParsedCommand::new(&command.command, " ");
//!             println!("{} plays {}", command.agent_id, parsed.next_str()?);
//!         }
//!         for (id, error) in &step.failures {
//!             println!("agent {id} failed: {error}");
//!         }
//!     }
//!
//!     engine.kill_and_clean(&mut agents);
//!     Ok(())
//! }
//! ```
//!
//! # Agent Requirements
//!
//! - Read the step input from stdin, one line at a time
//! - Write commands to stdout, several per line separated by the delimiter (`,` by default)
//! - End each turn with the finish symbol (`D_FINISH` by default) on its own line, or write
//!   exactly the configured number of lines when the line count policy is used
//! - Flush stdout after each turn
//! - Anything written to stderr is never read as a command
#![warn(missing_docs)]

pub mod agent;
mod cgroup_manager;
pub mod configuration;
pub mod constraints;
pub mod engine;
pub mod error;
pub mod logger;
pub mod parser;
pub mod process;
pub mod timed;
pub use anyhow;

/// Commonly used types and functions for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use match_runtime::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{generate_agents, Agent, AgentId, AgentSource, AgentStatus};
    pub use crate::configuration::{EngineOptions, FinishPolicy};
    pub use crate::constraints::{ContainerOptions, ProcessOptions, ProcessOptionsBuilder};
    pub use crate::engine::{Command, Engine, StepInput, StepOutcome};
    pub use crate::error::{AgentError, ParseError, TimeoutKind, WriteError};
    pub use crate::parser::ParsedCommand;
    pub use crate::process::{Backend, ProcessRegistry};
}
