//! Error types reported by agents and the command protocol.
//!
//! Errors are always local to one agent: the engine records them, marks the agent
//! [`Crashed`](crate::agent::AgentStatus::Crashed) or
//! [`Killed`](crate::agent::AgentStatus::Killed) when [`AgentError::is_fatal`] says so, and keeps
//! running the remaining agents.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::agent::AgentStatus;

/// Why an agent ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The per-step allowance plus the remaining overage elapsed while waiting for output.
    Deadline {
        /// The full deadline that was given to the turn.
        allowance: Duration,
    },
    /// The turn completed, but it overran the per-step allowance by more than the remaining
    /// overage.
    OverageExhausted {
        /// How much time beyond the per-step allowance the turn took.
        overrun: Duration,
        /// Overage that was left before the turn.
        remaining: Duration,
    },
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Deadline { allowance } => {
                write!(f, "no complete turn within {}ms", allowance.as_millis())
            }
            TimeoutKind::OverageExhausted { overrun, remaining } => write!(
                f,
                "turn overran its step by {}ms with only {}ms of overage left",
                overrun.as_millis(),
                remaining.as_millis()
            ),
        }
    }
}

/// Error produced while consuming tokens from a [`ParsedCommand`](crate::parser::ParsedCommand).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Every token of the line has already been consumed.
    #[error("no more contents to consume from line")]
    Exhausted,
    /// The token was consumed as an integer but is not one.
    #[error("'{0}' is not a number")]
    NotANumber(String),
}

/// Why a line could not be handed to a process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The process did not take the line before the deadline.
    #[error("input was not consumed before the deadline")]
    Timeout,
    /// The input stream is closed, usually because the process is gone.
    #[error("input stream is closed: {0}")]
    Closed(String),
}

/// Everything that can go wrong with one agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The executable or container could not be launched.
    #[error("could not spawn agent: {0:#}")]
    Spawn(anyhow::Error),
    /// The input stream of the process is unusable.
    #[error("could not write to agent: {0}")]
    Write(String),
    /// The agent exceeded its time budget.
    #[error("agent timed out: {0}")]
    Timeout(TimeoutKind),
    /// The process exited on its own, outside of a controlled close.
    #[error("agent exited prematurely ({})", describe_exit(.code))]
    PrematureExit {
        /// Exit code, `None` when terminated by a signal.
        code: Option<i32>,
    },
    /// Agent output could not be parsed. Not fatal by itself.
    #[error("malformed agent output: {0}")]
    MalformedOutput(#[from] ParseError),
    /// The memory ceiling was exceeded.
    #[error("agent exceeded its memory limit of {limit_bytes} bytes")]
    ResourceLimit {
        /// The configured ceiling, in bytes.
        limit_bytes: u64,
    },
    /// The agent cannot take part in a turn in its current state.
    #[error("agent is not active (status: {0:?})")]
    NotActive(AgentStatus),
    /// Any other failure of the process backend.
    #[error("process error: {0:#}")]
    Process(anyhow::Error),
    /// `generate_agents` was called without any agent.
    #[error("no agents were given")]
    NoAgents,
    /// An agent executable does not exist on disk.
    #[error("no such file '{}'", .0.display())]
    MissingExecutable(PathBuf),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "killed by signal".to_string(),
    }
}

impl AgentError {
    /// True if the agent must not take any further turn after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            AgentError::MalformedOutput(_) | AgentError::NotActive(_)
        )
    }

    /// True for both soft and hard timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AgentError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality() {
        assert!(!AgentError::from(ParseError::Exhausted).is_fatal());
        assert!(AgentError::PrematureExit { code: Some(1) }.is_fatal());
        assert!(AgentError::Timeout(TimeoutKind::Deadline {
            allowance: Duration::from_millis(10)
        })
        .is_fatal());
    }

    #[test]
    fn premature_exit_message() {
        let msg = AgentError::PrematureExit { code: None }.to_string();
        assert!(msg.contains("signal"), "{msg}");
        let msg = AgentError::PrematureExit { code: Some(3) }.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
    }
}
