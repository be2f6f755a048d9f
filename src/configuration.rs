//! Config for the command protocol
//!
//! This module provides [`EngineOptions`], which controls how the engine talks to agents during
//! a match: how commands are delimited, when a turn is considered finished, and how long agents
//! may take.
//!
//! Options can be created programmatically using [`EngineOptions::new()`] or by reading
//! environment variables using [`EngineOptions::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive; set them to `"true"` to enable.
//!
//! - `ENGINE_COMMAND_DELIMITER` — Delimiter between commands on one line (default: `,`)
//! - `ENGINE_FINISH_SYMBOL` — Line that ends a turn (default: `D_FINISH`)
//! - `ENGINE_FINISH_POLICY` — `finish_symbol` or `line_count` (default: `finish_symbol`)
//! - `ENGINE_MAX_LINES` — Lines accepted per turn under `line_count` (default: `1`)
//! - `ENGINE_WAIT_FOR_NEWLINE` — Only count complete lines (default: `true`)
//! - `ENGINE_TIMEOUT_ACTIVE` — Enforce time budgets (default: `true`)
//! - `ENGINE_TIMEOUT_MS` — Default per-step allowance in milliseconds (default: `1000`)
//! - `ENGINE_LOG` — Enable logging to a file (default: `false`)
//! - `ENGINE_LOG_DIR` — Directory of the log file (default: `.`)
//! - `ENGINE_DEBUG_AGENT_STDERR` — Mirror agent stderr into the logs (default: `false`)
//! - `ENGINE_ALLOW_UNCONTAINED` — Run local agents without a cgroup when cgroups are
//!   unavailable (default: `false`)

use std::{fmt::Debug, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use anyhow::bail;

use crate::{agent::AgentId, error::AgentError};

/// How commands are streamed from agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandStreamType {
    /// Each agent finishes its whole turn before its commands are handed over.
    #[default]
    Sequential,
}

/// How the engine decides that a turn's output is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinishPolicy {
    /// The turn ends on a line equal to the finish symbol. Output after it is discarded.
    #[default]
    FinishSymbol,
    /// The turn ends after `max` lines. Output after it is kept for the next turn.
    LineCount,
}

impl FromStr for FinishPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "finish_symbol" => Ok(FinishPolicy::FinishSymbol),
            "line_count" => Ok(FinishPolicy::LineCount),
            other => bail!("unknown finish policy '{other}'"),
        }
    }
}

/// Options of the [`FinishPolicy::LineCount`] policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandLines {
    /// Lines accepted before the turn is cut off.
    pub max: usize,
    /// Wait for the terminating newline before counting a line. When false, a pending partial
    /// line is counted as soon as it is read.
    pub wait_for_newline: bool,
}

/// Called after an agent was timed out and crashed by the engine.
pub type TimeoutCallback = Arc<dyn Fn(AgentId, &AgentError) + Send + Sync>;

/// Timeout options.
#[derive(Clone)]
pub struct TimeoutOptions {
    /// Whether time budgets are enforced at all.
    pub active: bool,
    /// Per-step allowance used when an agent's process options do not set one.
    pub max: Duration,
    /// Extra handling for timed out agents.
    pub callback: Option<TimeoutCallback>,
}

impl Debug for TimeoutOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutOptions")
            .field("active", &self.active)
            .field("max", &self.max)
            .field("callback", &self.callback.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// Protocol configuration for a match.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub(crate) stream_type: CommandStreamType,
    pub(crate) delimiter: String,
    pub(crate) finish_symbol: String,
    pub(crate) finish_policy: FinishPolicy,
    pub(crate) lines: CommandLines,
    pub(crate) timeout: TimeoutOptions,
    pub(crate) log: bool,
    pub(crate) log_dir: PathBuf,
    pub(crate) debug_agent_stderr: bool,
    pub(crate) allow_uncontained: bool,
    pub(crate) error_log_dir: Option<PathBuf>,
}

impl EngineOptions {
    /// Create options with default parameters.
    ///
    /// By default:
    /// - Commands on one line are separated by `,`.
    /// - A turn ends on a `D_FINISH` line.
    /// - Under the line count policy, one complete line is accepted per turn.
    /// - Timeouts are active, with 1000ms per step unless the agent says otherwise.
    /// - Logging to file and agent stderr mirroring are disabled.
    /// - Local agents need a cgroup when they have a memory limit.
    pub fn new() -> Self {
        Self {
            stream_type: CommandStreamType::Sequential,
            delimiter: ",".to_string(),
            finish_symbol: "D_FINISH".to_string(),
            finish_policy: FinishPolicy::FinishSymbol,
            lines: CommandLines {
                max: 1,
                wait_for_newline: true,
            },
            timeout: TimeoutOptions {
                active: true,
                max: Duration::from_millis(1000),
                callback: None,
            },
            log: false,
            log_dir: PathBuf::from("."),
            debug_agent_stderr: false,
            allow_uncontained: false,
            error_log_dir: None,
        }
    }

    /// Create options from environment variables (see module documentation).
    ///
    /// Unset or unparsable variables keep their default value.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_parsed<T: FromStr>(var: &str) -> Option<T> {
            std::env::var(var).ok()?.parse().ok()
        }

        let defaults = Self::new();
        Self {
            delimiter: std::env::var("ENGINE_COMMAND_DELIMITER").unwrap_or(defaults.delimiter),
            finish_symbol: std::env::var("ENGINE_FINISH_SYMBOL")
                .unwrap_or(defaults.finish_symbol),
            finish_policy: get_env_parsed("ENGINE_FINISH_POLICY")
                .unwrap_or(defaults.finish_policy),
            lines: CommandLines {
                max: get_env_parsed("ENGINE_MAX_LINES").unwrap_or(defaults.lines.max),
                wait_for_newline: get_env_flag(
                    "ENGINE_WAIT_FOR_NEWLINE",
                    defaults.lines.wait_for_newline,
                ),
            },
            timeout: TimeoutOptions {
                active: get_env_flag("ENGINE_TIMEOUT_ACTIVE", defaults.timeout.active),
                max: get_env_parsed("ENGINE_TIMEOUT_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.timeout.max),
                callback: None,
            },
            log: get_env_flag("ENGINE_LOG", defaults.log),
            log_dir: std::env::var("ENGINE_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            debug_agent_stderr: get_env_flag(
                "ENGINE_DEBUG_AGENT_STDERR",
                defaults.debug_agent_stderr,
            ),
            allow_uncontained: get_env_flag("ENGINE_ALLOW_UNCONTAINED", defaults.allow_uncontained),
            ..defaults
        }
    }

    /// Set the delimiter between commands of one line.
    pub fn with_delimiter(mut self, delimiter: &str) -> Self {
        self.delimiter = delimiter.to_string();
        self
    }

    /// Set the line marking the end of a turn.
    pub fn with_finish_symbol(mut self, symbol: &str) -> Self {
        self.finish_symbol = symbol.to_string();
        self
    }

    /// Set the finish policy.
    pub fn with_finish_policy(mut self, policy: FinishPolicy) -> Self {
        self.finish_policy = policy;
        self
    }

    /// Set the maximum number of lines per turn (line count policy). Values below one are
    /// raised to one.
    pub fn with_max_lines(mut self, max: usize) -> Self {
        self.lines.max = max.max(1);
        self
    }

    /// Only count complete lines (line count policy).
    pub fn with_wait_for_newline(mut self, value: bool) -> Self {
        self.lines.wait_for_newline = value;
        self
    }

    /// Enable or disable time budgets.
    pub fn with_timeout_active(mut self, value: bool) -> Self {
        self.timeout.active = value;
        self
    }

    /// Set the default per-step allowance.
    pub fn with_timeout_max(mut self, max: Duration) -> Self {
        self.timeout.max = max;
        self
    }

    /// Register a callback run whenever an agent times out.
    pub fn with_timeout_callback(
        mut self,
        callback: impl Fn(AgentId, &AgentError) + Send + Sync + 'static,
    ) -> Self {
        self.timeout.callback = Some(Arc::new(callback));
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Set the directory the log file is created in.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Enable or disable agent stderr output in the logs (debug purposes only).
    pub fn with_debug_agent_stderr(mut self, value: bool) -> Self {
        self.debug_agent_stderr = value;
        self
    }

    /// Allow local agents to run without cgroup containment.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Store each agent's stderr in `<dir>/agent_<id>.log`.
    pub fn with_error_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.error_log_dir = Some(dir.into());
        self
    }

    /// How commands are streamed.
    pub fn stream_type(&self) -> CommandStreamType {
        self.stream_type
    }

    /// Delimiter between commands of one line.
    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Line marking the end of a turn.
    pub fn finish_symbol(&self) -> &str {
        &self.finish_symbol
    }

    /// How the end of a turn is detected.
    pub fn finish_policy(&self) -> FinishPolicy {
        self.finish_policy
    }

    /// Line count policy options.
    pub fn lines(&self) -> CommandLines {
        self.lines
    }

    /// Timeout options.
    pub fn timeout(&self) -> &TimeoutOptions {
        &self.timeout
    }

    /// Directory the log file is created in.
    pub fn log_dir(&self) -> &std::path::Path {
        &self.log_dir
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}
