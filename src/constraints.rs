//! Defines per-agent resource and time constraints.
//!
//! The main entry point is [`ProcessOptionsBuilder`], which configures:
//!
//! - **Timing**:
//!   * Per-step allowance, the time an agent may take for one turn
//!   * Overage, a pool of extra time drawn from whenever a turn overruns its allowance.
//!     It is never replenished during a match.
//! - **Memory**: a hard ceiling, enforced with a cgroup (Linux), a polling watcher, or the
//!   container runtime depending on the backend
//!
//! Container agents additionally need [`ContainerOptions`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use match_runtime::constraints::ProcessOptionsBuilder;
//!
//! let options = ProcessOptionsBuilder::new()
//!     .with_per_step(Duration::from_millis(500))
//!     .with_overage(Duration::from_secs(10))
//!     .with_memory_limit(512)
//!     .build()
//!     .unwrap();
//! ```

use std::{env, path::PathBuf, time::Duration};

use anyhow::bail;

/// A builder for [`ProcessOptions`].
///
/// By default there is no memory ceiling, the per-step allowance is left to the engine's
/// `timeout.max` and the overage is 60 seconds.
#[derive(Debug, Default, Clone)]
pub struct ProcessOptionsBuilder {
    per_step: Option<Duration>,
    overage: Option<Duration>,
    memory_mb: Option<u64>,
}

impl ProcessOptionsBuilder {
    /// Creates a builder with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `PER_STEP_MS` (u64): per-step allowance in milliseconds
    /// - `OVERAGE_MS` (u64): overage pool in milliseconds
    /// - `MEMORY_LIMIT_MB` (u64): memory ceiling in MB
    #[must_use]
    pub fn from_env() -> Self {
        fn parse_u64(var: &str) -> Option<u64> {
            env::var(var).ok()?.parse().ok()
        }

        ProcessOptionsBuilder {
            per_step: parse_u64("PER_STEP_MS").map(Duration::from_millis),
            overage: parse_u64("OVERAGE_MS").map(Duration::from_millis),
            memory_mb: parse_u64("MEMORY_LIMIT_MB"),
        }
    }

    /// Sets the time allotted to a single turn.
    #[must_use]
    pub fn with_per_step(self, duration: Duration) -> Self {
        Self {
            per_step: Some(duration),
            ..self
        }
    }

    /// Sets the pool of extra time an agent may borrow across the whole match.
    #[must_use]
    pub fn with_overage(self, duration: Duration) -> Self {
        Self {
            overage: Some(duration),
            ..self
        }
    }

    /// Sets the memory ceiling (in MB).
    #[must_use]
    pub fn with_memory_limit(self, megabytes: u64) -> Self {
        Self {
            memory_mb: Some(megabytes),
            ..self
        }
    }

    /// Consumes the builder and returns the constructed [`ProcessOptions`].
    ///
    /// # Errors
    ///
    /// Returns an error when the memory ceiling is zero or larger than the memory available on
    /// this machine.
    pub fn build(self) -> anyhow::Result<ProcessOptions> {
        let memory_limit = match self.memory_mb {
            None => None,
            Some(0) => bail!("memory limit must be positive"),
            Some(mb) => {
                let Some(bytes) = mb.checked_mul(1_000_000) else {
                    bail!("memory limit ({mb}MB) is too large");
                };
                let mut sys = sysinfo::System::new();
                sys.refresh_memory();
                //REVIEW: sys.available_memory() ?
                let total = sys.total_memory();
                if total > 0 && bytes > total {
                    bail!(
                        "memory limit ({mb}MB) is greater than total RAM ({}MB)",
                        total / 1_000_000
                    );
                }
                Some(bytes)
            }
        };

        Ok(ProcessOptions {
            per_step: self.per_step,
            overage: self.overage.unwrap_or(DEFAULT_OVERAGE),
            memory_limit,
        })
    }
}

const DEFAULT_OVERAGE: Duration = Duration::from_secs(60);

/// Obtained using [`ProcessOptionsBuilder`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessOptions {
    pub(crate) per_step: Option<Duration>,
    pub(crate) overage: Duration,
    pub(crate) memory_limit: Option<u64>,
}

impl ProcessOptions {
    /// create a ProcessOptionsBuilder
    pub fn builder() -> ProcessOptionsBuilder {
        ProcessOptionsBuilder::new()
    }

    /// Memory ceiling in bytes.
    pub fn memory_limit(&self) -> Option<u64> {
        self.memory_limit
    }

    pub(crate) fn per_step_or(&self, fallback: Duration) -> Duration {
        self.per_step.unwrap_or(fallback)
    }
}

impl Default for ProcessOptions {
    fn default() -> Self {
        ProcessOptions {
            per_step: None,
            overage: DEFAULT_OVERAGE,
            memory_limit: None,
        }
    }
}

/// Where and how container agents run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerOptions {
    /// Base image every agent container is created from.
    pub image: String,
    /// Container name. A unique suffix is appended per agent.
    pub name: String,
    /// Unix socket of the container runtime, handed to the `docker` client as `DOCKER_HOST`.
    pub socket_path: PathBuf,
    /// Seccomp profile (JSON file) applied to the container. `None` keeps the runtime default.
    pub seccomp_profile: Option<PathBuf>,
    /// Maximum number of processes inside the container.
    pub pids_limit: i64,
}

impl ContainerOptions {
    /// Options with the default image and socket, reading `DOCKER_IMAGE` and `DOCKER_SOCKET`
    /// when set.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            image: env::var("DOCKER_IMAGE").unwrap_or(defaults.image),
            socket_path: env::var("DOCKER_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(defaults.socket_path),
            ..defaults
        }
    }

    /// Sets the base image.
    pub fn with_image(self, image: &str) -> Self {
        Self {
            image: image.to_string(),
            ..self
        }
    }

    /// Sets the container name prefix.
    pub fn with_name(self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self
        }
    }

    /// Sets the socket the container runtime listens on.
    pub fn with_socket_path(self, path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: path.into(),
            ..self
        }
    }

    /// Applies a seccomp profile to every container.
    pub fn with_seccomp_profile(self, path: impl Into<PathBuf>) -> Self {
        Self {
            seccomp_profile: Some(path.into()),
            ..self
        }
    }
}

impl Default for ContainerOptions {
    fn default() -> Self {
        ContainerOptions {
            image: "ubuntu:22.04".to_string(),
            name: "match_agent".to_string(),
            socket_path: PathBuf::from("/var/run/docker.sock"),
            seccomp_profile: None,
            pids_limit: 100,
        }
    }
}
