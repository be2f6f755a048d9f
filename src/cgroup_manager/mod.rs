//! Memory containment of local agent processes.
//!
//! On Linux, a [`MemoryCgroup`] places a process in its own cgroup v2 with a hard memory limit
//! and a pid cap, and can kill everything inside it at once. Elsewhere, creating one always
//! fails and callers fall back to watching memory from the outside.

#[cfg(target_os = "linux")]
mod cgroup_manager_linux;

#[cfg(target_os = "linux")]
pub use cgroup_manager_linux::*;

#[cfg(not(target_os = "linux"))]
mod cgroup_manager_stub;

#[cfg(not(target_os = "linux"))]
pub use cgroup_manager_stub::*;

/// Maximum number of processes an agent may have alive at the same time.
pub const MAX_PIDS: i64 = 100;
