use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use anyhow::{self, Context};
use cgroups_rs::Cgroup;
use tracing::{trace, warn};

use super::MAX_PIDS;

pub fn get_current_user_id() -> anyhow::Result<String> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .output()
        .context("Could not launch 'id -u'")?;
    let stdout = output.stdout;
    let untrimed_id = std::str::from_utf8(&stdout).context("id is not a valid string")?;
    Ok(untrimed_id.trim().to_string())
}

pub fn get_cgroup_path(user_id: &str, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

/// Create a cgroup at `path`.
///
/// * `max_memory` - Maximum available memory in Bytes. Non-positive means no restriction.
/// * `max_pids` - Maximum number of PIDS inside the cgroup at any time. Non-positive means no restriction.
///
/// # Errors
///
/// This function will return an error if the cgroup could not be created. This can happen if the parameters are incorrect or if cgroup is not available.
pub fn create_cgroup(path: &str, max_memory: i64, max_pids: i64) -> anyhow::Result<Cgroup> {
    let mut builder = cgroups_rs::cgroup_builder::CgroupBuilder::new(path);
    if max_memory > 0 {
        builder = builder
            .memory()
            .memory_hard_limit(max_memory)
            .memory_swap_limit(max_memory)
            .done();
    }
    if max_pids > 0 {
        builder = builder
            .pid()
            .maximum_number_of_processes(cgroups_rs::MaxValue::Value(max_pids))
            .done();
    }
    builder
        .build(cgroups_rs::hierarchies::auto())
        .context("could not create cgroup")
}

pub fn wait_for_process_cleanup(
    cgroup: &Cgroup,
    max_duration: Duration,
) -> Result<(), crate::timed::TimeoutError> {
    let deadline = Instant::now() + max_duration;
    while !cgroup.tasks().is_empty() {
        if Instant::now() > deadline {
            return Err(crate::timed::TimeoutError {});
        }

        std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
    }
    Ok(())
}

/// A cgroup holding exactly one agent process and its descendants.
#[derive(Debug)]
pub struct MemoryCgroup {
    cgroup: Cgroup,
}

impl MemoryCgroup {
    /// Create a new cgroup limited to `max_memory` bytes and move `pid` into it.
    ///
    /// The caller still owns the process: if this fails, it is not killed here.
    pub fn attach(pid: u32, max_memory: u64) -> anyhow::Result<MemoryCgroup> {
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        let user_id = get_current_user_id().context("could not get user id")?;
        // a new cgroup name for each agent process
        let group_name = format!(
            "MATCH_RUNTIME_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = get_cgroup_path(&user_id, &group_name);
        let max_memory = i64::try_from(max_memory).unwrap_or(i64::MAX);
        let cgroup = create_cgroup(&path, max_memory, MAX_PIDS)?;

        if let Err(e) = cgroup.add_task_by_tgid(cgroups_rs::CgroupPid { pid: pid as u64 }) {
            let _ = cgroup.delete();
            return Err(e).context("could not add process to cgroup");
        }
        trace!(pid, %path, "process contained");
        Ok(MemoryCgroup { cgroup })
    }

    /// True if the kernel OOM-killed something in this cgroup.
    pub fn oom_killed(&self) -> bool {
        let events = format!("/sys/fs/cgroup/{}/memory.events", self.cgroup.path());
        let Ok(content) = std::fs::read_to_string(events) else {
            return false;
        };
        content.lines().any(|line| {
            let mut fields = line.split_whitespace();
            fields.next() == Some("oom_kill")
                && fields
                    .next()
                    .and_then(|n| n.parse::<u64>().ok())
                    .is_some_and(|n| n > 0)
        })
    }

    /// Kill every process of the cgroup and remove it.
    pub fn kill(self, max_duration: Duration) -> anyhow::Result<()> {
        self.cgroup.kill().context("could not kill cgroup")?;
        wait_for_process_cleanup(&self.cgroup, max_duration)
            .context("process cleanup timed out")?;
        // at this point, the processes are killed. Even so the cgroup cleanup fail, it is
        // 'safe' (probably) to continue
        if let Err(e) = self.cgroup.delete() {
            warn!("Failed to remove cgroup. If this happens a lot, it may slow down the computer. {e}");
        }
        Ok(())
    }
}
