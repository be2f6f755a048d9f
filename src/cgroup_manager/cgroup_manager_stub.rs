use std::time::Duration;

use anyhow::bail;

#[derive(Debug)]
pub struct MemoryCgroup {
    _private: (),
}

impl MemoryCgroup {
    pub fn attach(_pid: u32, _max_memory: u64) -> anyhow::Result<MemoryCgroup> {
        bail!("cgroups only available on linux")
    }

    pub fn oom_killed(&self) -> bool {
        false
    }

    pub fn kill(self, _max_duration: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}
