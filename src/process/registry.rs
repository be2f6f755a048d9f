use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tracing::{debug, error};

use super::Process;

/// Every live process of one match, so that a shutdown can close them all.
///
/// Owned by whatever drives the match and passed to the agents it starts.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: Mutex<HashMap<u64, Arc<dyn Process>>>,
    next: AtomicU64,
}

/// Key of a registered process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryKey(u64);

impl ProcessRegistry {
    /// An empty registry.
    pub fn new() -> ProcessRegistry {
        ProcessRegistry::default()
    }

    /// Register `process` until it is removed or closed by [`ProcessRegistry::close_all`].
    pub fn add(&self, process: Arc<dyn Process>) -> RegistryKey {
        let key = self.next.fetch_add(1, Ordering::Relaxed);
        self.processes
            .lock()
            .expect("poisoned")
            .insert(key, process);
        RegistryKey(key)
    }

    /// Forget a process without closing it.
    pub fn remove(&self, key: RegistryKey) -> Option<Arc<dyn Process>> {
        self.processes.lock().expect("poisoned").remove(&key.0)
    }

    /// Number of registered processes.
    pub fn len(&self) -> usize {
        self.processes.lock().expect("poisoned").len()
    }

    /// True when no process is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget every registered process. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let processes: Vec<_> = self
            .processes
            .lock()
            .expect("poisoned")
            .drain()
            .map(|(_, process)| process)
            .collect();
        for process in &processes {
            if let Err(e) = process.close() {
                error!(process = process.label(), "could not close process: {e}");
            }
        }
        debug!(count = processes.len(), "closed all processes");
        processes.len()
    }
}
