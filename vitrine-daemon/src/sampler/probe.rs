use std::collections::HashSet;

use sysinfo::{Pid, System};

use crate::procs;

/// Raw reading for one process on one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcStats {
    pub name: String,
    pub status: String,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub threads: usize,
}

/// Read access to the OS process table. Refreshes are explicit so one tick
/// reads a consistent view.
pub trait ProcessProbe: Send {
    /// Re-read `pids`. CPU usage is measured between consecutive refreshes, so
    /// the first refresh of a pid only establishes a baseline.
    fn refresh(&mut self, pids: &[u32]);

    /// Stats from the last refresh; `None` if the process is gone.
    fn stats(&self, pid: u32) -> Option<ProcStats>;

    /// First process named `name` among `root` and its descendants.
    fn find_descendant(&mut self, root: u32, name: &str) -> Option<u32>;

    fn thread_names(&self, pid: u32) -> Vec<String>;
}

pub struct SysinfoProbe {
    sys: System,
    alive: HashSet<u32>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            alive: HashSet::new(),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SysinfoProbe {
    fn refresh(&mut self, pids: &[u32]) {
        self.sys.refresh_cpu_usage();
        self.alive.clear();
        for &pid in pids {
            if self.sys.refresh_process(Pid::from_u32(pid)) {
                self.alive.insert(pid);
            }
        }
    }

    fn stats(&self, pid: u32) -> Option<ProcStats> {
        if !self.alive.contains(&pid) {
            return None;
        }
        let process = self.sys.process(Pid::from_u32(pid))?;
        Some(ProcStats {
            name: process.name().to_string(),
            status: process.status().to_string(),
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
            threads: procs::thread_count(pid).unwrap_or(1),
        })
    }

    fn find_descendant(&mut self, root: u32, name: &str) -> Option<u32> {
        self.sys.refresh_processes();
        procs::find_descendant(&self.sys, root, name)
    }

    fn thread_names(&self, pid: u32) -> Vec<String> {
        procs::thread_names(pid)
    }
}
