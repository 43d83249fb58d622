//! Process-table lookups shared by the supervisor and the sampler.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use sysinfo::{Pid, Process, Signal, System};
use tracing::debug;

/// Linux truncates `comm` to 15 bytes.
const COMM_LEN: usize = 15;

/// Parent links followed before giving up, in case of pid reuse loops.
const MAX_ANCESTRY: usize = 64;

/// Whether `process` is an instance of the executable called `name`.
///
/// Checks the reported name (allowing for `comm` truncation), the executable
/// path, and `argv[0]`, since launchers and scripts report differently.
pub fn matches_name(process: &Process, name: &str) -> bool {
    let reported = process.name();
    if reported == name || (reported.len() == COMM_LEN && name.starts_with(reported)) {
        return true;
    }
    let basename = |p: &Path| p.file_name().map(|n| n == name).unwrap_or(false);
    if process.exe().map(basename).unwrap_or(false) {
        return true;
    }
    process
        .cmd()
        .first()
        .map(|argv0| basename(Path::new(argv0)))
        .unwrap_or(false)
}

/// Breadth-first search of `root` and its descendants for the first process
/// named `name`. Heuristic: a launcher may fork several children, and the
/// first match in BFS order wins.
pub fn find_descendant(sys: &System, root: u32, name: &str) -> Option<u32> {
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }
    for list in children.values_mut() {
        list.sort();
    }

    let mut queue = VecDeque::from([Pid::from_u32(root)]);
    while let Some(pid) = queue.pop_front() {
        if let Some(process) = sys.process(pid) {
            if matches_name(process, name) {
                return Some(pid.as_u32());
            }
        }
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }
    None
}

/// Whether `pid` is one of `roots` or runs somewhere below one of them.
fn descends_from(sys: &System, pid: Pid, roots: &[u32]) -> bool {
    let mut current = Some(pid);
    for _ in 0..MAX_ANCESTRY {
        let Some(pid) = current else {
            return false;
        };
        if roots.contains(&pid.as_u32()) {
            return true;
        }
        current = sys.process(pid).and_then(Process::parent);
    }
    false
}

/// Send SIGKILL to every process named `name`, except the trees rooted at
/// `spare`. Returns how many were signalled.
pub fn kill_by_name(name: &str, spare: &[u32]) -> usize {
    let mut sys = System::new();
    sys.refresh_processes();
    let own = std::process::id();

    let mut killed = 0;
    for (pid, process) in sys.processes() {
        let raw = pid.as_u32();
        if raw == own || !matches_name(process, name) || descends_from(&sys, *pid, spare) {
            continue;
        }
        if process.kill_with(Signal::Kill).unwrap_or(false) {
            debug!(pid = raw, name, "killed stray process");
            killed += 1;
        }
    }
    killed
}

/// Thread count from `/proc/<pid>/task`. `None` off Linux or if the process
/// is gone.
pub fn thread_count(pid: u32) -> Option<usize> {
    std::fs::read_dir(format!("/proc/{pid}/task"))
        .ok()
        .map(|entries| entries.flatten().count())
}

/// Thread names from `/proc/<pid>/task/*/comm`, sorted. Best-effort.
pub fn thread_names(pid: u32) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(format!("/proc/{pid}/task")) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("comm")).ok())
        .map(|comm| comm.trim().to_string())
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_threads_visible() {
        let pid = std::process::id();
        assert!(thread_count(pid).unwrap_or(0) >= 1);
        assert!(!thread_names(pid).is_empty());
    }

    #[test]
    fn test_missing_process() {
        // pid_max on Linux is at most 2^22
        let pid = 1 << 23;
        assert_eq!(thread_count(pid), None);
        assert!(thread_names(pid).is_empty());
    }

    #[test]
    fn test_find_descendant_of_spawned_child() {
        // `; true` keeps sh from exec-ing sleep in place
        let mut child = std::process::Command::new("sh")
            .args(["-c", "sleep 5; true"])
            .spawn()
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(300));

        let mut sys = System::new();
        sys.refresh_processes();
        let found = find_descendant(&sys, child.id(), "sleep").unwrap();
        assert_ne!(found, child.id());
        assert_eq!(find_descendant(&sys, child.id(), "sh"), Some(child.id()));
        assert_eq!(find_descendant(&sys, child.id(), "no-such-binary"), None);

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_kill_by_name_spares_subtree() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("vt-spare.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\ntrue\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut sheltered = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("{}; true", script.display()))
            .spawn()
            .unwrap();
        let mut exposed = std::process::Command::new(&script).spawn().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(300));

        assert_eq!(kill_by_name("vt-spare.sh", &[sheltered.id()]), 1);
        assert!(!exposed.wait().unwrap().success());
        assert!(sheltered.try_wait().unwrap().is_none());

        assert_eq!(kill_by_name("vt-spare.sh", &[]), 1);
        sheltered.wait().unwrap();
    }
}
