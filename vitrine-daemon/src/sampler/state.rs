use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vitrine_core::models::{Category, HistoryWindow, ProcessSample, Snapshot, TaskId, TotalSample};

use super::probe::{ProcStats, ProcessProbe};

/// One minute at the 1 Hz sampling period.
pub const HISTORY_CAPACITY: usize = 60;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Ticks spent looking for a wrapped task's engine before settling for the
/// wrapper itself.
const RESOLVE_ATTEMPTS: u32 = 10;

/// Fixed-capacity CPU/memory window; the oldest sample is evicted on overflow.
#[derive(Debug, Clone)]
pub struct RollingHistory {
    cpu: VecDeque<f32>,
    memory_mb: VecDeque<f64>,
    capacity: usize,
}

impl RollingHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            cpu: VecDeque::with_capacity(capacity),
            memory_mb: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, cpu: f32, memory_mb: f64) {
        if self.cpu.len() == self.capacity {
            self.cpu.pop_front();
        }
        if self.memory_mb.len() == self.capacity {
            self.memory_mb.pop_front();
        }
        self.cpu.push_back(cpu);
        self.memory_mb.push_back(memory_mb);
    }

    pub fn len(&self) -> usize {
        self.cpu.len()
    }

    pub fn window(&self) -> HistoryWindow {
        HistoryWindow {
            cpu: self.cpu.iter().copied().collect(),
            memory_mb: self.memory_mb.iter().copied().collect(),
        }
    }
}

impl Default for RollingHistory {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

/// Peak readings for a finished screenshot task.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskSummary {
    pub peak_cpu: f32,
    pub peak_memory_mb: f64,
    pub samples: usize,
}

#[derive(Debug)]
pub enum DeliveryError {
    /// The consumer is gone; the subscriber is dropped.
    Closed,
    /// This tick was not delivered; the subscriber stays registered.
    Failed(String),
}

/// Receives every snapshot. Runs on the sampling task, so it must not block.
pub trait Subscriber: Send {
    fn deliver(&mut self, snapshot: &Snapshot) -> Result<(), DeliveryError>;
}

impl<F> Subscriber for F
where
    F: FnMut(&Snapshot) -> Result<(), DeliveryError> + Send,
{
    fn deliver(&mut self, snapshot: &Snapshot) -> Result<(), DeliveryError> {
        self(snapshot)
    }
}

/// Hands snapshots to a consumer on another task without waiting for it.
pub struct ChannelSubscriber(pub mpsc::Sender<Snapshot>);

impl Subscriber for ChannelSubscriber {
    fn deliver(&mut self, snapshot: &Snapshot) -> Result<(), DeliveryError> {
        match self.0.try_send(snapshot.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(DeliveryError::Failed("consumer is lagging".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }
}

struct Tracked {
    pid: u32,
    history: RollingHistory,
    peak_cpu: f32,
    peak_memory_mb: f64,
    samples: usize,
    /// Engine name still being looked for under `pid`.
    resolve: Option<String>,
    resolve_attempts: u32,
}

impl Tracked {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            history: RollingHistory::default(),
            peak_cpu: 0.0,
            peak_memory_mb: 0.0,
            samples: 0,
            resolve: None,
            resolve_attempts: 0,
        }
    }

    fn record(&mut self, stats: &ProcStats) -> f64 {
        let memory_mb = stats.memory_bytes as f64 / BYTES_PER_MB;
        self.history.push(stats.cpu_percent, memory_mb);
        self.peak_cpu = self.peak_cpu.max(stats.cpu_percent);
        self.peak_memory_mb = self.peak_memory_mb.max(memory_mb);
        self.samples += 1;
        memory_mb
    }

    fn sample(&self, stats: ProcStats, memory_mb: f64) -> ProcessSample {
        ProcessSample {
            pid: self.pid,
            name: stats.name,
            status: stats.status,
            cpu_percent: stats.cpu_percent,
            memory_mb,
            threads: stats.threads,
            thread_names: Vec::new(),
            history: self.history.window(),
        }
    }

    fn summary(&self) -> TaskSummary {
        TaskSummary {
            peak_cpu: self.peak_cpu,
            peak_memory_mb: self.peak_memory_mb,
            samples: self.samples,
        }
    }
}

/// Everything the sampling task owns. Only that task touches it.
pub struct SamplerState {
    probe: Box<dyn ProcessProbe>,
    categories: BTreeMap<Category, Tracked>,
    tasks: BTreeMap<TaskId, Tracked>,
    /// Peaks of tasks dropped by `untrack_all`, kept for `finish_task`.
    retired: BTreeMap<TaskId, TaskSummary>,
    total: RollingHistory,
    subscribers: Vec<(String, Box<dyn Subscriber>)>,
    latest: Option<Snapshot>,
}

impl SamplerState {
    pub fn new(probe: Box<dyn ProcessProbe>) -> Self {
        Self {
            probe,
            categories: BTreeMap::new(),
            tasks: BTreeMap::new(),
            retired: BTreeMap::new(),
            total: RollingHistory::default(),
            subscribers: Vec::new(),
            latest: None,
        }
    }

    /// Start sampling `pid` under `category`, replacing any previous entry.
    /// With `resolve`, the first process of that name in `pid`'s tree is
    /// tracked instead, falling back to `pid` itself.
    ///
    /// Registering the same plain pid again keeps the existing history.
    pub fn track(&mut self, category: Category, pid: u32, resolve: Option<&str>) -> u32 {
        if resolve.is_none() && self.categories.get(&category).map(|t| t.pid) == Some(pid) {
            return pid;
        }
        let pid = match resolve {
            Some(name) => match self.probe.find_descendant(pid, name) {
                Some(found) => {
                    if found != pid {
                        debug!(launcher = pid, engine = found, "resolved engine process");
                    }
                    found
                }
                None => {
                    debug!(pid, name, "no matching descendant, tracking launcher");
                    pid
                }
            },
            None => pid,
        };
        self.probe.refresh(&[pid]);
        self.categories.insert(category, Tracked::new(pid));
        info!(%category, pid, "monitoring started");
        pid
    }

    /// Start sampling a one-shot task. With `resolve`, `pid` may be a wrapper
    /// that forks the named engine later; the lookup is retried on each tick
    /// and falls back to `pid` after a few attempts.
    pub fn track_task(&mut self, id: TaskId, pid: u32, resolve: Option<&str>) {
        let mut tracked = Tracked::new(pid);
        tracked.resolve = resolve.map(str::to_string);
        self.probe.refresh(&[pid]);
        self.tasks.insert(id, tracked);
        debug!(task = %id, pid, "monitoring task");
        self.resolve_tasks();
    }

    fn resolve_tasks(&mut self) {
        for (id, tracked) in self.tasks.iter_mut() {
            let Some(name) = tracked.resolve.as_deref() else {
                continue;
            };
            match self.probe.find_descendant(tracked.pid, name) {
                Some(found) => {
                    if found != tracked.pid {
                        debug!(task = %id, wrapper = tracked.pid, engine = found, "resolved task engine");
                        tracked.pid = found;
                        self.probe.refresh(&[found]);
                    }
                    tracked.resolve = None;
                }
                None => {
                    tracked.resolve_attempts += 1;
                    if tracked.resolve_attempts >= RESOLVE_ATTEMPTS {
                        debug!(task = %id, pid = tracked.pid, name, "engine never appeared, sampling wrapper");
                        tracked.resolve = None;
                    }
                }
            }
        }
    }

    /// Drop every entry except the frontend, which is permanent. Task peaks
    /// stay collectable.
    pub fn untrack_all(&mut self) {
        let before = self.categories.len();
        self.categories.retain(|category, _| *category == Category::Frontend);
        for (id, tracked) in std::mem::take(&mut self.tasks) {
            self.retired.insert(id, tracked.summary());
        }
        if self.categories.len() != before {
            info!("monitoring stopped for all but frontend");
        }
    }

    /// Take a final reading and stop tracking the task.
    pub fn finish_task(&mut self, id: TaskId) -> Option<TaskSummary> {
        if let Some(summary) = self.retired.remove(&id) {
            return Some(summary);
        }
        let mut tracked = self.tasks.remove(&id)?;
        self.probe.refresh(&[tracked.pid]);
        if let Some(stats) = self.probe.stats(tracked.pid) {
            tracked.record(&stats);
        }
        Some(tracked.summary())
    }

    pub fn subscribe(&mut self, name: impl Into<String>, subscriber: Box<dyn Subscriber>) {
        let name = name.into();
        debug!(subscriber = %name, "subscriber added");
        self.subscribers.push((name, subscriber));
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.latest.as_ref()
    }

    pub fn is_tracking(&self, category: Category) -> bool {
        self.categories.contains_key(&category)
    }

    pub fn history_len(&self, category: Category) -> Option<usize> {
        self.categories.get(&category).map(|t| t.history.len())
    }

    /// One sampling pass: read every tracked process, update histories and
    /// the synthetic total, drop vanished processes, notify subscribers.
    pub fn tick(&mut self) -> Snapshot {
        self.resolve_tasks();
        let pids: Vec<u32> = self
            .categories
            .values()
            .chain(self.tasks.values())
            .map(|t| t.pid)
            .collect();
        self.probe.refresh(&pids);

        let mut snapshot = Snapshot {
            timestamp: chrono::Local::now().to_rfc3339(),
            ..Default::default()
        };
        let mut total = TotalSample::default();

        let mut vanished = Vec::new();
        for (category, tracked) in self.categories.iter_mut() {
            match self.probe.stats(tracked.pid) {
                Some(stats) => {
                    let memory_mb = tracked.record(&stats);
                    total.cpu_percent += stats.cpu_percent;
                    total.memory_mb += memory_mb;
                    total.threads += stats.threads;
                    snapshot
                        .categories
                        .insert(*category, tracked.sample(stats, memory_mb));
                }
                None => vanished.push(*category),
            }
        }
        for category in vanished {
            if category == Category::Frontend {
                warn!("frontend process not readable this tick");
                continue;
            }
            if let Some(tracked) = self.categories.remove(&category) {
                info!(%category, pid = tracked.pid, "tracked process exited");
            }
        }

        let mut finished = Vec::new();
        for (id, tracked) in self.tasks.iter_mut() {
            match self.probe.stats(tracked.pid) {
                Some(stats) => {
                    let memory_mb = tracked.record(&stats);
                    total.cpu_percent += stats.cpu_percent;
                    total.memory_mb += memory_mb;
                    total.threads += stats.threads;
                    snapshot.tasks.insert(*id, tracked.sample(stats, memory_mb));
                }
                None => finished.push(*id),
            }
        }
        // a task that exited keeps its entry until `finish_task` collects the peaks
        for id in finished {
            debug!(task = %id, "task process no longer readable");
        }

        self.total.push(total.cpu_percent, total.memory_mb);
        total.history = self.total.window();
        snapshot.total = total;

        for (category, sample) in snapshot.categories.iter_mut() {
            sample.thread_names = self.probe.thread_names(sample.pid);
            if sample.thread_names.is_empty() {
                debug!(%category, "no thread names available");
            }
        }

        self.notify(&snapshot);
        self.latest = Some(snapshot.clone());
        snapshot
    }

    fn notify(&mut self, snapshot: &Snapshot) {
        self.subscribers.retain_mut(|(name, subscriber)| {
            match catch_unwind(AssertUnwindSafe(|| subscriber.deliver(snapshot))) {
                Ok(Ok(())) => true,
                Ok(Err(DeliveryError::Closed)) => {
                    debug!(subscriber = %name, "subscriber closed");
                    false
                }
                Ok(Err(DeliveryError::Failed(e))) => {
                    warn!(subscriber = %name, "snapshot delivery failed: {e}");
                    true
                }
                Err(_) => {
                    warn!(subscriber = %name, "subscriber panicked during delivery");
                    true
                }
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Scripted process table.
    #[derive(Clone, Default)]
    pub(crate) struct FakeProbe {
        pub procs: Arc<Mutex<HashMap<u32, ProcStats>>>,
        pub children: Arc<Mutex<HashMap<u32, Vec<u32>>>>,
        pub refreshed: Arc<Mutex<Vec<Vec<u32>>>>,
    }

    impl FakeProbe {
        pub(crate) fn add(&self, pid: u32, name: &str, cpu: f32, memory_mb: u64) {
            self.procs.lock().unwrap().insert(
                pid,
                ProcStats {
                    name: name.into(),
                    status: "Sleeping".into(),
                    cpu_percent: cpu,
                    memory_bytes: memory_mb * 1024 * 1024,
                    threads: 4,
                },
            );
        }

        pub(crate) fn remove(&self, pid: u32) {
            self.procs.lock().unwrap().remove(&pid);
        }
    }

    impl ProcessProbe for FakeProbe {
        fn refresh(&mut self, pids: &[u32]) {
            self.refreshed.lock().unwrap().push(pids.to_vec());
        }

        fn stats(&self, pid: u32) -> Option<ProcStats> {
            self.procs.lock().unwrap().get(&pid).cloned()
        }

        fn find_descendant(&mut self, root: u32, name: &str) -> Option<u32> {
            let procs = self.procs.lock().unwrap();
            let children = self.children.lock().unwrap();
            let mut queue = VecDeque::from([root]);
            let mut seen = HashSet::new();
            while let Some(pid) = queue.pop_front() {
                if !seen.insert(pid) {
                    continue;
                }
                if procs.get(&pid).map(|p| p.name == name).unwrap_or(false) {
                    return Some(pid);
                }
                queue.extend(children.get(&pid).into_iter().flatten().copied());
            }
            None
        }

        fn thread_names(&self, _pid: u32) -> Vec<String> {
            vec!["main".into()]
        }
    }

    fn state_with(probe: &FakeProbe) -> SamplerState {
        SamplerState::new(Box::new(probe.clone()))
    }

    #[test]
    fn test_rolling_history_bound() {
        let mut history = RollingHistory::new(3);
        for i in 0..5 {
            history.push(i as f32, i as f64);
        }
        let window = history.window();
        assert_eq!(window.cpu, vec![2.0, 3.0, 4.0]);
        assert_eq!(window.memory_mb, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_history_capped_after_many_ticks() {
        let probe = FakeProbe::default();
        probe.add(1, "vitrine-daemon", 1.0, 50);
        let mut state = state_with(&probe);
        state.track(Category::Frontend, 1, None);

        for _ in 0..61 {
            state.tick();
        }
        let snapshot = state.tick();
        let frontend = &snapshot.categories[&Category::Frontend];
        assert_eq!(frontend.history.cpu.len(), HISTORY_CAPACITY);
        assert_eq!(frontend.history.memory_mb.len(), HISTORY_CAPACITY);
        assert_eq!(snapshot.total.history.cpu.len(), HISTORY_CAPACITY);
        assert_eq!(state.history_len(Category::Frontend), Some(HISTORY_CAPACITY));
    }

    #[test]
    fn test_total_accumulates() {
        let probe = FakeProbe::default();
        probe.add(1, "vitrine-daemon", 2.0, 100);
        probe.add(2, "linux-wallpaperengine", 30.0, 400);
        let mut state = state_with(&probe);
        state.track(Category::Frontend, 1, None);
        state.track(Category::Backend, 2, None);

        let snapshot = state.tick();
        assert_eq!(snapshot.categories.len(), 2);
        assert!((snapshot.total.cpu_percent - 32.0).abs() < f32::EPSILON);
        assert!((snapshot.total.memory_mb - 500.0).abs() < 1e-9);
        assert_eq!(snapshot.total.threads, 8);
        assert_eq!(snapshot.categories[&Category::Backend].thread_names, vec!["main"]);
    }

    #[test]
    fn test_vanished_process_dropped_but_frontend_kept() {
        let probe = FakeProbe::default();
        probe.add(1, "vitrine-daemon", 1.0, 50);
        probe.add(2, "linux-wallpaperengine", 10.0, 300);
        let mut state = state_with(&probe);
        state.track(Category::Frontend, 1, None);
        state.track(Category::Backend, 2, None);
        state.tick();

        probe.remove(1);
        probe.remove(2);
        let snapshot = state.tick();

        assert!(snapshot.categories.is_empty());
        assert!(state.is_tracking(Category::Frontend));
        assert!(!state.is_tracking(Category::Backend));

        // frontend resumes contributing once readable again
        probe.add(1, "vitrine-daemon", 1.0, 50);
        let snapshot = state.tick();
        assert!(snapshot.categories.contains_key(&Category::Frontend));
    }

    #[test]
    fn test_frontend_cannot_be_untracked() {
        let probe = FakeProbe::default();
        probe.add(1, "vitrine-daemon", 1.0, 50);
        let mut state = state_with(&probe);
        state.track(Category::Frontend, 1, None);
        state.untrack_all();
        state.untrack_all();
        assert!(state.is_tracking(Category::Frontend));
    }

    #[test]
    fn test_backend_resolves_engine_descendant() {
        let probe = FakeProbe::default();
        probe.add(10, "xvfb-run", 0.0, 5);
        probe.add(11, "Xvfb", 0.0, 20);
        probe.add(12, "linux-wallpaperengine", 40.0, 500);
        probe.children.lock().unwrap().insert(10, vec![11, 12]);
        let mut state = state_with(&probe);

        assert_eq!(state.track(Category::Backend, 10, Some("linux-wallpaperengine")), 12);
        // fallback to the launcher when nothing matches
        assert_eq!(state.track(Category::Backend, 10, Some("other-engine")), 10);

        // each track call takes a baseline reading of the chosen pid
        let refreshed = probe.refreshed.lock().unwrap();
        assert_eq!(refreshed.last(), Some(&vec![10]));
    }

    #[test]
    fn test_task_peaks_survive_exit() {
        let probe = FakeProbe::default();
        probe.add(1, "vitrine-daemon", 1.0, 50);
        probe.add(20, "linux-wallpaperengine", 90.0, 700);
        let mut state = state_with(&probe);
        state.track(Category::Frontend, 1, None);
        state.track_task(TaskId(1), 20, None);

        let snapshot = state.tick();
        assert!(snapshot.tasks.contains_key(&TaskId(1)));

        probe.add(20, "linux-wallpaperengine", 50.0, 300);
        state.tick();
        probe.remove(20);
        state.tick();

        let summary = state.finish_task(TaskId(1)).unwrap();
        assert!((summary.peak_cpu - 90.0).abs() < f32::EPSILON);
        assert!((summary.peak_memory_mb - 700.0).abs() < 1e-9);
        assert_eq!(summary.samples, 2);
        assert!(state.finish_task(TaskId(1)).is_none());
    }

    #[test]
    fn test_failing_subscriber_does_not_block_others() {
        let probe = FakeProbe::default();
        probe.add(1, "vitrine-daemon", 1.0, 50);
        let mut state = state_with(&probe);
        state.track(Category::Frontend, 1, None);

        let delivered = Arc::new(Mutex::new(0usize));
        let counter = delivered.clone();
        state.subscribe(
            "panics",
            Box::new(|_: &Snapshot| -> Result<(), DeliveryError> { panic!("bad subscriber") }),
        );
        state.subscribe(
            "fails",
            Box::new(|_: &Snapshot| Err(DeliveryError::Failed("nope".into()))),
        );
        state.subscribe(
            "counts",
            Box::new(move |_: &Snapshot| {
                *counter.lock().unwrap() += 1;
                Ok(())
            }),
        );

        state.tick();
        state.tick();
        assert_eq!(*delivered.lock().unwrap(), 2);
        assert_eq!(state.subscribers.len(), 3);
    }

    #[test]
    fn test_wrapped_task_follows_late_engine() {
        let probe = FakeProbe::default();
        probe.add(30, "xvfb-run", 0.0, 2);
        let mut state = state_with(&probe);
        state.track_task(TaskId(4), 30, Some("linux-wallpaperengine"));

        // the wrapper has not forked the engine yet
        let snapshot = state.tick();
        assert_eq!(snapshot.tasks[&TaskId(4)].pid, 30);

        probe.add(31, "Xvfb", 5.0, 40);
        probe.add(32, "linux-wallpaperengine", 85.0, 900);
        probe.children.lock().unwrap().insert(30, vec![31, 32]);
        let snapshot = state.tick();
        assert_eq!(snapshot.tasks[&TaskId(4)].pid, 32);

        let summary = state.finish_task(TaskId(4)).unwrap();
        assert!((summary.peak_cpu - 85.0).abs() < f32::EPSILON);
        assert!((summary.peak_memory_mb - 900.0).abs() < 1e-9);
    }

    #[test]
    fn test_wrapped_task_falls_back_to_wrapper() {
        let probe = FakeProbe::default();
        probe.add(40, "xvfb-run", 3.0, 10);
        let mut state = state_with(&probe);
        state.track_task(TaskId(5), 40, Some("linux-wallpaperengine"));

        for _ in 0..RESOLVE_ATTEMPTS + 2 {
            state.tick();
        }
        // a late engine is no longer picked up once the lookup gave up
        probe.add(41, "linux-wallpaperengine", 90.0, 500);
        probe.children.lock().unwrap().insert(40, vec![41]);
        let snapshot = state.tick();
        assert_eq!(snapshot.tasks[&TaskId(5)].pid, 40);
    }

    #[test]
    fn test_untrack_all_keeps_frontend_and_task_peaks() {
        let probe = FakeProbe::default();
        probe.add(1, "vitrine-daemon", 1.0, 50);
        probe.add(2, "vitrine-tray", 0.5, 20);
        probe.add(3, "linux-wallpaperengine", 30.0, 400);
        probe.add(9, "linux-wallpaperengine", 60.0, 300);
        let mut state = state_with(&probe);
        state.track(Category::Frontend, 1, None);
        state.track(Category::Tray, 2, None);
        state.track(Category::Backend, 3, None);
        state.track_task(TaskId(9), 9, None);
        state.tick();

        state.untrack_all();
        let snapshot = state.tick();
        assert_eq!(snapshot.categories.keys().collect::<Vec<_>>(), vec![&Category::Frontend]);
        assert!(snapshot.tasks.is_empty());

        let summary = state.finish_task(TaskId(9)).unwrap();
        assert!((summary.peak_cpu - 60.0).abs() < f32::EPSILON);
        assert!(state.finish_task(TaskId(9)).is_none());
    }

    #[test]
    fn test_retracking_same_pid_keeps_history() {
        let probe = FakeProbe::default();
        probe.add(2, "vitrine-tray", 0.5, 20);
        let mut state = state_with(&probe);
        state.track(Category::Tray, 2, None);
        state.tick();
        state.tick();

        state.track(Category::Tray, 2, None);
        assert_eq!(state.history_len(Category::Tray), Some(2));

        probe.add(3, "vitrine-tray", 0.5, 20);
        state.track(Category::Tray, 3, None);
        assert_eq!(state.history_len(Category::Tray), Some(0));
    }

    #[test]
    fn test_closed_channel_subscriber_removed() {
        let probe = FakeProbe::default();
        probe.add(1, "vitrine-daemon", 1.0, 50);
        let mut state = state_with(&probe);
        state.track(Category::Frontend, 1, None);

        let (tx, mut rx) = mpsc::channel(4);
        state.subscribe("watch", Box::new(ChannelSubscriber(tx)));

        state.tick();
        assert!(rx.try_recv().is_ok());

        drop(rx);
        state.tick();
        assert!(state.subscribers.is_empty());
        assert!(state.latest().is_some());
    }
}
