//! Background performance sampler.
//!
//! A single task owns the tracked-process registry and rolling histories.
//! Everyone else holds a cloneable [`SamplerHandle`] and talks to it over a
//! command channel, so registry mutation and iteration never race. The task
//! is started lazily by the first registration or subscription.

pub mod probe;
pub mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use vitrine_core::models::{Category, Snapshot, TaskId};

use probe::ProcessProbe;
use state::{SamplerState, Subscriber, TaskSummary};

pub const SAMPLE_PERIOD: Duration = Duration::from_secs(1);

pub enum SamplerCommand {
    Track {
        category: Category,
        pid: u32,
        resolve: Option<String>,
    },
    TrackTask {
        id: TaskId,
        pid: u32,
        resolve: Option<String>,
    },
    UntrackAll,
    FinishTask {
        id: TaskId,
        respond: oneshot::Sender<Option<TaskSummary>>,
    },
    Subscribe {
        name: String,
        subscriber: Box<dyn Subscriber>,
    },
    Latest {
        respond: oneshot::Sender<Option<Snapshot>>,
    },
}

type Pending = (SamplerState, mpsc::UnboundedReceiver<SamplerCommand>);

#[derive(Clone)]
pub struct SamplerHandle {
    tx: mpsc::UnboundedSender<SamplerCommand>,
    pending: Arc<Mutex<Option<Pending>>>,
    next_task: Arc<AtomicU64>,
    period: Duration,
}

impl SamplerHandle {
    pub fn new(probe: Box<dyn ProcessProbe>) -> Self {
        Self::with_period(probe, SAMPLE_PERIOD)
    }

    pub fn with_period(probe: Box<dyn ProcessProbe>, period: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            pending: Arc::new(Mutex::new(Some((SamplerState::new(probe), rx)))),
            next_task: Arc::new(AtomicU64::new(1)),
            period,
        }
    }

    /// Spawn the sampling task if it is not running yet. Idempotent.
    pub fn ensure_running(&self) {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some((state, rx)) = pending {
            info!(period_ms = self.period.as_millis() as u64, "sampler started");
            tokio::spawn(run(state, rx, self.period));
        }
    }

    pub fn is_running(&self) -> bool {
        self.pending
            .lock()
            .map(|pending| pending.is_none())
            .unwrap_or(true)
    }

    pub fn track(&self, category: Category, pid: u32) {
        self.send(SamplerCommand::Track {
            category,
            pid,
            resolve: None,
        });
    }

    /// Track the engine. `pid` may be a launcher, in which case the first
    /// descendant named `engine_name` is sampled instead.
    pub fn track_backend(&self, pid: u32, engine_name: &str) {
        self.send(SamplerCommand::Track {
            category: Category::Backend,
            pid,
            resolve: Some(engine_name.to_string()),
        });
    }

    /// Forget the backend, the tray and every running task. Only the
    /// frontend keeps being sampled.
    pub fn untrack_all(&self) {
        self.send(SamplerCommand::UntrackAll);
    }

    pub fn next_task_id(&self) -> TaskId {
        TaskId(self.next_task.fetch_add(1, Ordering::Relaxed))
    }

    pub fn track_task(&self, id: TaskId, pid: u32, resolve: Option<&str>) {
        self.send(SamplerCommand::TrackTask {
            id,
            pid,
            resolve: resolve.map(str::to_string),
        });
    }

    /// Stop tracking a task and collect its peak readings.
    pub async fn finish_task(&self, id: TaskId) -> Option<TaskSummary> {
        let (respond, rx) = oneshot::channel();
        self.send(SamplerCommand::FinishTask { id, respond });
        rx.await.ok().flatten()
    }

    pub fn subscribe(&self, name: impl Into<String>, subscriber: Box<dyn Subscriber>) {
        self.send(SamplerCommand::Subscribe {
            name: name.into(),
            subscriber,
        });
    }

    /// The most recent snapshot, if a tick has happened yet.
    pub async fn latest(&self) -> Option<Snapshot> {
        let (respond, rx) = oneshot::channel();
        self.send(SamplerCommand::Latest { respond });
        rx.await.ok().flatten()
    }

    fn send(&self, cmd: SamplerCommand) {
        self.ensure_running();
        if self.tx.send(cmd).is_err() {
            debug!("sampler task is gone, command dropped");
        }
    }
}

async fn run(
    mut state: SamplerState,
    mut rx: mpsc::UnboundedReceiver<SamplerCommand>,
    period: Duration,
) {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                state.tick();
            }
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    info!("sampler stopped");
                    return;
                };
                match cmd {
                    SamplerCommand::Track { category, pid, resolve } => {
                        state.track(category, pid, resolve.as_deref());
                    }
                    SamplerCommand::TrackTask { id, pid, resolve } => {
                        state.track_task(id, pid, resolve.as_deref());
                    }
                    SamplerCommand::UntrackAll => state.untrack_all(),
                    SamplerCommand::FinishTask { id, respond } => {
                        let _ = respond.send(state.finish_task(id));
                    }
                    SamplerCommand::Subscribe { name, subscriber } => {
                        state.subscribe(name, subscriber);
                    }
                    SamplerCommand::Latest { respond } => {
                        let _ = respond.send(state.latest().cloned());
                    }
                }
            }
        }
    }
}
