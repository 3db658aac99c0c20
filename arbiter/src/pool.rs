//! Auto-scaling engine pool: assigns analysis jobs to idle drivers, queues
//! overflow, and enforces driver lifecycle (spawn, warm, idle-evict,
//! crash-replace).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{EngineConfig, ScalingConfig};
use crate::error::EngineError;
use crate::uci::{AnalyzeJob, AnalyzeResult, Engine, JobId};

/// Pause before retrying after an engine failed to even spawn, so a broken
/// binary cannot respawn in a hot loop.
const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// Cooperative cancellation handle shared between a session and the pool.
/// Cloning shares the flag; cancellation is sticky.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let _ = self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` was called, however long ago.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so this cannot fail while awaited
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DriverId(u32);

impl std::fmt::Display for DriverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Spawning,
    Idle,
    Searching,
    Draining,
}

struct DriverSlot {
    state: DriverState,
    last_idle: Instant,
    /// Signalled to make the driver quit once it is between jobs
    drain: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

struct QueuedJob {
    job: AnalyzeJob,
    cancel: CancelToken,
    reply: oneshot::Sender<Result<AnalyzeResult, EngineError>>,
}

/// The pool ledger. The only lock in the server; held strictly for
/// bookkeeping, never across an await.
struct Ledger {
    queue: VecDeque<QueuedJob>,
    drivers: HashMap<DriverId, DriverSlot>,
    /// At most one driver spawn is in flight at a time
    spawning: bool,
    next_driver: u32,
}

struct Shared {
    engine: EngineConfig,
    scaling: ScalingConfig,
    ledger: Mutex<Ledger>,
    /// Signalled when a job lands in the queue
    work: Notify,
    shutting_down: AtomicBool,
}

/// Point-in-time pool counters, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub drivers: usize,
    pub searching: usize,
    pub queued: usize,
}

/// A submitted job's pending result. Exactly one result or error resolves
/// per submission.
pub struct PendingAnalysis {
    id: JobId,
    rx: oneshot::Receiver<Result<AnalyzeResult, EngineError>>,
}

impl PendingAnalysis {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub async fn wait(self) -> Result<AnalyzeResult, EngineError> {
        match self.rx.await {
            Ok(res) => res,
            // The owning driver task went away without replying
            Err(_) => Err(EngineError::PoolClosed),
        }
    }
}

pub struct Pool {
    shared: Arc<Shared>,
    sweep: JoinHandle<()>,
}

impl Pool {
    /// Creates the pool and warms `min_engines` drivers. Drivers report
    /// ready asynchronously; jobs submitted meanwhile queue up.
    #[instrument(skip_all, fields(min = scaling.min_engines, max = scaling.max_engines))]
    pub fn new(engine: EngineConfig, scaling: ScalingConfig) -> Self {
        let shared = Arc::new(Shared {
            engine,
            scaling,
            ledger: Mutex::new(Ledger {
                queue: VecDeque::new(),
                drivers: HashMap::new(),
                spawning: false,
                next_driver: 0,
            }),
            work: Notify::new(),
            shutting_down: AtomicBool::new(false),
        });

        {
            let mut ledger = shared.ledger.lock().unwrap();
            for _ in 0..shared.scaling.min_engines {
                shared.spawn_driver(&mut ledger);
            }
        }

        let sweep = tokio::spawn(sweep_loop(shared.clone()));
        info!("Engine pool started");

        Self { shared, sweep }
    }

    /// Appends the job to the FIFO queue and wakes a driver. May decide to
    /// grow the pool while it holds the ledger.
    #[instrument(skip_all, fields(id = %job.id, kind = ?job.kind))]
    pub fn submit(&self, job: AnalyzeJob, cancel: CancelToken) -> PendingAnalysis {
        let id = job.id;
        let (reply, rx) = oneshot::channel();

        if self.shared.shutting_down.load(Ordering::Acquire) {
            let _ = reply.send(Err(EngineError::PoolClosed));
            return PendingAnalysis { id, rx };
        }

        {
            let mut ledger = self.shared.ledger.lock().unwrap();
            ledger.queue.push_back(QueuedJob { job, cancel, reply });
            trace!(queued = ledger.queue.len(), "Job enqueued");
            self.shared.maybe_scale_up(&mut ledger);
        }

        self.shared.work.notify_one();
        PendingAnalysis { id, rx }
    }

    pub fn status(&self) -> PoolStatus {
        let ledger = self.shared.ledger.lock().unwrap();
        PoolStatus {
            drivers: ledger.drivers.len(),
            searching: ledger
                .drivers
                .values()
                .filter(|slot| slot.state == DriverState::Searching)
                .count(),
            queued: ledger.queue.len(),
        }
    }

    /// Graceful shutdown: fail everything still queued, let running searches
    /// finish, then quit every driver and await their exit.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        self.sweep.abort();

        let (tasks, drains) = {
            let mut ledger = self.shared.ledger.lock().unwrap();

            for queued in ledger.queue.drain(..) {
                let _ = queued.reply.send(Err(EngineError::PoolClosed));
            }

            let mut tasks = vec![];
            let mut drains = vec![];
            for slot in ledger.drivers.values_mut() {
                slot.state = DriverState::Draining;
                drains.push(slot.drain.clone());
                tasks.extend(slot.task.take());
            }
            (tasks, drains)
        };

        for drain in drains {
            drain.notify_one();
        }

        let _ = futures::future::join_all(tasks).await;
        info!("Engine pool stopped");
    }
}

impl Shared {
    /// Grows the pool when the queue backs up, with headroom and at most one
    /// spawn in flight.
    fn maybe_scale_up(self: &Arc<Self>, ledger: &mut Ledger) {
        if ledger.queue.len() >= self.scaling.scale_up_threshold
            && ledger.drivers.len() < self.scaling.max_engines
            && !ledger.spawning
        {
            debug!(queued = ledger.queue.len(), drivers = ledger.drivers.len(), "Scaling up");
            self.spawn_driver(ledger);
        }
    }

    fn spawn_driver(self: &Arc<Self>, ledger: &mut Ledger) {
        let id = DriverId(ledger.next_driver);
        ledger.next_driver += 1;
        ledger.spawning = true;

        let drain = Arc::new(Notify::new());
        ledger.drivers.insert(
            id,
            DriverSlot {
                state: DriverState::Spawning,
                last_idle: Instant::now(),
                drain: drain.clone(),
                task: None,
            },
        );

        let task = tokio::spawn(driver_loop(id, self.clone(), drain));
        if let Some(slot) = ledger.drivers.get_mut(&id) {
            slot.task = Some(task);
        }
    }

    fn driver_ready(self: &Arc<Self>, id: DriverId) {
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(slot) = ledger.drivers.get_mut(&id) {
            slot.state = DriverState::Idle;
            slot.last_idle = Instant::now();
        }
        ledger.spawning = ledger
            .drivers
            .values()
            .any(|slot| slot.state == DriverState::Spawning);

        // The queue may have backed up while this spawn was in flight
        self.maybe_scale_up(&mut ledger);
    }

    fn set_searching(&self, id: DriverId) {
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(slot) = ledger.drivers.get_mut(&id) {
            slot.state = DriverState::Searching;
        }
    }

    fn set_idle(&self, id: DriverId) {
        let mut ledger = self.ledger.lock().unwrap();
        if let Some(slot) = ledger.drivers.get_mut(&id) {
            slot.state = DriverState::Idle;
            slot.last_idle = Instant::now();
        }
    }

    /// Removes a finished driver. An unexpected death re-checks the
    /// min-engines invariant and respawns after a short backoff.
    fn driver_gone(self: &Arc<Self>, id: DriverId, unexpected: bool) {
        let mut ledger = self.ledger.lock().unwrap();
        ledger.drivers.remove(&id);
        ledger.spawning = ledger
            .drivers
            .values()
            .any(|slot| slot.state == DriverState::Spawning);

        if !unexpected || self.shutting_down.load(Ordering::Acquire) {
            return;
        }

        if ledger.drivers.len() < self.scaling.min_engines {
            warn!(%id, drivers = ledger.drivers.len(), "Driver lost, respawning");
            let shared = self.clone();
            drop(ledger);
            let _task = tokio::spawn(async move {
                tokio::time::sleep(RESPAWN_BACKOFF).await;
                if shared.shutting_down.load(Ordering::Acquire) {
                    return;
                }
                let mut ledger = shared.ledger.lock().unwrap();
                if ledger.drivers.len() < shared.scaling.min_engines {
                    shared.spawn_driver(&mut ledger);
                }
            });
        }
    }

    /// Pops the next live job, resolving any canceled entries on the way.
    /// `None` either means an empty queue or that this driver must drain.
    fn next_job(&self, id: DriverId) -> PullDecision {
        let mut ledger = self.ledger.lock().unwrap();

        let draining = ledger
            .drivers
            .get(&id)
            .map(|slot| slot.state == DriverState::Draining)
            .unwrap_or(true);
        if draining {
            return PullDecision::Drain;
        }

        while let Some(queued) = ledger.queue.pop_front() {
            if queued.cancel.is_cancelled() {
                trace!(id = %queued.job.id, "Dropping canceled job from queue");
                let _ = queued.reply.send(Err(EngineError::Canceled));
                continue;
            }
            return PullDecision::Job(queued);
        }

        PullDecision::Wait
    }
}

enum PullDecision {
    Job(QueuedJob),
    Wait,
    Drain,
}

/// One driver task: spawn the engine, then pull jobs FIFO until drained or
/// dead. The subprocess stdio is owned exclusively by this task.
#[instrument(skip(shared, drain), fields(%id))]
async fn driver_loop(id: DriverId, shared: Arc<Shared>, drain: Arc<Notify>) {
    let mut engine = match Engine::spawn(&shared.engine).await {
        Ok(engine) => engine,
        Err(err) => {
            error!(%err, "Engine spawn failed");
            shared.driver_gone(id, true);
            return;
        }
    };

    shared.driver_ready(id);
    debug!(name = engine.name(), "Driver ready");

    loop {
        let next = loop {
            match shared.next_job(id) {
                PullDecision::Job(job) => break job,
                PullDecision::Drain => {
                    debug!("Driver draining");
                    engine.shutdown().await;
                    shared.driver_gone(id, false);
                    return;
                }
                PullDecision::Wait => {
                    tokio::select! {
                        () = shared.work.notified() => (),
                        () = drain.notified() => (),
                    }
                }
            }
        };

        shared.set_searching(id);

        let wall = next.job.wall_timeout();
        let result = match timeout(wall, engine.analyze(&next.job, &next.cancel)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(id = %next.job.id, "Analysis exceeded wall timeout");
                Err(EngineError::Timeout)
            }
        };

        let fatal = result.as_ref().err().map(EngineError::is_fatal).unwrap_or(false);
        let _ = next.reply.send(result);

        if fatal {
            // Dropping the engine kills the subprocess if it still runs
            shared.driver_gone(id, true);
            return;
        }

        shared.set_idle(id);
    }
}

/// Background sweep draining drivers that sat idle past the scale-down
/// deadline, while the pool stays above its minimum.
async fn sweep_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.scaling.sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if shared.shutting_down.load(Ordering::Acquire) {
            return;
        }

        let victims = {
            let mut ledger = shared.ledger.lock().unwrap();
            shared.maybe_scale_up(&mut ledger);

            let mut excess = ledger
                .drivers
                .len()
                .saturating_sub(shared.scaling.min_engines);
            let deadline = shared.scaling.scale_down_idle();

            let mut victims = vec![];
            for (id, slot) in ledger.drivers.iter_mut() {
                if excess == 0 {
                    break;
                }
                if slot.state == DriverState::Idle && slot.last_idle.elapsed() > deadline {
                    debug!(%id, idle_for = ?slot.last_idle.elapsed(), "Draining idle driver");
                    slot.state = DriverState::Draining;
                    victims.push(slot.drain.clone());
                    excess -= 1;
                }
            }
            victims
        };

        for drain in victims {
            drain.notify_one();
        }
    }
}
