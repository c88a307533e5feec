use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ContextError, LayerError};
use crate::session::Session;

/// Identity of a worker: a logical task id handed out by the
/// [`WorkerRegistry`] or chosen by the caller's scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Source of runtime resource readings for a worker.
///
/// Abstracted so hosts can plug in per-thread CPU clocks or allocator
/// counters, and so tests can observe exactly when baselines are captured.
pub trait ResourceProbe: Send + Sync {
    fn cpu_time(&self, worker: WorkerId) -> Duration;
    fn allocated_bytes(&self, worker: WorkerId) -> u64;
}

/// Default probe: a monotonic clock stands in for CPU time and allocation
/// is reported as zero.
#[derive(Debug)]
pub struct MonotonicProbe {
    origin: Instant,
}

impl MonotonicProbe {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for MonotonicProbe {
    fn cpu_time(&self, _worker: WorkerId) -> Duration {
        self.origin.elapsed()
    }

    fn allocated_bytes(&self, _worker: WorkerId) -> u64 {
        0
    }
}

/// Binds one worker to the session it is currently driving.
///
/// Quotas are stored here for an external supervisor; nothing in this crate
/// enforces them.
pub struct WorkerContext {
    id: WorkerId,
    probe: Arc<dyn ResourceProbe>,
    cancelled: AtomicBool,
    state: Mutex<WorkerState>,
}

#[derive(Debug, Default)]
struct WorkerState {
    session: Option<Arc<Session>>,
    initial_allocated_memory: Option<u64>,
    max_allocated_memory: Option<u64>,
    initial_time: Option<Duration>,
    max_execution_time: Option<Duration>,
}

/// Resource consumption of a worker since its current session was bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub worker: WorkerId,
    pub accumulated_time: Duration,
    pub allocated_memory: u64,
    pub max_execution_time: Option<Duration>,
    pub max_allocated_memory: Option<u64>,
}

impl ResourceUsage {
    pub fn exceeds_execution_time(&self) -> bool {
        self.max_execution_time
            .is_some_and(|max| self.accumulated_time > max)
    }

    pub fn exceeds_allocated_memory(&self) -> bool {
        self.max_allocated_memory
            .is_some_and(|max| self.allocated_memory > max)
    }
}

impl WorkerContext {
    pub fn new(id: WorkerId, probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            id,
            probe,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(WorkerState::default()),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Bind this worker to `session`.
    ///
    /// The previously bound session, if any, has its accounting for this
    /// worker finalized before the new session's accounting starts and the
    /// baselines are captured. The whole exchange happens under the worker
    /// lock, so no reader observes both sessions bound.
    pub fn bind(&self, session: Arc<Session>) {
        let mut state = self.lock();
        self.bind_locked(&mut state, session);
    }

    /// Bind `session` only if no session is bound, and return whichever
    /// session the worker ends up driving. Check and bind happen under one
    /// lock, so a concurrent explicit [`bind`](Self::bind) is never
    /// overwritten.
    pub fn bind_if_unbound(&self, session: Arc<Session>) -> Arc<Session> {
        let mut state = self.lock();
        if let Some(current) = &state.session {
            return Arc::clone(current);
        }
        self.bind_locked(&mut state, Arc::clone(&session));
        session
    }

    fn bind_locked(&self, state: &mut WorkerState, session: Arc<Session>) {
        if let Some(previous) = state.session.take() {
            previous.end_worker(self.id);
        }

        session.start_worker(self.id);
        state.initial_allocated_memory = Some(self.probe.allocated_bytes(self.id));
        state.initial_time = Some(self.probe.cpu_time(self.id));

        tracing::info!(
            worker = %self.id,
            session = %session.name(),
            session_id = %session.id(),
            "Worker bound to session"
        );
        state.session = Some(session);
    }

    /// Release the current session, finalizing its accounting.
    pub fn unbind(&self) -> Option<Arc<Session>> {
        let mut state = self.lock();
        let previous = state.session.take();
        if let Some(session) = &previous {
            session.end_worker(self.id);
            tracing::debug!(worker = %self.id, session = %session.name(), "Worker unbound");
        }
        previous
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.lock().session.clone()
    }

    pub fn initial_allocated_memory(&self) -> Option<u64> {
        self.lock().initial_allocated_memory
    }

    pub fn initial_time(&self) -> Option<Duration> {
        self.lock().initial_time
    }

    pub fn max_allocated_memory(&self) -> Option<u64> {
        self.lock().max_allocated_memory
    }

    pub fn set_max_allocated_memory(&self, max: Option<u64>) {
        self.lock().max_allocated_memory = max;
    }

    pub fn max_execution_time(&self) -> Option<Duration> {
        self.lock().max_execution_time
    }

    pub fn set_max_execution_time(&self, max: Option<Duration>) {
        self.lock().max_execution_time = max;
    }

    /// Time consumed since the current session was bound.
    pub fn accumulated_time(&self) -> Result<Duration, ContextError> {
        let initial = self
            .lock()
            .initial_time
            .ok_or(ContextError::NotBound(self.id.get()))?;
        Ok(self.probe.cpu_time(self.id).saturating_sub(initial))
    }

    /// Bytes allocated since the current session was bound.
    pub fn allocated_memory(&self) -> Result<u64, ContextError> {
        let initial = self
            .lock()
            .initial_allocated_memory
            .ok_or(ContextError::NotBound(self.id.get()))?;
        Ok(self.probe.allocated_bytes(self.id).saturating_sub(initial))
    }

    pub fn usage(&self) -> Result<ResourceUsage, ContextError> {
        let accumulated_time = self.accumulated_time()?;
        let allocated_memory = self.allocated_memory()?;
        let state = self.lock();
        Ok(ResourceUsage {
            worker: self.id,
            accumulated_time,
            allocated_memory,
            max_execution_time: state.max_execution_time,
            max_allocated_memory: state.max_allocated_memory,
        })
    }

    /// Request cooperative cancellation. Observed at the start of the next
    /// layer invocation on this worker.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        tracing::info!(worker = %self.id, "Worker cancellation requested");
    }

    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check_cancelled(&self) -> Result<(), LayerError> {
        if self.is_cancelled() {
            return Err(LayerError::Cancelled);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("WorkerContext")
            .field("id", &self.id)
            .field("session", &state.session.as_ref().map(|s| s.name().to_string()))
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Lazily created worker contexts, looked up by worker identity.
///
/// Workers that have never been bound explicitly are bound to the guest
/// session on first lookup.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, Arc<WorkerContext>>>,
    probe: Arc<dyn ResourceProbe>,
    guest: Arc<Session>,
    next_id: AtomicU64,
}

impl WorkerRegistry {
    pub fn new(guest: Arc<Session>, probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            probe,
            guest,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn guest_session(&self) -> &Arc<Session> {
        &self.guest
    }

    /// Return the context for `id`, creating it on first use.
    pub async fn worker(&self, id: WorkerId) -> Arc<WorkerContext> {
        // Fast path: already known
        let existing = {
            let guard = self.workers.read().await;
            guard.get(&id).cloned()
        };

        let worker = match existing {
            Some(worker) => worker,
            None => {
                let mut guard = self.workers.write().await;
                guard
                    .entry(id)
                    .or_insert_with(|| {
                        tracing::debug!(worker = %id, "Worker context created");
                        Arc::new(WorkerContext::new(id, Arc::clone(&self.probe)))
                    })
                    .clone()
            }
        };

        worker.bind_if_unbound(Arc::clone(&self.guest));
        worker
    }

    /// Allocate a fresh worker identity and return its context.
    pub async fn spawn_worker(&self) -> Arc<WorkerContext> {
        self.worker(self.next_worker_id()).await
    }

    /// Allocate a fresh worker identity already bound to `session`. The
    /// guest session is never involved.
    pub async fn spawn_bound(&self, session: Arc<Session>) -> Arc<WorkerContext> {
        self.bind(self.next_worker_id(), session).await
    }

    fn next_worker_id(&self) -> WorkerId {
        WorkerId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn bind(&self, id: WorkerId, session: Arc<Session>) -> Arc<WorkerContext> {
        let mut guard = self.workers.write().await;
        let worker = guard
            .entry(id)
            .or_insert_with(|| Arc::new(WorkerContext::new(id, Arc::clone(&self.probe))))
            .clone();
        drop(guard);
        worker.bind(session);
        worker
    }

    /// Accumulated time of a worker that has been bound at least once.
    pub async fn accumulated_time(&self, id: WorkerId) -> Result<Duration, ContextError> {
        let guard = self.workers.read().await;
        let worker = guard.get(&id).ok_or(ContextError::NotBound(id.get()))?;
        worker.accumulated_time()
    }

    /// Drop a worker context, finalizing its session accounting.
    pub async fn remove(&self, id: WorkerId) -> Option<Arc<WorkerContext>> {
        let removed = self.workers.write().await.remove(&id);
        if let Some(worker) = &removed {
            worker.unbind();
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}
