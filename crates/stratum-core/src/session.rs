use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::WorkerId;

/// One entry of a session's layer stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub type_name: String,
    pub implementation_name: String,
    pub is_plugin: bool,
    pub is_stateful: bool,
}

/// A logical unit of work.
///
/// Keeps one nested layer call stack per worker driving it, so workers that
/// share a session (the guest session, typically) never pop each other's
/// frames. Also keeps per-worker accounting: which workers are currently
/// bound and how long finished bindings lasted.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    name: String,
    created_at: DateTime<Utc>,
    system: bool,
    permissions: HashSet<String>,
    /// worker → frames, outermost first
    stacks: Mutex<HashMap<WorkerId, Vec<StackFrame>>>,
    accounting: Mutex<Accounting>,
}

#[derive(Debug, Default)]
struct Accounting {
    active: HashMap<WorkerId, Instant>,
    completed_bindings: u64,
    bound_time: Duration,
}

impl Session {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
            system: false,
            permissions: HashSet::new(),
            stacks: Mutex::new(HashMap::new()),
            accounting: Mutex::new(Accounting::default()),
        }
    }

    /// A session that passes every permission check.
    pub fn system(name: impl Into<String>) -> Self {
        Self {
            system: true,
            ..Self::new(name)
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.system || self.permissions.contains(permission)
    }

    pub fn push_frame(&self, worker: WorkerId, frame: StackFrame) {
        lock(&self.stacks).entry(worker).or_default().push(frame);
    }

    /// Pop the innermost frame `worker` pushed. Frames of other workers are
    /// never touched.
    pub fn pop_frame(&self, worker: WorkerId) -> Option<StackFrame> {
        let mut stacks = lock(&self.stacks);
        let stack = stacks.get_mut(&worker)?;
        let frame = stack.pop();
        if stack.is_empty() {
            stacks.remove(&worker);
        }
        frame
    }

    pub fn stack_depth(&self, worker: WorkerId) -> usize {
        lock(&self.stacks).get(&worker).map_or(0, Vec::len)
    }

    /// Frames of `worker`, from outermost to innermost.
    pub fn stack(&self, worker: WorkerId) -> Vec<StackFrame> {
        lock(&self.stacks).get(&worker).cloned().unwrap_or_default()
    }

    pub fn current_frame(&self, worker: WorkerId) -> Option<StackFrame> {
        lock(&self.stacks)
            .get(&worker)
            .and_then(|stack| stack.last().cloned())
    }

    /// Frames across every worker currently inside a layer call.
    pub fn total_depth(&self) -> usize {
        lock(&self.stacks).values().map(Vec::len).sum()
    }

    /// Begin this session's accounting for `worker`.
    pub fn start_worker(&self, worker: WorkerId) {
        let mut accounting = lock(&self.accounting);
        accounting.active.insert(worker, Instant::now());
        tracing::debug!(session = %self.name, worker = %worker, "Worker accounting started");
    }

    /// Close this session's accounting for `worker`.
    pub fn end_worker(&self, worker: WorkerId) {
        let mut accounting = lock(&self.accounting);
        if let Some(started) = accounting.active.remove(&worker) {
            accounting.completed_bindings += 1;
            accounting.bound_time += started.elapsed();
            tracing::debug!(session = %self.name, worker = %worker, "Worker accounting finalized");
        }
    }

    pub fn is_bound_to(&self, worker: WorkerId) -> bool {
        lock(&self.accounting).active.contains_key(&worker)
    }

    pub fn active_workers(&self) -> usize {
        lock(&self.accounting).active.len()
    }

    pub fn completed_bindings(&self) -> u64 {
        lock(&self.accounting).completed_bindings
    }

    /// Total wall time of all finished worker bindings.
    pub fn bound_time(&self) -> Duration {
        lock(&self.accounting).bound_time
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
