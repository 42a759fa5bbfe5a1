//! Bounded admission for lookup and store tasks.
//!
//! | Pool | Bound | When full |
//! |------|-------|-----------|
//! | internal-lookup | `lookup_concurrency` | caller waits for a slot |
//! | internal-put | `lookup_concurrency` | caller waits for a slot |
//! | external-lookup | `external_lookup_pool` | task is queued |
//! | external-put | `external_put_pool` (smaller while sleeping) | task is queued |
//!
//! Internal pools serve the control plane's own work (seeding, refresh,
//! direct puts) and apply backpressure. External pools serve API callers and
//! never block them. A task keeps its permit until it finishes.
//!
//! Within a pool, high-priority tasks waiting for a permit are admitted
//! before normal ones. Waiters of the same priority are served in order.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::ControlConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    InternalLookup,
    InternalPut,
    ExternalLookup,
    ExternalPut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overflow {
    Block,
    Queue,
}

#[derive(Default)]
struct QueueState {
    available: usize,
    /// Permits to swallow as they come back after a shrink.
    owed: usize,
    high: VecDeque<oneshot::Sender<PoolPermit>>,
    normal: VecDeque<oneshot::Sender<PoolPermit>>,
}

/// Counting permits handed out high priority first.
struct PermitQueue {
    state: Mutex<QueueState>,
}

impl PermitQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                available: capacity,
                ..QueueState::default()
            }),
        })
    }

    async fn acquire(self: &Arc<Self>, high_priority: bool) -> PoolPermit {
        let rx = {
            let mut state = self.state.lock();
            if state.available > 0 {
                state.available -= 1;
                return PoolPermit::new(self.clone());
            }
            let (tx, rx) = oneshot::channel();
            if high_priority {
                state.high.push_back(tx);
            } else {
                state.normal.push_back(tx);
            }
            rx
        };

        match rx.await {
            Ok(permit) => permit,
            // the sender is only dropped with the queue itself
            Err(_) => PoolPermit::detached(),
        }
    }

    /// Returns one permit: to the next waiter if there is one.
    fn release(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                if state.owed > 0 {
                    state.owed -= 1;
                    return;
                }
                match state.high.pop_front().or_else(|| state.normal.pop_front()) {
                    Some(waiter) => waiter,
                    None => {
                        state.available += 1;
                        return;
                    }
                }
            };

            // a waiter that gave up hands the permit straight back
            match waiter.send(PoolPermit::new(self.clone())) {
                Ok(()) => return,
                Err(mut permit) => permit.disarm(),
            }
        }
    }

    fn shrink(&self, by: usize) {
        let mut state = self.state.lock();
        let taken = by.min(state.available);
        state.available -= taken;
        state.owed += by - taken;
    }

    fn available(&self) -> usize {
        self.state.lock().available
    }

    fn waiting(&self) -> usize {
        let state = self.state.lock();
        state.high.len() + state.normal.len()
    }
}

/// Slot in a pool, given back on drop.
pub struct PoolPermit {
    queue: Option<Arc<PermitQueue>>,
}

impl PoolPermit {
    fn new(queue: Arc<PermitQueue>) -> Self {
        Self { queue: Some(queue) }
    }

    fn detached() -> Self {
        Self { queue: None }
    }

    fn disarm(&mut self) {
        self.queue = None;
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.release();
        }
    }
}

pub struct Pool {
    name: &'static str,
    permits: Arc<PermitQueue>,
    capacity: Mutex<usize>,
    overflow: Overflow,
}

impl Pool {
    pub fn new(name: &'static str, capacity: usize, overflow: Overflow) -> Self {
        Self {
            name,
            permits: PermitQueue::new(capacity),
            capacity: Mutex::new(capacity),
            overflow,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        *self.capacity.lock()
    }

    pub fn available(&self) -> usize {
        self.permits.available()
    }

    /// Tasks waiting for a permit.
    pub fn waiting(&self) -> usize {
        self.permits.waiting()
    }

    /// Runs `task` under a pool permit at normal priority.
    pub async fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_prioritized(task, false).await
    }

    /// Runs `task` under a pool permit.
    ///
    /// A blocking pool returns only once a permit is held; a queuing pool
    /// returns at once and the task waits for its permit.
    pub async fn spawn_prioritized<F>(&self, task: F, high_priority: bool) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.overflow {
            Overflow::Block => {
                let permit = self.permits.acquire(high_priority).await;
                tokio::spawn(async move {
                    let _permit = permit;
                    task.await
                })
            }
            Overflow::Queue => {
                let permits = self.permits.clone();
                tokio::spawn(async move {
                    let _permit = permits.acquire(high_priority).await;
                    task.await
                })
            }
        }
    }

    /// Changes the bound. Shrinking takes effect as running tasks return
    /// their permits.
    pub fn resize(&self, capacity: usize) {
        let mut current = self.capacity.lock();
        if capacity == *current {
            return;
        }
        debug!(pool = self.name, from = *current, to = capacity, "resizing pool");

        if capacity > *current {
            for _ in *current..capacity {
                self.permits.release();
            }
        } else {
            self.permits.shrink(*current - capacity);
        }
        *current = capacity;
    }
}

/// The four pools of one control plane.
pub struct AdmissionPools {
    pub internal_lookup: Pool,
    pub internal_put: Pool,
    pub external_lookup: Pool,
    pub external_put: Pool,
    external_put_awake: usize,
    external_put_sleeping: usize,
}

impl AdmissionPools {
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            internal_lookup: Pool::new("internal-lookup", config.lookup_concurrency, Overflow::Block),
            internal_put: Pool::new("internal-put", config.lookup_concurrency, Overflow::Block),
            external_lookup: Pool::new("external-lookup", config.external_lookup_pool, Overflow::Queue),
            external_put: Pool::new("external-put", config.external_put_pool, Overflow::Queue),
            external_put_awake: config.external_put_pool,
            external_put_sleeping: config.external_put_pool_sleeping,
        }
    }

    pub fn get(&self, kind: PoolKind) -> &Pool {
        match kind {
            PoolKind::InternalLookup => &self.internal_lookup,
            PoolKind::InternalPut => &self.internal_put,
            PoolKind::ExternalLookup => &self.external_lookup,
            PoolKind::ExternalPut => &self.external_put,
        }
    }

    pub fn set_sleeping(&self, sleeping: bool) {
        let capacity = if sleeping {
            self.external_put_sleeping
        } else {
            self.external_put_awake
        };
        self.external_put.resize(capacity);
    }
}
