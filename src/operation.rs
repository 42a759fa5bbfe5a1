//! Caller-facing progress callbacks and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::identity::{Contact, NodeId};
use crate::lookup::LookupObserver;
use crate::messages::StoredValue;

/// Progress of a put, get or lookup as seen by its caller.
///
/// Every operation calls [`complete`](OperationListener::complete) exactly
/// once. The other hooks may fire from any task, in any order, before that.
pub trait OperationListener: Send + Sync {
    fn searching(&self, _key: &NodeId, _level: usize, _active: usize) {}

    fn found(&self, _contact: &Contact, _is_closest: bool) {}

    fn read(&self, _contact: &Contact, _value: &StoredValue) {}

    fn wrote(&self, _contact: &Contact, _value: &StoredValue) {}

    /// A key was redirected. Returning `false` skips the derived keys of a get.
    fn diversified(&self, _description: &str) -> bool {
        true
    }

    fn complete(&self, _timed_out: bool) {}
}

/// Listener that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;

impl OperationListener for NoopListener {}

/// Forwards the progress of one lookup to an operation listener.
pub struct ListenerObserver {
    key: NodeId,
    listener: Arc<dyn OperationListener>,
}

impl ListenerObserver {
    pub fn new(key: NodeId, listener: Arc<dyn OperationListener>) -> Self {
        Self { key, listener }
    }
}

impl LookupObserver for ListenerObserver {
    fn found(&self, contact: &Contact, is_closest: bool) {
        self.listener.found(contact, is_closest);
    }

    fn searching(&self, _contact: &Contact, level: usize, active: usize) {
        self.listener.searching(&self.key, level, active);
    }

    fn read(&self, contact: &Contact, value: &StoredValue) {
        self.listener.read(contact, value);
    }
}

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Shared cancellation flag that can also be awaited.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct TaskSetInner {
    cancelled: bool,
    members: Vec<CancelToken>,
    children: Vec<TaskSet>,
}

/// Group of tasks cancelled together. Members added after cancellation are
/// cancelled on arrival.
#[derive(Clone, Default)]
pub struct TaskSet {
    inner: Arc<Mutex<TaskSetInner>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, token: CancelToken) {
        let mut inner = self.inner.lock();
        if inner.cancelled {
            drop(inner);
            token.cancel();
            return;
        }
        inner.members.push(token);
    }

    /// A fresh member token.
    pub fn token(&self) -> CancelToken {
        let token = CancelToken::new();
        self.add(token.clone());
        token
    }

    /// A set cancelled along with this one that can also be cancelled on
    /// its own, leaving this one untouched.
    pub fn child(&self) -> TaskSet {
        let child = TaskSet::new();
        let mut inner = self.inner.lock();
        if inner.cancelled {
            drop(inner);
            child.cancel();
            return child;
        }
        inner.children.retain(|c| !c.is_cancelled());
        inner.children.push(child.clone());
        child
    }

    pub fn cancel(&self) {
        let (members, children) = {
            let mut inner = self.inner.lock();
            inner.cancelled = true;
            (
                std::mem::take(&mut inner.members),
                std::mem::take(&mut inner.children),
            )
        };
        for token in members {
            token.cancel();
        }
        for child in children {
            child.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }
}
