//! Registry of in-flight control tasks.
//!
//! Every lookup registers itself here for its lifetime. Subscribers receive
//! `Added` when a task is submitted, `Changed` when it leaves its pool queue
//! and starts, and `Removed` when it finishes. A live task can be asked for a
//! snapshot of its search tree.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::identity::{Contact, NodeId};
use crate::pools::PoolKind;

const ACTIVITY_CHANNEL_CAPACITY: usize = 256;

/// Pool a task was submitted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    InternalGet,
    ExternalGet,
    InternalPut,
    ExternalPut,
}

impl From<PoolKind> for ActivityKind {
    fn from(pool: PoolKind) -> Self {
        match pool {
            PoolKind::InternalLookup => ActivityKind::InternalGet,
            PoolKind::ExternalLookup => ActivityKind::ExternalGet,
            PoolKind::InternalPut => ActivityKind::InternalPut,
            PoolKind::ExternalPut => ActivityKind::ExternalPut,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ActivityEntry {
    pub id: u64,
    pub kind: ActivityKind,
    pub target: NodeId,
    pub description: String,
    pub queued: bool,
}

#[derive(Clone, Debug)]
pub enum ActivityEvent {
    Added(ActivityEntry),
    Changed(ActivityEntry),
    Removed(ActivityEntry),
}

/// A contact in a search tree, under the contact that told us about it.
#[derive(Clone, Debug)]
pub struct ActivityNode {
    pub contact: Contact,
    pub children: Vec<ActivityNode>,
}

impl ActivityNode {
    pub fn new(contact: Contact) -> Self {
        Self {
            contact,
            children: Vec::new(),
        }
    }

    fn max_depth(&self) -> usize {
        1 + self.children.iter().map(|c| c.max_depth()).max().unwrap_or(0)
    }
}

impl fmt::Display for ActivityNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - ", self.contact.addr.ip())?;
        if !self.children.is_empty() {
            write!(f, "[")?;
            for (i, child) in self.children.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{child}")?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ActivityState {
    pub root: ActivityNode,
    pub result: String,
}

impl ActivityState {
    /// Search depth below the local node, at least 1.
    pub fn depth(&self) -> usize {
        (self.root.max_depth() - 1).max(1)
    }
}

/// Produces a snapshot of a running task.
pub trait ActivitySource: Send + Sync {
    fn current_state(&self) -> ActivityState;
}

struct Registered {
    entry: ActivityEntry,
    source: Weak<dyn ActivitySource>,
}

pub struct ActivityTracker {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Registered>>,
    events: broadcast::Sender<ActivityEvent>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(ACTIVITY_CHANNEL_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn register(
        self: &Arc<Self>,
        kind: ActivityKind,
        target: NodeId,
        description: String,
        source: Weak<dyn ActivitySource>,
    ) -> ActivityGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ActivityEntry {
            id,
            kind,
            target,
            description,
            queued: true,
        };
        self.entries.lock().insert(
            id,
            Registered {
                entry: entry.clone(),
                source,
            },
        );
        let _ = self.events.send(ActivityEvent::Added(entry));
        ActivityGuard {
            tracker: Arc::clone(self),
            id,
        }
    }

    fn mark_started(&self, id: u64) {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&id) {
                Some(registered) => {
                    registered.entry.queued = false;
                    registered.entry.clone()
                }
                None => return,
            }
        };
        let _ = self.events.send(ActivityEvent::Changed(entry));
    }

    fn remove(&self, id: u64) {
        let removed = self.entries.lock().remove(&id);
        if let Some(registered) = removed {
            let _ = self.events.send(ActivityEvent::Removed(registered.entry));
        }
    }

    pub fn activities(&self) -> Vec<ActivityEntry> {
        let mut entries: Vec<ActivityEntry> =
            self.entries.lock().values().map(|r| r.entry.clone()).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    pub fn current_state(&self, id: u64) -> Option<ActivityState> {
        let source = self.entries.lock().get(&id)?.source.upgrade()?;
        Some(source.current_state())
    }

    /// Current entries plus a receiver for everything that happens after.
    pub fn subscribe(&self) -> (Vec<ActivityEntry>, broadcast::Receiver<ActivityEvent>) {
        let receiver = self.events.subscribe();
        (self.activities(), receiver)
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps an activity registered until dropped.
pub struct ActivityGuard {
    tracker: Arc<ActivityTracker>,
    id: u64,
}

impl ActivityGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn started(&self) {
        self.tracker.mark_started(self.id);
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.tracker.remove(self.id);
    }
}
