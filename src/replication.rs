//! # Store Waves
//!
//! A put fans out into a tree of work that all reports into one
//! [`CompletionJoin`]:
//!
//! ```text
//! put_keys(key)
//!   ├─ adapter: key -> [k1, k2, ...]          (existing diversifications)
//!   └─ per new key: node lookup (LOOKUP_FOR_STORE)
//!        └─ store_at(closest)
//!             └─ per contact: store RPC
//!                  ├─ diversified reply -> put_keys(derived, level + 1)
//!                  ├─ obfuscated flag   -> second store of the marker
//!                  └─ key block         -> key replaced for the rest of the wave
//! ```
//!
//! Every unit of work increments the join before it is dispatched and
//! decrements it when done. A pre-store lookup holds its unit until its
//! store wave has been dispatched, so the count cannot touch zero while
//! more work is still on its way. Keys and contacts already written by
//! the wave are never written again, which also breaks diversification
//! loops.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::control::ControlInner;
use crate::identity::{Contact, NodeId};
use crate::lookup::LookupRequest;
use crate::messages::{
    DiversificationType, StoreReply, StoredValue, Substituted, ValueView, FLAG_LOOKUP_FOR_STORE,
    FLAG_OBFUSCATE_LOOKUP,
};
use crate::metric::{obfuscated_key, obfuscated_value};
use crate::operation::{CancelToken, ListenerObserver, OperationListener};
use crate::pools::PoolKind;

/// Result of a put, remove or direct store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PutOutcome {
    /// No unit of the wave completed successfully.
    pub failed: bool,
    /// A storage node presented a valid key block.
    pub key_blocked: bool,
    pub succeeded: usize,
    pub failures: usize,
}

/// Fan-in counter of a store wave.
///
/// Starts holding one unit for the caller that dispatches the wave; the
/// caller gives it back with [`release`](Self::release) once dispatch is
/// over. The listener's `complete` fires exactly once, when the count
/// returns to zero, flagged when the wave timed out or any unit failed.
pub struct CompletionJoin {
    pending: AtomicUsize,
    succeeded: AtomicUsize,
    failures: AtomicUsize,
    key_blocked: AtomicBool,
    timed_out: AtomicBool,
    fired: AtomicBool,
    done: Notify,
    listener: Arc<dyn OperationListener>,
}

impl CompletionJoin {
    pub fn new(listener: Arc<dyn OperationListener>) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicUsize::new(1),
            succeeded: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            key_blocked: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            done: Notify::new(),
            listener,
        })
    }

    pub fn begin(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn complete(&self, ok: bool) {
        if ok {
            self.succeeded.fetch_add(1, Ordering::AcqRel);
        } else {
            self.failures.fetch_add(1, Ordering::AcqRel);
        }
        self.release();
    }

    /// Gives a unit back without counting it as a success or failure.
    pub fn release(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    pub fn mark_key_blocked(&self) {
        self.key_blocked.store(true, Ordering::Release);
    }

    pub fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            let troubled = self.timed_out() || self.failures.load(Ordering::Acquire) > 0;
            self.listener.complete(troubled);
            self.done.notify_waiters();
        }
    }

    pub fn outcome(&self) -> PutOutcome {
        let succeeded = self.succeeded.load(Ordering::Acquire);
        PutOutcome {
            failed: succeeded == 0,
            key_blocked: self.key_blocked.load(Ordering::Acquire),
            succeeded,
            failures: self.failures.load(Ordering::Acquire),
        }
    }

    pub async fn wait(&self) -> PutOutcome {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_done() {
                return self.outcome();
            }
            notified.await;
        }
    }
}

#[derive(Default)]
struct WrittenSet {
    keys: HashSet<NodeId>,
    contacts: HashSet<NodeId>,
}

/// Keys and values sent to a list of contacts.
struct StoreBatch {
    description: String,
    /// A key block swaps the blocked key for random bytes.
    keys: Mutex<Vec<NodeId>>,
    value_sets: Vec<Vec<StoredValue>>,
    obfuscated: Option<(Vec<NodeId>, Vec<Vec<StoredValue>>)>,
    /// Keys already diversified by an earlier reply of this batch.
    diversified: Mutex<Vec<bool>>,
    consider_diversification: bool,
    level: usize,
    immediate: bool,
}

/// One put, remove or direct store in flight.
#[derive(Clone)]
pub(crate) struct StoreWave {
    inner: Arc<ControlInner>,
    join: Arc<CompletionJoin>,
    written: Arc<Mutex<WrittenSet>>,
    listener: Arc<dyn OperationListener>,
    flags: u16,
    pool: PoolKind,
    /// Bounds each pre-store lookup.
    timeout: Option<Duration>,
}

impl StoreWave {
    pub(crate) fn new(
        inner: Arc<ControlInner>,
        listener: Arc<dyn OperationListener>,
        flags: u16,
        pool: PoolKind,
    ) -> Self {
        Self {
            inner,
            join: CompletionJoin::new(listener.clone()),
            written: Arc::new(Mutex::new(WrittenSet::default())),
            listener,
            flags,
            pool,
            timeout: None,
        }
    }

    pub(crate) fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ends dispatch and waits for every unit of the wave.
    pub(crate) async fn finish(self) -> PutOutcome {
        let join = self.join.clone();
        drop(self);
        join.release();
        join.wait().await
    }

    /// Looks up the closest contacts of `key` (and every key it is
    /// currently spread over) and stores `values` there.
    pub(crate) fn put_keys(
        &self,
        key: &NodeId,
        values: Vec<StoredValue>,
        original_mappings: bool,
        level: usize,
        description: &str,
    ) {
        let max_depth = self.inner.max_div_depth();
        let keys = self.inner.adapter.diversify(
            None,
            true,
            true,
            key,
            DiversificationType::None,
            original_mappings,
            max_depth,
        );

        if keys.is_empty() {
            debug!(key = %key.short_hex(), max_depth, "put key is over-diversified");
            self.listener
                .diversified(&format!("Over-diversification of [{description}]"));
            self.join.begin();
            self.join.complete(false);
            return;
        }

        let mut reported = false;
        for encoded in keys {
            if !self.written.lock().keys.insert(encoded.clone()) {
                continue;
            }

            let this_description = if encoded == *key {
                description.to_string()
            } else {
                let derived = format!("Diversification of [{description}]");
                if !reported {
                    reported = true;
                    self.listener.diversified(&derived);
                }
                derived
            };

            self.join.begin();
            let wave = self.clone();
            let values = values.clone();
            tokio::spawn(async move {
                let mut request = LookupRequest::node(
                    encoded.clone(),
                    wave.inner.config.search_concurrency,
                    wave.inner.router().k(),
                )
                .with_flags(wave.flags | FLAG_LOOKUP_FOR_STORE)
                .with_description(this_description.clone());
                request.max_values = 1;
                request.timeout = wave.timeout;

                let observer = Arc::new(ListenerObserver::new(encoded.clone(), wave.listener.clone()));
                let outcome = wave
                    .inner
                    .run_lookup(
                        wave.pool,
                        request,
                        observer,
                        CancelToken::new(),
                    )
                    .await;

                // a timed-out lookup still stores at what it found
                if outcome.timed_out {
                    wave.join.mark_timed_out();
                }
                if outcome.failed {
                    wave.join.begin();
                    wave.join.complete(false);
                } else {
                    wave.store_at(
                        vec![encoded],
                        vec![values],
                        outcome.closest,
                        true,
                        level,
                        false,
                        format!("Store of [{this_description}]"),
                    );
                }
                wave.join.release();
            });
        }
    }

    /// Sends `value_sets` under `keys` to each of `contacts`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn store_at(
        &self,
        keys: Vec<NodeId>,
        value_sets: Vec<Vec<StoredValue>>,
        contacts: Vec<Contact>,
        consider_diversification: bool,
        level: usize,
        immediate: bool,
        description: String,
    ) {
        let max_depth = self.inner.max_div_depth();
        if level > max_depth {
            warn!(level, max_depth, description = %description, "put level exceeded, terminating diversification");
            self.join.begin();
            self.join.complete(false);
            return;
        }

        let storage = &self.inner.storage;
        let (keys, value_sets): (Vec<NodeId>, Vec<Vec<StoredValue>>) = keys
            .into_iter()
            .zip(value_sets)
            .filter(|(key, _)| !storage.is_key_blocked(key))
            .unzip();
        if keys.is_empty() {
            debug!(description = %description, "every key of the store is blocked");
            self.join.mark_key_blocked();
            self.join.begin();
            self.join.complete(false);
            return;
        }

        let obfuscated = if self.flags & FLAG_OBFUSCATE_LOOKUP != 0 {
            if keys.len() != 1 || value_sets[0].len() != 1 {
                warn!(
                    keys = keys.len(),
                    values = value_sets[0].len(),
                    "inconsistent obfuscated store, expected one key and one value"
                );
            }
            value_sets[0].first().map(|value| {
                let marker = Substituted::new(value, obfuscated_value(keys[0].as_bytes())).to_stored();
                (vec![obfuscated_key(&keys[0])], vec![vec![marker]])
            })
        } else {
            None
        };

        let batch = Arc::new(StoreBatch {
            description,
            diversified: Mutex::new(vec![false; keys.len()]),
            keys: Mutex::new(keys),
            value_sets,
            obfuscated,
            consider_diversification,
            level,
            immediate,
        });

        let local_id = self.inner.router().local_id();
        let mut skipped = 0;
        for contact in &contacts {
            if contact.id == local_id || !self.written.lock().contacts.insert(contact.id.clone()) {
                skipped += 1;
                continue;
            }

            for value in batch.value_sets.iter().flatten() {
                self.listener.wrote(contact, value);
            }

            self.join.begin();
            let wave = self.clone();
            let batch = batch.clone();
            let contact = contact.clone();
            tokio::spawn(async move { wave.store_one(contact, batch).await });
        }

        if skipped == contacts.len() {
            trace!(description = %batch.description, "no contact left to store at");
            self.join.begin();
            self.join.complete(true);
        }
    }

    async fn store_one(self, contact: Contact, batch: Arc<StoreBatch>) {
        let keys = batch.keys.lock().clone();
        let transport = self.inner.transport.clone();
        let router = self.inner.router();

        match transport
            .store(&contact, &keys, &batch.value_sets, batch.immediate)
            .await
        {
            Ok(StoreReply::Diversifications(diversifications)) => {
                trace!(contact = %contact, description = %batch.description, "store ok");
                router.contact_alive(&contact);

                let mut div_done = false;
                if batch.consider_diversification {
                    for (j, diversification) in diversifications.iter().enumerate().take(keys.len()) {
                        if *diversification == DiversificationType::None {
                            continue;
                        }
                        let fresh = {
                            let mut done = batch.diversified.lock();
                            !std::mem::replace(&mut done[j], true)
                        };
                        if !fresh {
                            continue;
                        }
                        div_done = true;

                        let derived = self.inner.adapter.diversify(
                            Some(&contact),
                            true,
                            false,
                            &keys[j],
                            *diversification,
                            false,
                            self.inner.max_div_depth(),
                        );
                        debug!(
                            contact = %contact,
                            key = %keys[j].short_hex(),
                            kind = ?diversification,
                            derived = derived.len(),
                            "store diversified"
                        );

                        let description = format!("Diversification of [{}]", batch.description);
                        for key in derived {
                            self.put_keys(
                                &key,
                                batch.value_sets[j].clone(),
                                false,
                                batch.level + 1,
                                &description,
                            );
                        }
                    }
                }

                if !div_done {
                    if let Some((obs_keys, obs_values)) = batch.obfuscated.as_ref() {
                        let ok = match transport
                            .store(&contact, obs_keys, obs_values, batch.immediate)
                            .await
                        {
                            Ok(_) => true,
                            Err(e) => {
                                trace!(contact = %contact, error = %e, "obfuscated store failed");
                                false
                            }
                        };
                        self.join.complete(ok);
                        return;
                    }
                }
                self.join.complete(true);
            }
            Ok(StoreReply::KeyBlocked { request, signature }) => {
                if let Some(block) = self.inner.storage.key_block_request(None, &request, &signature) {
                    debug!(contact = %contact, key = %block.key.short_hex(), "store refused by key block");
                    let mut keys = batch.keys.lock();
                    for key in keys.iter_mut() {
                        if *key == block.key {
                            *key = NodeId::random(key.len());
                        }
                    }
                    self.join.mark_key_blocked();
                }
                self.join.complete(false);
            }
            Err(e) => {
                trace!(contact = %contact, error = %e, "store failed");
                router.contact_dead(&contact.id, false);
                self.join.complete(false);
            }
        }
    }
}
