//! # Iterative Lookup
//!
//! A [`LookupTask`] walks the id space towards a target, probing up to
//! `concurrency` contacts at a time:
//!
//! ```text
//! seed to_query from the router
//! loop:
//!     drain probe events
//!     stop on cancel / deadline / termination rule
//!     launch the next candidate, or wait for an event
//! ```
//!
//! The driver is the only writer of [`LookupState`]. Probes run as spawned
//! tasks and report back over an unbounded channel, so a reply that lands
//! while the driver is going idle is simply picked up on the next wake.
//! Every probe sends exactly one `Released` event when it ends, even if it
//! panics, which keeps the active count honest.
//!
//! Value searches may stream replies (`more_to_come`). Obfuscated value
//! searches query an obfuscated key first and only ask for the real key
//! from a contact that holds the marker value.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, trace};

use crate::activity::{ActivityNode, ActivitySource, ActivityState};
use crate::estimate::SizeEstimator;
use crate::identity::{estimate_rtt, Contact, NodeId};
use crate::messages::{
    DiversificationType, FindValueReply, KeyBlock, StoredValue, FLAG_OBFUSCATE_LOOKUP, FLAG_STATS,
};
use crate::metric::{distance, distance_cmp, obfuscated_key, obfuscated_value};
use crate::operation::CancelToken;
use crate::protocols::{Router, Storage, Transport};

/// Value searches stop after this many complete value replies, unless they
/// are after statistics.
const VALUE_REPLY_LIMIT: usize = 2;

/// Progress hooks of a single lookup. All default to no-ops.
pub trait LookupObserver: Send + Sync {
    fn found(&self, _contact: &Contact, _is_closest: bool) {}

    fn searching(&self, _contact: &Contact, _level: usize, _active: usize) {}

    fn read(&self, _contact: &Contact, _value: &StoredValue) {}

    fn diversify(&self, _cause: &Contact, _diversification: DiversificationType) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl LookupObserver for NoopObserver {}

#[derive(Clone, Debug)]
pub struct LookupRequest {
    pub target: NodeId,
    pub description: String,
    pub flags: u16,
    pub value_search: bool,
    pub timeout: Option<Duration>,
    pub concurrency: usize,
    /// 0 means unbounded.
    pub max_values: usize,
    pub search_accuracy: usize,
}

impl LookupRequest {
    pub fn node(target: NodeId, concurrency: usize, search_accuracy: usize) -> Self {
        Self {
            description: format!("lookup {}", target.short_hex()),
            target,
            flags: 0,
            value_search: false,
            timeout: None,
            concurrency,
            max_values: 0,
            search_accuracy,
        }
    }

    pub fn value(target: NodeId, max_values: usize, concurrency: usize, search_accuracy: usize) -> Self {
        Self {
            description: format!("get {}", target.short_hex()),
            target,
            flags: 0,
            value_search: true,
            timeout: None,
            concurrency,
            max_values,
            search_accuracy,
        }
    }

    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct LookupOutcome {
    /// Closest responders, ascending distance.
    pub closest: Vec<Contact>,
    /// Values with the contact that served them.
    pub values: Vec<(Contact, StoredValue)>,
    pub queried: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    /// The task died before producing a result.
    pub failed: bool,
    pub key_block: Option<KeyBlock>,
    /// Some responder asked for the key to be diversified.
    pub diversified: bool,
}

impl LookupOutcome {
    pub fn failed() -> Self {
        Self {
            failed: true,
            ..Self::default()
        }
    }
}

/// Collaborators a lookup runs against.
#[derive(Clone)]
pub struct LookupEnv {
    pub router: Arc<dyn Router>,
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<dyn Storage>,
    pub estimator: Arc<SizeEstimator>,
}

#[derive(Clone, Debug)]
struct SearchLevel {
    level: usize,
    parent: Option<NodeId>,
}

/// Mutable search state, keyed by XOR distance to the lookup id.
#[derive(Default)]
struct LookupState {
    to_query: BTreeMap<Vec<u8>, Contact>,
    queried: HashMap<NodeId, Contact>,
    ok: BTreeMap<Vec<u8>, Contact>,
    levels: HashMap<NodeId, SearchLevel>,
    values_seen: HashSet<Vec<u8>>,
    values: Vec<(Contact, StoredValue)>,
    active: usize,
    values_found: usize,
    value_replies: usize,
    key_block: Option<KeyBlock>,
    diversified: bool,
    timed_out: bool,
    started: Option<Instant>,
    elapsed: Option<Duration>,
}

struct LookupShared {
    local: Contact,
    value_search: bool,
    state: Mutex<LookupState>,
}

impl ActivitySource for LookupShared {
    fn current_state(&self) -> ActivityState {
        let (mut queried, result) = {
            let state = self.state.lock();
            let queried: Vec<(usize, Option<NodeId>, Contact)> = state
                .queried
                .values()
                .filter(|c| c.id != self.local.id)
                .map(|c| {
                    let level = state.levels.get(&c.id);
                    (
                        level.map_or(0, |l| l.level),
                        level.and_then(|l| l.parent.clone()),
                        c.clone(),
                    )
                })
                .collect();

            let elapsed = state
                .elapsed
                .or_else(|| state.started.map(|s| s.elapsed()))
                .unwrap_or_default();
            let result = if state.timed_out {
                "Timeout".to_string()
            } else if self.value_search {
                format!("{} hits, time={}ms", state.values_found, elapsed.as_millis())
            } else {
                format!("time={}ms", elapsed.as_millis())
            };
            (queried, result)
        };
        queried.sort_by_key(|(level, _, _)| *level);

        let ids: HashSet<NodeId> = queried.iter().map(|(_, _, c)| c.id.clone()).collect();
        let mut children: HashMap<Option<NodeId>, Vec<Contact>> = HashMap::new();
        for (_, parent, contact) in queried {
            let parent = parent.filter(|p| ids.contains(p));
            children.entry(parent).or_default().push(contact);
        }

        fn attach(
            parent: Option<NodeId>,
            children: &mut HashMap<Option<NodeId>, Vec<Contact>>,
        ) -> Vec<ActivityNode> {
            let Some(direct) = children.remove(&parent) else {
                return Vec::new();
            };
            direct
                .into_iter()
                .map(|contact| {
                    let id = contact.id.clone();
                    let mut node = ActivityNode::new(contact);
                    node.children = attach(Some(id), children);
                    node
                })
                .collect()
        }

        let mut root = ActivityNode::new(self.local.clone());
        root.children = attach(None, &mut children);
        ActivityState { root, result }
    }
}

enum Step {
    Launch {
        contact: Contact,
        level: usize,
        active: usize,
        remaining: usize,
    },
    Skip,
    Wait,
    Terminate,
}

enum ProbeEvent {
    Nodes {
        from: Contact,
        contacts: Vec<Contact>,
    },
    Values {
        from: Contact,
        values: Vec<StoredValue>,
        diversification: DiversificationType,
        final_batch: bool,
    },
    KeyBlock {
        request: Vec<u8>,
        signature: Vec<u8>,
    },
    Failed {
        contact: Contact,
        had_value_reply: bool,
    },
    Released,
}

/// Probe side of the event channel. Dropping it releases the probe slot.
struct ProbeReporter {
    tx: mpsc::UnboundedSender<ProbeEvent>,
}

impl ProbeReporter {
    fn send(&self, event: ProbeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Drop for ProbeReporter {
    fn drop(&mut self) {
        let _ = self.tx.send(ProbeEvent::Released);
    }
}

pub struct LookupTask {
    env: LookupEnv,
    request: LookupRequest,
    lookup_id: NodeId,
    marker: Option<Arc<Vec<u8>>>,
    shared: Arc<LookupShared>,
    observer: Arc<dyn LookupObserver>,
    cancel: CancelToken,
}

impl LookupTask {
    pub fn new(
        env: LookupEnv,
        mut request: LookupRequest,
        observer: Arc<dyn LookupObserver>,
        cancel: CancelToken,
    ) -> Self {
        request.concurrency = request.concurrency.max(1);
        request.search_accuracy = request.search_accuracy.max(1);

        let obfuscate = request.flags & FLAG_OBFUSCATE_LOOKUP != 0;
        let lookup_id = if obfuscate {
            obfuscated_key(&request.target)
        } else {
            request.target.clone()
        };
        let marker = (obfuscate && request.value_search)
            .then(|| Arc::new(obfuscated_value(request.target.as_bytes())));

        let shared = Arc::new(LookupShared {
            local: env.router.local_contact(),
            value_search: request.value_search,
            state: Mutex::new(LookupState::default()),
        });

        Self {
            env,
            request,
            lookup_id,
            marker,
            shared,
            observer,
            cancel,
        }
    }

    /// The id actually searched for.
    pub fn lookup_id(&self) -> &NodeId {
        &self.lookup_id
    }

    pub fn request(&self) -> &LookupRequest {
        &self.request
    }

    pub fn activity_source(&self) -> Weak<dyn ActivitySource> {
        let shared: Arc<dyn ActivitySource> = self.shared.clone();
        Arc::downgrade(&shared)
    }

    pub async fn run(self) -> LookupOutcome {
        let started = Instant::now();
        self.shared.state.lock().started = Some(started);
        let deadline = self.request.timeout.map(|t| started + t);

        if self.request.value_search && self.env.storage.is_key_blocked(&self.request.target) {
            debug!(
                target = %self.request.target.short_hex(),
                "value search on locally blocked key"
            );
            return self.finish(false, false, Vec::new());
        }

        let seeds = self
            .env
            .router
            .find_closest_contacts(&self.lookup_id, self.env.router.k(), false);
        {
            let mut state = self.shared.state.lock();
            for contact in &seeds {
                state.levels.insert(
                    contact.id.clone(),
                    SearchLevel {
                        level: 0,
                        parent: None,
                    },
                );
                state
                    .to_query
                    .insert(distance(&contact.id, &self.lookup_id), contact.clone());
            }
        }
        for contact in &seeds {
            self.observer.found(contact, false);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut probes: Vec<JoinHandle<()>> = Vec::new();
        let mut timed_out = false;
        let mut cancelled = false;

        loop {
            while let Ok(event) = rx.try_recv() {
                self.handle(event);
            }

            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                timed_out = true;
                break;
            }

            match self.next_step() {
                Step::Launch {
                    contact,
                    level,
                    active,
                    remaining,
                } => {
                    self.observer.searching(&contact, level, active);
                    probes.retain(|p| !p.is_finished());
                    probes.push(self.launch(contact, remaining, tx.clone()));
                }
                Step::Skip => {}
                Step::Terminate => break,
                Step::Wait => {
                    tokio::select! {
                        event = rx.recv() => {
                            if let Some(event) = event {
                                self.handle(event);
                            }
                        }
                        _ = wait_deadline(deadline) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
            }
        }

        self.finish(timed_out, cancelled, probes)
    }

    fn next_step(&self) -> Step {
        let request = &self.request;
        let mut state = self.shared.state.lock();

        if request.value_search {
            if request.max_values > 0 && state.values_found >= request.max_values {
                return Step::Terminate;
            }
            if request.flags & FLAG_STATS == 0 && state.value_replies >= VALUE_REPLY_LIMIT {
                return Step::Terminate;
            }
        }

        if state.active >= request.concurrency {
            return Step::Wait;
        }

        if state.key_block.is_some() {
            state.to_query.clear();
        }

        let Some(closest) = state.to_query.keys().next().cloned() else {
            return if state.active == 0 {
                Step::Terminate
            } else {
                Step::Wait
            };
        };

        if state.ok.len() >= request.search_accuracy {
            if let Some(furthest) = state.ok.keys().next_back() {
                if distance_cmp(furthest, &closest) != Ordering::Greater {
                    return Step::Terminate;
                }
            }
        }

        let mut chosen = closest;
        if state.queried.len() < request.concurrency {
            if let Some(local_position) = self.shared.local.position.as_ref() {
                let scan = (request.concurrency * 2).saturating_sub(state.queried.len());
                let mut best: Option<(f32, &Vec<u8>)> = None;
                for (dist, contact) in state.to_query.iter().take(scan) {
                    let rtt = estimate_rtt(Some(local_position), contact.position.as_ref());
                    if rtt.is_nan() {
                        continue;
                    }
                    if best.map_or(true, |(b, _)| rtt < b) {
                        best = Some((rtt, dist));
                    }
                }
                if let Some((_, dist)) = best {
                    chosen = dist.clone();
                }
            }
        }

        let Some(contact) = state.to_query.remove(&chosen) else {
            return Step::Skip;
        };
        state.queried.insert(contact.id.clone(), contact.clone());
        if contact.id == self.shared.local.id {
            return Step::Skip;
        }

        state.active += 1;
        let level = state.levels.get(&contact.id).map_or(0, |l| l.level);
        let remaining = if request.max_values == 0 {
            0
        } else {
            request.max_values.saturating_sub(state.values_found).max(1)
        };
        Step::Launch {
            contact,
            level,
            active: state.active,
            remaining,
        }
    }

    fn launch(
        &self,
        contact: Contact,
        remaining: usize,
        tx: mpsc::UnboundedSender<ProbeEvent>,
    ) -> JoinHandle<()> {
        let reporter = ProbeReporter { tx };
        let transport = self.env.transport.clone();
        let key = self.lookup_id.clone();
        let flags = self.request.flags;

        if self.request.value_search {
            let real = self
                .marker
                .clone()
                .map(|marker| (marker, self.request.target.clone()));
            tokio::spawn(probe_values(
                transport, contact, key, real, remaining, flags, reporter,
            ))
        } else {
            tokio::spawn(probe_node(transport, contact, key, flags, reporter))
        }
    }

    fn handle(&self, event: ProbeEvent) {
        match event {
            ProbeEvent::Nodes { from, contacts } => self.handle_nodes(from, contacts),
            ProbeEvent::Values {
                from,
                values,
                diversification,
                final_batch,
            } => self.handle_values(from, values, diversification, final_batch),
            ProbeEvent::KeyBlock { request, signature } => {
                if let Some(block) = self.env.storage.key_block_request(None, &request, &signature) {
                    debug!(key = %block.key.short_hex(), "lookup hit a key block");
                    self.shared.state.lock().key_block = Some(block);
                }
            }
            ProbeEvent::Failed {
                contact,
                had_value_reply,
            } => {
                if !had_value_reply {
                    self.env.router.contact_dead(&contact.id, false);
                }
            }
            ProbeEvent::Released => {
                let mut state = self.shared.state.lock();
                state.active = state.active.saturating_sub(1);
            }
        }
    }

    fn handle_nodes(&self, from: Contact, contacts: Vec<Contact>) {
        self.env.router.contact_alive(&from);
        for contact in &contacts {
            if contact.id != self.shared.local.id {
                self.env.router.contact_known(contact, false);
            }
        }

        let mut fresh = Vec::new();
        {
            let mut state = self.shared.state.lock();
            let level = state.levels.get(&from.id).map_or(0, |l| l.level);

            state
                .ok
                .insert(distance(&from.id, &self.lookup_id), from.clone());
            while state.ok.len() > self.request.search_accuracy {
                state.ok.pop_last();
            }

            for contact in contacts {
                if contact.id.len() != self.lookup_id.len() || state.queried.contains_key(&contact.id) {
                    continue;
                }
                let dist = distance(&contact.id, &self.lookup_id);
                if state.to_query.contains_key(&dist) {
                    continue;
                }
                state.levels.entry(contact.id.clone()).or_insert(SearchLevel {
                    level: level + 1,
                    parent: Some(from.id.clone()),
                });
                state.to_query.insert(dist, contact.clone());
                fresh.push(contact);
            }
        }

        trace!(from = %from, fresh = fresh.len(), "find_node reply");
        for contact in &fresh {
            self.observer.found(contact, false);
        }
    }

    fn handle_values(
        &self,
        from: Contact,
        values: Vec<StoredValue>,
        diversification: DiversificationType,
        final_batch: bool,
    ) {
        let report_diversification = diversification != DiversificationType::None
            && self.request.flags & FLAG_STATS == 0
            && {
                let mut state = self.shared.state.lock();
                let blocked = state.key_block.is_some();
                if !blocked {
                    state.diversified = true;
                }
                !blocked
            };
        if report_diversification {
            self.observer.diversify(&from, diversification);
        }

        self.env.router.contact_alive(&from);

        let mut fresh = Vec::new();
        {
            let mut state = self.shared.state.lock();
            // nothing is read past an accepted key block
            let values = if state.key_block.is_some() {
                Vec::new()
            } else {
                values
            };
            for value in values {
                if self.request.max_values > 0 && state.values_found >= self.request.max_values {
                    break;
                }
                if state.values_seen.insert(value.dedup_key()) {
                    state.values_found += 1;
                    state.values.push((from.clone(), value.clone()));
                    fresh.push(value);
                }
            }
            if final_batch {
                state.value_replies += 1;
            }
        }

        trace!(from = %from, fresh = fresh.len(), final_batch, "find_value reply");
        for value in &fresh {
            self.observer.read(&from, value);
        }
    }

    fn finish(&self, timed_out: bool, cancelled: bool, probes: Vec<JoinHandle<()>>) -> LookupOutcome {
        for probe in probes {
            probe.abort();
        }

        let (closest, queried, values, key_block, diversified, elapsed) = {
            let mut state = self.shared.state.lock();
            let elapsed = state.started.map(|s| s.elapsed()).unwrap_or_default();
            state.timed_out = timed_out;
            state.elapsed = Some(elapsed);
            (
                state.ok.values().cloned().collect::<Vec<_>>(),
                state.queried.values().cloned().collect::<Vec<_>>(),
                std::mem::take(&mut state.values),
                state.key_block.clone(),
                state.diversified,
                elapsed,
            )
        };

        if !self.request.value_search && self.request.timeout.is_none() && !cancelled {
            let (contacts, replacements) = self.env.router.stats();
            self.env.estimator.record_lookup(
                &self.lookup_id,
                queried.clone(),
                self.request.search_accuracy,
                contacts + replacements,
            );
        }

        debug!(
            target = %self.lookup_id.short_hex(),
            description = %self.request.description,
            closest = closest.len(),
            values = values.len(),
            queried = queried.len(),
            timed_out,
            cancelled,
            elapsed_ms = elapsed.as_millis() as u64,
            "lookup complete"
        );

        LookupOutcome {
            closest,
            values,
            queried: queried.len(),
            timed_out,
            cancelled,
            failed: false,
            key_block,
            diversified,
        }
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn probe_node(
    transport: Arc<dyn Transport>,
    mut contact: Contact,
    target: NodeId,
    flags: u16,
    reporter: ProbeReporter,
) {
    match transport.find_node(&contact, &target, flags).await {
        Ok(reply) => {
            if let Some(token) = reply.spoof_token {
                contact.apply_token(token);
            }
            reporter.send(ProbeEvent::Nodes {
                from: contact,
                contacts: reply.contacts,
            });
        }
        Err(e) => {
            trace!(contact = %contact, error = %e, "find_node probe failed");
            reporter.send(ProbeEvent::Failed {
                contact,
                had_value_reply: false,
            });
        }
    }
}

/// Queries `key` at `contact`. With `real` set, `key` is obfuscated and a
/// marker payload sends the probe on to the real key, once.
async fn probe_values(
    transport: Arc<dyn Transport>,
    mut contact: Contact,
    key: NodeId,
    real: Option<(Arc<Vec<u8>>, NodeId)>,
    max_values: usize,
    flags: u16,
    reporter: ProbeReporter,
) {
    let mut had_reply = false;
    let mut replies = transport.find_value(&contact, &key, max_values, flags);

    while let Some(reply) = replies.next().await {
        match reply {
            Ok(FindValueReply::Values {
                mut values,
                diversification,
                more_to_come,
                spoof_token,
            }) => {
                had_reply = true;
                if let Some(token) = spoof_token {
                    contact.apply_token(token);
                }

                if let Some((marker, real_key)) = real.as_ref() {
                    if let Some(pos) = values.iter().position(|v| v.payload == **marker) {
                        values.truncate(pos);
                        if !values.is_empty() {
                            reporter.send(ProbeEvent::Values {
                                from: contact.clone(),
                                values,
                                diversification,
                                final_batch: false,
                            });
                        }
                        drop(replies);
                        probe_real_key(transport, contact, real_key, flags, reporter).await;
                        return;
                    }
                }

                let final_batch = !more_to_come;
                reporter.send(ProbeEvent::Values {
                    from: contact.clone(),
                    values,
                    diversification,
                    final_batch,
                });
                if final_batch {
                    return;
                }
            }
            Ok(FindValueReply::Contacts(reply)) => {
                if let Some(token) = reply.spoof_token {
                    contact.apply_token(token);
                }
                reporter.send(ProbeEvent::Nodes {
                    from: contact,
                    contacts: reply.contacts,
                });
                return;
            }
            Ok(FindValueReply::KeyBlocked { request, signature }) => {
                reporter.send(ProbeEvent::KeyBlock { request, signature });
                return;
            }
            Err(e) => {
                trace!(contact = %contact, error = %e, had_reply, "find_value probe failed");
                reporter.send(ProbeEvent::Failed {
                    contact,
                    had_value_reply: had_reply,
                });
                return;
            }
        }
    }

    if !had_reply {
        reporter.send(ProbeEvent::Failed {
            contact,
            had_value_reply: false,
        });
    }
}

/// Second leg of an obfuscated probe. Only undiversified value batches and
/// key blocks are passed on; anything else ends the probe.
async fn probe_real_key(
    transport: Arc<dyn Transport>,
    contact: Contact,
    key: &NodeId,
    flags: u16,
    reporter: ProbeReporter,
) {
    let flags = flags & !FLAG_OBFUSCATE_LOOKUP;
    let mut replies = transport.find_value(&contact, key, 1, flags);
    while let Some(reply) = replies.next().await {
        match reply {
            Ok(FindValueReply::Values {
                values,
                diversification: DiversificationType::None,
                more_to_come,
                ..
            }) => {
                reporter.send(ProbeEvent::Values {
                    from: contact.clone(),
                    values,
                    diversification: DiversificationType::None,
                    final_batch: !more_to_come,
                });
                if !more_to_come {
                    return;
                }
            }
            Ok(FindValueReply::KeyBlocked { request, signature }) => {
                reporter.send(ProbeEvent::KeyBlock { request, signature });
                return;
            }
            Ok(_) => return,
            Err(e) => {
                trace!(contact = %contact, error = %e, "real key probe failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Liveness;
    use crate::messages::{FindNodeReply, StoreReply};
    use crate::routing::MemoryRouter;
    use crate::storage::MemoryStorage;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tokio::time::sleep;

    fn id(byte: u8) -> NodeId {
        let mut bytes = vec![0u8; 20];
        bytes[0] = byte;
        NodeId::from_bytes(bytes)
    }

    fn contact(byte: u8) -> Contact {
        Contact::new(
            id(byte),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, byte)), 4000),
        )
    }

    fn value(from: u8, payload: &[u8]) -> StoredValue {
        StoredValue::new(contact(from), payload.to_vec(), 0)
    }

    type ValueScript = Vec<std::result::Result<FindValueReply, String>>;

    /// Transport that answers from fixed tables.
    #[derive(Default)]
    struct ScriptedTransport {
        nodes: HashMap<NodeId, Vec<Contact>>,
        values: HashMap<(NodeId, NodeId), ValueScript>,
        silent: HashSet<NodeId>,
        /// Answer only after this long.
        slow: HashMap<NodeId, Duration>,
        calls: Mutex<Vec<(NodeId, NodeId)>>,
    }

    impl ScriptedTransport {
        fn calls(&self) -> Vec<(NodeId, NodeId)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn find_node(&self, to: &Contact, target: &NodeId, _flags: u16) -> Result<FindNodeReply> {
            self.calls.lock().push((to.id.clone(), target.clone()));
            if self.silent.contains(&to.id) {
                std::future::pending::<()>().await;
            }
            if let Some(delay) = self.slow.get(&to.id) {
                sleep(*delay).await;
            }
            match self.nodes.get(&to.id) {
                Some(contacts) => Ok(FindNodeReply {
                    contacts: contacts.clone(),
                    spoof_token: None,
                }),
                None => Err(anyhow!("injected network failure")),
            }
        }

        fn find_value(
            &self,
            to: &Contact,
            key: &NodeId,
            _max_values: usize,
            _flags: u16,
        ) -> BoxStream<'static, Result<FindValueReply>> {
            self.calls.lock().push((to.id.clone(), key.clone()));
            if self.silent.contains(&to.id) {
                return stream::pending().boxed();
            }
            if let Some(script) = self.values.get(&(to.id.clone(), key.clone())) {
                let items: Vec<Result<FindValueReply>> = script
                    .iter()
                    .map(|item| item.clone().map_err(|e| anyhow!(e)))
                    .collect();
                let delay = self.slow.get(&to.id).copied().unwrap_or_default();
                return stream::once(async move {
                    sleep(delay).await;
                    stream::iter(items)
                })
                .flatten()
                .boxed();
            }
            let item = match self.nodes.get(&to.id) {
                Some(contacts) => Ok(FindValueReply::Contacts(FindNodeReply {
                    contacts: contacts.clone(),
                    spoof_token: None,
                })),
                None => Err(anyhow!("injected network failure")),
            };
            stream::iter(vec![item]).boxed()
        }

        async fn store(
            &self,
            _to: &Contact,
            keys: &[NodeId],
            _value_sets: &[Vec<StoredValue>],
            _immediate: bool,
        ) -> Result<StoreReply> {
            Ok(StoreReply::Diversifications(vec![DiversificationType::None; keys.len()]))
        }

        async fn ping(&self, _to: &Contact) -> Result<()> {
            Ok(())
        }

        async fn key_block(&self, _to: &Contact, _request: &[u8], _signature: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        router: Arc<MemoryRouter>,
        storage: Arc<MemoryStorage>,
        transport: Arc<ScriptedTransport>,
    }

    impl Fixture {
        fn new(transport: ScriptedTransport, seeds: &[Contact]) -> Self {
            let local = contact(0);
            let router = Arc::new(MemoryRouter::new(local.clone(), 20));
            for seed in seeds {
                router.contact_known(seed, true);
            }
            Self {
                router,
                storage: Arc::new(MemoryStorage::new(local.id)),
                transport: Arc::new(transport),
            }
        }

        fn env(&self) -> LookupEnv {
            LookupEnv {
                router: self.router.clone(),
                transport: self.transport.clone(),
                storage: self.storage.clone(),
                estimator: Arc::new(SizeEstimator::new()),
            }
        }

        fn task(&self, request: LookupRequest) -> LookupTask {
            LookupTask::new(self.env(), request, Arc::new(NoopObserver), CancelToken::new())
        }
    }

    #[tokio::test]
    async fn single_silent_seed_terminates_with_it() {
        let x = contact(0x80);
        let mut transport = ScriptedTransport::default();
        transport.nodes.insert(x.id.clone(), Vec::new());
        let fixture = Fixture::new(transport, &[x.clone()]);

        let outcome = fixture.task(LookupRequest::node(id(0x10), 1, 1)).run().await;

        assert_eq!(outcome.closest, vec![x.clone()]);
        assert!(!outcome.timed_out);
        assert!(!outcome.failed);
        assert_eq!(outcome.queried, 1);
        assert_eq!(fixture.router.liveness(&x.id), Some(Liveness::Alive));
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_seed_times_out_empty() {
        let x = contact(0x80);
        let mut transport = ScriptedTransport::default();
        transport.silent.insert(x.id.clone());
        let fixture = Fixture::new(transport, &[x]);

        let start = Instant::now();
        let outcome = fixture
            .task(LookupRequest::node(id(0x10), 1, 1).with_timeout(Duration::from_millis(500)))
            .run()
            .await;

        assert!(outcome.timed_out);
        assert!(outcome.closest.is_empty());
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500));
        assert!(waited < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn walks_towards_target_and_bounds_ok() {
        let (a, b, c, d, e) = (contact(0x80), contact(0x40), contact(0x20), contact(0x11), contact(0x12));
        let mut transport = ScriptedTransport::default();
        transport.nodes.insert(a.id.clone(), vec![b.clone(), c.clone()]);
        transport.nodes.insert(b.id.clone(), vec![d.clone()]);
        transport.nodes.insert(c.id.clone(), vec![d.clone(), e.clone()]);
        transport.nodes.insert(d.id.clone(), Vec::new());
        transport.nodes.insert(e.id.clone(), Vec::new());
        let fixture = Fixture::new(transport, &[a]);

        let task = fixture.task(LookupRequest::node(id(0x10), 1, 2));
        let shared = task.shared.clone();
        let outcome = task.run().await;

        assert_eq!(outcome.closest, vec![d, e]);
        assert_eq!(outcome.queried, 4);
        // B was never needed
        assert!(!fixture.transport.calls().iter().any(|(to, _)| *to == b.id));

        let state = shared.state.lock();
        assert!(state.ok.len() <= 2);
        for contact in state.to_query.values() {
            assert!(!state.queried.contains_key(&contact.id));
        }
    }

    #[tokio::test]
    async fn self_in_reply_is_not_probed() {
        let x = contact(0x80);
        let mut transport = ScriptedTransport::default();
        transport.nodes.insert(x.id.clone(), vec![contact(0)]);
        let fixture = Fixture::new(transport, &[x]);

        let outcome = fixture.task(LookupRequest::node(id(0x10), 1, 5)).run().await;

        assert_eq!(fixture.transport.calls().len(), 1);
        assert_eq!(outcome.queried, 2);
    }

    #[tokio::test]
    async fn partial_value_reply_keeps_contact_alive() {
        let x = contact(0x80);
        let target = id(0x10);
        let mut transport = ScriptedTransport::default();
        transport.values.insert(
            (x.id.clone(), target.clone()),
            vec![
                Ok(FindValueReply::Values {
                    values: vec![value(9, b"first")],
                    diversification: DiversificationType::None,
                    more_to_come: true,
                    spoof_token: None,
                }),
                Err("connection reset".to_string()),
            ],
        );
        let fixture = Fixture::new(transport, &[x.clone()]);

        let outcome = fixture.task(LookupRequest::value(target, 0, 1, 1)).run().await;

        assert_eq!(outcome.values.len(), 1);
        assert_eq!(fixture.router.liveness(&x.id), Some(Liveness::Alive));
    }

    #[tokio::test]
    async fn failed_probe_marks_contact_dead() {
        let x = contact(0x80);
        let fixture = Fixture::new(ScriptedTransport::default(), &[x.clone()]);

        let outcome = fixture.task(LookupRequest::value(id(0x10), 0, 1, 1)).run().await;

        assert!(outcome.values.is_empty());
        assert_eq!(fixture.router.liveness(&x.id), Some(Liveness::Dead));
    }

    #[derive(Default)]
    struct CountingObserver {
        reads: AtomicUsize,
        diversifications: AtomicUsize,
    }

    impl LookupObserver for CountingObserver {
        fn read(&self, _contact: &Contact, _value: &StoredValue) {
            self.reads.fetch_add(1, AtomicOrdering::SeqCst);
        }

        fn diversify(&self, _cause: &Contact, _diversification: DiversificationType) {
            self.diversifications.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    #[tokio::test]
    async fn values_are_deduplicated_across_responders() {
        let (x, y) = (contact(0x80), contact(0x40));
        let target = id(0x10);
        let shared = value(9, b"shared");
        let mut transport = ScriptedTransport::default();
        transport.values.insert(
            (x.id.clone(), target.clone()),
            vec![Ok(FindValueReply::Values {
                values: vec![shared.clone(), value(9, b"from-x")],
                diversification: DiversificationType::Frequency,
                more_to_come: false,
                spoof_token: None,
            })],
        );
        transport.values.insert(
            (y.id.clone(), target.clone()),
            vec![Ok(FindValueReply::Values {
                values: vec![shared, value(9, b"from-y")],
                diversification: DiversificationType::None,
                more_to_come: false,
                spoof_token: None,
            })],
        );
        let fixture = Fixture::new(transport, &[x, y]);
        let observer = Arc::new(CountingObserver::default());

        let task = LookupTask::new(
            fixture.env(),
            LookupRequest::value(target, 0, 2, 20),
            observer.clone(),
            CancelToken::new(),
        );
        let outcome = task.run().await;

        assert_eq!(outcome.values.len(), 3);
        assert_eq!(observer.reads.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(observer.diversifications.load(AtomicOrdering::SeqCst), 1);
        assert!(outcome.diversified);
    }

    #[tokio::test]
    async fn obfuscated_search_follows_marker_once() {
        let x = contact(0x80);
        let target = id(0x10);
        let hidden = obfuscated_key(&target);
        let marker = StoredValue::new(contact(9), obfuscated_value(target.as_bytes()), 0);
        let real = value(9, b"real");

        let mut transport = ScriptedTransport::default();
        transport.values.insert(
            (x.id.clone(), hidden.clone()),
            vec![Ok(FindValueReply::Values {
                values: vec![marker],
                diversification: DiversificationType::None,
                more_to_come: false,
                spoof_token: None,
            })],
        );
        transport.values.insert(
            (x.id.clone(), target.clone()),
            vec![Ok(FindValueReply::Values {
                values: vec![real.clone()],
                diversification: DiversificationType::None,
                more_to_come: false,
                spoof_token: None,
            })],
        );
        let fixture = Fixture::new(transport, &[x.clone()]);

        let outcome = fixture
            .task(LookupRequest::value(target.clone(), 1, 1, 1).with_flags(FLAG_OBFUSCATE_LOOKUP))
            .run()
            .await;

        assert_eq!(outcome.values.len(), 1);
        assert_eq!(outcome.values[0].1, real);
        assert_eq!(
            fixture.transport.calls(),
            vec![(x.id.clone(), hidden), (x.id, target)]
        );
    }

    #[tokio::test]
    async fn blocked_key_value_search_sends_nothing() {
        let authority = [7u8; 32];
        let x = contact(0x80);
        let fixture = Fixture::new(ScriptedTransport::default(), &[x]);
        let storage = Arc::new(MemoryStorage::new(id(0)).with_block_authority(authority));
        let target = id(0x10);
        let request = target.as_bytes().to_vec();
        let signature = MemoryStorage::sign_block_request(&authority, &request);
        assert!(storage.key_block_request(None, &request, &signature).is_some());

        let mut env = fixture.env();
        env.storage = storage;
        let outcome = LookupTask::new(
            env,
            LookupRequest::value(target, 0, 1, 1),
            Arc::new(NoopObserver),
            CancelToken::new(),
        )
        .run()
        .await;

        assert!(outcome.values.is_empty());
        assert!(!outcome.timed_out);
        assert!(fixture.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn values_after_key_block_are_ignored() {
        let authority = [7u8; 32];
        let (x, y) = (contact(0x80), contact(0x40));
        let target = id(0x10);
        let request = target.as_bytes().to_vec();
        let signature = MemoryStorage::sign_block_request(&authority, &request);

        let mut transport = ScriptedTransport::default();
        transport.values.insert(
            (x.id.clone(), target.clone()),
            vec![Ok(FindValueReply::KeyBlocked { request, signature })],
        );
        transport.values.insert(
            (y.id.clone(), target.clone()),
            vec![Ok(FindValueReply::Values {
                values: vec![value(9, b"late")],
                diversification: DiversificationType::None,
                more_to_come: false,
                spoof_token: None,
            })],
        );
        transport.slow.insert(y.id.clone(), Duration::from_millis(50));
        let fixture = Fixture::new(transport, &[x, y.clone()]);

        let mut env = fixture.env();
        env.storage = Arc::new(MemoryStorage::new(id(0)).with_block_authority(authority));
        let observer = Arc::new(CountingObserver::default());
        let outcome = LookupTask::new(
            env,
            LookupRequest::value(target, 0, 2, 20),
            observer.clone(),
            CancelToken::new(),
        )
        .run()
        .await;

        assert!(outcome.key_block.is_some());
        assert!(outcome.values.is_empty());
        assert_eq!(observer.reads.load(AtomicOrdering::SeqCst), 0);
        // the late responder still answered
        assert_eq!(fixture.router.liveness(&y.id), Some(Liveness::Alive));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_lookup_keeps_what_answered() {
        let (fast, stalled) = (contact(0x20), contact(0x80));
        let mut transport = ScriptedTransport::default();
        transport.nodes.insert(fast.id.clone(), Vec::new());
        transport.silent.insert(stalled.id.clone());
        let fixture = Fixture::new(transport, &[fast.clone(), stalled]);

        let outcome = fixture
            .task(LookupRequest::node(id(0x10), 2, 2).with_timeout(Duration::from_millis(500)))
            .run()
            .await;

        assert!(outcome.timed_out);
        assert_eq!(outcome.closest, vec![fast]);
    }

    #[tokio::test]
    async fn cancelled_lookup_keeps_what_answered() {
        let (fast, stalled) = (contact(0x20), contact(0x80));
        let mut transport = ScriptedTransport::default();
        transport.nodes.insert(fast.id.clone(), Vec::new());
        transport.silent.insert(stalled.id.clone());
        let fixture = Fixture::new(transport, &[fast.clone(), stalled]);
        let cancel = CancelToken::new();

        let task = LookupTask::new(
            fixture.env(),
            LookupRequest::node(id(0x10), 2, 2),
            Arc::new(NoopObserver),
            cancel.clone(),
        );
        let handle = tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("lookup ended")
            .expect("lookup task");
        assert!(outcome.cancelled);
        assert_eq!(outcome.closest, vec![fast]);
    }

    #[tokio::test]
    async fn cancel_wakes_idle_lookup() {
        let x = contact(0x80);
        let mut transport = ScriptedTransport::default();
        transport.silent.insert(x.id.clone());
        let fixture = Fixture::new(transport, &[x]);
        let cancel = CancelToken::new();

        let task = LookupTask::new(
            fixture.env(),
            LookupRequest::node(id(0x10), 1, 1),
            Arc::new(NoopObserver),
            cancel.clone(),
        );
        let handle = tokio::spawn(task.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("lookup ended")
            .expect("lookup task");
        assert!(outcome.cancelled);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn activity_tree_nests_by_parent() {
        let (a, b) = (contact(0x80), contact(0x20));
        let mut transport = ScriptedTransport::default();
        transport.nodes.insert(a.id.clone(), vec![b.clone()]);
        transport.nodes.insert(b.id.clone(), Vec::new());
        let fixture = Fixture::new(transport, &[a]);

        let task = fixture.task(LookupRequest::node(id(0x10), 1, 5));
        let shared = task.shared.clone();
        task.run().await;

        let state = shared.current_state();
        assert_eq!(state.root.to_string(), "10.0.0.0 - [10.0.0.128 - [10.0.0.32 - ]]");
        assert_eq!(state.depth(), 2);
        assert!(state.result.starts_with("time="));
    }
}
