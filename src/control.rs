//! # Control Core
//!
//! [`DhtControl`] is the public face of the control plane. It ties the
//! collaborators together and exposes three groups of operations:
//!
//! | Group | Operations |
//! |-------|------------|
//! | Outbound | `put`, `get`, `lookup`, `remove` and their encoded/direct variants |
//! | Inbound | `handle_ping`, `handle_store`, `handle_find_node`, `handle_find_value`, ... |
//! | Lifecycle | seeding, sleep/suspend, router replacement, maintenance, state export |
//!
//! Outbound operations resolve to an outcome rather than an error: network
//! trouble only ever shows up as `failed`/`timed_out` flags. Every lookup
//! runs as a task on one of the [`AdmissionPools`] and is registered with
//! the [`ActivityTracker`] while it lives.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::activity::{ActivityEntry, ActivityEvent, ActivityState, ActivityTracker};
use crate::config::ControlConfig;
use crate::error::ControlError;
use crate::estimate::SizeEstimator;
use crate::identity::{Contact, Liveness, NodeId};
use crate::lookup::{LookupEnv, LookupObserver, LookupOutcome, LookupRequest, LookupTask, NoopObserver};
use crate::messages::{
    anonymize_values, deserialize_bounded, now_millis, serialize_bounded, DiversificationType,
    FindNodeReply, FindValueReply, KeyBlock, QueryStoreReply, StoreReply, StoredValue,
    FLAG_HIGH_PRIORITY, FLAG_STATS,
};
use crate::metric::{compare, sort_by_distance, KeyEncoder};
use crate::operation::{CancelToken, OperationListener, TaskSet};
use crate::pools::{AdmissionPools, PoolKind};
use crate::protocols::{DiversificationAdapter, Router, Storage, Transport};
use crate::replication::{CompletionJoin, PutOutcome, StoreWave};
use crate::spoof::{SpoofGuard, SpoofToken};

/// A rejected cache-forward originator is not reconsidered for this long.
pub(crate) const CACHE_FORWARD_REJECT_WINDOW: Duration = Duration::from_secs(10);

/// Seeding searches with this multiple of the normal concurrency.
const SEED_CONCURRENCY_FACTOR: usize = 4;

/// Non-waiting seeds sleep out the integration period only if at least
/// this much of it is left.
const MIN_INTEGRATION_REMAINDER: Duration = Duration::from_millis(500);

/// Contacts carried over when the router is replaced.
const ROUTER_CARRY_FILL: usize = 32;
const ROUTER_CARRY_MAX: usize = 128;

/// Parallel pings issued by `ping_all`.
const PING_ALL_CONCURRENCY: usize = 32;

#[derive(Clone, Copy, Debug, Default)]
pub struct PutOptions {
    /// Request flags; the low byte is stored with the value.
    /// `FLAG_HIGH_PRIORITY` admits the put's lookups ahead of normal ones.
    pub flags: u16,
    pub life_hours: u8,
    pub replication_control: u8,
    /// Bounds each lookup ahead of a store.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct GetOptions {
    /// `FLAG_HIGH_PRIORITY` admits the get's lookups ahead of normal ones.
    pub flags: u16,
    /// 0 means unbounded.
    pub max_values: usize,
    pub timeout: Option<Duration>,
    /// Search every derived key instead of a sample.
    pub exhaustive: bool,
    /// Cancelling this set stops the get and all its diversified sub-gets.
    pub tasks: TaskSet,
}

#[derive(Clone, Debug, Default)]
pub struct GetOutcome {
    pub values: Vec<(Contact, StoredValue)>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub diversified: bool,
    pub key_block: Option<KeyBlock>,
}

#[derive(Clone, Debug, Default)]
pub struct RemoveOutcome {
    /// The value this node had published, if any.
    pub previous: Option<StoredValue>,
    pub outcome: PutOutcome,
}

pub(crate) struct ControlInner {
    pub(crate) config: ControlConfig,
    pub(crate) encoder: KeyEncoder,
    router: RwLock<Arc<dyn Router>>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) adapter: Arc<dyn DiversificationAdapter>,
    pub(crate) pools: AdmissionPools,
    pub(crate) spoof: SpoofGuard,
    pub(crate) estimator: Arc<SizeEstimator>,
    pub(crate) activity: Arc<ActivityTracker>,
    seeded: AtomicBool,
    sleeping: AtomicBool,
    suspended: AtomicBool,
    last_lookup: Mutex<Instant>,
    rejected_forward: Mutex<Option<(NodeId, Instant)>>,
    imported: Mutex<HashSet<NodeId>>,
}

impl ControlInner {
    pub(crate) fn router(&self) -> Arc<dyn Router> {
        self.router.read().clone()
    }

    fn lookup_env(&self) -> LookupEnv {
        LookupEnv {
            router: self.router(),
            transport: self.transport.clone(),
            storage: self.storage.clone(),
            estimator: self.estimator.clone(),
        }
    }

    /// Runs a lookup on `pool`, registered as an activity for its lifetime.
    pub(crate) async fn run_lookup(
        self: &Arc<Self>,
        pool: PoolKind,
        request: LookupRequest,
        observer: Arc<dyn LookupObserver>,
        cancel: CancelToken,
    ) -> LookupOutcome {
        *self.last_lookup.lock() = Instant::now();

        let high_priority = request.flags & FLAG_HIGH_PRIORITY != 0;
        let task = LookupTask::new(self.lookup_env(), request, observer, cancel);
        let guard = self.activity.register(
            pool.into(),
            task.lookup_id().clone(),
            task.request().description.clone(),
            task.activity_source(),
        );

        let handle = self
            .pools
            .get(pool)
            .spawn_prioritized(
                async move {
                    guard.started();
                    let outcome = task.run().await;
                    drop(guard);
                    outcome
                },
                high_priority,
            )
            .await;

        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(pool = ?pool, error = %e, "lookup task aborted");
                LookupOutcome::failed()
            }
        }
    }

    fn refresh_estimate(&self) {
        let router = self.router();
        let local = router.local_contact();
        let mut closest = router.find_closest_contacts(&local.id, router.k(), false);
        closest.push(local.clone());
        let (contacts, replacements) = router.stats();
        self.estimator
            .record_router(&local.id, closest, router.k(), contacts + replacements);
    }

    pub(crate) fn max_div_depth(&self) -> usize {
        if self.estimator.combined_estimate() == 0 {
            self.refresh_estimate();
        }
        self.estimator.max_diversification_depth()
    }

    fn closest_factor(&self, k: usize) -> usize {
        if self.config.large_network {
            k + k / 2
        } else {
            k
        }
    }

    /// Whether we are among the `c` closest live nodes to `key`.
    fn is_in_closest(&self, router: &dyn Router, local_id: &NodeId, key: &NodeId, c: usize) -> bool {
        let closest = router.find_closest_contacts(key, c, true);
        if closest.len() < c {
            return true;
        }
        closest
            .last()
            .map_or(true, |furthest| compare(local_id, &furthest.id, key) == CmpOrdering::Less)
    }

    fn accept_cache_forward(&self, router: &dyn Router, from: &Contact, local_id: &NodeId, c: usize) -> bool {
        let now = Instant::now();
        if let Some((id, at)) = self.rejected_forward.lock().as_ref() {
            if *id == from.id && now.duration_since(*at) < CACHE_FORWARD_REJECT_WINDOW {
                return false;
            }
        }

        let closest = router.find_closest_contacts(local_id, c, true);
        if closest.len() >= c {
            if let Some(furthest) = closest.last() {
                if compare(&furthest.id, &from.id, local_id) == CmpOrdering::Less {
                    *self.rejected_forward.lock() = Some((from.id.clone(), now));
                    return false;
                }
            }
        }
        true
    }

    /// Starts value lookups for `key` and whatever it is currently spread
    /// over. Each lookup holds a unit of `ctx.join`.
    fn get_support(self: &Arc<Self>, ctx: &Arc<GetContext>, key: NodeId, description: String, max_values: usize) {
        let keys = self.adapter.diversify(
            None,
            false,
            true,
            &key,
            DiversificationType::None,
            ctx.exhaustive,
            self.max_div_depth(),
        );

        if keys.is_empty() {
            ctx.listener
                .diversified(&format!("Over-diversification of [{description}]"));
            ctx.join.begin();
            ctx.join.complete(false);
            return;
        }

        let router = self.router();
        for encoded in keys {
            let this_description = if encoded == key {
                description.clone()
            } else {
                let derived = format!("Diversification of [{description}]");
                if !ctx.listener.diversified(&derived) {
                    continue;
                }
                derived
            };

            let concurrency = if ctx.flags & FLAG_STATS != 0 {
                self.config.search_concurrency * 2
            } else {
                self.config.search_concurrency
            };
            let mut request = LookupRequest::value(encoded.clone(), max_values, concurrency, router.k())
                .with_flags(ctx.flags)
                .with_description(this_description.clone());
            request.timeout = ctx.timeout;

            let observer = Arc::new(GetObserver {
                inner: self.clone(),
                ctx: ctx.clone(),
                key: encoded,
                description: this_description,
                max_values,
                followed: AtomicBool::new(false),
                found: AtomicUsize::new(0),
            });

            ctx.join.begin();
            let inner = self.clone();
            let ctx = ctx.clone();
            let cancel = ctx.tasks.token();
            tokio::spawn(async move {
                let outcome = inner.run_lookup(ctx.pool, request, observer, cancel).await;
                if outcome.timed_out {
                    ctx.join.mark_timed_out();
                }
                if outcome.cancelled {
                    ctx.cancelled.store(true, Ordering::Release);
                }
                if outcome.diversified {
                    ctx.diversified.store(true, Ordering::Release);
                }
                if let Some(block) = outcome.key_block {
                    ctx.key_block.lock().get_or_insert(block);
                }
                ctx.values.lock().extend(outcome.values);
                ctx.join.complete(!outcome.failed);
            });
        }
    }
}

/// Shared state of one get and its diversified sub-gets.
struct GetContext {
    listener: Arc<dyn OperationListener>,
    join: Arc<CompletionJoin>,
    tasks: TaskSet,
    pool: PoolKind,
    flags: u16,
    timeout: Option<Duration>,
    exhaustive: bool,
    values: Mutex<Vec<(Contact, StoredValue)>>,
    key_block: Mutex<Option<KeyBlock>>,
    cancelled: AtomicBool,
    diversified: AtomicBool,
}

struct GetObserver {
    inner: Arc<ControlInner>,
    ctx: Arc<GetContext>,
    key: NodeId,
    description: String,
    max_values: usize,
    followed: AtomicBool,
    found: AtomicUsize,
}

impl LookupObserver for GetObserver {
    fn found(&self, contact: &Contact, is_closest: bool) {
        self.ctx.listener.found(contact, is_closest);
    }

    fn searching(&self, _contact: &Contact, level: usize, active: usize) {
        self.ctx.listener.searching(&self.key, level, active);
    }

    fn read(&self, contact: &Contact, value: &StoredValue) {
        self.found.fetch_add(1, Ordering::AcqRel);
        self.ctx.listener.read(contact, value);
    }

    // only the first diversification of a lookup is followed
    fn diversify(&self, cause: &Contact, diversification: DiversificationType) {
        let description = format!("Diversification of [{}]", self.description);
        if !self.ctx.listener.diversified(&description) || self.followed.swap(true, Ordering::AcqRel) {
            return;
        }

        let remaining = if self.max_values == 0 {
            0
        } else {
            self.max_values
                .saturating_sub(self.found.load(Ordering::Acquire))
        };
        if self.max_values != 0 && remaining == 0 {
            return;
        }

        let keys = self.inner.adapter.diversify(
            Some(cause),
            false,
            false,
            &self.key,
            diversification,
            self.ctx.exhaustive,
            self.inner.max_div_depth(),
        );
        for key in keys {
            if self.ctx.tasks.is_cancelled() {
                break;
            }
            self.inner
                .get_support(&self.ctx, key, description.clone(), remaining);
        }
    }
}

/// Forwards only search progress; closest contacts are reported at the end.
struct SearchingObserver {
    key: NodeId,
    listener: Arc<dyn OperationListener>,
}

impl LookupObserver for SearchingObserver {
    fn searching(&self, _contact: &Contact, level: usize, active: usize) {
        self.listener.searching(&self.key, level, active);
    }
}

/// Handle to a running control plane. Cheap to clone.
#[derive(Clone)]
pub struct DhtControl(Arc<ControlInner>);

impl DhtControl {
    pub fn new(
        config: ControlConfig,
        router: Arc<dyn Router>,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        adapter: Arc<dyn DiversificationAdapter>,
    ) -> Result<Self, ControlError> {
        config.validate()?;
        let local_id = router.local_id();
        if local_id.len() != config.node_id_len {
            return Err(ControlError::KeyLength {
                expected: config.node_id_len,
                actual: local_id.len(),
            });
        }

        let inner = ControlInner {
            encoder: KeyEncoder::new(config.node_id_len, config.encode_keys),
            pools: AdmissionPools::new(&config),
            config,
            router: RwLock::new(router),
            transport,
            storage,
            adapter,
            spoof: SpoofGuard::new(),
            estimator: Arc::new(SizeEstimator::new()),
            activity: Arc::new(ActivityTracker::new()),
            seeded: AtomicBool::new(false),
            sleeping: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            last_lookup: Mutex::new(Instant::now()),
            rejected_forward: Mutex::new(None),
            imported: Mutex::new(HashSet::new()),
        };
        debug!(local = %local_id.short_hex(), "control plane created");
        Ok(Self(Arc::new(inner)))
    }

    pub fn config(&self) -> &ControlConfig {
        &self.0.config
    }

    pub fn router(&self) -> Arc<dyn Router> {
        self.0.router()
    }

    pub fn local_contact(&self) -> Contact {
        self.0.router().local_contact()
    }

    pub fn spoof_guard(&self) -> &SpoofGuard {
        &self.0.spoof
    }

    pub fn encode_key(&self, key: &[u8]) -> NodeId {
        self.0.encoder.encode(key)
    }

    fn check_encoded(&self, key: &NodeId) -> Result<(), ControlError> {
        if key.len() != self.0.config.node_id_len {
            return Err(ControlError::KeyLength {
                expected: self.0.config.node_id_len,
                actual: key.len(),
            });
        }
        Ok(())
    }

    // ---- outbound ----

    /// Publishes `value` under `key`. Zero-length values are reserved for
    /// removal and rejected before anything is sent.
    pub async fn put(
        &self,
        key: &[u8],
        description: &str,
        value: Vec<u8>,
        options: PutOptions,
        listener: Arc<dyn OperationListener>,
    ) -> Result<PutOutcome, ControlError> {
        let encoded = self.encode_key(key);
        self.put_with_pool(
            encoded,
            description,
            value,
            options,
            true,
            PoolKind::ExternalPut,
            listener,
        )
        .await
    }

    /// Like [`put`](Self::put) for a key that is already encoded. Without
    /// `original_mappings` only a sample of the key's current
    /// diversifications is written.
    pub async fn put_encoded_key(
        &self,
        encoded: &[u8],
        description: &str,
        value: Vec<u8>,
        options: PutOptions,
        original_mappings: bool,
        listener: Arc<dyn OperationListener>,
    ) -> Result<PutOutcome, ControlError> {
        let encoded = NodeId::from_bytes(encoded.to_vec());
        self.check_encoded(&encoded)?;
        self.put_with_pool(
            encoded,
            description,
            value,
            options,
            original_mappings,
            PoolKind::InternalPut,
            listener,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn put_with_pool(
        &self,
        encoded: NodeId,
        description: &str,
        value: Vec<u8>,
        options: PutOptions,
        original_mappings: bool,
        pool: PoolKind,
        listener: Arc<dyn OperationListener>,
    ) -> Result<PutOutcome, ControlError> {
        if value.is_empty() {
            return Err(ControlError::ZeroLengthValue);
        }

        let local = self.local_contact();
        let value = StoredValue::new(local.clone(), value, options.flags & 0x00ff)
            .with_life_hours(options.life_hours)
            .with_replication_control(options.replication_control);
        self.0.storage.store(&local, &encoded, std::slice::from_ref(&value));

        debug!(key = %encoded.short_hex(), description, pool = ?pool, "put");
        let wave = StoreWave::new(self.0.clone(), listener, options.flags, pool).with_timeout(options.timeout);
        wave.put_keys(&encoded, vec![value], original_mappings, 1, description);
        Ok(wave.finish().await)
    }

    /// Stores prepared values straight at `contacts`, without a lookup and
    /// without following diversifications.
    pub async fn put_direct_encoded_keys(
        &self,
        keys: Vec<NodeId>,
        description: &str,
        value_sets: Vec<Vec<StoredValue>>,
        contacts: Vec<Contact>,
        listener: Arc<dyn OperationListener>,
    ) -> PutOutcome {
        let inner = self.0.clone();
        let description = description.to_string();
        let handle = self
            .0
            .pools
            .get(PoolKind::InternalPut)
            .spawn(async move {
                let wave = StoreWave::new(inner, listener, 0, PoolKind::InternalPut);
                wave.store_at(keys, value_sets, contacts, false, 1, false, description);
                wave.finish().await
            })
            .await;

        handle.await.unwrap_or_else(|e| {
            warn!(error = %e, "direct put task aborted");
            PutOutcome {
                failed: true,
                ..PutOutcome::default()
            }
        })
    }

    pub async fn get(
        &self,
        key: &[u8],
        description: &str,
        options: GetOptions,
        listener: Arc<dyn OperationListener>,
    ) -> GetOutcome {
        let encoded = self.encode_key(key);
        let ctx = Arc::new(GetContext {
            join: CompletionJoin::new(listener.clone()),
            listener,
            tasks: options.tasks.child(),
            pool: PoolKind::ExternalLookup,
            flags: options.flags,
            timeout: options.timeout,
            exhaustive: options.exhaustive,
            values: Mutex::new(Vec::new()),
            key_block: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            diversified: AtomicBool::new(false),
        });

        self.0
            .get_support(&ctx, encoded.clone(), description.to_string(), options.max_values);
        ctx.join.release();
        ctx.join.wait().await;
        ctx.tasks.cancel();

        let values = std::mem::take(&mut *ctx.values.lock());
        let key_block = ctx.key_block.lock().clone();
        debug!(key = %encoded.short_hex(), values = values.len(), timed_out = ctx.join.timed_out(), "get complete");
        GetOutcome {
            values,
            timed_out: ctx.join.timed_out(),
            cancelled: ctx.cancelled.load(Ordering::Acquire),
            diversified: ctx.diversified.load(Ordering::Acquire),
            key_block,
        }
    }

    /// Finds the contacts closest to `key`. Each is reported to the
    /// listener with `found(contact, true)` once the search is over.
    pub async fn lookup(
        &self,
        key: &[u8],
        description: &str,
        timeout: Option<Duration>,
        listener: Arc<dyn OperationListener>,
    ) -> LookupOutcome {
        let encoded = self.encode_key(key);
        self.lookup_encoded(&encoded, description, timeout, false, listener)
            .await
    }

    pub async fn lookup_encoded(
        &self,
        encoded: &NodeId,
        description: &str,
        timeout: Option<Duration>,
        high_priority: bool,
        listener: Arc<dyn OperationListener>,
    ) -> LookupOutcome {
        let router = self.router();
        let flags = if high_priority { FLAG_HIGH_PRIORITY } else { 0 };
        let mut request = LookupRequest::node(encoded.clone(), self.0.config.search_concurrency, router.k())
            .with_flags(flags)
            .with_description(description);
        request.max_values = 1;
        request.timeout = timeout;

        let observer = Arc::new(SearchingObserver {
            key: encoded.clone(),
            listener: listener.clone(),
        });
        let outcome = self
            .0
            .run_lookup(PoolKind::ExternalLookup, request, observer, CancelToken::new())
            .await;

        if outcome.diversified {
            listener.diversified("Diversification of [lookup]");
        }
        for contact in &outcome.closest {
            listener.found(contact, true);
        }
        listener.complete(outcome.timed_out);
        outcome
    }

    /// Withdraws this node's value for `key` by publishing a zero-length
    /// value in its place.
    pub async fn remove(
        &self,
        key: &[u8],
        description: &str,
        listener: Arc<dyn OperationListener>,
    ) -> RemoveOutcome {
        let encoded = self.encode_key(key);
        let local = self.local_contact();
        let Some(previous) = self.0.storage.remove(&local, &encoded) else {
            trace!(key = %encoded.short_hex(), "remove of a key never published");
            listener.complete(false);
            return RemoveOutcome::default();
        };

        let deletion = deletion_of(&previous);
        let wave = StoreWave::new(self.0.clone(), listener, previous.flags, PoolKind::ExternalPut);
        wave.put_keys(&encoded, vec![deletion], true, 1, description);
        RemoveOutcome {
            previous: Some(previous),
            outcome: wave.finish().await,
        }
    }

    /// Sends the removal of `key` straight to `contacts`.
    pub async fn remove_at(
        &self,
        contacts: Vec<Contact>,
        key: &[u8],
        description: &str,
        listener: Arc<dyn OperationListener>,
    ) -> RemoveOutcome {
        let encoded = self.encode_key(key);
        let local = self.local_contact();
        let Some(previous) = self.0.storage.remove(&local, &encoded) else {
            listener.complete(false);
            return RemoveOutcome::default();
        };

        let deletion = deletion_of(&previous);
        let wave = StoreWave::new(self.0.clone(), listener, previous.flags, PoolKind::InternalPut);
        wave.store_at(
            vec![encoded],
            vec![vec![deletion]],
            contacts,
            true,
            1,
            true,
            format!("Store of [{description}]"),
        );
        RemoveOutcome {
            previous: Some(previous),
            outcome: wave.finish().await,
        }
    }

    pub async fn request_ping(&self, contact: &Contact) -> bool {
        self.0.request_ping(contact).await
    }

    /// Pings every contact in the routing table. Returns how many answered.
    pub async fn ping_all(&self) -> usize {
        let limiter = Arc::new(Semaphore::new(PING_ALL_CONCURRENCY));
        let contacts = self.router().all_contacts();
        let pings = contacts.into_iter().map(|contact| {
            let inner = self.0.clone();
            let limiter = limiter.clone();
            async move {
                let _permit = limiter.acquire_owned().await.ok();
                inner.request_ping(&contact).await
            }
        });
        join_all(pings).await.into_iter().filter(|ok| *ok).count()
    }

    // ---- inbound ----

    pub fn handle_ping(&self, from: &Contact) {
        trace!(from = %from, "ping request");
        self.router().contact_alive(from);
    }

    pub fn handle_key_block(&self, from: &Contact, request: &[u8], signature: &[u8]) {
        self.router().contact_alive(from);
        self.0.storage.key_block_request(Some(from), request, signature);
    }

    pub fn handle_store(&self, from: &Contact, keys: &[NodeId], value_sets: &[Vec<StoredValue>]) -> StoreReply {
        let inner = &self.0;
        let router = inner.router();
        router.contact_alive(from);

        let mut result = vec![DiversificationType::None; keys.len()];
        if keys.len() != value_sets.len() {
            warn!(
                from = %from,
                keys = keys.len(),
                values = value_sets.len(),
                "store request with mismatched keys and values"
            );
            return StoreReply::Diversifications(result);
        }
        if keys.is_empty() {
            return StoreReply::Diversifications(result);
        }

        let cache_forward = value_sets
            .iter()
            .flatten()
            .any(|value| value.originator.id != from.id);

        if cache_forward && !self.is_seeded() {
            debug!(from = %from, "not storing cache forward before seeding");
            return StoreReply::Diversifications(result);
        }
        if !inner.spoof.verify(from) {
            debug!(from = %from, direct = !cache_forward, "store from unverified contact");
            return StoreReply::Diversifications(result);
        }

        let local_id = router.local_id();
        let c = inner.closest_factor(router.k());
        if cache_forward && !inner.accept_cache_forward(router.as_ref(), from, &local_id, c) {
            trace!(from = %from, "cache forward from a contact too far away");
            return StoreReply::Diversifications(result);
        }

        let mut block: Option<KeyBlock> = None;
        for (i, (key, values)) in keys.iter().zip(value_sets).enumerate() {
            if inner.storage.is_key_blocked(key) {
                if block.is_none() {
                    block = inner.storage.key_block_details(key);
                }
                continue;
            }
            if inner.storage.has_key(key) || inner.is_in_closest(router.as_ref(), &local_id, key, c) {
                result[i] = inner.storage.store(from, key, values);
            } else {
                trace!(from = %from, key = %key.short_hex(), "key too far away to store");
            }
        }

        match block {
            Some(block) => StoreReply::KeyBlocked {
                request: block.request,
                signature: block.certificate,
            },
            None => StoreReply::Diversifications(result),
        }
    }

    pub fn handle_query_store(
        &self,
        from: &Contact,
        header_len: usize,
        key_prefixes: &[Vec<u8>],
        max: usize,
    ) -> QueryStoreReply {
        self.router().contact_alive(from);
        QueryStoreReply {
            keys: self.0.storage.query_store(header_len, key_prefixes, max),
            spoof_token: self.0.spoof.token_for(from),
        }
    }

    pub fn handle_find_node(&self, from: &Contact, id: &NodeId) -> FindNodeReply {
        let router = self.router();
        router.contact_alive(from);
        let contacts = if id.len() == router.local_id().len() {
            router.find_closest_contacts(id, router.k(), true)
        } else {
            Vec::new()
        };
        FindNodeReply {
            contacts,
            spoof_token: self.0.spoof.token_for(from),
        }
    }

    pub fn handle_find_value(&self, from: &Contact, key: &NodeId, max_values: usize, flags: u16) -> FindValueReply {
        let Some(lookup) = self.0.storage.get(from, key, max_values, flags) else {
            return FindValueReply::Contacts(self.handle_find_node(from, key));
        };

        self.router().contact_alive(from);
        if let Some(block) = self.0.storage.key_block_details(key) {
            return FindValueReply::KeyBlocked {
                request: block.request,
                signature: block.certificate,
            };
        }

        let spoof_token = self
            .0
            .spoof
            .token_for(from)
            .filter(|token| matches!(token, SpoofToken::Id(_)));
        FindValueReply::Values {
            values: anonymize_values(lookup.values),
            diversification: lookup.diversification,
            more_to_come: false,
            spoof_token,
        }
    }

    // ---- lifecycle ----

    /// Integrates with the network by looking up our own id.
    ///
    /// Without `full_wait` the call returns once the lookup has found its
    /// closest contacts, but never before the integration period is over.
    pub async fn seed(&self, full_wait: bool) {
        let started = Instant::now();
        let wait = self.0.config.integration_wait();
        let (tx, rx) = oneshot::channel::<()>();

        let inner = self.0.clone();
        tokio::spawn(async move {
            let router = inner.router();
            let mut request = LookupRequest::node(
                router.local_id(),
                inner.config.search_concurrency * SEED_CONCURRENCY_FACTOR,
                router.k(),
            )
            .with_description("Seeding DHT");
            request.max_values = 1;

            let outcome = inner
                .run_lookup(PoolKind::InternalLookup, request, Arc::new(NoopObserver), CancelToken::new())
                .await;
            if outcome.failed {
                warn!("seeding lookup failed");
                return;
            }

            let mut tx = Some(tx);
            if !full_wait {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(());
                }
            }
            inner.seeded.store(true, Ordering::Release);
            router.seed();
            info!(closest = outcome.closest.len(), queried = outcome.queried, "seeded");
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
        });

        let _ = timeout(wait, rx).await;

        let remaining = wait.saturating_sub(started.elapsed());
        if remaining > MIN_INTEGRATION_REMAINDER && !full_wait {
            info!(remaining_ms = remaining.as_millis() as u64, "initial integration complete, waiting for second phase");
            sleep(remaining).await;
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.0.seeded.load(Ordering::Acquire)
    }

    /// Marks the node as seeded without running the seeding lookup.
    pub fn set_seeded(&self) {
        self.0.seeded.store(true, Ordering::Release);
        self.router().seed();
    }

    pub fn is_sleeping(&self) -> bool {
        self.0.sleeping.load(Ordering::Acquire)
    }

    pub fn set_sleeping(&self, asleep: bool) {
        if self.0.sleeping.swap(asleep, Ordering::AcqRel) != asleep {
            info!(asleep, "sleep mode changed");
        }
        self.router().set_sleeping(asleep);
        self.0.transport.set_sleeping(asleep);
        self.0.pools.set_sleeping(asleep);
        self.0.storage.set_sleeping(asleep);
    }

    pub fn is_suspended(&self) -> bool {
        self.0.suspended.load(Ordering::Acquire)
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.0.suspended.store(suspended, Ordering::Release);
        info!(suspended, "suspension changed");
        if suspended {
            self.0.transport.set_suspended(true);
            self.router().set_suspended(true);
            self.0.storage.set_suspended(true);
        } else {
            self.0.storage.set_suspended(false);
            self.router().set_suspended(false);
            self.0.transport.set_suspended(false);
        }
    }

    /// Swaps in a new routing table, carries over the best known contacts
    /// and re-seeds.
    pub async fn replace_router(&self, new_router: Arc<dyn Router>) {
        let old = std::mem::replace(&mut *self.0.router.write(), new_router.clone());
        let old_id = old.local_id();
        let new_id = new_router.local_id();

        let (mut carried, others): (Vec<Contact>, Vec<Contact>) = old
            .all_contacts()
            .into_iter()
            .filter(|c| c.id != old_id)
            .partition(|c| c.is_alive());
        sort_by_distance(&mut carried, &new_id);
        for contact in others {
            if carried.len() >= ROUTER_CARRY_FILL {
                break;
            }
            carried.push(contact);
        }
        carried.truncate(ROUTER_CARRY_MAX);

        for contact in &carried {
            new_router.contact_alive(contact);
        }
        new_router.set_sleeping(self.is_sleeping());
        new_router.set_suspended(self.is_suspended());
        info!(
            old = %old_id.short_hex(),
            new = %new_id.short_hex(),
            carried = carried.len(),
            "router replaced"
        );

        self.seed(false).await;
    }

    /// Starts the periodic random poke and bucket refresh. The task ends
    /// once every handle to the control plane is gone.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let weak: Weak<ControlInner> = Arc::downgrade(&self.0);
        let period = self.0.config.maintenance_interval();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.poke();
                inner.refresh();
            }
            debug!("maintenance task stopped");
        })
    }

    /// Serialized live contacts for a later [`import_state`](Self::import_state).
    ///
    /// Imported contacts that are still alive come first, then other live
    /// contacts, then imported ones not known to be failing, then the rest.
    pub fn export_state(&self, max: usize) -> Result<Vec<u8>, ControlError> {
        let mut to_save = self.router().all_contacts();
        let imported = self.0.imported.lock().clone();
        let rank = |c: &Contact| match (imported.contains(&c.id), c.is_alive()) {
            (true, true) => 0u8,
            (false, true) => 1,
            (true, false) if c.liveness != Liveness::Dead => 2,
            _ => 3,
        };
        to_save.sort_by_key(rank);
        to_save.truncate(max);

        debug!(exported = to_save.len(), "exporting control state");
        Ok(serialize_bounded(&to_save)?)
    }

    /// Adds previously exported contacts to the router as bootstrap
    /// contacts. Returns how many were accepted.
    pub fn import_state(&self, bytes: &[u8]) -> Result<usize, ControlError> {
        let contacts: Vec<Contact> = deserialize_bounded(bytes)?;
        let router = self.router();
        let local_id = router.local_id();

        let mut imported = self.0.imported.lock();
        let mut count = 0;
        for contact in contacts {
            if contact.id == local_id || contact.id.len() != local_id.len() {
                continue;
            }
            router.contact_known(&contact, true);
            imported.insert(contact.id.clone());
            count += 1;
        }
        info!(imported = count, "imported control state");
        Ok(count)
    }

    pub fn get_contacts(&self) -> Vec<Contact> {
        self.router().all_contacts()
    }

    /// A contact joined the routing table.
    pub fn contact_added(&self, contact: &Contact) {
        if contact.is_alive() {
            return;
        }
        let inner = self.0.clone();
        let contact = contact.clone();
        tokio::spawn(async move {
            inner.request_ping(&contact).await;
        });
    }

    pub fn contact_imported(&self, contact: &Contact, is_bootstrap: bool) {
        self.router().contact_known(contact, is_bootstrap);
    }

    pub fn contact_removed(&self, contact: &Contact) {
        let router = self.router();
        if !router.is_id(&contact.id) {
            router.contact_dead(&contact.id, true);
        }
    }

    // ---- size estimate ----

    pub fn estimated_size(&self) -> u64 {
        if self.0.estimator.is_stale() {
            self.0.refresh_estimate();
        }
        self.0
            .estimator
            .scaled_estimate(self.0.transport.routeable_percentage())
    }

    pub fn set_transport_estimated_size(&self, size: u64) {
        self.0.estimator.ingest_remote(size);
    }

    pub fn transport_estimated_size(&self) -> u64 {
        self.0.estimator.local_estimate()
    }

    pub fn max_diversification_depth(&self) -> usize {
        self.0.max_div_depth()
    }

    // ---- activity and local data ----

    pub fn activities(&self) -> Vec<ActivityEntry> {
        self.0.activity.activities()
    }

    pub fn activity_state(&self, id: u64) -> Option<ActivityState> {
        self.0.activity.current_state(id)
    }

    pub fn subscribe_activities(&self) -> (Vec<ActivityEntry>, broadcast::Receiver<ActivityEvent>) {
        self.0.activity.subscribe()
    }

    pub fn get_local_value(&self, key: &[u8]) -> Option<StoredValue> {
        self.0.storage.local_value(&self.encode_key(key))
    }

    pub fn get_stored_values(&self, key: &[u8]) -> Vec<StoredValue> {
        self.0.storage.stored_values(&self.encode_key(key))
    }

    pub fn is_diversified(&self, key: &[u8]) -> bool {
        self.0.adapter.is_diversified(&self.encode_key(key))
    }
}

impl ControlInner {
    async fn request_ping(&self, contact: &Contact) -> bool {
        match self.transport.ping(contact).await {
            Ok(()) => {
                self.router().contact_alive(contact);
                true
            }
            Err(e) => {
                trace!(contact = %contact, error = %e, "ping failed");
                self.router().contact_dead(&contact.id, false);
                false
            }
        }
    }

    /// Random lookup once the node has been quiet for a while.
    fn poke(self: &Arc<Self>) {
        if !self.config.enable_random_poking {
            return;
        }
        {
            let mut last = self.last_lookup.lock();
            if last.elapsed() <= self.config.random_query_period() {
                return;
            }
            *last = Instant::now();
        }

        let inner = self.clone();
        tokio::spawn(async move {
            let target = NodeId::random(inner.config.node_id_len);
            let request = LookupRequest::node(target, inner.config.search_concurrency, inner.router().k())
                .with_description("Random Query");
            inner
                .run_lookup(PoolKind::ExternalLookup, request, Arc::new(NoopObserver), CancelToken::new())
                .await;
        });
    }

    fn refresh(self: &Arc<Self>) {
        let targets = self.router().refresh_targets();
        if targets.is_empty() {
            return;
        }
        debug!(buckets = targets.len(), "refreshing stale buckets");
        for target in targets {
            let inner = self.clone();
            tokio::spawn(async move {
                let request = LookupRequest::node(
                    target,
                    inner.config.search_concurrency,
                    inner.config.refresh_accuracy(),
                )
                .with_description("Bucket Refresh")
                .with_timeout(inner.config.refresh_lookup_timeout());
                inner
                    .run_lookup(PoolKind::InternalLookup, request, Arc::new(NoopObserver), CancelToken::new())
                    .await;
            });
        }
    }
}

/// The zero-length value that replaces `previous` on removal.
fn deletion_of(previous: &StoredValue) -> StoredValue {
    StoredValue {
        payload: Vec::new(),
        created: now_millis(),
        version: previous.version.wrapping_add(1),
        ..previous.clone()
    }
}
