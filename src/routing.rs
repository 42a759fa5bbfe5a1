//! # Reference Routing Table
//!
//! An in-memory [`Router`] for embedders without their own table, and for
//! tests. Contacts are grouped by the length of the prefix they share with
//! the local id.
//!
//! ```text
//! Bucket 0:            distance has 0 leading zeros (furthest, half the id space)
//! Bucket 1:            distance has 1 leading zero
//! ...
//! Bucket 8*id_len - 1: closest
//! ```
//!
//! Buckets never split. A full bucket pushes newcomers onto a bounded
//! replacement list, and a contact that fails `max_fails` times in a row is
//! dropped in favour of the freshest replacement for its bucket.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use parking_lot::Mutex;
use rand::RngCore;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace};

use crate::identity::{Contact, Liveness, NodeId};
use crate::metric::{distance, distance_cmp, xor_distance};
use crate::protocols::Router;

/// A bucket without activity for this long is due a refresh lookup.
pub(crate) const BUCKET_STALE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Consecutive failures before a contact is dropped.
pub(crate) const DEFAULT_MAX_FAILS: usize = 3;

/// Contacts waiting for a bucket slot.
const REPLACEMENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Bucket {
    contacts: Vec<Contact>,
    last_refresh: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.id == id)
    }

    fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        self.position(id).map(|pos| self.contacts.remove(pos))
    }
}

pub(crate) fn bucket_index(self_id: &NodeId, other: &NodeId) -> usize {
    let dist = distance(self_id, other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    (self_id.len() * 8).saturating_sub(1)
}

pub(crate) fn random_id_for_bucket(self_id: &NodeId, bucket_idx: usize) -> NodeId {
    let self_bytes = self_id.as_bytes();
    let len = self_bytes.len();
    if len == 0 {
        return self_id.clone();
    }
    let bucket_idx = bucket_idx.min(len * 8 - 1);

    let mut distance = vec![0u8; len];
    if getrandom::getrandom(&mut distance).is_err() {
        rand::thread_rng().fill_bytes(&mut distance);
    }

    let byte_idx = bucket_idx / 8;
    let bit_pos = bucket_idx % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    NodeId::from_bytes(xor_distance(self_bytes, &distance))
}

struct RouterState {
    local: Contact,
    buckets: Vec<Bucket>,
    replacements: VecDeque<Contact>,
    fails: HashMap<NodeId, usize>,
    seeded: bool,
    sleeping: bool,
    suspended: bool,
}

impl RouterState {
    fn bucket_of(&self, id: &NodeId) -> usize {
        bucket_index(&self.local.id, id)
    }

    fn find_mut(&mut self, id: &NodeId) -> Option<&mut Contact> {
        let idx = self.bucket_of(id);
        let bucket = self.buckets.get_mut(idx)?;
        let pos = bucket.position(id)?;
        bucket.contacts.get_mut(pos)
    }

    fn push_replacement(&mut self, contact: Contact) {
        self.replacements.retain(|c| c.id != contact.id);
        if self.replacements.len() >= REPLACEMENT_CAPACITY {
            self.replacements.pop_front();
        }
        self.replacements.push_back(contact);
    }

    /// Inserts `contact`, evicting a dead entry if its bucket is full.
    /// Returns false when it went to the replacement list instead.
    fn insert(&mut self, contact: Contact, k: usize) -> bool {
        let idx = self.bucket_of(&contact.id);
        if idx >= self.buckets.len() {
            return false;
        }
        if self.buckets[idx].contacts.len() >= k {
            let dead = self.buckets[idx]
                .contacts
                .iter()
                .position(|c| c.liveness == Liveness::Dead);
            match dead {
                Some(pos) => {
                    let evicted = self.buckets[idx].contacts.remove(pos);
                    trace!(evicted = %evicted, "evicting dead contact for newcomer");
                }
                None => {
                    self.push_replacement(contact);
                    return false;
                }
            }
        }
        let bucket = &mut self.buckets[idx];
        bucket.contacts.push(contact);
        bucket.mark_refreshed();
        true
    }

    fn promote_replacement(&mut self, bucket_idx: usize) {
        let local_id = self.local.id.clone();
        let Some(pos) = self
            .replacements
            .iter()
            .rposition(|c| bucket_index(&local_id, &c.id) == bucket_idx)
        else {
            return;
        };
        if let Some(contact) = self.replacements.remove(pos) {
            trace!(contact = %contact, bucket = bucket_idx, "promoting replacement");
            if let Some(bucket) = self.buckets.get_mut(bucket_idx) {
                bucket.contacts.push(contact);
            }
        }
    }

    fn drop_contact(&mut self, id: &NodeId) {
        let idx = self.bucket_of(id);
        self.fails.remove(id);
        self.replacements.retain(|c| &c.id != id);
        let removed = self.buckets.get_mut(idx).and_then(|b| b.remove(id));
        if removed.is_some() {
            self.promote_replacement(idx);
        }
    }
}

/// In-memory routing table.
pub struct MemoryRouter {
    k: usize,
    max_fails: usize,
    state: Mutex<RouterState>,
}

impl MemoryRouter {
    pub fn new(local: Contact, k: usize) -> Self {
        let bits = (local.id.len() * 8).max(1);
        let mut buckets = Vec::with_capacity(bits);
        for _ in 0..bits {
            buckets.push(Bucket::new());
        }
        Self {
            k,
            max_fails: DEFAULT_MAX_FAILS,
            state: Mutex::new(RouterState {
                local,
                buckets,
                replacements: VecDeque::new(),
                fails: HashMap::new(),
                seeded: false,
                sleeping: false,
                suspended: false,
            }),
        }
    }

    pub fn with_max_fails(mut self, max_fails: usize) -> Self {
        self.max_fails = max_fails.max(1);
        self
    }

    pub fn is_seeded(&self) -> bool {
        self.state.lock().seeded
    }

    pub fn is_sleeping(&self) -> bool {
        self.state.lock().sleeping
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    /// Liveness currently recorded for `id`, if it is in a bucket.
    pub fn liveness(&self, id: &NodeId) -> Option<Liveness> {
        self.state.lock().find_mut(id).map(|c| c.liveness)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.state.lock().find_mut(id).is_some()
    }
}

fn merge_details(existing: &mut Contact, update: &Contact) {
    existing.addr = update.addr;
    existing.version = update.version;
    existing.instance_id = update.instance_id;
    existing.flags = update.flags;
    if update.address_token.is_some() {
        existing.address_token = update.address_token;
    }
    if update.id_token.is_some() {
        existing.id_token = update.id_token;
    }
    if update.position.is_some() {
        existing.position = update.position;
    }
}

impl Router for MemoryRouter {
    fn local_contact(&self) -> Contact {
        self.state.lock().local.clone()
    }

    fn k(&self) -> usize {
        self.k
    }

    fn find_closest_contacts(&self, id: &NodeId, n: usize, live_only: bool) -> Vec<Contact> {
        if n == 0 {
            return Vec::new();
        }

        #[derive(Eq, PartialEq)]
        struct DistContact {
            dist: Vec<u8>,
            contact: Contact,
        }

        impl Ord for DistContact {
            fn cmp(&self, other: &Self) -> Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for DistContact {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let state = self.state.lock();
        let mut heap: BinaryHeap<DistContact> = BinaryHeap::with_capacity(n + 1);

        for bucket in &state.buckets {
            for contact in &bucket.contacts {
                if live_only && !contact.is_alive() {
                    continue;
                }
                let dist = distance(&contact.id, id);
                if heap.len() < n {
                    heap.push(DistContact {
                        dist,
                        contact: contact.clone(),
                    });
                } else if let Some(max_entry) = heap.peek() {
                    if distance_cmp(&dist, &max_entry.dist) == Ordering::Less {
                        heap.push(DistContact {
                            dist,
                            contact: contact.clone(),
                        });
                        heap.pop();
                    }
                }
            }
        }

        heap.into_sorted_vec().into_iter().map(|dc| dc.contact).collect()
    }

    fn contact_alive(&self, contact: &Contact) {
        let mut state = self.state.lock();
        if contact.id == state.local.id {
            return;
        }
        state.fails.remove(&contact.id);
        let idx = state.bucket_of(&contact.id);
        if let Some(bucket) = state.buckets.get_mut(idx) {
            if let Some(pos) = bucket.position(&contact.id) {
                let mut existing = bucket.contacts.remove(pos);
                merge_details(&mut existing, contact);
                existing.liveness = Liveness::Alive;
                bucket.contacts.push(existing);
                bucket.mark_refreshed();
                return;
            }
        }
        let fresh = contact.clone().with_liveness(Liveness::Alive);
        state.insert(fresh, self.k);
    }

    fn contact_dead(&self, id: &NodeId, permanent: bool) {
        let mut state = self.state.lock();
        if permanent {
            debug!(contact = %id.short_hex(), "removing contact");
            state.drop_contact(id);
            return;
        }

        let fails = {
            let entry = state.fails.entry(id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if fails >= self.max_fails {
            debug!(contact = %id.short_hex(), fails, "dropping failing contact");
            state.drop_contact(id);
        } else if let Some(contact) = state.find_mut(id) {
            contact.liveness = Liveness::Dead;
        }
    }

    fn contact_known(&self, contact: &Contact, is_bootstrap: bool) {
        let mut state = self.state.lock();
        if contact.id == state.local.id || contact.id.len() != state.local.id.len() {
            return;
        }
        if let Some(existing) = state.find_mut(&contact.id) {
            if existing.liveness != Liveness::Alive {
                merge_details(existing, contact);
            }
            return;
        }
        let inserted = state.insert(contact.clone(), self.k);
        trace!(contact = %contact, inserted, bootstrap = is_bootstrap, "contact known");
    }

    fn all_contacts(&self) -> Vec<Contact> {
        let state = self.state.lock();
        state
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect()
    }

    fn stats(&self) -> (usize, usize) {
        let state = self.state.lock();
        let contacts = state.buckets.iter().map(|b| b.contacts.len()).sum();
        (contacts, state.replacements.len())
    }

    fn seed(&self) {
        let mut state = self.state.lock();
        state.seeded = true;
        let contacts: usize = state.buckets.iter().map(|b| b.contacts.len()).sum();
        info!(contacts, "routing table seeded");
    }

    fn refresh_targets(&self) -> Vec<NodeId> {
        let mut state = self.state.lock();
        let local_id = state.local.id.clone();
        let mut targets = Vec::new();
        for (idx, bucket) in state.buckets.iter_mut().enumerate() {
            if !bucket.contacts.is_empty() && bucket.is_stale(BUCKET_STALE_THRESHOLD) {
                bucket.mark_refreshed();
                targets.push(random_id_for_bucket(&local_id, idx));
            }
        }
        targets
    }

    fn set_sleeping(&self, sleeping: bool) {
        self.state.lock().sleeping = sleeping;
    }

    fn set_suspended(&self, suspended: bool) {
        self.state.lock().suspended = suspended;
    }
}
