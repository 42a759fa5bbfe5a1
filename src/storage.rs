//! Reference value store with key blocks and store-time diversification.
//!
//! This module provides an in-memory [`Storage`] for embedders without a
//! persistent database, and for tests:
//! - LRU cache of keys, each holding at most one value per originator
//! - Size diversification once a key collects too many originators
//! - Frequency diversification once a key is read too often
//! - Key blocks validated against an optional authority key
//! - Lazy expiration by value lifetime

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::identity::{Contact, NodeId};
use crate::messages::{now_millis, DiversificationType, KeyBlock, StorageLookup, StoredValue};
use crate::protocols::Storage;

/// Lifetime of values stored without an explicit `life_hours`.
pub(crate) const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How often to sweep for expired values.
const EXPIRATION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum size of a single stored value.
const MAX_VALUE_SIZE: usize = 64 * 1024;

/// Maximum keys in the store.
const LOCAL_STORE_MAX_KEYS: usize = 100_000;

/// Originators per key before further writes are diversified by size.
pub(crate) const DEFAULT_MAX_VALUES_PER_KEY: usize = 64;

/// Window and limit for read-frequency diversification.
const READ_WINDOW: Duration = Duration::from_secs(60);
const READ_LIMIT: usize = 200;

/// A value with its local arrival time.
#[derive(Clone)]
struct Held {
    value: StoredValue,
    stored_at: Instant,
}

impl Held {
    fn expires_at(&self) -> Instant {
        let ttl = match self.value.life_hours {
            0 => DEFAULT_TTL,
            hours => Duration::from_secs(hours as u64 * 60 * 60),
        };
        self.stored_at + ttl
    }
}

struct KeyEntry {
    values: Vec<Held>,
    reads: VecDeque<Instant>,
    diversification: DiversificationType,
}

impl KeyEntry {
    fn new() -> Self {
        Self {
            values: Vec::new(),
            reads: VecDeque::new(),
            diversification: DiversificationType::None,
        }
    }

    fn record_read(&mut self, now: Instant) {
        self.reads.push_back(now);
        while let Some(front) = self.reads.front() {
            if now.duration_since(*front) > READ_WINDOW {
                self.reads.pop_front();
            } else {
                break;
            }
        }
        if self.reads.len() > READ_LIMIT && self.diversification == DiversificationType::None {
            self.diversification = DiversificationType::Frequency;
        }
    }

    fn position(&self, originator: &NodeId) -> Option<usize> {
        self.values.iter().position(|h| &h.value.originator.id == originator)
    }
}

struct StoreState {
    entries: LruCache<NodeId, KeyEntry>,
    blocks: HashMap<NodeId, KeyBlock>,
    last_expiration_check: Instant,
    sleeping: bool,
    suspended: bool,
}

impl StoreState {
    fn maybe_expire_entries(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_expiration_check) < EXPIRATION_CHECK_INTERVAL {
            return;
        }
        self.last_expiration_check = now;

        let mut expired = 0usize;
        let mut emptied = Vec::new();
        for (key, entry) in self.entries.iter_mut() {
            let before = entry.values.len();
            entry.values.retain(|h| now < h.expires_at());
            expired += before - entry.values.len();
            if entry.values.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            self.entries.pop(&key);
        }
        if expired > 0 {
            debug!(expired_count = expired, "removing expired values");
        }
    }
}

/// In-memory value store.
pub struct MemoryStorage {
    local_id: NodeId,
    max_values_per_key: usize,
    block_authority: Option<[u8; 32]>,
    state: Mutex<StoreState>,
}

impl MemoryStorage {
    pub fn new(local_id: NodeId) -> Self {
        let cap = NonZeroUsize::new(LOCAL_STORE_MAX_KEYS).unwrap_or(NonZeroUsize::MIN);
        Self {
            local_id,
            max_values_per_key: DEFAULT_MAX_VALUES_PER_KEY,
            block_authority: None,
            state: Mutex::new(StoreState {
                entries: LruCache::new(cap),
                blocks: HashMap::new(),
                last_expiration_check: Instant::now(),
                sleeping: false,
                suspended: false,
            }),
        }
    }

    pub fn with_max_values_per_key(mut self, max: usize) -> Self {
        self.max_values_per_key = max.max(1);
        self
    }

    /// Accept key blocks whose signature is the keyed blake3 digest of the
    /// request under `authority`. Without an authority every block is refused.
    pub fn with_block_authority(mut self, authority: [u8; 32]) -> Self {
        self.block_authority = Some(authority);
        self
    }

    /// Signature a block authority would attach to `request`.
    pub fn sign_block_request(authority: &[u8; 32], request: &[u8]) -> Vec<u8> {
        blake3::keyed_hash(authority, request).as_bytes().to_vec()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sleeping(&self) -> bool {
        self.state.lock().sleeping
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }
}

impl Storage for MemoryStorage {
    fn store(&self, originator: &Contact, key: &NodeId, values: &[StoredValue]) -> DiversificationType {
        let mut state = self.state.lock();
        if state.blocks.contains_key(key) {
            debug!(key = %key.short_hex(), "store refused: key blocked");
            return DiversificationType::None;
        }
        state.maybe_expire_entries();

        let now = Instant::now();
        let max_values = self.max_values_per_key;
        let entry = state.entries.get_or_insert_mut(key.clone(), KeyEntry::new);

        for value in values {
            if value.payload.len() > MAX_VALUE_SIZE {
                warn!(
                    size = value.payload.len(),
                    limit = MAX_VALUE_SIZE,
                    from = %originator,
                    "rejecting oversized value"
                );
                continue;
            }

            let existing = entry.position(&value.originator.id);
            if value.is_deletion() {
                if let Some(pos) = existing {
                    entry.values.remove(pos);
                }
                continue;
            }

            let held = Held {
                value: value.clone(),
                stored_at: now,
            };
            match existing {
                Some(pos) => entry.values[pos] = held,
                None if entry.values.len() < max_values => entry.values.push(held),
                None => {
                    if entry.diversification == DiversificationType::None {
                        info!(key = %key.short_hex(), values = entry.values.len(), "diversifying key by size");
                        entry.diversification = DiversificationType::Size;
                    }
                }
            }
        }

        let diversification = entry.diversification;
        if entry.values.is_empty() {
            state.entries.pop(key);
        }
        diversification
    }

    fn get(&self, _reader: &Contact, key: &NodeId, max_values: usize, _flags: u16) -> Option<StorageLookup> {
        let mut state = self.state.lock();
        if state.blocks.contains_key(key) {
            return Some(StorageLookup::default());
        }
        state.maybe_expire_entries();

        let now = Instant::now();
        let entry = state.entries.get_mut(key)?;
        entry.record_read(now);

        let limit = if max_values == 0 { usize::MAX } else { max_values };
        let values = entry
            .values
            .iter()
            .filter(|h| now < h.expires_at())
            .take(limit)
            .map(|h| h.value.clone())
            .collect();
        Some(StorageLookup {
            values,
            diversification: entry.diversification,
        })
    }

    fn local_value(&self, key: &NodeId) -> Option<StoredValue> {
        let mut state = self.state.lock();
        let entry = state.entries.get(key)?;
        entry
            .position(&self.local_id)
            .map(|pos| entry.values[pos].value.clone())
    }

    fn stored_values(&self, key: &NodeId) -> Vec<StoredValue> {
        let mut state = self.state.lock();
        state
            .entries
            .get(key)
            .map(|entry| entry.values.iter().map(|h| h.value.clone()).collect())
            .unwrap_or_default()
    }

    fn has_key(&self, key: &NodeId) -> bool {
        self.state.lock().entries.contains(key)
    }

    fn remove(&self, originator: &Contact, key: &NodeId) -> Option<StoredValue> {
        let mut state = self.state.lock();
        let entry = state.entries.get_mut(key)?;
        let pos = entry.position(&originator.id)?;
        let removed = entry.values.remove(pos).value;
        if entry.values.is_empty() {
            state.entries.pop(key);
        }
        Some(removed)
    }

    fn is_key_blocked(&self, key: &NodeId) -> bool {
        self.state.lock().blocks.contains_key(key)
    }

    fn key_block_details(&self, key: &NodeId) -> Option<KeyBlock> {
        self.state.lock().blocks.get(key).cloned()
    }

    fn key_block_request(
        &self,
        originator: Option<&Contact>,
        request: &[u8],
        signature: &[u8],
    ) -> Option<KeyBlock> {
        let authority = self.block_authority.as_ref()?;
        let id_len = self.local_id.len();
        if request.len() < id_len {
            debug!(len = request.len(), "key block request too short");
            return None;
        }
        if Self::sign_block_request(authority, request) != signature {
            debug!(from = ?originator.map(|c| c.to_string()), "key block signature rejected");
            return None;
        }

        let key = NodeId::from_bytes(request[..id_len].to_vec());
        let mut state = self.state.lock();
        if let Some(existing) = state.blocks.get(&key) {
            return Some(existing.clone());
        }
        let block = KeyBlock {
            key: key.clone(),
            request: request.to_vec(),
            certificate: signature.to_vec(),
            received: now_millis(),
        };
        state.entries.pop(&key);
        state.blocks.insert(key.clone(), block.clone());
        info!(key = %key.short_hex(), "key blocked");
        Some(block)
    }

    fn query_store(&self, header_len: usize, key_prefixes: &[Vec<u8>], max: usize) -> Vec<Vec<u8>> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for (key, _) in state.entries.iter() {
            if out.len() >= max {
                break;
            }
            let bytes = key.as_bytes();
            if bytes.len() < header_len {
                continue;
            }
            let header = &bytes[..header_len];
            if key_prefixes
                .iter()
                .any(|prefix| prefix.len() >= header_len && &prefix[..header_len] == header)
            {
                out.push(bytes.to_vec());
            }
        }
        out
    }

    fn set_sleeping(&self, sleeping: bool) {
        self.state.lock().sleeping = sleeping;
    }

    fn set_suspended(&self, suspended: bool) {
        self.state.lock().suspended = suspended;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn make_contact(seed: u8) -> Contact {
        let mut bytes = vec![0u8; 20];
        bytes[0] = seed;
        Contact::new(
            NodeId::from_bytes(bytes),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, seed)), 4000),
        )
    }

    fn make_key(seed: u8) -> NodeId {
        NodeId::from_bytes(vec![seed; 20])
    }

    #[test]
    fn store_and_retrieve() {
        let local = make_contact(0x01);
        let store = MemoryStorage::new(local.id.clone());
        let key = make_key(0xaa);
        let value = StoredValue::new(local.clone(), b"test value".to_vec(), 0);

        assert_eq!(store.store(&local, &key, &[value.clone()]), DiversificationType::None);
        assert!(store.has_key(&key));
        assert_eq!(store.local_value(&key), Some(value.clone()));

        let lookup = store.get(&make_contact(0x02), &key, 0, 0).expect("key present");
        assert_eq!(lookup.values, vec![value]);
    }

    #[test]
    fn one_value_per_originator() {
        let store = MemoryStorage::new(make_contact(0x01).id);
        let key = make_key(0xaa);
        let peer = make_contact(0x02);
        store.store(&peer, &key, &[StoredValue::new(peer.clone(), b"one".to_vec(), 0)]);
        store.store(&peer, &key, &[StoredValue::new(peer.clone(), b"two".to_vec(), 0)]);

        let values = store.stored_values(&key);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].payload, b"two".to_vec());
        assert!(store.local_value(&key).is_none());
    }

    #[test]
    fn zero_length_value_deletes() {
        let store = MemoryStorage::new(make_contact(0x01).id);
        let key = make_key(0xaa);
        let peer = make_contact(0x02);
        store.store(&peer, &key, &[StoredValue::new(peer.clone(), b"v".to_vec(), 0)]);
        store.store(&peer, &key, &[StoredValue::new(peer.clone(), Vec::new(), 0)]);
        assert!(!store.has_key(&key));
    }

    #[test]
    fn remove_returns_previous_value() {
        let local = make_contact(0x01);
        let store = MemoryStorage::new(local.id.clone());
        let key = make_key(0xaa);
        assert!(store.remove(&local, &key).is_none());

        store.store(&local, &key, &[StoredValue::new(local.clone(), b"mine".to_vec(), 0)]);
        let removed = store.remove(&local, &key).expect("value existed");
        assert_eq!(removed.payload, b"mine".to_vec());
        assert!(store.get(&local, &key, 0, 0).is_none());
    }

    #[test]
    fn crowded_key_diversifies_by_size() {
        let store = MemoryStorage::new(make_contact(0x01).id).with_max_values_per_key(2);
        let key = make_key(0xaa);
        let mut last = DiversificationType::None;
        for seed in 2..5 {
            let peer = make_contact(seed);
            last = store.store(&peer, &key, &[StoredValue::new(peer.clone(), vec![seed], 0)]);
        }
        assert_eq!(last, DiversificationType::Size);
        assert_eq!(store.stored_values(&key).len(), 2);
    }

    #[test]
    fn key_blocks_require_authority_signature() {
        let authority = [9u8; 32];
        let local = make_contact(0x01);
        let store = MemoryStorage::new(local.id.clone()).with_block_authority(authority);
        let key = make_key(0xaa);
        store.store(&local, &key, &[StoredValue::new(local.clone(), b"v".to_vec(), 0)]);

        let mut request = key.as_bytes().to_vec();
        request.extend_from_slice(b"reason");
        assert!(store.key_block_request(None, &request, b"forged").is_none());
        assert!(!store.is_key_blocked(&key));

        let signature = MemoryStorage::sign_block_request(&authority, &request);
        let block = store
            .key_block_request(None, &request, &signature)
            .expect("signed request accepted");
        assert_eq!(block.key, key);
        assert!(store.is_key_blocked(&key));
        assert_eq!(store.key_block_details(&key), Some(block));
        assert!(store.stored_values(&key).is_empty());

        let lookup = store.get(&local, &key, 0, 0).expect("blocked keys still answer");
        assert!(lookup.values.is_empty());
        assert_eq!(
            store.store(&local, &key, &[StoredValue::new(local.clone(), b"v".to_vec(), 0)]),
            DiversificationType::None
        );
        assert!(store.stored_values(&key).is_empty());
    }

    #[test]
    fn unconfigured_store_refuses_blocks() {
        let store = MemoryStorage::new(make_key(0x01));
        let request = make_key(0xaa).as_bytes().to_vec();
        let signature = MemoryStorage::sign_block_request(&[0u8; 32], &request);
        assert!(store.key_block_request(None, &request, &signature).is_none());
    }

    #[test]
    fn query_store_matches_prefixes() {
        let local = make_contact(0x01);
        let store = MemoryStorage::new(local.id.clone());
        for seed in [0x10u8, 0x11, 0x20] {
            let key = make_key(seed);
            store.store(&local, &key, &[StoredValue::new(local.clone(), vec![seed], 0)]);
        }
        let found = store.query_store(1, &[vec![0x10], vec![0x20]], 10);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|k| k[0] == 0x10 || k[0] == 0x20));
        assert_eq!(store.query_store(1, &[vec![0x10], vec![0x20]], 1).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_their_lifetime() {
        let local = make_contact(0x01);
        let store = MemoryStorage::new(local.id.clone());
        let key = make_key(0xaa);
        store.store(
            &local,
            &key,
            &[StoredValue::new(local.clone(), b"short".to_vec(), 0).with_life_hours(1)],
        );
        assert_eq!(store.get(&local, &key, 0, 0).map(|l| l.values.len()), Some(1));

        tokio::time::advance(Duration::from_secs(60 * 60 + 1)).await;
        assert!(store.get(&local, &key, 0, 0).is_none());
    }
}
