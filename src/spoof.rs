//! Anti-spoof tokens for store authorization.
//!
//! Before a node accepts a store it wants proof that the requester actually
//! received one of its replies, so it hands out a short token with every
//! find-node, find-value and query-store reply and expects the token back on
//! the store. Two schemes exist:
//!
//! | Scheme | Size | Folded input | Cache key |
//! |--------|------|--------------|-----------|
//! | Address | 4 bytes | requester IP octets | `IpAddr` |
//! | Id | 8 bytes | requester node id | `NodeId` |
//!
//! Both fold the input into a random per-process secret and run a keyed
//! blake3 digest over it. The tokens resist blind address spoofing; they are
//! not authentication.

use std::net::IpAddr;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::identity::{Contact, NodeId, VERSION_ADDRESS_TOKEN};

const SPOOF_KEY_LEN: usize = 16;

/// Recently issued tokens kept per scheme.
/// Cache forwards arrive in bursts from the same few senders.
const SPOOF_CACHE_SIZE: usize = 256;

const SPOOF_KEY_CONTEXT: &str = "dht-control 2024 anti-spoof token";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpoofToken {
    Address(u32),
    Id([u8; 8]),
}

pub struct SpoofGuard {
    secret: [u8; SPOOF_KEY_LEN],
    digest_key: [u8; 32],
    address_tokens: Mutex<LruCache<IpAddr, u32>>,
    id_tokens: Mutex<LruCache<NodeId, [u8; 8]>>,
}

impl SpoofGuard {
    pub fn new() -> Self {
        let mut secret = [0u8; SPOOF_KEY_LEN];
        if getrandom::getrandom(&mut secret).is_err() {
            rand::thread_rng().fill_bytes(&mut secret);
        }
        Self::with_secret(secret)
    }

    pub fn with_secret(secret: [u8; SPOOF_KEY_LEN]) -> Self {
        let capacity = NonZeroUsize::new(SPOOF_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            secret,
            digest_key: blake3::derive_key(SPOOF_KEY_CONTEXT, &secret),
            address_tokens: Mutex::new(LruCache::new(capacity)),
            id_tokens: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn digest(&self, folded: &[u8; SPOOF_KEY_LEN]) -> blake3::Hash {
        blake3::keyed_hash(&self.digest_key, folded)
    }

    pub fn address_token(&self, ip: IpAddr) -> u32 {
        let mut cache = self.address_tokens.lock();
        if let Some(token) = cache.get(&ip) {
            return *token;
        }

        let octets: Vec<u8> = match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        let mut folded = self.secret;
        for (i, byte) in octets.iter().enumerate() {
            folded[i % SPOOF_KEY_LEN] ^= byte;
        }
        let digest = self.digest(&folded);
        let bytes = digest.as_bytes();
        let token = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

        trace!(ip = %ip, cached = cache.len(), "issued address token");
        cache.put(ip, token);
        token
    }

    pub fn id_token(&self, id: &NodeId) -> [u8; 8] {
        let mut cache = self.id_tokens.lock();
        if let Some(token) = cache.get(id) {
            return *token;
        }

        let mut folded = self.secret;
        let n = id.len().min(SPOOF_KEY_LEN);
        for i in 0..n {
            folded[i] ^= id.as_bytes()[i];
        }
        let digest = self.digest(&folded);
        let mut token = [0u8; 8];
        token.copy_from_slice(&digest.as_bytes()[..8]);

        cache.put(id.clone(), token);
        token
    }

    /// Token to embed in a reply to `contact`, chosen by its protocol version.
    pub fn token_for(&self, contact: &Contact) -> Option<SpoofToken> {
        if contact.version < VERSION_ADDRESS_TOKEN {
            None
        } else if contact.supports_id_token() {
            Some(SpoofToken::Id(self.id_token(&contact.id)))
        } else {
            Some(SpoofToken::Address(self.address_token(contact.ip())))
        }
    }

    /// Checks the token a contact presents against the one we would issue it.
    pub fn verify(&self, contact: &Contact) -> bool {
        if contact.version < VERSION_ADDRESS_TOKEN {
            return tokens_match::<u32>(contact.address_token, None)
                && tokens_match::<[u8; 8]>(contact.id_token, None);
        }
        if contact.supports_id_token() {
            tokens_match(contact.id_token, Some(self.id_token(&contact.id)))
        } else {
            tokens_match(contact.address_token, Some(self.address_token(contact.ip())))
        }
    }
}

impl Default for SpoofGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Absent on both sides is valid; absent on one side is not.
fn tokens_match<T: PartialEq>(presented: Option<T>, expected: Option<T>) -> bool {
    match (presented, expected) {
        (None, None) => true,
        (Some(presented), Some(expected)) => presented == expected,
        _ => false,
    }
}
