//! Reference diversification adapter.
//!
//! When a storage node answers with a diversification, the key is spread
//! over [`DIV_WIDTH`] derived keys. Which of them a request uses depends on
//! the kind of diversification and the direction:
//!
//! | Kind | Put | Get |
//! |------|-----|-----|
//! | `Frequency` | all derived keys | one random derived key |
//! | `Size` | a fixed subset of [`DIV_FRAG_GET_SIZE`] | a random subset, or all when exhaustive |
//!
//! Exhaustive puts also keep the original key. Derived keys may themselves
//! be diversified, so resolution follows the chain up to a depth bound. A
//! chain that hits the bound resolves to no keys at all.

use std::collections::HashMap;

use parking_lot::Mutex;
use rand::seq::index::sample;
use rand::Rng;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::identity::{Contact, NodeId};
use crate::messages::DiversificationType;
use crate::protocols::DiversificationAdapter;

pub const DIV_WIDTH: usize = 10;
pub const DIV_FRAG_GET_SIZE: usize = 2;

/// Diversifications are forgotten after this long plus a random share of
/// [`DIV_EXPIRY_RAND`].
const DIV_EXPIRY_MIN: Duration = Duration::from_secs(2 * 24 * 60 * 60);
const DIV_EXPIRY_RAND: Duration = Duration::from_secs(24 * 60 * 60);

/// Derived key `offset` of `key`: blake3 of the key with the offset byte
/// appended, cut to the key length.
pub fn derive_key(key: &NodeId, offset: usize) -> NodeId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(&[offset as u8]);
    let mut out = vec![0u8; key.len()];
    hasher.finalize_xof().fill(&mut out);
    NodeId::from_bytes(out)
}

#[derive(Clone, Debug)]
struct Diversification {
    kind: DiversificationType,
    fixed_put_offsets: Vec<usize>,
    expires: Instant,
}

impl Diversification {
    fn new(kind: DiversificationType) -> Self {
        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0..DIV_EXPIRY_RAND.as_secs());
        Self {
            kind,
            fixed_put_offsets: sample(&mut rng, DIV_WIDTH, DIV_FRAG_GET_SIZE).into_vec(),
            expires: Instant::now() + DIV_EXPIRY_MIN + Duration::from_secs(jitter),
        }
    }

    fn keys(&self, key: &NodeId, put: bool, exhaustive: bool) -> Vec<NodeId> {
        let mut keys = Vec::new();
        let mut rng = rand::thread_rng();
        match (put, self.kind) {
            (true, DiversificationType::Frequency) => {
                keys.extend((0..DIV_WIDTH).map(|i| derive_key(key, i)));
                if exhaustive {
                    keys.push(key.clone());
                }
            }
            (true, _) => {
                keys.extend(self.fixed_put_offsets.iter().map(|i| derive_key(key, *i)));
                if exhaustive {
                    keys.push(key.clone());
                }
            }
            (false, DiversificationType::Frequency) => {
                keys.push(derive_key(key, rng.gen_range(0..DIV_WIDTH)));
            }
            (false, _) if exhaustive => {
                keys.extend((0..DIV_WIDTH).map(|i| derive_key(key, i)));
            }
            (false, _) => {
                keys.extend(
                    sample(&mut rng, DIV_WIDTH, DIV_FRAG_GET_SIZE)
                        .into_iter()
                        .map(|i| derive_key(key, i)),
                );
            }
        }
        keys
    }
}

/// In-memory [`DiversificationAdapter`] that follows diversification chains.
#[derive(Default)]
pub struct ChainDiversifier {
    divs: Mutex<HashMap<NodeId, Diversification>>,
}

impl ChainDiversifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.divs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn push_unique(list: &mut Vec<NodeId>, key: NodeId) {
    if !list.contains(&key) {
        list.push(key);
    }
}

fn follow_chain(
    divs: &HashMap<NodeId, Diversification>,
    keys: Vec<NodeId>,
    put: bool,
    depth: usize,
    exhaustive: bool,
    done: &mut Vec<NodeId>,
    max_depth: usize,
) -> Vec<NodeId> {
    let mut out = Vec::new();
    if depth >= max_depth {
        debug!(max_depth, "diversification chain terminated at depth bound");
        return out;
    }

    for key in keys {
        let Some(div) = divs.get(&key) else {
            push_unique(&mut out, key);
            continue;
        };
        if done.contains(&key) {
            // an earlier diversification in the chain wants this key kept
            push_unique(&mut out, key);
            continue;
        }
        done.push(key.clone());
        let derived = div.keys(&key, put, exhaustive);
        for entry in follow_chain(divs, derived, put, depth + 1, exhaustive, done, max_depth) {
            push_unique(&mut out, entry);
        }
    }
    out
}

impl DiversificationAdapter for ChainDiversifier {
    fn diversify(
        &self,
        cause: Option<&Contact>,
        put: bool,
        existing: bool,
        key: &NodeId,
        diversification: DiversificationType,
        exhaustive: bool,
        max_depth: usize,
    ) -> Vec<NodeId> {
        let mut divs = self.divs.lock();
        let now = Instant::now();
        divs.retain(|_, div| div.expires > now);

        if !existing && diversification != DiversificationType::None && !divs.contains_key(key) {
            debug!(
                key = %key.short_hex(),
                kind = ?diversification,
                cause = ?cause.map(|c| c.to_string()),
                "recording diversification"
            );
            divs.insert(key.clone(), Diversification::new(diversification));
        }

        let mut done = Vec::new();
        follow_chain(&divs, vec![key.clone()], put, 0, exhaustive, &mut done, max_depth)
    }

    fn is_diversified(&self, key: &NodeId) -> bool {
        self.divs.lock().contains_key(key)
    }
}
