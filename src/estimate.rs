//! # Network Size Estimation
//!
//! Population is estimated from how densely contacts pack around a point in
//! the id space. Given contacts `N1..Np` ordered by distance `Di` from an
//! anchor `N0`:
//!
//! ```text
//! Dc    = sum(i * Di) / sum(i * i)
//! size  = 2^(8 * id_len) / Dc
//! ```
//!
//! Each sample is kept per anchor; the local estimate is their mean. Remote
//! estimates reported by the transport are trimmed of outliers and averaged
//! in, and the result never drops below what the routing table itself holds.
//! The estimate only tunes diversification depth, so recomputation is
//! rate-limited rather than exact.

use std::collections::{BTreeSet, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::identity::{Contact, NodeId};
use crate::metric::{distance, sort_by_distance};

/// Minimum spacing between two recomputations.
pub(crate) const ESTIMATE_MIN_INTERVAL: Duration = Duration::from_secs(5);

/// The public getter recomputes once the last estimate is this old.
pub(crate) const ESTIMATE_STALE_AFTER: Duration = Duration::from_secs(60);

const LOCAL_ESTIMATE_HISTORY: usize = 32;
const REMOTE_ESTIMATE_HISTORY: usize = 128;

/// Smallest and largest remote values ignored on each side.
const REMOTE_TRIM: usize = 3;

/// Below this routeable share the transport figure is treated as noise.
const MIN_ROUTEABLE_PERCENT: u8 = 25;

struct EstimatorState {
    local_history: LruCache<NodeId, u64>,
    remote_history: VecDeque<u64>,
    local_estimate: u64,
    combined_estimate: u64,
    magnitude: usize,
    last_update: Option<Instant>,
}

pub struct SizeEstimator {
    state: Mutex<EstimatorState>,
}

impl SizeEstimator {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(LOCAL_ESTIMATE_HISTORY).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(EstimatorState {
                local_history: LruCache::new(capacity),
                remote_history: VecDeque::with_capacity(REMOTE_ESTIMATE_HISTORY),
                local_estimate: 0,
                combined_estimate: 0,
                magnitude: 0,
                last_update: None,
            }),
        }
    }

    /// Samples the contacts a lookup queried. The anchor becomes the contact
    /// closest to the lookup target.
    pub fn record_lookup(
        &self,
        target: &NodeId,
        mut queried: Vec<Contact>,
        contacts_to_use: usize,
        router_population: usize,
    ) {
        sort_by_distance(&mut queried, target);
        let anchor = queried.first().map(|c| c.id.clone()).unwrap_or_else(|| target.clone());
        self.update(&anchor, &queried, contacts_to_use, router_population);
    }

    /// Samples the routing table around the local id. `closest` must
    /// contain the local contact.
    pub fn record_router(
        &self,
        local_id: &NodeId,
        mut closest: Vec<Contact>,
        contacts_to_use: usize,
        router_population: usize,
    ) {
        sort_by_distance(&mut closest, local_id);
        self.update(local_id, &closest, contacts_to_use, router_population);
    }

    fn update(
        &self,
        anchor: &NodeId,
        sorted: &[Contact],
        contacts_to_use: usize,
        router_population: usize,
    ) {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some(last) = state.last_update {
            if now.duration_since(last) <= ESTIMATE_MIN_INTERVAL {
                return;
            }
        }
        state.last_update = Some(now);

        if let Some(estimate) = local_estimate_from(anchor, sorted, contacts_to_use) {
            state.local_history.put(anchor.clone(), estimate);
            let total: u128 = state.local_history.iter().map(|(_, v)| *v as u128).sum();
            state.local_estimate = (total / state.local_history.len() as u128) as u64;
        }

        let remote: Vec<u64> = state
            .remote_history
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut sum = state.local_estimate as u128;
        let mut count: u128 = 1;
        for value in remote
            .iter()
            .take(remote.len().saturating_sub(REMOTE_TRIM))
            .skip(REMOTE_TRIM)
        {
            sum += *value as u128;
            count += 1;
        }

        state.combined_estimate = ((sum / count) as u64).max(router_population as u64);
        state.magnitude = magnitude(state.combined_estimate);

        trace!(
            local = state.local_estimate,
            combined = state.combined_estimate,
            remote = state.remote_history.len(),
            "network size estimate updated"
        );
    }

    /// Records a size reported by another node. Non-positive sizes are ignored.
    pub fn ingest_remote(&self, size: u64) {
        if size == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.remote_history.push_back(size);
        if state.remote_history.len() > REMOTE_ESTIMATE_HISTORY {
            state.remote_history.pop_front();
        }
    }

    pub fn local_estimate(&self) -> u64 {
        self.state.lock().local_estimate
    }

    pub fn combined_estimate(&self) -> u64 {
        self.state.lock().combined_estimate
    }

    pub fn is_stale(&self) -> bool {
        match self.state.lock().last_update {
            Some(last) => last.elapsed() > ESTIMATE_STALE_AFTER,
            None => true,
        }
    }

    /// Combined estimate corrected for contacts the router cannot hold.
    pub fn scaled_estimate(&self, routeable_percentage: Option<u8>) -> u64 {
        let combined = self.combined_estimate();
        match routeable_percentage {
            Some(percent) if percent >= MIN_ROUTEABLE_PERCENT => {
                (combined as f64 * (100.0 / percent as f64)) as u64
            }
            _ => combined,
        }
    }

    pub fn max_diversification_depth(&self) -> usize {
        self.state.lock().magnitude.max(2)
    }
}

impl Default for SizeEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Estimate from a sample sorted by distance to `anchor`, whose first entry
/// is the anchor itself. `None` with fewer than three entries.
pub fn local_estimate_from(anchor: &NodeId, sorted: &[Contact], contacts_to_use: usize) -> Option<u64> {
    if sorted.len() <= 2 {
        return None;
    }

    let mut sum1 = 0.0f64;
    let mut sum2 = 0.0f64;
    for (i, contact) in sorted.iter().enumerate().take(contacts_to_use).skip(1) {
        let weight = i as f64;
        sum1 += weight * distance_value(&distance(anchor, &contact.id));
        sum2 += weight * weight;
    }

    let estimate = if sum1 == 0.0 {
        0
    } else {
        let max_space = 256f64.powi(anchor.len() as i32);
        (max_space * sum2 / sum1) as u64
    };
    Some(estimate.max(1))
}

fn distance_value(distance: &[u8]) -> f64 {
    distance.iter().fold(0.0, |acc, byte| acc * 256.0 + *byte as f64)
}

/// Decimal order of magnitude used to bound diversification depth.
pub fn magnitude(estimate: u64) -> usize {
    let mut test: u64 = 10;
    let mut mag = 1;
    while test < estimate {
        test = test.saturating_mul(10);
        mag += 1;
        if test == u64::MAX {
            break;
        }
    }
    mag + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn contact(bytes: [u8; 2]) -> Contact {
        Contact::new(
            NodeId::from_bytes(bytes.to_vec()),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000),
        )
    }

    #[test]
    fn weighted_distance_estimate() {
        let anchor = NodeId::from_bytes(vec![0, 0]);
        let sample = vec![
            contact([0, 0]),
            contact([0, 0x10]),
            contact([0, 0x20]),
            contact([0, 0x30]),
        ];
        // Dc = (16 + 2*32 + 3*48) / 14 = 16; 65536 / 16
        assert_eq!(local_estimate_from(&anchor, &sample, 20), Some(4096));
        // Only the first two neighbours: Dc = (16 + 64) / 5 = 16
        assert_eq!(local_estimate_from(&anchor, &sample, 3), Some(4096));
    }

    #[test]
    fn degenerate_samples() {
        let anchor = NodeId::from_bytes(vec![0, 0]);
        assert_eq!(local_estimate_from(&anchor, &[contact([0, 0]), contact([0, 1])], 20), None);

        let same = vec![contact([0, 0]), contact([0, 0]), contact([0, 0])];
        assert_eq!(local_estimate_from(&anchor, &same, 20), Some(1));

        let far = vec![contact([0, 0]), contact([0xff, 0xff]), contact([0xff, 0xff])];
        assert_eq!(local_estimate_from(&anchor, &far, 20), Some(1));
    }

    #[test]
    fn magnitude_steps() {
        assert_eq!(magnitude(0), 2);
        assert_eq!(magnitude(10), 2);
        assert_eq!(magnitude(11), 3);
        assert_eq!(magnitude(1_000), 4);
        assert_eq!(magnitude(1_000_000), 7);
        assert!(magnitude(u64::MAX) > 19);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_estimates_are_trimmed_and_floored() {
        let estimator = SizeEstimator::new();
        for size in [1u64, 2, 3, 100, 100, 200, 300, 1_000_000, 2_000_000, 3_000_000] {
            estimator.ingest_remote(size);
        }
        estimator.ingest_remote(0);

        let local = NodeId::from_bytes(vec![0, 0]);
        let closest = vec![contact([0, 0]), contact([0, 0x10]), contact([0, 0x20]), contact([0, 0x30])];
        estimator.record_router(&local, closest, 20, 5);

        assert_eq!(estimator.local_estimate(), 4096);
        // distinct remote values: 1 2 3 100 200 300 1e6 2e6 3e6; keep 100 200 300
        assert_eq!(estimator.combined_estimate(), (4096 + 600) / 4);
        assert_eq!(estimator.max_diversification_depth(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn recomputation_is_rate_limited() {
        let estimator = SizeEstimator::new();
        let local = NodeId::from_bytes(vec![0, 0]);
        let sample = vec![contact([0, 0]), contact([0, 0x10]), contact([0, 0x20]), contact([0, 0x30])];

        estimator.record_router(&local, sample.clone(), 20, 0);
        assert_eq!(estimator.combined_estimate(), 4096);

        estimator.record_router(&local, sample.clone(), 20, 100_000);
        assert_eq!(estimator.combined_estimate(), 4096);

        tokio::time::advance(ESTIMATE_MIN_INTERVAL + Duration::from_millis(1)).await;
        estimator.record_router(&local, sample, 20, 100_000);
        assert_eq!(estimator.combined_estimate(), 100_000);
        assert!(!estimator.is_stale());

        tokio::time::advance(ESTIMATE_STALE_AFTER + Duration::from_millis(1)).await;
        assert!(estimator.is_stale());
    }

    #[test]
    fn routeable_share_scales_estimate() {
        let estimator = SizeEstimator::new();
        estimator.state.lock().combined_estimate = 1_000;
        assert_eq!(estimator.scaled_estimate(None), 1_000);
        assert_eq!(estimator.scaled_estimate(Some(10)), 1_000);
        assert_eq!(estimator.scaled_estimate(Some(50)), 2_000);
    }

    #[test]
    fn lookup_sample_anchors_on_closest_contact() {
        let estimator = SizeEstimator::new();
        let target = NodeId::from_bytes(vec![0x80, 0x00]);
        let queried = vec![
            contact([0x80, 0x30]),
            contact([0x80, 0x00]),
            contact([0x80, 0x20]),
            contact([0x80, 0x10]),
        ];
        estimator.record_lookup(&target, queried, 20, 0);
        assert_eq!(estimator.local_estimate(), 4096);
    }
}
