//! Collaborator traits the control plane is built against.
//!
//! The control plane owns the search and replication algorithms; everything
//! else is reached through these seams:
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Wire | [`Transport`] | Outbound RPCs to a single contact |
//! | Routing table | [`Router`] | Contact liveness and closest-contact queries |
//! | Value store | [`Storage`] | Local values, key blocks and store-time diversification |
//! | Diversification | [`DiversificationAdapter`] | Maps a key to the keys it has been spread over |
//!
//! The routing table and storage are shared with other subsystems. The
//! control plane never holds its own locks while calling into them.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::identity::{Contact, NodeId};
use crate::messages::{
    DiversificationType, FindNodeReply, FindValueReply, KeyBlock, StorageLookup, StoreReply,
    StoredValue,
};

/// Outbound RPCs.
///
/// Every call resolves exactly once. `find_value` may deliver several
/// batches (`more_to_come`) and may end in an error after some of them.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn find_node(&self, to: &Contact, id: &NodeId, flags: u16) -> Result<FindNodeReply>;

    fn find_value(
        &self,
        to: &Contact,
        key: &NodeId,
        max_values: usize,
        flags: u16,
    ) -> BoxStream<'static, Result<FindValueReply>>;

    async fn store(
        &self,
        to: &Contact,
        keys: &[NodeId],
        value_sets: &[Vec<StoredValue>],
        immediate: bool,
    ) -> Result<StoreReply>;

    async fn ping(&self, to: &Contact) -> Result<()>;

    async fn key_block(&self, to: &Contact, request: &[u8], signature: &[u8]) -> Result<()>;

    fn set_sleeping(&self, _sleeping: bool) {}

    fn set_suspended(&self, _suspended: bool) {}

    /// Share of recent contacts that were directly reachable, if known.
    fn routeable_percentage(&self) -> Option<u8> {
        None
    }
}

/// Routing table collaborator.
pub trait Router: Send + Sync + 'static {
    fn local_contact(&self) -> Contact;

    fn local_id(&self) -> NodeId {
        self.local_contact().id
    }

    fn k(&self) -> usize;

    fn is_id(&self, id: &NodeId) -> bool {
        self.local_contact().id == *id
    }

    /// Up to `n` contacts ordered by ascending distance to `id`.
    fn find_closest_contacts(&self, id: &NodeId, n: usize, live_only: bool) -> Vec<Contact>;

    fn contact_alive(&self, contact: &Contact);

    fn contact_dead(&self, id: &NodeId, permanent: bool);

    fn contact_known(&self, contact: &Contact, is_bootstrap: bool);

    fn all_contacts(&self) -> Vec<Contact>;

    /// `(contacts, replacements)` currently held.
    fn stats(&self) -> (usize, usize);

    /// Called once the table has been populated from the network.
    fn seed(&self) {}

    /// Ids that should be looked up to keep the table fresh.
    fn refresh_targets(&self) -> Vec<NodeId> {
        Vec::new()
    }

    fn set_sleeping(&self, _sleeping: bool) {}

    fn set_suspended(&self, _suspended: bool) {}
}

/// Local value store collaborator.
pub trait Storage: Send + Sync + 'static {
    /// Stores values received for `key`, reporting any diversification it now needs.
    fn store(
        &self,
        originator: &Contact,
        key: &NodeId,
        values: &[StoredValue],
    ) -> DiversificationType;

    fn get(
        &self,
        reader: &Contact,
        key: &NodeId,
        max_values: usize,
        flags: u16,
    ) -> Option<StorageLookup>;

    /// The value this node itself published under `key`, if any.
    fn local_value(&self, key: &NodeId) -> Option<StoredValue>;

    fn stored_values(&self, key: &NodeId) -> Vec<StoredValue>;

    fn has_key(&self, key: &NodeId) -> bool;

    fn remove(&self, originator: &Contact, key: &NodeId) -> Option<StoredValue>;

    fn is_key_blocked(&self, key: &NodeId) -> bool;

    fn key_block_details(&self, key: &NodeId) -> Option<KeyBlock>;

    /// Validates and records a key-block request. `None` when it is rejected.
    fn key_block_request(
        &self,
        originator: Option<&Contact>,
        request: &[u8],
        signature: &[u8],
    ) -> Option<KeyBlock>;

    /// Keys matching any of the `header_len`-byte prefixes, at most `max`.
    fn query_store(&self, header_len: usize, key_prefixes: &[Vec<u8>], max: usize) -> Vec<Vec<u8>>;

    fn set_sleeping(&self, _sleeping: bool) {}

    fn set_suspended(&self, _suspended: bool) {}
}

/// Tracks keys that storage nodes asked to spread over derived keys.
pub trait DiversificationAdapter: Send + Sync + 'static {
    /// Keys to use in place of `key`.
    ///
    /// With `existing` set, returns the keys already known for `key`
    /// (usually just `key` itself). Otherwise records a new diversification
    /// of `diversification` caused by `cause` and returns the derived keys.
    /// An empty result means `key` is over-diversified.
    #[allow(clippy::too_many_arguments)]
    fn diversify(
        &self,
        cause: Option<&Contact>,
        put: bool,
        existing: bool,
        key: &NodeId,
        diversification: DiversificationType,
        exhaustive: bool,
        max_depth: usize,
    ) -> Vec<NodeId>;

    fn is_diversified(&self, key: &NodeId) -> bool;
}
