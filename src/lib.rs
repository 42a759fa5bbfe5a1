//! Control plane of a Kademlia-style DHT.
//!
//! [`DhtControl`] runs iterative lookups, replicated puts and gets with
//! key diversification, spoof-resistant store authorization and network
//! size estimation. The wire, routing table, value store and
//! diversification bookkeeping are collaborators behind the traits in
//! [`protocols`]; in-memory implementations of the last three ship with
//! the crate.

mod activity;
mod config;
mod control;
mod diversify;
mod error;
mod estimate;
mod identity;
mod lookup;
mod messages;
mod metric;
mod operation;
mod pools;
pub mod protocols;
mod replication;
mod routing;
mod spoof;
mod storage;

pub use activity::{
    ActivityEntry, ActivityEvent, ActivityKind, ActivityNode, ActivitySource, ActivityState,
    ActivityTracker,
};
pub use config::{ConfigError, ControlConfig};
pub use control::{DhtControl, GetOptions, GetOutcome, PutOptions, RemoveOutcome};
pub use diversify::{derive_key, ChainDiversifier, DIV_FRAG_GET_SIZE, DIV_WIDTH};
pub use error::ControlError;
pub use estimate::{local_estimate_from, magnitude, SizeEstimator};
pub use identity::{
    estimate_rtt, Contact, Liveness, NetworkPosition, NodeId, PROTOCOL_VERSION,
    VERSION_ADDRESS_TOKEN, VERSION_ID_TOKEN,
};
pub use lookup::{LookupObserver, LookupOutcome, LookupRequest, NoopObserver};
pub use messages::{
    anonymize_values, DiversificationType, FindNodeReply, FindValueReply, KeyBlock,
    QueryStoreReply, StorageLookup, StoreReply, StoredValue, FLAG_ANON, FLAG_DOWNLOADING,
    FLAG_HIGH_PRIORITY, FLAG_LOOKUP_FOR_STORE, FLAG_MULTI_VALUE, FLAG_OBFUSCATE_LOOKUP,
    FLAG_PRECIOUS, FLAG_SEEDING, FLAG_SINGLE_VALUE, FLAG_STATS, MAX_STATE_SIZE,
};
pub use metric::{compare, distance, sort_by_distance, KeyEncoder};
pub use operation::{CancelToken, NoopListener, OperationListener, TaskSet};
pub use pools::{AdmissionPools, PoolKind};
pub use protocols::{DiversificationAdapter, Router, Storage, Transport};
pub use replication::{CompletionJoin, PutOutcome};
pub use routing::MemoryRouter;
pub use spoof::{SpoofGuard, SpoofToken};
pub use storage::MemoryStorage;
