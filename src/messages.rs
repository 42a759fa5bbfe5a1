//! # Values, flags and replies
//!
//! Types exchanged with the transport and storage collaborators, plus the
//! bounded bincode helpers used for persisted control state.
//!
//! ## Flags
//!
//! Request and value flags share one `u16` space. The low byte travels
//! with stored values; the high byte only affects how a request is run.
//!
//! | Flag | Meaning |
//! |------|---------|
//! | `FLAG_STATS` | value search is after per-key statistics, not values |
//! | `FLAG_ANON` | value is served with its originator address hidden |
//! | `FLAG_LOOKUP_FOR_STORE` | node lookup ahead of a store |
//! | `FLAG_OBFUSCATE_LOOKUP` | query an obfuscated key first |
//! | `FLAG_HIGH_PRIORITY` | admitted ahead of normal work waiting in the same pool |

use std::time::{SystemTime, UNIX_EPOCH};

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{Contact, NodeId};
use crate::spoof::SpoofToken;

pub const FLAG_SINGLE_VALUE: u16 = 0x0000;
pub const FLAG_DOWNLOADING: u16 = 0x0001;
pub const FLAG_SEEDING: u16 = 0x0002;
pub const FLAG_MULTI_VALUE: u16 = 0x0004;
pub const FLAG_STATS: u16 = 0x0008;
pub const FLAG_ANON: u16 = 0x0010;
pub const FLAG_PRECIOUS: u16 = 0x0020;
pub const FLAG_LOOKUP_FOR_STORE: u16 = 0x0100;
pub const FLAG_OBFUSCATE_LOOKUP: u16 = 0x0200;
pub const FLAG_HIGH_PRIORITY: u16 = 0x0400;

/// Upper bound on persisted control state.
/// Export holds contacts only, so this is generous.
pub const MAX_STATE_SIZE: u64 = 4 * 1024 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_STATE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Server-directed redirection of a key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiversificationType {
    #[default]
    None,
    /// Key is too popular: spread reads and writes across derived keys.
    Frequency,
    /// Key holds too many values: move further writes to a derived key.
    Size,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredValue {
    pub payload: Vec<u8>,
    pub flags: u16,
    pub life_hours: u8,
    pub replication_control: u8,
    pub originator: Contact,
    /// Milliseconds since the UNIX epoch.
    pub created: u64,
    pub version: u32,
}

impl StoredValue {
    pub fn new(originator: Contact, payload: Vec<u8>, flags: u16) -> Self {
        Self {
            payload,
            flags,
            life_hours: 0,
            replication_control: 0,
            originator,
            created: now_millis(),
            version: 0,
        }
    }

    pub fn with_life_hours(mut self, life_hours: u8) -> Self {
        self.life_hours = life_hours;
        self
    }

    pub fn with_replication_control(mut self, replication_control: u8) -> Self {
        self.replication_control = replication_control;
        self
    }

    /// Zero-length payloads mean "delete".
    pub fn is_deletion(&self) -> bool {
        self.payload.is_empty()
    }

    /// Identity used to de-duplicate values seen from several responders.
    pub fn dedup_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.originator.id.len() + self.payload.len());
        key.extend_from_slice(self.originator.id.as_bytes());
        key.extend_from_slice(&self.payload);
        key
    }
}

/// Read access to a value, so wrappers can override parts of it.
pub trait ValueView {
    fn payload(&self) -> &[u8];
    fn flags(&self) -> u16;
    fn life_hours(&self) -> u8;
    fn replication_control(&self) -> u8;
    fn originator(&self) -> Contact;
    fn created(&self) -> u64;
    fn version(&self) -> u32;

    fn to_stored(&self) -> StoredValue {
        StoredValue {
            payload: self.payload().to_vec(),
            flags: self.flags(),
            life_hours: self.life_hours(),
            replication_control: self.replication_control(),
            originator: self.originator(),
            created: self.created(),
            version: self.version(),
        }
    }
}

impl ValueView for StoredValue {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn flags(&self) -> u16 {
        self.flags
    }

    fn life_hours(&self) -> u8 {
        self.life_hours
    }

    fn replication_control(&self) -> u8 {
        self.replication_control
    }

    fn originator(&self) -> Contact {
        self.originator.clone()
    }

    fn created(&self) -> u64 {
        self.created
    }

    fn version(&self) -> u32 {
        self.version
    }
}

/// Serves a value with its originator's address hidden.
pub struct Anonymized<'a, V: ValueView>(pub &'a V);

impl<V: ValueView> ValueView for Anonymized<'_, V> {
    fn payload(&self) -> &[u8] {
        self.0.payload()
    }

    fn flags(&self) -> u16 {
        self.0.flags()
    }

    fn life_hours(&self) -> u8 {
        self.0.life_hours()
    }

    fn replication_control(&self) -> u8 {
        self.0.replication_control()
    }

    fn originator(&self) -> Contact {
        self.0.originator().anonymized()
    }

    fn created(&self) -> u64 {
        self.0.created()
    }

    fn version(&self) -> u32 {
        self.0.version()
    }
}

/// A value that carries another payload but keeps the basis metadata.
pub struct Substituted<'a, V: ValueView> {
    basis: &'a V,
    payload: Vec<u8>,
}

impl<'a, V: ValueView> Substituted<'a, V> {
    pub fn new(basis: &'a V, payload: Vec<u8>) -> Self {
        Self { basis, payload }
    }
}

impl<V: ValueView> ValueView for Substituted<'_, V> {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn flags(&self) -> u16 {
        self.basis.flags()
    }

    fn life_hours(&self) -> u8 {
        self.basis.life_hours()
    }

    fn replication_control(&self) -> u8 {
        self.basis.replication_control()
    }

    fn originator(&self) -> Contact {
        self.basis.originator()
    }

    fn created(&self) -> u64 {
        self.basis.created()
    }

    fn version(&self) -> u32 {
        self.basis.version()
    }
}

/// Replaces anonymous-flagged values by their anonymized form.
pub fn anonymize_values(values: Vec<StoredValue>) -> Vec<StoredValue> {
    values
        .into_iter()
        .map(|value| {
            if value.flags & FLAG_ANON != 0 {
                Anonymized(&value).to_stored()
            } else {
                value
            }
        })
        .collect()
}

/// A signed request asking nodes to stop serving a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBlock {
    pub key: NodeId,
    pub request: Vec<u8>,
    pub certificate: Vec<u8>,
    pub received: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FindNodeReply {
    pub contacts: Vec<Contact>,
    pub spoof_token: Option<SpoofToken>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FindValueReply {
    Values {
        values: Vec<StoredValue>,
        diversification: DiversificationType,
        more_to_come: bool,
        spoof_token: Option<SpoofToken>,
    },
    Contacts(FindNodeReply),
    KeyBlocked {
        request: Vec<u8>,
        signature: Vec<u8>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreReply {
    /// One entry per stored key.
    Diversifications(Vec<DiversificationType>),
    KeyBlocked {
        request: Vec<u8>,
        signature: Vec<u8>,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueryStoreReply {
    /// Keys held locally that match the queried prefixes.
    pub keys: Vec<Vec<u8>>,
    pub spoof_token: Option<SpoofToken>,
}

/// Result of a storage read.
#[derive(Clone, Debug, Default)]
pub struct StorageLookup {
    pub values: Vec<StoredValue>,
    pub diversification: DiversificationType,
}
