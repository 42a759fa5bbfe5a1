//! Node identifiers and contacts.
//!
//! A [`NodeId`] is a fixed-length byte string; the length is chosen per
//! deployment (20 bytes by default) and every id inside one control plane
//! shares it. A [`Contact`] is everything the control plane knows about a
//! remote node: where to reach it, which protocol version it speaks, its
//! liveness as last reported by the routing table, and the spoof tokens it
//! presents on stores.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::spoof::SpoofToken;

/// Contacts below this version predate spoof tokens entirely.
pub const VERSION_ADDRESS_TOKEN: u8 = 1;

/// Contacts at or above this version are issued id-keyed tokens.
pub const VERSION_ID_TOKEN: u8 = 2;

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u8 = VERSION_ID_TOKEN;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Vec<u8>);

impl NodeId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn zero(len: usize) -> Self {
        Self(vec![0u8; len])
    }

    pub fn random(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Hex of the first eight bytes, used in log fields.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(8)])
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Vec<u8>> for NodeId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for NodeId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Liveness as last reported by the routing table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Liveness {
    Alive,
    #[default]
    Unknown,
    Dead,
}

/// Coordinates in a latency space (height-vector model).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkPosition {
    pub x: f32,
    pub y: f32,
    pub height: f32,
}

impl NetworkPosition {
    pub fn new(x: f32, y: f32, height: f32) -> Self {
        Self { x, y, height }
    }

    pub fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.height.is_finite() && self.height >= 0.0
    }

    /// Estimated round-trip time in milliseconds, `NaN` if either position is unusable.
    pub fn estimate_rtt(&self, other: &NetworkPosition) -> f32 {
        if !self.is_valid() || !other.is_valid() {
            return f32::NAN;
        }
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt() + self.height + other.height
    }
}

pub fn estimate_rtt(local: Option<&NetworkPosition>, remote: Option<&NetworkPosition>) -> f32 {
    match (local, remote) {
        (Some(local), Some(remote)) => local.estimate_rtt(remote),
        _ => f32::NAN,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub version: u8,
    pub instance_id: u32,
    pub liveness: Liveness,
    /// 4-byte token issued against our address by this contact.
    pub address_token: Option<u32>,
    /// 8-byte token issued against our id by this contact.
    pub id_token: Option<[u8; 8]>,
    pub flags: u8,
    pub position: Option<NetworkPosition>,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            version: PROTOCOL_VERSION,
            instance_id: 0,
            liveness: Liveness::Unknown,
            address_token: None,
            id_token: None,
            flags: 0,
            position: None,
        }
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn with_instance_id(mut self, instance_id: u32) -> Self {
        self.instance_id = instance_id;
        self
    }

    pub fn with_position(mut self, position: NetworkPosition) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = liveness;
        self
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.liveness == Liveness::Alive
    }

    pub fn supports_id_token(&self) -> bool {
        self.version >= VERSION_ID_TOKEN
    }

    /// Record a token handed to us by this contact so later stores can echo it.
    pub fn apply_token(&mut self, token: SpoofToken) {
        match token {
            SpoofToken::Address(t) => self.address_token = Some(t),
            SpoofToken::Id(t) => self.id_token = Some(t),
        }
    }

    /// The same contact with its network address hidden.
    pub fn anonymized(&self) -> Contact {
        Contact {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            position: None,
            ..self.clone()
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl Hash for Contact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.short_hex(), self.addr)
    }
}
