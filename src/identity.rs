//! # Peer Identity and the XOR Metric
//!
//! This module defines the identifier types shared by every overlay component:
//!
//! - [`NodeId`]: fixed-length (160-bit) identifier in the XOR metric space
//! - [`PeerIdentity`]: a node id plus the endpoints it can be reached on and
//!   its capability tag ([`NodeKind`])
//! - [`Endpoint`]: one reachable connectivity descriptor (socket, browser
//!   socket or NAT-traversing peer channel)
//!
//! ## Identity Model
//!
//! Two [`PeerIdentity`] values are the same peer iff their node ids are
//! byte-equal. Connectivity may change between observations of one peer
//! (address change, relay switch); the last observed value wins wherever
//! identities are merged.
//!
//! ## Distance
//!
//! `d(a, b) = a XOR b`, compared as a big-endian unsigned integer.
//! `d(a, a) = 0` and `d(a, b) = d(b, a)`. Distances are only used as ordering
//! keys for nearest-neighbour ranking.
//!
//! ## Records
//!
//! Peer identities are published in the DHT as packed bytes
//! ([`PeerIdentity::pack`] / [`PeerIdentity::unpack`]); unpacking is size
//! bounded like every other deserialization in the crate.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::messages::{deserialize_bounded, serialize};

/// Length of a node identifier in bytes (160 bits, Kademlia convention).
pub const NODE_ID_LEN: usize = 20;

/// XOR distance between two node ids.
pub type Distance = [u8; NODE_ID_LEN];

/// Maximum number of endpoints carried by one peer identity.
/// Larger lists are truncated when unpacking records from the network.
pub const MAX_ENDPOINTS: usize = 8;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an id from a slice, failing when the length is not [`NODE_ID_LEN`].
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; NODE_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Uniformly random id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Deterministic id derived from arbitrary bytes (BLAKE3, truncated).
    ///
    /// Used for well-known keys such as the entry point record key.
    pub fn derive(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut out = [0u8; NODE_ID_LEN];
        out.copy_from_slice(&digest.as_bytes()[..NODE_ID_LEN]);
        Self(out)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Id with every bit flipped: the farthest point of the space from `self`.
    pub fn flipped(&self) -> Self {
        let mut out = self.0;
        for byte in out.iter_mut() {
            *byte = !*byte;
        }
        Self(out)
    }
}

/// Lexicographic comparison of two distances (big-endian magnitude).
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    for i in 0..NODE_ID_LEN {
        if a[i] < b[i] {
            return Ordering::Less;
        } else if a[i] > b[i] {
            return Ordering::Greater;
        }
    }
    Ordering::Equal
}

/// Signed difference `a - b` of two distances, saturated to the `i64` range.
///
/// Small distances (ids that only differ in their trailing bytes) produce
/// their exact numeric difference.
pub fn distance_delta(a: &Distance, b: &Distance) -> i64 {
    let (larger, smaller, sign) = match distance_cmp(a, b) {
        Ordering::Equal => return 0,
        Ordering::Greater => (a, b, 1i64),
        Ordering::Less => (b, a, -1i64),
    };

    let mut magnitude = [0u8; NODE_ID_LEN];
    let mut borrow = 0i16;
    for i in (0..NODE_ID_LEN).rev() {
        let mut digit = larger[i] as i16 - smaller[i] as i16 - borrow;
        if digit < 0 {
            digit += 256;
            borrow = 1;
        } else {
            borrow = 0;
        }
        magnitude[i] = digit as u8;
    }

    let (high, low) = magnitude.split_at(NODE_ID_LEN - 8);
    if high.iter().any(|b| *b != 0) {
        return if sign > 0 { i64::MAX } else { i64::MIN };
    }
    let mut low_bytes = [0u8; 8];
    low_bytes.copy_from_slice(low);
    let value = u64::from_be_bytes(low_bytes);
    if value > i64::MAX as u64 {
        return if sign > 0 { i64::MAX } else { i64::MIN };
    }
    sign * value as i64
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Capability tag of a peer.
///
/// `Restricted` covers nodes that cannot accept inbound connections
/// (browser runtimes, peers behind symmetric NAT). They can still originate
/// calls and be reached over peer channels that they opened themselves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    #[default]
    Full,
    Restricted,
}

/// Transport family of an [`Endpoint`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Reliable stream socket.
    Tcp,
    /// Browser-compatible socket.
    WebSocket,
    /// NAT-traversing peer channel, negotiated through a signalling peer.
    WebRtc,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: TransportKind::Tcp,
            host: host.into(),
            port,
            tls: false,
        }
    }

    pub fn websocket(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            transport: TransportKind::WebSocket,
            host: host.into(),
            port,
            tls,
        }
    }

    /// Whether a remote peer can open a connection to this endpoint on its own.
    pub fn accepts_inbound(&self) -> bool {
        !matches!(self.transport, TransportKind::WebRtc)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match (self.transport, self.tls) {
            (TransportKind::Tcp, _) => "tcp",
            (TransportKind::WebSocket, false) => "ws",
            (TransportKind::WebSocket, true) => "wss",
            (TransportKind::WebRtc, _) => "webrtc",
        };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub node_id: NodeId,
    pub connectivity: Vec<Endpoint>,
    pub kind: NodeKind,
}

impl PeerIdentity {
    pub fn new(node_id: NodeId, connectivity: Vec<Endpoint>, kind: NodeKind) -> Self {
        Self { node_id, connectivity, kind }
    }

    /// Full node without any endpoints (simulated overlays, tests).
    pub fn bare(node_id: NodeId) -> Self {
        Self::new(node_id, Vec::new(), NodeKind::Full)
    }

    pub fn primary_endpoint(&self) -> Option<&Endpoint> {
        self.connectivity.first()
    }

    /// Whether other peers can open a connection to this peer directly.
    pub fn is_directly_reachable(&self) -> bool {
        self.kind == NodeKind::Full && self.connectivity.iter().any(Endpoint::accepts_inbound)
    }

    /// Serialize into the record format stored in the DHT.
    pub fn pack(&self) -> Result<Vec<u8>, bincode::Error> {
        serialize(self)
    }

    /// Parse a record produced by [`PeerIdentity::pack`].
    ///
    /// Endpoint lists longer than [`MAX_ENDPOINTS`] are truncated.
    pub fn unpack(bytes: &[u8]) -> Result<Self, bincode::Error> {
        let mut identity: PeerIdentity = deserialize_bounded(bytes)?;
        identity.connectivity.truncate(MAX_ENDPOINTS);
        Ok(identity)
    }

    /// Field-by-field equality, unlike `==` which compares node ids only.
    pub fn same_fields(&self, other: &PeerIdentity) -> bool {
        self.node_id == other.node_id
            && self.connectivity == other.connectivity
            && self.kind == other.kind
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Eq for PeerIdentity {}

impl std::hash::Hash for PeerIdentity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
    }
}
