//! # Wire Messages
//!
//! Every serializable type exchanged between peers. Encoding is bincode;
//! decoding always goes through [`deserialize_bounded`] so a hostile payload
//! cannot make us allocate more than [`MAX_DESERIALIZE_SIZE`].
//!
//! ## Layers
//!
//! | Layer | Type | Carried in |
//! |-------|------|------------|
//! | RPC envelope | [`RpcMessage`] | transport payload |
//! | DHT request | [`DhtRequest`] | `RpcMessage::body` (request) |
//! | DHT response | [`DhtResponse`] | `RpcMessage::body` (response) |
//! | Routed payload | [`RoutedMessage`] | `DhtRequest::RouteMessage` |

use std::fmt;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{NodeId, PeerIdentity};
use crate::store::StoredRecordEntry;

/// Maximum size of a stored value (1 MiB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization, leaving room for framing.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced. Use this instead of raw
/// `bincode::deserialize` for anything that came off the network.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

// ============================================================================
// RPC envelope
// ============================================================================

/// Correlation id of one request/response exchange.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId([u8; 16]);

impl RequestId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", hex::encode(&self.0[..8]))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Notification,
    Response,
}

/// Error classes a remote peer can report in a response envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// No handler registered for the requested method.
    UnknownMethod,
    /// The handler did not finish within the server-side processing timeout.
    ServerTimeout,
    /// The handler returned an error.
    ServerError,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteErrorKind::UnknownMethod => "unknown method",
            RemoteErrorKind::ServerTimeout => "server timeout",
            RemoteErrorKind::ServerError => "server error",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcMessage {
    pub request_id: RequestId,
    pub service_id: String,
    pub method: String,
    pub kind: MessageKind,
    pub body: Vec<u8>,
    pub error: Option<RemoteError>,
    /// Routing hints mirrored from the call context.
    pub source: Option<NodeId>,
    pub target: Option<NodeId>,
}

impl RpcMessage {
    /// Response envelope answering `self`.
    pub fn response(&self, body: Vec<u8>, error: Option<RemoteError>) -> Self {
        Self {
            request_id: self.request_id,
            service_id: self.service_id.clone(),
            method: self.method.clone(),
            kind: MessageKind::Response,
            body,
            error,
            source: self.source,
            target: self.target,
        }
    }
}

pub fn encode_envelope(message: &RpcMessage) -> Result<Vec<u8>, bincode::Error> {
    serialize(message)
}

pub fn decode_envelope(bytes: &[u8]) -> Result<RpcMessage, bincode::Error> {
    deserialize_bounded(bytes)
}

// ============================================================================
// DHT protocol
// ============================================================================

/// Service id under which the DHT methods are registered.
pub const DHT_SERVICE_ID: &str = "dht";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping {
        from: PeerIdentity,
    },
    FindClosestNodes {
        from: PeerIdentity,
        target: NodeId,
        limit: u32,
    },
    StoreData {
        from: PeerIdentity,
        entry: StoredRecordEntry,
    },
    FindData {
        from: PeerIdentity,
        key: NodeId,
    },
    DeleteData {
        from: PeerIdentity,
        key: NodeId,
        creator: NodeId,
    },
    RouteMessage {
        from: PeerIdentity,
        message: RoutedMessage,
    },
    /// One-way notice that `from` is leaving the overlay.
    LeaveNotice {
        from: PeerIdentity,
    },
    /// One-way copy of an entry held by `from`, sent to a peer that should
    /// hold it too.
    ReplicateData {
        from: PeerIdentity,
        entry: StoredRecordEntry,
    },
}

impl DhtRequest {
    pub fn sender(&self) -> &PeerIdentity {
        match self {
            DhtRequest::Ping { from }
            | DhtRequest::FindClosestNodes { from, .. }
            | DhtRequest::StoreData { from, .. }
            | DhtRequest::FindData { from, .. }
            | DhtRequest::DeleteData { from, .. }
            | DhtRequest::RouteMessage { from, .. }
            | DhtRequest::LeaveNotice { from }
            | DhtRequest::ReplicateData { from, .. } => from,
        }
    }

    /// RPC method name the request travels under.
    pub fn method(&self) -> &'static str {
        match self {
            DhtRequest::Ping { .. } => "ping",
            DhtRequest::FindClosestNodes { .. } => "findClosestNodes",
            DhtRequest::StoreData { .. } => "storeData",
            DhtRequest::FindData { .. } => "findData",
            DhtRequest::DeleteData { .. } => "deleteData",
            DhtRequest::RouteMessage { .. } => "routeMessage",
            DhtRequest::LeaveNotice { .. } => "leaveNotice",
            DhtRequest::ReplicateData { .. } => "replicateData",
        }
    }

    /// Every method name that expects a response.
    pub const METHODS: [&'static str; 6] = [
        "ping",
        "findClosestNodes",
        "storeData",
        "findData",
        "deleteData",
        "routeMessage",
    ];

    /// Every one-way method name.
    pub const NOTIFICATIONS: [&'static str; 2] = ["leaveNotice", "replicateData"];
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtResponse {
    Ack,
    Nodes(Vec<PeerIdentity>),
    Stored { accepted: bool },
    Data(Vec<StoredRecordEntry>),
    Deleted { existed: bool },
    Routed(RouteAck),
    Error { message: String },
}

// ============================================================================
// Routing
// ============================================================================

/// Payload travelling hop by hop towards the peer closest to `target`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutedMessage {
    /// Unique per message; used for duplicate suppression at every hop.
    pub request_id: String,
    pub source: PeerIdentity,
    pub target: NodeId,
    pub payload: Vec<u8>,
    /// Forwarding peers the message passed through, in order. The source
    /// is not repeated here.
    pub routing_path: Vec<PeerIdentity>,
}

impl RoutedMessage {
    pub fn new(source: PeerIdentity, target: NodeId, payload: Vec<u8>) -> Self {
        Self {
            request_id: RequestId::random().to_string(),
            source,
            target,
            payload,
            routing_path: Vec::new(),
        }
    }

    pub fn has_visited(&self, id: &NodeId) -> bool {
        self.source.node_id == *id || self.routing_path.iter().any(|p| p.node_id == *id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteFailure {
    /// The message was already seen at this hop.
    Duplicate,
    /// No peer closer to the target accepted the message.
    NoCandidates,
    /// The receiving node is not (or no longer) joined.
    NotJoined,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAck {
    pub error: Option<RouteFailure>,
}

impl RouteAck {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn failed(reason: RouteFailure) -> Self {
        Self { error: Some(reason) }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
