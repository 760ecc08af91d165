//! # Transport Seam
//!
//! The RPC layer never touches sockets. It hands encoded envelopes to an
//! injected [`Transport`] together with a [`CallContext`], and the transport
//! calls back into an [`IncomingHandler`] for every payload it receives.
//!
//! ```text
//!   RpcCommunicator ──send(bytes, ctx)──► Transport ──► wire / relay
//!          ▲                                               │
//!          └──── handle_incoming_message(bytes, ctx) ◄─────┘
//! ```
//!
//! ## Call Context
//!
//! [`CallContext`] carries routing hints a relaying transport needs to
//! deliver a reply to the right physical origin (`source`, `target`), plus
//! per-call flags and an open extension map. The RPC layer passes it through
//! untouched in both directions.
//!
//! ## Implementations
//!
//! - [`SimulatorNetwork`]: explicit in-memory hub used by tests and the demo
//!   binary. One hub per simulated overlay; no global state.
//! - [`TransportMux`]: lets several communicators share one physical
//!   transport, keyed by service id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::identity::{NodeId, PeerIdentity};

/// Outbound half of a transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `payload` to the peer selected by `context`.
    ///
    /// Returning `Err` means the payload was not handed to the network; the
    /// caller's pending call (if any) is rejected immediately.
    async fn send(&self, payload: Vec<u8>, context: CallContext) -> Result<()>;
}

/// Inbound half: whatever consumes payloads coming off a transport.
#[async_trait]
pub trait IncomingHandler: Send + Sync + 'static {
    async fn handle_incoming_message(&self, payload: Vec<u8>, context: CallContext);
}

#[derive(Clone, Debug, Default)]
pub struct CallContext {
    /// Peer that originated the exchange.
    pub source: Option<PeerIdentity>,
    /// Peer the request is addressed to.
    pub target: Option<PeerIdentity>,
    /// No response expected.
    pub notification: bool,
    /// Allow the transport to open a new connection to `target`.
    pub connect: bool,
    /// Overrides the communicator's default call timeout.
    pub timeout: Option<Duration>,
    pub extensions: HashMap<String, String>,
}

impl CallContext {
    /// Context for a request from `source` to `target`.
    pub fn between(source: PeerIdentity, target: PeerIdentity) -> Self {
        Self {
            source: Some(source),
            target: Some(target),
            connect: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    pub fn source_id(&self) -> Option<NodeId> {
        self.source.as_ref().map(|p| p.node_id)
    }

    pub fn target_id(&self) -> Option<NodeId> {
        self.target.as_ref().map(|p| p.node_id)
    }
}

// ============================================================================
// In-memory simulator
// ============================================================================

#[derive(Default)]
struct SimulatorState {
    peers: HashMap<NodeId, (PeerIdentity, Arc<dyn IncomingHandler>)>,
    failures: HashSet<NodeId>,
    latencies: HashMap<NodeId, Duration>,
}

/// In-memory network hub connecting any number of simulated peers.
///
/// Cheap to clone; every clone refers to the same hub. Delivery is
/// asynchronous (each payload is handed to the receiver on its own task), so
/// a handler may send while handling without deadlocking the sender.
#[derive(Clone, Default)]
pub struct SimulatorNetwork {
    state: Arc<RwLock<SimulatorState>>,
}

impl SimulatorNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `peer`, delivering its inbound traffic to `handler`.
    pub async fn connect(&self, peer: PeerIdentity, handler: Arc<dyn IncomingHandler>) {
        let mut state = self.state.write().await;
        state.peers.insert(peer.node_id, (peer, handler));
    }

    /// Outbound handle for `local`. The peer does not need to be connected
    /// yet, which lets a node build its transport before its handler exists.
    pub fn transport_for(&self, local: PeerIdentity) -> SimulatorTransport {
        SimulatorTransport {
            network: self.clone(),
            local,
        }
    }

    /// Detach a peer; further sends to it fail.
    pub async fn disconnect(&self, id: &NodeId) {
        let mut state = self.state.write().await;
        state.peers.remove(id);
    }

    /// Make every send to `id` fail while `fail` is set.
    pub async fn set_failure(&self, id: NodeId, fail: bool) {
        let mut state = self.state.write().await;
        if fail {
            state.failures.insert(id);
        } else {
            state.failures.remove(&id);
        }
    }

    /// Delay every delivery to `id` by `latency`.
    pub async fn set_latency(&self, id: NodeId, latency: Duration) {
        self.state.write().await.latencies.insert(id, latency);
    }

    pub async fn peer_count(&self) -> usize {
        self.state.read().await.peers.len()
    }

    pub async fn is_connected(&self, id: &NodeId) -> bool {
        self.state.read().await.peers.contains_key(id)
    }

    async fn deliver(&self, to: NodeId, payload: Vec<u8>, context: CallContext) -> Result<()> {
        let (handler, latency) = {
            let state = self.state.read().await;
            if state.failures.contains(&to) {
                return Err(anyhow!("injected network failure"));
            }
            let (_, handler) = state
                .peers
                .get(&to)
                .ok_or_else(|| anyhow!("peer {} not connected", hex::encode(&to.as_bytes()[..8])))?;
            (handler.clone(), state.latencies.get(&to).copied())
        };

        tokio::spawn(async move {
            if let Some(delay) = latency {
                tokio::time::sleep(delay).await;
            }
            handler.handle_incoming_message(payload, context).await;
        });
        Ok(())
    }
}

/// One peer's view of a [`SimulatorNetwork`].
#[derive(Clone)]
pub struct SimulatorTransport {
    network: SimulatorNetwork,
    local: PeerIdentity,
}

impl SimulatorTransport {
    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    /// Requests go to `target`; replies (sent with the incoming context,
    /// whose target is us) go back to `source`.
    fn destination(&self, context: &CallContext) -> Option<NodeId> {
        let local = self.local.node_id;
        match (context.source_id(), context.target_id()) {
            (_, Some(target)) if target != local => Some(target),
            (Some(source), _) if source != local => Some(source),
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for SimulatorTransport {
    async fn send(&self, payload: Vec<u8>, mut context: CallContext) -> Result<()> {
        if context.source.is_none() {
            context.source = Some(self.local.clone());
        }
        let to = self
            .destination(&context)
            .ok_or_else(|| anyhow!("call context names no remote peer"))?;
        trace!(
            from = hex::encode(&self.local.node_id.as_bytes()[..8]),
            to = hex::encode(&to.as_bytes()[..8]),
            bytes = payload.len(),
            "simulator send"
        );
        self.network
            .deliver(to, payload, context)
            .await
            .context("simulator delivery failed")
    }
}

// ============================================================================
// Service multiplexing
// ============================================================================

/// Magic prefix of a multiplexed frame.
pub const MUX_MAGIC: [u8; 4] = *b"OMUX";

/// Longest accepted service id.
pub const MAX_SERVICE_ID_LEN: usize = 256;

const MUX_HEADER_SIZE: usize = MUX_MAGIC.len() + 2;

pub fn encode_mux_frame(service_id: &str, payload: &[u8]) -> Vec<u8> {
    let service = service_id.as_bytes();
    let mut frame = Vec::with_capacity(MUX_HEADER_SIZE + service.len() + payload.len());
    frame.extend_from_slice(&MUX_MAGIC);
    frame.extend_from_slice(&(service.len() as u16).to_be_bytes());
    frame.extend_from_slice(service);
    frame.extend_from_slice(payload);
    frame
}

/// Split a multiplexed frame into `(service_id, payload)`.
pub fn decode_mux_frame(data: &[u8]) -> Option<(&str, &[u8])> {
    if data.len() < MUX_HEADER_SIZE || data[..4] != MUX_MAGIC {
        return None;
    }
    let len = u16::from_be_bytes([data[4], data[5]]) as usize;
    if len > MAX_SERVICE_ID_LEN || data.len() < MUX_HEADER_SIZE + len {
        return None;
    }
    let service = std::str::from_utf8(&data[MUX_HEADER_SIZE..MUX_HEADER_SIZE + len]).ok()?;
    Some((service, &data[MUX_HEADER_SIZE + len..]))
}

/// Shares one physical transport between several logical services.
///
/// Each service obtains a [`MuxChannel`] (its own [`Transport`]) and
/// registers the handler that should receive its inbound traffic. The mux
/// itself is the [`IncomingHandler`] attached to the physical transport.
pub struct TransportMux {
    physical: Arc<dyn Transport>,
    services: RwLock<HashMap<String, Arc<dyn IncomingHandler>>>,
}

impl TransportMux {
    pub fn new(physical: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            physical,
            services: RwLock::new(HashMap::new()),
        })
    }

    pub fn channel(self: &Arc<Self>, service_id: impl Into<String>) -> MuxChannel {
        MuxChannel {
            mux: self.clone(),
            service_id: service_id.into(),
        }
    }

    pub async fn register(&self, service_id: impl Into<String>, handler: Arc<dyn IncomingHandler>) {
        let service_id = service_id.into();
        if service_id.len() > MAX_SERVICE_ID_LEN {
            warn!(len = service_id.len(), "service id too long, not registering");
            return;
        }
        self.services.write().await.insert(service_id, handler);
    }

    pub async fn unregister(&self, service_id: &str) {
        self.services.write().await.remove(service_id);
    }
}

#[async_trait]
impl IncomingHandler for TransportMux {
    async fn handle_incoming_message(&self, payload: Vec<u8>, context: CallContext) {
        let Some((service, inner)) = decode_mux_frame(&payload) else {
            debug!(bytes = payload.len(), "dropping malformed mux frame");
            return;
        };
        let handler = self.services.read().await.get(service).cloned();
        match handler {
            Some(handler) => handler.handle_incoming_message(inner.to_vec(), context).await,
            None => debug!(service = %service, "no handler registered for service, dropping"),
        }
    }
}

/// One service's transport on top of a [`TransportMux`].
#[derive(Clone)]
pub struct MuxChannel {
    mux: Arc<TransportMux>,
    service_id: String,
}

impl MuxChannel {
    pub fn service_id(&self) -> &str {
        &self.service_id
    }
}

#[async_trait]
impl Transport for MuxChannel {
    async fn send(&self, payload: Vec<u8>, context: CallContext) -> Result<()> {
        let frame = encode_mux_frame(&self.service_id, &payload);
        self.mux.physical.send(frame, context).await
    }
}
