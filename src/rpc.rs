//! # RPC Layer
//!
//! Transport-agnostic request/response and notification calls.
//!
//! ## Architecture
//!
//! - [`RpcCommunicator`]: cheap-to-clone handle. Encodes calls into
//!   [`RpcMessage`] envelopes, hands them to the injected [`Transport`], and
//!   correlates responses with pending calls by [`RequestId`].
//! - [`DhtRpcClient`]: implements [`DhtNodeRpc`] on top of a communicator.
//! - [`register_dht_methods`]: server side, exposes a [`DhtNode`] over a
//!   communicator.
//!
//! ## Call Lifecycle
//!
//! ```text
//!   call() ── register pending ──► send ──┬─ Err ──────────► TransportSend
//!                                         └─ Ok ── wait ──┬─ response ──► Ok / Remote
//!                                                         ├─ deadline ──► Timeout
//!                                                         └─ stop() ───► Stopped
//! ```
//!
//! Every pending call resolves exactly once: the entry is removed from the
//! pending table by whichever path resolves it, and only the path that
//! removed it may deliver a result.
//!
//! ## Server Side
//!
//! Requests are dispatched to handlers registered per `(service, method)`.
//! Handler errors, handler timeouts and unknown methods are answered with an
//! error envelope; nothing a remote peer sends can make
//! `handle_incoming_message` fail.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::dht::DhtNode;
use crate::identity::{NodeId, PeerIdentity};
use crate::messages::{
    self, decode_envelope, encode_envelope, DhtRequest, DhtResponse, MessageKind, RemoteError,
    RemoteErrorKind, RequestId, RouteAck, RoutedMessage, RpcMessage, DHT_SERVICE_ID,
};
use crate::protocols::DhtNodeRpc;
use crate::store::StoredRecordEntry;
use crate::transport::{CallContext, IncomingHandler, Transport};
use crate::ttl_cache::TtlCache;

// ============================================================================
// Limits and defaults
// ============================================================================

/// Default deadline of an outgoing call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a local handler may spend on one request.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of outstanding calls per communicator.
pub const MAX_PENDING_CALLS: usize = 10_000;

/// Pending entries outlive their deadline by this much before the table
/// purges them on its own.
const PENDING_GRACE: Duration = Duration::from_secs(1);

/// Maximum contacts accepted from a single find_closest_nodes response.
const MAX_CONTACTS_PER_RESPONSE: usize = 100;

/// Maximum entries accepted from a single find_data response.
const MAX_ENTRIES_PER_RESPONSE: usize = 1_000;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    #[serde(with = "crate::config::duration_ms")]
    pub request_timeout: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub handler_timeout: Duration,
    pub max_pending_calls: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            max_pending_calls: MAX_PENDING_CALLS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("communicator stopped")]
    Stopped,
    #[error("transport send failed: {0}")]
    TransportSend(String),
    #[error("remote {kind}: {message}")]
    Remote { kind: RemoteErrorKind, message: String },
    #[error("too many pending calls")]
    Overloaded,
    #[error("failed to encode message: {0}")]
    Encode(String),
    /// Failure reported by the connection layer through
    /// [`RpcCommunicator::fail_pending`].
    #[error("connection failed: {0}")]
    Connection(String),
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler of a request/response method.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn handle(&self, request: Vec<u8>, context: CallContext) -> Result<Vec<u8>>;
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(Vec<u8>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
{
    async fn handle(&self, request: Vec<u8>, context: CallContext) -> Result<Vec<u8>> {
        (self)(request, context).await
    }
}

/// Handler of a one-way method.
#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    async fn handle(&self, request: Vec<u8>, context: CallContext) -> Result<()>;
}

#[async_trait]
impl<F, Fut> NotificationHandler for F
where
    F: Fn(Vec<u8>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, request: Vec<u8>, context: CallContext) -> Result<()> {
        (self)(request, context).await
    }
}

type MethodKey = (String, String);

struct PendingCall {
    created_at: Instant,
    reply: oneshot::Sender<Result<Vec<u8>, RpcError>>,
    context: CallContext,
}

struct CommunicatorInner {
    transport: Arc<dyn Transport>,
    config: RpcConfig,
    pending: Mutex<TtlCache<RequestId, PendingCall>>,
    methods: RwLock<HashMap<MethodKey, Arc<dyn MethodHandler>>>,
    notifications: RwLock<HashMap<MethodKey, Arc<dyn NotificationHandler>>>,
    stopped: AtomicBool,
}

#[derive(Clone)]
pub struct RpcCommunicator {
    inner: Arc<CommunicatorInner>,
}

impl RpcCommunicator {
    pub fn new(transport: Arc<dyn Transport>, config: RpcConfig) -> Self {
        let pending = TtlCache::new(config.request_timeout + PENDING_GRACE);
        Self {
            inner: Arc::new(CommunicatorInner {
                transport,
                config,
                pending: Mutex::new(pending),
                methods: RwLock::new(HashMap::new()),
                notifications: RwLock::new(HashMap::new()),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    pub async fn register_method(
        &self,
        service_id: impl Into<String>,
        method: impl Into<String>,
        handler: impl MethodHandler,
    ) {
        self.inner
            .methods
            .write()
            .await
            .insert((service_id.into(), method.into()), Arc::new(handler));
    }

    pub async fn register_notification(
        &self,
        service_id: impl Into<String>,
        method: impl Into<String>,
        handler: impl NotificationHandler,
    ) {
        self.inner
            .notifications
            .write()
            .await
            .insert((service_id.into(), method.into()), Arc::new(handler));
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Send a request and wait for its response.
    ///
    /// The deadline is `context.timeout`, or the configured default.
    pub async fn call(
        &self,
        service_id: &str,
        method: &str,
        request: Vec<u8>,
        context: CallContext,
    ) -> Result<Vec<u8>, RpcError> {
        if self.is_stopped() {
            return Err(RpcError::Stopped);
        }

        let request_id = RequestId::random();
        let deadline = context.timeout.unwrap_or(self.inner.config.request_timeout);
        let envelope = RpcMessage {
            request_id,
            service_id: service_id.to_string(),
            method: method.to_string(),
            kind: MessageKind::Request,
            body: request,
            error: None,
            source: context.source_id(),
            target: context.target_id(),
        };
        let bytes = encode_envelope(&envelope).map_err(|e| RpcError::Encode(e.to_string()))?;

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            if pending.len() >= self.inner.config.max_pending_calls {
                pending.remove_expired();
                if pending.len() >= self.inner.config.max_pending_calls {
                    return Err(RpcError::Overloaded);
                }
            }
            pending.set_with_ttl(
                request_id,
                PendingCall {
                    created_at: Instant::now(),
                    reply: tx,
                    context: context.clone(),
                },
                deadline + PENDING_GRACE,
            );
        }

        trace!(
            request_id = ?request_id,
            service = service_id,
            method = method,
            "sending request"
        );

        if let Err(e) = self.inner.transport.send(bytes, context).await {
            debug!(
                request_id = ?request_id,
                method = method,
                error = %e,
                "transport rejected request"
            );
            if self.take_pending(&request_id).await.is_some() {
                return Err(RpcError::TransportSend(format!("{e:#}")));
            }
            // resolved elsewhere (stop) while the send was failing
            return rx.await.unwrap_or(Err(RpcError::Stopped));
        }

        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Stopped),
            Err(_) => {
                if self.take_pending(&request_id).await.is_some() {
                    debug!(request_id = ?request_id, method = method, "call timed out");
                    Err(RpcError::Timeout(deadline))
                } else {
                    // a response raced the deadline and already claimed the entry
                    rx.await.unwrap_or(Err(RpcError::Stopped))
                }
            }
        }
    }

    /// Send a one-way message. Never registers a pending call.
    pub async fn notify(
        &self,
        service_id: &str,
        method: &str,
        request: Vec<u8>,
        mut context: CallContext,
    ) -> Result<(), RpcError> {
        if self.is_stopped() {
            return Err(RpcError::Stopped);
        }
        context.notification = true;
        let envelope = RpcMessage {
            request_id: RequestId::random(),
            service_id: service_id.to_string(),
            method: method.to_string(),
            kind: MessageKind::Notification,
            body: request,
            error: None,
            source: context.source_id(),
            target: context.target_id(),
        };
        let bytes = encode_envelope(&envelope).map_err(|e| RpcError::Encode(e.to_string()))?;
        self.inner
            .transport
            .send(bytes, context)
            .await
            .map_err(|e| RpcError::TransportSend(format!("{e:#}")))
    }

    /// Entry point for every payload the transport receives.
    pub async fn handle_incoming_message(&self, payload: Vec<u8>, context: CallContext) {
        if self.is_stopped() {
            trace!(bytes = payload.len(), "communicator stopped, ignoring message");
            return;
        }
        let message = match decode_envelope(&payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(bytes = payload.len(), error = %e, "dropping undecodable message");
                return;
            }
        };
        match message.kind {
            MessageKind::Response => self.on_response(message).await,
            MessageKind::Request => self.on_request(message, context).await,
            MessageKind::Notification => self.on_notification(message, context).await,
        }
    }

    async fn on_response(&self, message: RpcMessage) {
        let Some(call) = self.take_pending(&message.request_id).await else {
            debug!(
                request_id = ?message.request_id,
                method = %message.method,
                "response for unknown request id, dropping"
            );
            return;
        };
        trace!(
            request_id = ?message.request_id,
            elapsed_ms = call.created_at.elapsed().as_millis(),
            "response received"
        );
        let result = match message.error {
            None => Ok(message.body),
            Some(RemoteError { kind, message }) => Err(RpcError::Remote { kind, message }),
        };
        let _ = call.reply.send(result);
    }

    async fn on_request(&self, message: RpcMessage, context: CallContext) {
        let key = (message.service_id.clone(), message.method.clone());
        let handler = self.inner.methods.read().await.get(&key).cloned();

        let (body, error) = match handler {
            None => {
                debug!(service = %message.service_id, method = %message.method, "unknown method");
                (
                    Vec::new(),
                    Some(RemoteError {
                        kind: RemoteErrorKind::UnknownMethod,
                        message: format!("{}.{}", message.service_id, message.method),
                    }),
                )
            }
            Some(handler) => {
                let request = message.body.clone();
                match tokio::time::timeout(
                    self.inner.config.handler_timeout,
                    handler.handle(request, context.clone()),
                )
                .await
                {
                    Ok(Ok(body)) => (body, None),
                    Ok(Err(e)) => {
                        debug!(method = %message.method, error = %e, "handler failed");
                        (
                            Vec::new(),
                            Some(RemoteError {
                                kind: RemoteErrorKind::ServerError,
                                message: format!("{e:#}"),
                            }),
                        )
                    }
                    Err(_) => {
                        warn!(
                            method = %message.method,
                            timeout_ms = self.inner.config.handler_timeout.as_millis(),
                            "handler exceeded processing timeout"
                        );
                        (
                            Vec::new(),
                            Some(RemoteError {
                                kind: RemoteErrorKind::ServerTimeout,
                                message: format!("{} timed out", message.method),
                            }),
                        )
                    }
                }
            }
        };

        if self.is_stopped() {
            return;
        }
        let response = message.response(body, error);
        let bytes = match encode_envelope(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(method = %message.method, error = %e, "failed to encode response");
                return;
            }
        };
        if let Err(e) = self.inner.transport.send(bytes, context).await {
            debug!(
                request_id = ?message.request_id,
                error = %e,
                "failed to send response"
            );
        }
    }

    async fn on_notification(&self, message: RpcMessage, context: CallContext) {
        let key = (message.service_id.clone(), message.method.clone());
        let handler = self.inner.notifications.read().await.get(&key).cloned();
        let Some(handler) = handler else {
            debug!(service = %message.service_id, method = %message.method, "unknown notification");
            return;
        };
        match tokio::time::timeout(self.inner.config.handler_timeout, handler.handle(message.body, context)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(method = %message.method, error = %e, "notification handler failed"),
            Err(_) => warn!(method = %message.method, "notification handler exceeded processing timeout"),
        }
    }

    async fn take_pending(&self, request_id: &RequestId) -> Option<PendingCall> {
        self.inner.pending.lock().await.remove(request_id)
    }

    /// Ids of outstanding calls whose context matches `predicate`.
    pub async fn pending_request_ids<P>(&self, predicate: P) -> Vec<RequestId>
    where
        P: Fn(&CallContext) -> bool,
    {
        let pending = self.inner.pending.lock().await;
        pending
            .iter()
            .filter(|(_, call)| predicate(&call.context))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Reject one outstanding call, e.g. because its connection was lost.
    /// Returns `false` when the call already resolved.
    pub async fn fail_pending(&self, request_id: &RequestId, reason: impl Into<String>) -> bool {
        match self.take_pending(request_id).await {
            Some(call) => {
                let _ = call.reply.send(Err(RpcError::Connection(reason.into())));
                true
            }
            None => false,
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Reject every outstanding call with [`RpcError::Stopped`] and refuse
    /// further traffic.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained = self.inner.pending.lock().await.drain();
        debug!(pending = drained.len(), "stopping communicator");
        for (_, call) in drained {
            let _ = call.reply.send(Err(RpcError::Stopped));
        }
    }
}

#[async_trait]
impl IncomingHandler for RpcCommunicator {
    async fn handle_incoming_message(&self, payload: Vec<u8>, context: CallContext) {
        RpcCommunicator::handle_incoming_message(self, payload, context).await
    }
}

// ============================================================================
// DHT client
// ============================================================================

/// [`DhtNodeRpc`] over an [`RpcCommunicator`].
#[derive(Clone)]
pub struct DhtRpcClient {
    communicator: RpcCommunicator,
    local: PeerIdentity,
}

impl DhtRpcClient {
    pub fn new(communicator: RpcCommunicator, local: PeerIdentity) -> Self {
        Self { communicator, local }
    }

    async fn rpc(&self, to: &PeerIdentity, request: DhtRequest) -> Result<DhtResponse> {
        let method = request.method();
        let body = messages::serialize(&request).context("failed to serialize DHT request")?;
        let context = CallContext::between(self.local.clone(), to.clone());
        let response = self
            .communicator
            .call(DHT_SERVICE_ID, method, body, context)
            .await
            .with_context(|| format!("{} to {} failed", method, hex::encode(&to.node_id.as_bytes()[..8])))?;
        let response: DhtResponse =
            messages::deserialize_bounded(&response).context("failed to deserialize DHT response")?;
        if let DhtResponse::Error { message } = response {
            anyhow::bail!("{} rejected by peer: {}", method, message);
        }
        Ok(response)
    }
}

#[async_trait]
impl DhtNodeRpc for DhtRpcClient {
    async fn ping(&self, to: &PeerIdentity) -> Result<()> {
        let request = DhtRequest::Ping { from: self.local.clone() };
        match self.rpc(to, request).await? {
            DhtResponse::Ack => Ok(()),
            other => anyhow::bail!("unexpected response to Ping: {:?}", other),
        }
    }

    async fn find_closest_nodes(
        &self,
        to: &PeerIdentity,
        target: NodeId,
        limit: usize,
    ) -> Result<Vec<PeerIdentity>> {
        let request = DhtRequest::FindClosestNodes {
            from: self.local.clone(),
            target,
            limit: limit.min(MAX_CONTACTS_PER_RESPONSE) as u32,
        };
        match self.rpc(to, request).await? {
            DhtResponse::Nodes(nodes) => {
                if nodes.len() > MAX_CONTACTS_PER_RESPONSE {
                    warn!(
                        peer = hex::encode(&to.node_id.as_bytes()[..8]),
                        count = nodes.len(),
                        max = MAX_CONTACTS_PER_RESPONSE,
                        "peer returned too many contacts, truncating"
                    );
                    Ok(nodes.into_iter().take(MAX_CONTACTS_PER_RESPONSE).collect())
                } else {
                    Ok(nodes)
                }
            }
            other => anyhow::bail!("unexpected response to FindClosestNodes: {:?}", other),
        }
    }

    async fn store_data(&self, to: &PeerIdentity, entry: StoredRecordEntry) -> Result<bool> {
        let request = DhtRequest::StoreData { from: self.local.clone(), entry };
        match self.rpc(to, request).await? {
            DhtResponse::Stored { accepted } => Ok(accepted),
            other => anyhow::bail!("unexpected response to StoreData: {:?}", other),
        }
    }

    async fn find_data(&self, to: &PeerIdentity, key: NodeId) -> Result<Vec<StoredRecordEntry>> {
        let request = DhtRequest::FindData { from: self.local.clone(), key };
        match self.rpc(to, request).await? {
            DhtResponse::Data(mut entries) => {
                entries.retain(|e| e.key == key);
                entries.truncate(MAX_ENTRIES_PER_RESPONSE);
                Ok(entries)
            }
            other => anyhow::bail!("unexpected response to FindData: {:?}", other),
        }
    }

    async fn delete_data(&self, to: &PeerIdentity, key: NodeId, creator: NodeId) -> Result<bool> {
        let request = DhtRequest::DeleteData { from: self.local.clone(), key, creator };
        match self.rpc(to, request).await? {
            DhtResponse::Deleted { existed } => Ok(existed),
            other => anyhow::bail!("unexpected response to DeleteData: {:?}", other),
        }
    }

    async fn route_message(&self, to: &PeerIdentity, message: RoutedMessage) -> Result<RouteAck> {
        let request = DhtRequest::RouteMessage { from: self.local.clone(), message };
        match self.rpc(to, request).await? {
            DhtResponse::Routed(ack) => Ok(ack),
            other => anyhow::bail!("unexpected response to RouteMessage: {:?}", other),
        }
    }

    async fn leave_notice(&self, to: &PeerIdentity) -> Result<()> {
        let request = DhtRequest::LeaveNotice { from: self.local.clone() };
        let method = request.method();
        let body = messages::serialize(&request).context("failed to serialize leave notice")?;
        let context = CallContext::between(self.local.clone(), to.clone());
        self.communicator
            .notify(DHT_SERVICE_ID, method, body, context)
            .await
            .context("failed to send leave notice")
    }

    async fn replicate_data(&self, to: &PeerIdentity, entry: StoredRecordEntry) -> Result<()> {
        let request = DhtRequest::ReplicateData { from: self.local.clone(), entry };
        let method = request.method();
        let body = messages::serialize(&request).context("failed to serialize replica")?;
        let context = CallContext::between(self.local.clone(), to.clone());
        self.communicator
            .notify(DHT_SERVICE_ID, method, body, context)
            .await
            .context("failed to send replica")
    }
}

// ============================================================================
// DHT server
// ============================================================================

/// Expose `node` over `communicator` under [`DHT_SERVICE_ID`].
pub async fn register_dht_methods<N: DhtNodeRpc>(communicator: &RpcCommunicator, node: DhtNode<N>) {
    for method in DhtRequest::METHODS {
        let node = node.clone();
        communicator
            .register_method(DHT_SERVICE_ID, method, move |body: Vec<u8>, _ctx: CallContext| {
                let node = node.clone();
                async move {
                    let request: DhtRequest =
                        messages::deserialize_bounded(&body).context("failed to decode DHT request")?;
                    let response = handle_dht_rpc(&node, request).await;
                    messages::serialize(&response).context("failed to encode DHT response")
                }
            })
            .await;
    }
    for method in DhtRequest::NOTIFICATIONS {
        let node = node.clone();
        communicator
            .register_notification(DHT_SERVICE_ID, method, move |body: Vec<u8>, _ctx: CallContext| {
                let node = node.clone();
                async move {
                    let request: DhtRequest =
                        messages::deserialize_bounded(&body).context("failed to decode DHT notification")?;
                    handle_dht_rpc(&node, request).await;
                    Ok::<(), anyhow::Error>(())
                }
            })
            .await;
    }
}

async fn handle_dht_rpc<N: DhtNodeRpc>(node: &DhtNode<N>, request: DhtRequest) -> DhtResponse {
    match request {
        DhtRequest::Ping { from } => {
            trace!(from = ?hex::encode(&from.node_id.as_bytes()[..8]), "handling PING request");
            node.handle_ping(from).await;
            DhtResponse::Ack
        }
        DhtRequest::FindClosestNodes { from, target, limit } => {
            trace!(
                from = ?hex::encode(&from.node_id.as_bytes()[..8]),
                target = ?hex::encode(&target.as_bytes()[..8]),
                "handling FIND_CLOSEST_NODES request"
            );
            let limit = (limit as usize).min(MAX_CONTACTS_PER_RESPONSE);
            let nodes = node.handle_find_closest_nodes(from, target, limit).await;
            DhtResponse::Nodes(nodes)
        }
        DhtRequest::StoreData { from, entry } => {
            debug!(
                from = ?hex::encode(&from.node_id.as_bytes()[..8]),
                key = ?hex::encode(&entry.key.as_bytes()[..8]),
                value_len = entry.value.len(),
                "handling STORE_DATA request"
            );
            let accepted = node.handle_store_data(from, entry).await;
            DhtResponse::Stored { accepted }
        }
        DhtRequest::FindData { from, key } => {
            trace!(
                from = ?hex::encode(&from.node_id.as_bytes()[..8]),
                key = ?hex::encode(&key.as_bytes()[..8]),
                "handling FIND_DATA request"
            );
            DhtResponse::Data(node.handle_find_data(from, key).await)
        }
        DhtRequest::DeleteData { from, key, creator } => {
            debug!(
                from = ?hex::encode(&from.node_id.as_bytes()[..8]),
                key = ?hex::encode(&key.as_bytes()[..8]),
                "handling DELETE_DATA request"
            );
            let existed = node.handle_delete_data(from, key, creator).await;
            DhtResponse::Deleted { existed }
        }
        DhtRequest::RouteMessage { from, message } => {
            trace!(
                from = ?hex::encode(&from.node_id.as_bytes()[..8]),
                target = ?hex::encode(&message.target.as_bytes()[..8]),
                hops = message.routing_path.len(),
                "handling ROUTE_MESSAGE request"
            );
            DhtResponse::Routed(node.handle_route_message(from, message).await)
        }
        DhtRequest::LeaveNotice { from } => {
            debug!(from = ?hex::encode(&from.node_id.as_bytes()[..8]), "peer leaving");
            node.handle_leave_notice(from).await;
            DhtResponse::Ack
        }
        DhtRequest::ReplicateData { from, entry } => {
            debug!(
                from = ?hex::encode(&from.node_id.as_bytes()[..8]),
                key = ?hex::encode(&entry.key.as_bytes()[..8]),
                "handling REPLICATE_DATA notification"
            );
            node.handle_replicate_data(from, entry).await;
            DhtResponse::Ack
        }
    }
}
