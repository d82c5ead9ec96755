use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use courier_core::payload::{BroadcastAck, ClientList, Disconnected, Membership, Registered, Stats};
use courier_core::{Envelope, ErrorCode, Kind, RequestId};
use courier_fabric::codec::JsonCodec;
use courier_fabric::transport::{TcpTransport, UnixTransport};
use courier_fabric::{Channel, ChannelRx, ChannelTx, Transport};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::event::{ClientEvent, ClientState, ErrorKind};
use crate::handler::{HandlerResult, HandlerTable, MessageHandler, Typed};
use crate::pending::{Correlation, PendingRequests};

const CONNECTION_LOST: &str = "Connection lost";
const CLIENT_DISCONNECTED: &str = "Client disconnected";

/// Result of a [`Client::ping`]
#[derive(Debug, Clone, Copy)]
pub struct PingReply {
    /// Broker clock when it answered, in epoch milliseconds
    pub timestamp: Option<i64>,
    pub latency: Duration,
}

/// A named endpoint attached to a broker.
///
/// Cloning is cheap; clones share one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    shared: Mutex<Shared>,
    handlers: HandlerTable,
    events: broadcast::Sender<ClientEvent>,
}

struct Shared {
    state: ClientState,
    session: Option<Arc<Session>>,
}

impl Shared {
    fn holds(&self, session: &Arc<Session>) -> bool {
        self.session
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }
}

/// One connection to the broker, from connect until disconnect
struct Session {
    name: String,
    tx: tokio::sync::Mutex<ChannelTx<JsonCodec>>,
    pending: PendingRequests,
    next_seq: AtomicU64,
    cancel: CancellationToken,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                shared: Mutex::new(Shared {
                    state: ClientState::Idle,
                    session: None,
                }),
                handlers: HandlerTable::default(),
                events,
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Ready
    }

    /// The registered name while connected
    pub fn name(&self) -> Option<String> {
        let shared = self.inner.lock();
        match (shared.state, &shared.session) {
            (ClientState::Ready, Some(session)) => Some(session.name.clone()),
            _ => None,
        }
    }

    /// Receive lifecycle and membership events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Register as `name` over an already established transport
    pub async fn connect(
        &self,
        name: impl Into<String>,
        transport: impl Transport + 'static,
    ) -> Result<()> {
        let name = self.begin_connect(name.into())?;
        self.establish(name, Channel::from_transport(transport, JsonCodec))
            .await
    }

    /// Dial a broker's TCP listener and register as `name`.
    ///
    /// Honors the configured connect and write timeouts.
    pub async fn connect_tcp(&self, name: impl Into<String>, addr: SocketAddr) -> Result<()> {
        let name = self.begin_connect(name.into())?;
        let config = &self.inner.config;
        let dialed = TcpTransport::builder(addr)
            .connect_timeout(config.connect_timeout)
            .send_timeout(config.write_timeout)
            .connect()
            .await;
        self.establish_dialed(name, dialed).await
    }

    /// Dial a broker's Unix socket and register as `name`
    pub async fn connect_unix(
        &self,
        name: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<()> {
        let name = self.begin_connect(name.into())?;
        let config = &self.inner.config;
        let dialed = UnixTransport::builder(path)
            .connect_timeout(config.connect_timeout)
            .send_timeout(config.write_timeout)
            .connect()
            .await;
        self.establish_dialed(name, dialed).await
    }

    async fn establish_dialed<T: Transport + 'static>(
        &self,
        name: String,
        dialed: courier_fabric::Result<T>,
    ) -> Result<()> {
        match dialed {
            Ok(transport) => {
                self.establish(name, Channel::from_transport(transport, JsonCodec))
                    .await
            }
            Err(e) => {
                warn!(%name, error = %e, "Could not reach broker");
                self.inner.lock().state = ClientState::Disconnected;
                Err(e.into())
            }
        }
    }

    fn begin_connect(&self, name: String) -> Result<String> {
        if name.trim().is_empty() {
            return Err(Error::InvalidClientName);
        }

        let mut shared = self.inner.lock();
        match shared.state {
            ClientState::Idle | ClientState::Disconnected => {
                shared.state = ClientState::Connecting;
                Ok(name)
            }
            _ => Err(Error::AlreadyConnected),
        }
    }

    async fn establish(&self, name: String, channel: Channel<JsonCodec>) -> Result<()> {
        let (rx, tx) = channel.into_split();
        let session = Arc::new(Session::new(name.clone(), tx));
        {
            let mut shared = self.inner.lock();
            shared.state = ClientState::AwaitingRegistration;
            shared.session = Some(session.clone());
        }

        tokio::spawn(read_loop(
            Arc::downgrade(&self.inner),
            session.clone(),
            rx,
        ));

        let timeout = self.inner.config.registration_timeout;
        let registered = match session.request(Envelope::register(&name), timeout).await {
            Ok(reply) => expect_kind(reply, Kind::Registered)
                .and_then(|reply| Ok(reply.payload::<Registered>()?)),
            Err(Error::Timeout { .. }) => Err(Error::RegistrationTimeout(timeout)),
            Err(e) => Err(e),
        };

        let registered = match registered {
            Ok(registered) => registered,
            Err(e) => {
                warn!(%name, error = %e, "Registration failed");
                self.inner.end_session(&session, "Registration failed", None);
                return Err(e);
            }
        };

        {
            let mut shared = self.inner.lock();
            if !shared.holds(&session) {
                return Err(Error::Disconnected(CONNECTION_LOST.to_string()));
            }
            shared.state = ClientState::Ready;
        }

        info!(name = %registered.name, clients = registered.clients.len(), "Registered with broker");
        self.inner.emit(ClientEvent::Connected {
            name: registered.name,
            clients: registered.clients,
        });

        let interval = self.inner.config.heartbeat_interval;
        if !interval.is_zero() {
            tokio::spawn(heartbeat(
                Arc::downgrade(&self.inner),
                session,
                interval,
                self.inner.config.heartbeat_timeout,
            ));
        }

        Ok(())
    }

    /// Leave the broker. Idempotent.
    ///
    /// Outstanding requests are rejected with [`Error::Disconnected`].
    pub async fn disconnect(&self) {
        let (session, was_ready) = {
            let shared = self.inner.lock();
            match &shared.session {
                Some(session) => (session.clone(), shared.state == ClientState::Ready),
                None => return,
            }
        };

        if was_ready {
            if let Err(e) = session.send(&Envelope::unregister()).await {
                debug!(name = %session.name, error = %e, "Could not send UNREGISTER");
            }
        }

        self.inner.end_session(&session, CLIENT_DISCONNECTED, None);
        let _ = session.tx.lock().await.close().await;
    }

    /// Send a data message and wait for the target's reply payload
    pub async fn send_to(&self, target: &str, data: Value) -> Result<Value> {
        self.send_to_with_timeout(target, data, self.inner.config.request_timeout)
            .await
    }

    pub async fn send_to_with_timeout(
        &self,
        target: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let session = self.ready_session()?;
        let reply = session.request(Envelope::to(target, data), timeout).await?;
        if !reply.is_data() {
            return Err(Error::InvalidResponse(format!(
                "Expected a data reply, got {:?}",
                reply.kind
            )));
        }
        Ok(reply.data.unwrap_or(Value::Null))
    }

    /// Typed variant of [`send_to`](Self::send_to)
    pub async fn request<Req, Resp>(&self, target: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let reply = self.send_to(target, serde_json::to_value(request)?).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Send a data message without waiting for any reply
    pub async fn post(&self, target: &str, data: Value) -> Result<()> {
        self.ready_session()?
            .send(&Envelope::to(target, data))
            .await
    }

    /// Fan a message out to every other client
    pub async fn broadcast(&self, data: Value) -> Result<BroadcastAck> {
        let session = self.ready_session()?;
        let reply = session
            .request(Envelope::broadcast(data), self.inner.config.request_timeout)
            .await?;
        Ok(expect_kind(reply, Kind::BroadcastAck)?.payload()?)
    }

    pub async fn get_clients(&self) -> Result<ClientList> {
        let session = self.ready_session()?;
        let reply = session
            .request(Envelope::of(Kind::GetClients), self.inner.config.request_timeout)
            .await?;
        Ok(expect_kind(reply, Kind::ClientList)?.payload()?)
    }

    pub async fn get_stats(&self) -> Result<Stats> {
        let session = self.ready_session()?;
        let reply = session
            .request(Envelope::of(Kind::GetStats), self.inner.config.request_timeout)
            .await?;
        Ok(expect_kind(reply, Kind::Stats)?.payload()?)
    }

    pub async fn ping(&self) -> Result<PingReply> {
        self.ready_session()?
            .ping(self.inner.config.request_timeout)
            .await
    }

    /// Handle inbound messages whose payload `type` equals `message_type`.
    ///
    /// Replaces any handler already registered for that type.
    pub fn on_message<F, Fut>(&self, message_type: impl Into<String>, handler: F)
    where
        F: Fn(Value, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on_handler(message_type, handler);
    }

    /// Like [`on_message`](Self::on_message) with serde on both ends
    pub fn on_typed<T, R, F, Fut>(&self, message_type: impl Into<String>, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.on_handler(message_type, Typed::new(handler));
    }

    pub fn on_handler(&self, message_type: impl Into<String>, handler: impl MessageHandler + 'static) {
        let message_type = message_type.into();
        if self
            .inner
            .handlers
            .insert(message_type.clone(), Arc::new(handler))
            .is_some()
        {
            debug!(%message_type, "Replaced message handler");
        }
    }

    /// Remove the handler for `message_type`; false if none was registered
    pub fn off_message(&self, message_type: &str) -> bool {
        self.inner.handlers.remove(message_type)
    }

    fn ready_session(&self) -> Result<Arc<Session>> {
        let shared = self.inner.lock();
        match (shared.state, &shared.session) {
            (ClientState::Ready, Some(session)) => Ok(session.clone()),
            _ => Err(Error::NotConnected),
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Tear down `session` if it is still current.
    ///
    /// `failure` describes a broken port and is published as an error event
    /// ahead of the disconnect.
    fn end_session(&self, session: &Arc<Session>, reason: &str, failure: Option<String>) {
        let was_ready = {
            let mut shared = self.lock();
            if !shared.holds(session) {
                return;
            }
            let was_ready = shared.state == ClientState::Ready;
            shared.session = None;
            shared.state = ClientState::Disconnected;
            was_ready
        };

        session.cancel.cancel();
        let rejected = session.pending.fail_all(reason);
        info!(name = %session.name, %reason, rejected, "Disconnected from broker");

        if was_ready {
            if let Some(message) = failure {
                self.emit(ClientEvent::Error {
                    kind: ErrorKind::ChannelFailed,
                    message,
                });
            }
            self.emit(ClientEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    fn dispatch(&self, session: &Arc<Session>, envelope: Envelope) {
        match envelope.kind {
            None => self.on_data(session, envelope),
            Some(
                Kind::Registered | Kind::Pong | Kind::ClientList | Kind::Stats | Kind::BroadcastAck,
            ) => settle(session, envelope),
            Some(Kind::Error) => self.on_error(session, envelope),
            Some(Kind::ClientJoined) => match envelope.payload::<Membership>() {
                Ok(joined) => self.emit(ClientEvent::ClientJoined {
                    name: joined.name,
                    total_clients: joined.total_clients,
                }),
                Err(e) => warn!(error = %e, "Malformed CLIENT_JOINED"),
            },
            Some(Kind::ClientLeft) => match envelope.payload::<Membership>() {
                Ok(left) => self.emit(ClientEvent::ClientLeft {
                    name: left.name,
                    total_clients: left.total_clients,
                }),
                Err(e) => warn!(error = %e, "Malformed CLIENT_LEFT"),
            },
            Some(Kind::Disconnected) => {
                let reason = envelope
                    .payload::<Disconnected>()
                    .map(|notice| notice.reason)
                    .unwrap_or_else(|_| "Disconnected by broker".to_string());
                self.end_session(session, &reason, None);
            }
            Some(kind) => debug!(?kind, "Ignoring unexpected envelope"),
        }
    }

    fn on_error(&self, session: &Arc<Session>, envelope: Envelope) {
        if let Some(request_id) = &envelope.request_id {
            if session.issued(request_id) {
                if !session
                    .pending
                    .resolve(request_id, Err(Error::from_envelope(&envelope)))
                {
                    debug!(%request_id, "Error arrived after the request settled");
                }
                return;
            }
        }

        let message = envelope
            .error
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(code = ?envelope.code, %message, "Uncorrelated error from broker");
        self.emit(ClientEvent::Error {
            kind: ErrorKind::Remote,
            message,
        });
    }

    fn on_data(&self, session: &Arc<Session>, envelope: Envelope) {
        if let (false, Some(request_id)) = (envelope.broadcast, envelope.request_id.clone()) {
            match session.pending.correlate(&request_id, envelope.from.as_deref()) {
                Correlation::Reply(waiter) => {
                    // The waiter may have given up already
                    let _ = waiter.send(Ok(envelope));
                    return;
                }
                Correlation::Unknown if session.issued(&request_id) => {
                    debug!(%request_id, "Reply arrived after the request settled");
                    return;
                }
                // Our own request routed back to us, or a peer's request
                // that happens to reuse one of our ids
                Correlation::Echo | Correlation::Foreign | Correlation::Unknown => {}
            }
        }

        self.on_inbound(session, envelope);
    }

    fn on_inbound(&self, session: &Arc<Session>, envelope: Envelope) {
        let from = envelope.from.clone().unwrap_or_default();
        let message_type = envelope.payload_type().map(str::to_owned);

        // Broadcast deliveries are never answered
        let reply_to = match (&envelope.request_id, envelope.broadcast) {
            (Some(request_id), false) if !from.is_empty() => Some(request_id.clone()),
            _ => None,
        };

        let session = session.clone();
        let handler = message_type
            .as_deref()
            .and_then(|message_type| self.handlers.get(message_type));

        let Some(handler) = handler else {
            let message_type = message_type.unwrap_or_default();
            warn!(%message_type, %from, "No handler for message");
            if let Some(request_id) = reply_to {
                let reply = Envelope::error(
                    ErrorCode::NoHandler,
                    format!("No handler for message type '{}'", message_type),
                )
                .with_target(from)
                .with_request_id(Some(request_id));
                tokio::spawn(async move {
                    if let Err(e) = session.send(&reply).await {
                        debug!(error = %e, "Could not send NO_HANDLER reply");
                    }
                });
            }
            return;
        };

        let payload = envelope.data.unwrap_or(Value::Null);
        tokio::spawn(async move {
            let outcome = handler.handle(payload, from.clone()).await;

            let Some(request_id) = reply_to else {
                if let Err(e) = outcome {
                    warn!(%from, error = %e, "Handler failed");
                }
                return;
            };

            let reply = match outcome {
                Ok(value) => Envelope::to(from, value),
                Err(e) => {
                    warn!(%from, %request_id, error = %e, "Handler failed");
                    Envelope::error(ErrorCode::HandlerFailed, format!("{:#}", e)).with_target(from)
                }
            };

            if let Err(e) = session.send(&reply.with_request_id(Some(request_id))).await {
                debug!(error = %e, "Could not send reply");
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self
            .shared
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = shared.session.take() {
            session.cancel.cancel();
        }
    }
}

impl Session {
    fn new(name: String, tx: ChannelTx<JsonCodec>) -> Self {
        Self {
            name,
            tx: tokio::sync::Mutex::new(tx),
            pending: PendingRequests::default(),
            next_seq: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<()> {
        self.tx.lock().await.send(envelope).await?;
        Ok(())
    }

    fn next_request_id(&self) -> RequestId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        RequestId::Text(format!("{}-{}", self.name, seq))
    }

    /// Whether `request_id` was minted by this session
    fn issued(&self, request_id: &RequestId) -> bool {
        let RequestId::Text(text) = request_id else {
            return false;
        };
        text.strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|seq| seq.parse::<u64>().ok())
            .is_some_and(|seq| seq < self.next_seq.load(Ordering::Relaxed))
    }

    /// Send `envelope` under a fresh request id and wait for the correlated reply
    async fn request(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let request_id = self.next_request_id();
        let responder = envelope.to.clone();
        let loops_back = responder.as_deref() == Some(self.name.as_str());
        let reply = self
            .pending
            .register(request_id.clone(), responder, loops_back);

        if let Err(e) = self
            .send(&envelope.with_request_id(Some(request_id.clone())))
            .await
        {
            self.pending.cancel(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Disconnected(CONNECTION_LOST.to_string())),
            Err(_) => {
                self.pending.cancel(&request_id);
                debug!(%request_id, ?timeout, "Request timed out");
                Err(Error::Timeout {
                    request_id,
                    after: timeout,
                })
            }
        }
    }

    async fn ping(&self, timeout: Duration) -> Result<PingReply> {
        let started = Instant::now();
        let reply = expect_kind(self.request(Envelope::of(Kind::Ping), timeout).await?, Kind::Pong)?;
        Ok(PingReply {
            timestamp: reply.timestamp,
            latency: started.elapsed(),
        })
    }
}

fn expect_kind(envelope: Envelope, kind: Kind) -> Result<Envelope> {
    if envelope.kind == Some(kind) {
        Ok(envelope)
    } else {
        Err(Error::InvalidResponse(format!(
            "Expected {:?}, got {:?}",
            kind, envelope.kind
        )))
    }
}

fn settle(session: &Session, envelope: Envelope) {
    let Some(request_id) = envelope.request_id.clone() else {
        debug!(kind = ?envelope.kind, "Ignoring uncorrelated reply");
        return;
    };

    if !session.pending.resolve(&request_id, Ok(envelope)) {
        debug!(%request_id, "Ignoring late or unknown reply");
    }
}

/// Read envelopes until the session ends or the port fails
async fn read_loop(weak: Weak<Inner>, session: Arc<Session>, mut rx: ChannelRx<JsonCodec>) {
    loop {
        let received = tokio::select! {
            _ = session.cancel.cancelled() => break,
            received = rx.receive_bytes() => received,
        };

        let Some(inner) = weak.upgrade() else {
            break;
        };

        match received {
            Ok(bytes) => match rx.decode::<Envelope>(&bytes) {
                Ok(envelope) => inner.dispatch(&session, envelope),
                Err(e) => warn!(name = %session.name, error = %e, "Dropping undecodable envelope"),
            },
            Err(e) => {
                if e.is_disconnect() {
                    debug!(name = %session.name, "Broker closed the port");
                } else {
                    warn!(name = %session.name, error = %e, "Port failed");
                }
                inner.end_session(&session, CONNECTION_LOST, Some(e.to_string()));
                break;
            }
        }
    }

    trace!(name = %session.name, "Reader stopped");
}

/// Ping the broker every `interval` while the session lives
async fn heartbeat(weak: Weak<Inner>, session: Arc<Session>, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match session.ping(timeout).await {
            Ok(pong) => trace!(name = %session.name, latency = ?pong.latency, "Heartbeat"),
            Err(Error::Disconnected(_)) => break,
            Err(_) if session.cancel.is_cancelled() => break,
            Err(e) => {
                warn!(name = %session.name, error = %e, "Heartbeat failed");
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.emit(ClientEvent::Error {
                    kind: ErrorKind::HeartbeatFailed,
                    message: e.to_string(),
                });
            }
        }
    }

    trace!(name = %session.name, "Heartbeat stopped");
}
