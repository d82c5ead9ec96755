//! The broker: one loop that owns the registry and routes every envelope.
//!
//! Every port gets a reader task (see [`connection::read_loop`]) that turns
//! frames into [`Event`]s on a bounded queue shared by all readers. Port
//! attachment and queries from the embedding process travel on a separate
//! [`Control`] channel that the loop always drains first. The loop handles
//! one message at a time, so registry mutations never interleave and no lock
//! guards the registry. Writes to ports happen from the loop itself; a failed
//! write is treated as the recipient having gone away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::payload::{BroadcastAck, ClientList, Disconnected, Membership, Registered, Stats};
use courier_core::{Envelope, ErrorCode, Kind, RequestId, Route};
use courier_fabric::codec::JsonCodec;
use courier_fabric::{Channel, MemoryTransport, Transport, TransportListener};

use crate::config::BrokerConfig;
use crate::connection::{self, ConnectionId, Port};
use crate::error::{Error, Result};
use crate::registry::{ClientRecord, Registry};

const DUPLICATE_REASON: &str = "Duplicate connection";
const HEARTBEAT_REASON: &str = "Heartbeat timeout";
pub(crate) const NAME_REQUIRED: &str = "Client name must be a non-empty string";

/// What a port reader observed, queued alongside the port's id
pub(crate) enum Event {
    Inbound(Envelope),
    Malformed {
        code: ErrorCode,
        message: String,
        request_id: Option<RequestId>,
    },
    Closed,
}

/// Input from the embedding process
pub(crate) enum Control {
    Connected { id: ConnectionId, port: Port },
    Query(Query),
}

/// Out-of-band introspection for the embedding process
pub(crate) enum Query {
    Stats(oneshot::Sender<Stats>),
    Clients(oneshot::Sender<ClientList>),
}

/// Result of writing one envelope to many clients
struct FanOut {
    delivered: usize,
    failed: Vec<String>,
}

#[derive(Debug)]
struct Counters {
    total_messages: u64,
    total_clients: u64,
    started: Instant,
    start_time: i64,
}

pub struct Broker {
    config: BrokerConfig,
    control: mpsc::UnboundedReceiver<Control>,
    inbound: mpsc::Receiver<(ConnectionId, Event)>,
    shutdown: CancellationToken,
    ports: HashMap<ConnectionId, Port>,
    registry: Registry,
    counters: Counters,
}

impl Broker {
    /// Create a broker and the handle used to feed it
    pub fn new(config: BrokerConfig) -> (Self, BrokerHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let shutdown = CancellationToken::new();

        let handle = BrokerHandle {
            control: control_tx,
            inbound: inbound_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown: shutdown.clone(),
            write_timeout: config.write_timeout,
        };

        let broker = Self {
            config,
            control: control_rx,
            inbound: inbound_rx,
            shutdown,
            ports: HashMap::new(),
            registry: Registry::new(),
            counters: Counters {
                total_messages: 0,
                total_clients: 0,
                started: Instant::now(),
                start_time: courier_core::timestamp(),
            },
        };

        (broker, handle)
    }

    /// Create a broker and run it on a new task
    pub fn spawn(config: BrokerConfig) -> BrokerHandle {
        let (broker, handle) = Self::new(config);
        tokio::spawn(broker.run());
        handle
    }

    /// Process events until shutdown
    pub async fn run(mut self) {
        info!(
            client_timeout = ?self.config.client_timeout,
            write_timeout = ?self.config.write_timeout,
            inbound_capacity = self.config.inbound_capacity,
            "broker started"
        );

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweeping = self.config.client_timeout.is_some();
        let mut control_open = true;

        loop {
            // Control first: a port's Connected is queued before its reader
            // starts, so it is always handled before that port's first frame.
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                control = self.control.recv(), if control_open => match control {
                    Some(control) => self.handle_control(control),
                    None => control_open = false,
                },
                inbound = self.inbound.recv() => match inbound {
                    Some((id, event)) => self.handle_event(id, event).await,
                    None => break,
                },
                _ = sweep.tick(), if sweeping => self.sweep_stale().await,
            }
        }

        for (_, port) in self.ports.drain() {
            port.close().await;
        }
        info!(
            total_messages = self.counters.total_messages,
            total_clients = self.counters.total_clients,
            "broker stopped"
        );
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Connected { id, port } => {
                debug!(connection = %id, "port attached");
                self.ports.insert(id, port);
            }
            Control::Query(Query::Stats(tx)) => {
                let _ = tx.send(self.stats());
            }
            Control::Query(Query::Clients(tx)) => {
                let _ = tx.send(self.registry.client_list());
            }
        }
    }

    async fn handle_event(&mut self, id: ConnectionId, event: Event) {
        match event {
            Event::Inbound(envelope) => {
                if let Err(e) = self.handle_envelope(id, envelope).await {
                    error!(connection = %id, error = %e, "failed to handle envelope");
                }
            }
            Event::Malformed {
                code,
                message,
                request_id,
            } => {
                warn!(connection = %id, %code, %message, "malformed envelope");
                if self.ports.contains_key(&id) {
                    let reply = Envelope::error(code, message).with_request_id(request_id);
                    self.reply(id, reply).await;
                }
            }
            Event::Closed => self.drop_connection(id).await,
        }
    }

    async fn handle_envelope(&mut self, id: ConnectionId, envelope: Envelope) -> Result<()> {
        // Frames still queued from a port we already evicted
        if !self.ports.contains_key(&id) {
            return Ok(());
        }

        let request_id = envelope.request_id.clone();
        match envelope.kind {
            Some(Kind::Register) => self.register(id, envelope).await,
            Some(Kind::Ping) => {
                self.pong(id, request_id).await;
                Ok(())
            }
            Some(kind) if kind.is_broker_only() => {
                let reply = Envelope::error(
                    ErrorCode::InvalidMessage,
                    format!("Unexpected message kind {:?}", kind),
                )
                .with_request_id(request_id);
                self.reply(id, reply).await;
                Ok(())
            }
            _ => self.handle_request(id, envelope).await,
        }
    }

    /// Pings refresh liveness but leave the message counters alone
    async fn pong(&mut self, id: ConnectionId, request_id: Option<RequestId>) {
        if let Some(name) = self.sender_name(id) {
            if let Some(record) = self.registry.get_mut(&name) {
                record.last_seen = Instant::now();
            }
        }
        let pong = Envelope::of(Kind::Pong).with_request_id(request_id).stamped();
        self.reply(id, pong).await;
    }

    /// Anything that requires a registered sender
    async fn handle_request(&mut self, id: ConnectionId, envelope: Envelope) -> Result<()> {
        let request_id = envelope.request_id.clone();
        let Some(from) = self.sender_name(id) else {
            let reply = Envelope::error(ErrorCode::NotRegistered, "Client not registered")
                .with_request_id(request_id);
            self.reply(id, reply).await;
            return Ok(());
        };

        self.counters.total_messages += 1;
        if let Some(record) = self.registry.get_mut(&from) {
            record.message_count += 1;
            record.last_seen = Instant::now();
        }

        match envelope.kind {
            Some(Kind::Unregister) => {
                info!(client = %from, "client unregistered");
                if let Some(port) = self.ports.get_mut(&id) {
                    port.name = None;
                }
                self.remove_client(&from, id).await
            }
            Some(Kind::GetClients) => {
                let list = system(Kind::ClientList, &self.registry.client_list())?;
                self.reply(id, list.with_request_id(request_id)).await;
                Ok(())
            }
            Some(Kind::GetStats) => {
                let stats = system(Kind::Stats, &self.stats())?;
                self.reply(id, stats.with_request_id(request_id)).await;
                Ok(())
            }
            // Plain data, or a handler's error reply travelling back to a requester
            _ => self.route(id, &from, envelope).await,
        }
    }

    async fn register(&mut self, id: ConnectionId, envelope: Envelope) -> Result<()> {
        let request_id = envelope.request_id.clone();
        let name = envelope.name.unwrap_or_default();
        if name.trim().is_empty() {
            let reply = Envelope::error(ErrorCode::InvalidClientName, NAME_REQUIRED)
                .with_request_id(request_id);
            self.reply(id, reply).await;
            return Ok(());
        }

        // Same connection claiming a new name leaves under the old one first
        if let Some(previous) = self.sender_name(id).filter(|n| *n != name) {
            info!(connection = %id, from = %previous, to = %name, "client renamed");
            self.remove_client(&previous, id).await?;
        }

        if let Some(holder) = self.registry.holder(&name).filter(|c| *c != id) {
            warn!(client = %name, old = %holder, new = %id, "duplicate registration, evicting previous holder");
            self.registry.remove(&name);
            if let Some(mut port) = self.ports.remove(&holder) {
                let notice = system(
                    Kind::Disconnected,
                    &Disconnected {
                        reason: DUPLICATE_REASON.to_string(),
                    },
                )?;
                if let Err(e) = port.send(&notice.stamped()).await {
                    debug!(connection = %holder, error = %e, "could not notify evicted holder");
                }
                port.close().await;
            }
        }

        let refresh = self.registry.holder(&name) == Some(id);
        if !refresh {
            self.registry.insert(ClientRecord::new(name.clone(), id));
        }

        let registered = system(
            Kind::Registered,
            &Registered {
                name: name.clone(),
                clients: self.registry.names(),
            },
        )?
        .with_request_id(request_id)
        .stamped();

        let Some(port) = self.ports.get_mut(&id) else {
            self.registry.remove_held_by(&name, id);
            return Ok(());
        };
        if let Err(e) = port.send(&registered).await {
            warn!(client = %name, connection = %id, error = %e, "could not confirm registration");
            if refresh {
                self.drop_connection(id).await;
            } else {
                // Nobody heard of this client yet, so it leaves without a CLIENT_LEFT
                self.registry.remove_held_by(&name, id);
                if let Some(port) = self.ports.remove(&id) {
                    port.close().await;
                }
            }
            return Ok(());
        }

        if !refresh {
            self.counters.total_clients += 1;
            port.name = Some(name.clone());
            info!(client = %name, connection = %id, total = self.registry.len(), "client registered");

            let joined = system(
                Kind::ClientJoined,
                &Membership {
                    name: name.clone(),
                    total_clients: self.registry.len(),
                },
            )?;
            let outcome = self.fan_out(&joined.stamped(), Some(&name)).await;
            self.evict(outcome.failed).await?;
        }
        Ok(())
    }

    async fn route(&mut self, id: ConnectionId, from: &str, envelope: Envelope) -> Result<()> {
        let request_id = envelope.request_id.clone();
        let route = match envelope.route() {
            Ok(Route::Broadcast) if envelope.kind == Some(Kind::Error) => {
                Err("Error replies must target a single client")
            }
            other => other,
        };

        match route {
            Err(reason) => {
                let reply = Envelope::error(ErrorCode::InvalidMessage, reason)
                    .with_request_id(request_id);
                self.reply(id, reply).await;
                Ok(())
            }
            Ok(Route::Direct(target)) => {
                let target = target.to_string();
                self.route_direct(id, from, target, envelope).await
            }
            Ok(Route::Broadcast) => self.route_broadcast(id, from, envelope).await,
        }
    }

    async fn route_direct(
        &mut self,
        id: ConnectionId,
        from: &str,
        target: String,
        envelope: Envelope,
    ) -> Result<()> {
        let request_id = envelope.request_id.clone();
        if !self.registry.contains(&target) {
            debug!(%from, %target, "target not found");
            let reply = Envelope::error(
                ErrorCode::TargetNotFound,
                format!("Target client '{}' not found", target),
            )
            .with_request_id(request_id);
            self.reply(id, reply).await;
            return Ok(());
        }

        let forwarded = Envelope {
            kind: envelope.kind,
            data: envelope.data,
            request_id: request_id.clone(),
            error: envelope.error,
            code: envelope.code,
            ..Envelope::default()
        }
        .with_from(from)
        .stamped();

        if self.deliver(&target, &forwarded).await {
            debug!(%from, %target, "message routed");
            return Ok(());
        }

        self.evict(vec![target.clone()]).await?;
        let reply = Envelope::error(
            ErrorCode::DeliveryFailed,
            format!("Failed to deliver message to '{}'", target),
        )
        .with_request_id(request_id);
        self.reply(id, reply).await;
        Ok(())
    }

    async fn route_broadcast(&mut self, id: ConnectionId, from: &str, envelope: Envelope) -> Result<()> {
        let request_id = envelope.request_id.clone();
        let forwarded = Envelope {
            broadcast: true,
            data: envelope.data,
            request_id: request_id.clone(),
            ..Envelope::default()
        }
        .with_from(from)
        .stamped();

        let outcome = self.fan_out(&forwarded, Some(from)).await;
        let ack = BroadcastAck {
            delivered: outcome.delivered,
            failed: outcome.failed.len(),
        };
        debug!(%from, delivered = ack.delivered, failed = ack.failed, "broadcast routed");

        self.evict(outcome.failed).await?;

        if request_id.is_some() && self.registry.holder(from) == Some(id) {
            let reply = system(Kind::BroadcastAck, &ack)?;
            self.reply(id, reply.with_request_id(request_id)).await;
        }
        Ok(())
    }

    /// Write to every registered client except `except`, without evicting
    async fn fan_out(&mut self, envelope: &Envelope, except: Option<&str>) -> FanOut {
        let mut outcome = FanOut {
            delivered: 0,
            failed: Vec::new(),
        };

        for name in self.registry.names() {
            if Some(name.as_str()) == except {
                continue;
            }
            if self.deliver(&name, envelope).await {
                outcome.delivered += 1;
            } else {
                outcome.failed.push(name);
            }
        }
        outcome
    }

    /// Write to a registered client by name
    async fn deliver(&mut self, name: &str, envelope: &Envelope) -> bool {
        let Some(connection) = self.registry.holder(name) else {
            return false;
        };
        let Some(port) = self.ports.get_mut(&connection) else {
            return false;
        };

        match port.send(envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!(client = %name, error = %e, "delivery failed");
                false
            }
        }
    }

    /// Write to a connection; a failed write drops the connection.
    ///
    /// Returns whether the write succeeded.
    async fn reply(&mut self, id: ConnectionId, envelope: Envelope) -> bool {
        let Some(port) = self.ports.get_mut(&id) else {
            return false;
        };

        match port.send(&envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!(connection = %id, error = %e, "reply failed");
                self.drop_connection(id).await;
                false
            }
        }
    }

    /// Evict clients whose ports failed, announcing each departure.
    ///
    /// Announcements that fail in turn evict their recipients too.
    async fn evict(&mut self, mut names: Vec<String>) -> Result<()> {
        while let Some(name) = names.pop() {
            let Some(record) = self.registry.remove(&name) else {
                continue;
            };
            warn!(client = %name, connection = %record.connection, "client evicted");
            if let Some(port) = self.ports.remove(&record.connection) {
                port.close().await;
            }
            names.extend(self.announce_left(&name).await?);
        }
        Ok(())
    }

    /// Remove `name` if `id` still holds it and announce the departure
    async fn remove_client(&mut self, name: &str, id: ConnectionId) -> Result<()> {
        if self.registry.remove_held_by(name, id).is_some() {
            let failed = self.announce_left(name).await?;
            self.evict(failed).await?;
        }
        Ok(())
    }

    async fn announce_left(&mut self, name: &str) -> Result<Vec<String>> {
        let left = system(
            Kind::ClientLeft,
            &Membership {
                name: name.to_string(),
                total_clients: self.registry.len(),
            },
        )?;
        Ok(self.fan_out(&left.stamped(), None).await.failed)
    }

    async fn drop_connection(&mut self, id: ConnectionId) {
        let Some(port) = self.ports.remove(&id) else {
            return;
        };
        let name = port.name.clone();
        port.close().await;

        if let Some(name) = name {
            info!(client = %name, connection = %id, "client disconnected");
            if let Err(e) = self.remove_client(&name, id).await {
                error!(client = %name, error = %e, "failed to announce departure");
            }
        }
    }

    async fn sweep_stale(&mut self) {
        let Some(timeout) = self.config.client_timeout else {
            return;
        };

        let stale = self.registry.stale(Instant::now(), timeout);
        if stale.is_empty() {
            return;
        }

        if let Ok(notice) = system(
            Kind::Disconnected,
            &Disconnected {
                reason: HEARTBEAT_REASON.to_string(),
            },
        ) {
            let notice = notice.stamped();
            for name in &stale {
                warn!(client = %name, ?timeout, "client missed heartbeats");
                self.deliver(name, &notice).await;
            }
        }

        if let Err(e) = self.evict(stale).await {
            error!(error = %e, "failed to evict stale clients");
        }
    }

    fn sender_name(&self, id: ConnectionId) -> Option<String> {
        self.ports.get(&id).and_then(|port| port.name.clone())
    }

    fn stats(&self) -> Stats {
        Stats {
            total_messages: self.counters.total_messages,
            total_clients: self.counters.total_clients,
            current_clients: self.registry.len(),
            uptime: self.counters.started.elapsed().as_millis() as u64,
            start_time: self.counters.start_time,
        }
    }
}

fn system<T: Serialize>(kind: Kind, payload: &T) -> Result<Envelope> {
    Envelope::system(kind, payload).map_err(Error::from)
}

/// Cloneable handle for attaching ports to a running broker
#[derive(Clone)]
pub struct BrokerHandle {
    control: mpsc::UnboundedSender<Control>,
    inbound: mpsc::Sender<(ConnectionId, Event)>,
    next_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
    write_timeout: Option<std::time::Duration>,
}

impl BrokerHandle {
    /// Attach a transport as a new port
    pub fn attach(&self, transport: impl Transport + 'static) -> Result<ConnectionId> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Stopped);
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (rx, tx) = Channel::from_transport(transport, JsonCodec).into_split();

        // Connected must be queued before any inbound frame from this port
        self.control
            .send(Control::Connected {
                id,
                port: Port::new(tx, self.write_timeout),
            })
            .map_err(|_| Error::Stopped)?;

        tokio::spawn(connection::read_loop(
            id,
            rx,
            self.inbound.clone(),
            self.shutdown.clone(),
        ));
        Ok(id)
    }

    /// Open an in-process port; the returned end belongs to the client
    pub fn open_port(&self) -> Result<MemoryTransport> {
        let (broker_end, client_end) = MemoryTransport::pair();
        self.attach(broker_end)?;
        Ok(client_end)
    }

    /// Accept connections from `listener` until shutdown
    pub fn serve<L>(&self, mut listener: L) -> JoinHandle<()>
    where
        L: TransportListener + 'static,
    {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = handle.shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok(transport) => {
                        if handle.attach(transport).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }

            if let Err(e) = listener.close().await {
                debug!(error = %e, "listener close failed");
            }
        })
    }

    pub async fn stats(&self) -> Result<Stats> {
        let (tx, rx) = oneshot::channel();
        self.query(Query::Stats(tx))?;
        rx.await.map_err(|_| Error::Stopped)
    }

    pub async fn clients(&self) -> Result<ClientList> {
        let (tx, rx) = oneshot::channel();
        self.query(Query::Clients(tx))?;
        rx.await.map_err(|_| Error::Stopped)
    }

    fn query(&self, query: Query) -> Result<()> {
        self.control
            .send(Control::Query(query))
            .map_err(|_| Error::Stopped)
    }

    /// Stop the broker loop, its readers, and its listeners
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.control.is_closed()
    }
}
