use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;
use wirelink_frame::{Envelope, Message, MessageRegistry};
use wirelink_transport::{TcpTransport, WireStream};

use crate::connection::{Connection, PeerConfig, StreamOutbound};
use crate::control::{default_registry, QueryError};
use crate::error::{PeerError, Result};
use crate::handshake::{
    evaluate_filters, Handshake, HandshakeCandidate, HandshakeConfig, HandshakeFilter,
    RejectPolicy,
};
use crate::identity::Identity;
use crate::inbound::{Inbound, InboundReader};
use crate::sync::{lock, read, write};
use crate::transmitter::Transmitter;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Lifecycle event delivered to connection actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection passed every handshake filter and joined the server's set.
    Authenticated,
    /// The connection closed. Fires once per authenticated connection.
    Disconnected,
}

/// Predicate run on every message from an authenticated connection before
/// dispatch. Returning `false` drops the message.
pub trait PacketFilter: Send + Sync {
    fn allow(&self, envelope: &Envelope, connection: &Connection) -> bool;
}

impl<F> PacketFilter for F
where
    F: Fn(&Envelope, &Connection) -> bool + Send + Sync,
{
    fn allow(&self, envelope: &Envelope, connection: &Connection) -> bool {
        self(envelope, connection)
    }
}

type ConnectionAction = Arc<dyn Fn(ConnectionEvent, &Connection) + Send + Sync>;

/// Configures and binds a [`Server`].
pub struct ServerBuilder {
    identity: Option<Identity>,
    config: PeerConfig,
    handshake: HandshakeConfig,
    registry: MessageRegistry,
    filters: Vec<Arc<dyn HandshakeFilter>>,
    packet_filters: Vec<Arc<dyn PacketFilter>>,
    actions: Vec<ConnectionAction>,
    transmitter: Arc<Transmitter>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            identity: None,
            config: PeerConfig::default(),
            handshake: HandshakeConfig::default(),
            registry: default_registry(),
            filters: Vec::new(),
            packet_filters: Vec::new(),
            actions: Vec::new(),
            transmitter: Arc::new(Transmitter::new()),
        }
    }

    /// Name the server in its own log output.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.handshake = config;
        self
    }

    /// Replace the message registry. The built-in handshake and query error
    /// messages are added at bind time.
    pub fn with_registry(mut self, registry: MessageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Append a handshake filter. Filters run in registration order.
    pub fn with_filter(mut self, filter: impl HandshakeFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Append a filter over inbound messages of authenticated connections.
    pub fn with_packet_filter(mut self, filter: impl PacketFilter + 'static) -> Self {
        self.packet_filters.push(Arc::new(filter));
        self
    }

    /// Register an action run on every connection lifecycle event.
    pub fn on_connection<F>(mut self, action: F) -> Self
    where
        F: Fn(ConnectionEvent, &Connection) + Send + Sync + 'static,
    {
        self.actions.push(Arc::new(action));
        self
    }

    /// Server-wide transmitter, for registering handlers before binding.
    pub fn transmitter(&self) -> &Arc<Transmitter> {
        &self.transmitter
    }

    /// Bind `addr` and start accepting connections on a background thread.
    pub fn bind(mut self, addr: impl ToSocketAddrs + fmt::Debug) -> Result<Server> {
        self.registry
            .register::<Handshake>()?
            .register::<QueryError>()?;

        let transport = TcpTransport::bind(addr)?;
        let local_addr = transport.local_addr();
        let inner = Arc::new(ServerInner {
            identity: self.identity,
            config: self.config,
            handshake: self.handshake,
            registry: Arc::new(self.registry),
            filters: self.filters,
            packet_filters: self.packet_filters,
            actions: self.actions,
            transmitter: self.transmitter,
            transport,
            local_addr,
            next_ticket: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            connections: RwLock::new(BTreeMap::new()),
            running: AtomicBool::new(true),
            workers: Mutex::new(Vec::new()),
        });

        let accept_inner = Arc::clone(&inner);
        let accept = thread::Builder::new()
            .name("wirelink-accept".to_string())
            .spawn(move || accept_loop(accept_inner))
            .map_err(|err| PeerError::Transport(err.into()))?;

        info!(server = %inner.label(), %local_addr, "server started");
        Ok(Server {
            inner,
            accept: Mutex::new(Some(accept)),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts clients, runs their handshakes, and dispatches messages from
/// authenticated connections into a shared [`Transmitter`].
///
/// Each connection is served by its own thread. Dropping the server shuts
/// it down.
pub struct Server {
    inner: Arc<ServerInner>,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind with default configuration and no handshake filters.
    pub fn bind(addr: impl ToSocketAddrs + fmt::Debug) -> Result<Self> {
        ServerBuilder::new().bind(addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.inner.identity.as_ref()
    }

    /// Server-wide transmitter. Its handlers see messages from every
    /// connection.
    pub fn transmitter(&self) -> &Arc<Transmitter> {
        &self.inner.transmitter
    }

    /// Authenticated connections, oldest first.
    pub fn connections(&self) -> Vec<Connection> {
        read(&self.inner.connections).values().cloned().collect()
    }

    /// Authenticated connections whose identity name matches, ignoring case.
    pub fn connections_named(&self, name: &str) -> Vec<Connection> {
        read(&self.inner.connections)
            .values()
            .filter(|conn| conn.name().eq_ignore_ascii_case(name))
            .cloned()
            .collect()
    }

    pub fn first_named(&self, name: &str) -> Option<Connection> {
        read(&self.inner.connections)
            .values()
            .find(|conn| conn.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn connection(&self, id: Uuid) -> Option<Connection> {
        read(&self.inner.connections)
            .values()
            .find(|conn| conn.id() == id)
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        read(&self.inner.connections).len()
    }

    /// Connections accepted but not yet authenticated.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Send `message` to every authenticated connection. Returns how many
    /// sends succeeded; failures are logged.
    pub fn broadcast<M: Message>(&self, message: &M) -> usize {
        let mut delivered = 0;
        for conn in self.connections() {
            match conn.send(message) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(
                    type_tag = M::TYPE_TAG,
                    peer = %conn,
                    error = %err,
                    "broadcast send failed"
                ),
            }
        }
        delivered
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Stop accepting, close every connection and join all worker threads.
    ///
    /// Outstanding queries fail with [`PeerError::Disconnected`]. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!(server = %self.inner.label(), "shutting down");

        // Wake the accept thread.
        let _ = TcpTransport::connect_timeout(
            wake_addr(self.inner.local_addr),
            ACCEPT_RETRY_DELAY * 10,
        );

        for stream in lock(&self.inner.pending).values() {
            let _ = stream.shutdown();
        }
        for conn in self.connections() {
            conn.close();
        }

        let current = thread::current().id();
        let accept = lock(&self.accept).take();
        let workers = std::mem::take(&mut *lock(&self.inner.workers));
        for handle in accept.into_iter().chain(workers) {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(server = %self.inner.label(), "worker thread panicked");
            }
        }

        self.inner.transmitter.fail_all("server shut down");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("identity", &self.inner.identity)
            .field("local_addr", &self.inner.local_addr)
            .field("connections", &self.connection_count())
            .field("running", &self.is_running())
            .finish()
    }
}

struct ServerInner {
    identity: Option<Identity>,
    config: PeerConfig,
    handshake: HandshakeConfig,
    registry: Arc<MessageRegistry>,
    filters: Vec<Arc<dyn HandshakeFilter>>,
    packet_filters: Vec<Arc<dyn PacketFilter>>,
    actions: Vec<ConnectionAction>,
    transmitter: Arc<Transmitter>,
    transport: TcpTransport,
    local_addr: SocketAddr,
    next_ticket: AtomicU64,
    /// Streams still in the handshake phase, kept so shutdown can close them.
    pending: Mutex<HashMap<u64, WireStream>>,
    connections: RwLock<BTreeMap<u64, Connection>>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ServerInner {
    fn label(&self) -> String {
        match &self.identity {
            Some(identity) => identity.to_string(),
            None => self.local_addr.to_string(),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn notify(&self, event: ConnectionEvent, connection: &Connection) {
        for action in &self.actions {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| action(event, connection)));
            if outcome.is_err() {
                warn!(peer = %connection, ?event, "connection action panicked");
            }
        }
    }
}

fn accept_loop(inner: Arc<ServerInner>) {
    while inner.is_running() {
        let stream = match inner.transport.accept() {
            Ok(stream) => stream,
            Err(err) => {
                if !inner.is_running() {
                    break;
                }
                warn!(server = %inner.label(), error = %err, "accept failed");
                thread::sleep(ACCEPT_RETRY_DELAY);
                continue;
            }
        };
        if !inner.is_running() {
            let _ = stream.shutdown();
            break;
        }

        let worker_inner = Arc::clone(&inner);
        let spawned = thread::Builder::new()
            .name("wirelink-conn".to_string())
            .spawn(move || serve_connection(worker_inner, stream));
        match spawned {
            Ok(handle) => {
                let mut workers = lock(&inner.workers);
                workers.retain(|worker| !worker.is_finished());
                workers.push(handle);
            }
            Err(err) => warn!(
                server = %inner.label(),
                error = %err,
                "failed to spawn connection worker"
            ),
        }
    }
    debug!(server = %inner.label(), "accept loop stopped");
}

fn serve_connection(inner: Arc<ServerInner>, stream: WireStream) {
    let ticket = inner.next_ticket.fetch_add(1, Ordering::Relaxed);
    let peer_addr = stream.peer_addr();
    match stream.try_clone() {
        Ok(control) => {
            lock(&inner.pending).insert(ticket, control);
        }
        Err(err) => {
            warn!(peer = ?peer_addr, error = %err, "failed to clone accepted stream");
            let _ = stream.shutdown();
            return;
        }
    }

    if let Err(err) = run_connection(&inner, ticket, stream) {
        warn!(peer = ?peer_addr, error = %err, "connection ended with error");
    }

    // Still present only if the connection never authenticated.
    if let Some(control) = lock(&inner.pending).remove(&ticket) {
        let _ = control.shutdown();
    }
}

fn run_connection(inner: &ServerInner, ticket: u64, stream: WireStream) -> Result<()> {
    let peer_addr = stream.peer_addr();
    let mut inbound = InboundReader::new(
        stream.try_clone()?,
        &inner.config.frame,
        inner.config.sweep_interval,
        Arc::clone(&inner.registry),
    )?;
    inbound.set_max_frame_size(inner.handshake.max_handshake_frame);
    let outbound = Arc::new(StreamOutbound::new(stream, inner.config.frame.clone())?);

    let Some(handshake) = await_handshake(inner, &mut inbound, peer_addr)? else {
        return Ok(());
    };
    inbound.set_max_frame_size(inner.config.frame.max_frame_size);

    let connection = Connection::new(
        handshake.identity,
        peer_addr,
        outbound,
        Arc::new(Transmitter::new()),
    );
    {
        let mut pending = lock(&inner.pending);
        pending.remove(&ticket);
        write(&inner.connections).insert(connection.serial(), connection.clone());
    }
    if !inner.is_running() {
        connection.close();
    }

    info!(
        server = %inner.label(),
        peer = %connection,
        id = %connection.id(),
        "connection authenticated"
    );
    inner.notify(ConnectionEvent::Authenticated, &connection);

    let reason = serve_authenticated(inner, &mut inbound, &connection);

    write(&inner.connections).remove(&connection.serial());
    connection.close();
    let failed = connection.transmitter().fail_all(&reason)
        + inner.transmitter.fail_pending_for(connection.serial(), &reason);
    info!(
        server = %inner.label(),
        peer = %connection,
        %reason,
        failed_queries = failed,
        "connection closed"
    );
    inner.notify(ConnectionEvent::Disconnected, &connection);
    Ok(())
}

/// Read until a handshake passes every filter. `None` means the connection
/// went away (or the server stopped) before authenticating.
fn await_handshake(
    inner: &ServerInner,
    inbound: &mut InboundReader,
    peer_addr: Option<SocketAddr>,
) -> Result<Option<Handshake>> {
    let deadline = inner.handshake.timeout.map(|timeout| Instant::now() + timeout);
    let label = PendingLabel(peer_addr);

    loop {
        if !inner.is_running() {
            return Ok(None);
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(peer = %label, "handshake timed out");
            return Err(PeerError::HandshakeFailed(format!(
                "no accepted handshake from {label} within {:?}",
                inner.handshake.timeout.unwrap_or_default()
            )));
        }

        let envelope = match inbound.next(&label) {
            Inbound::Message(envelope) => envelope,
            Inbound::Idle => continue,
            Inbound::Closed(None) => {
                debug!(peer = %label, "pending connection closed");
                return Ok(None);
            }
            Inbound::Closed(Some(err)) => return Err(err.into()),
        };

        let type_tag = envelope.type_tag();
        let Some(handshake) = envelope.into_message::<Handshake>() else {
            debug!(
                type_tag,
                peer = %label,
                error = %PeerError::NotAuthenticated,
                "dropping message from pending connection"
            );
            continue;
        };
        debug!(peer = %label, identity = %handshake.identity, ?handshake, "handshake received");

        let verdict = handshake.validate().and_then(|()| {
            let candidate = HandshakeCandidate {
                identity: &handshake.identity,
                properties: &handshake.properties,
                peer_addr,
            };
            evaluate_filters(&inner.filters, &candidate)
        });
        match verdict {
            Ok(()) => return Ok(Some(handshake)),
            Err(err) => {
                warn!(
                    type_tag,
                    peer = %label,
                    identity = %handshake.identity,
                    error = %err,
                    "handshake rejected"
                );
                if inner.handshake.reject_policy == RejectPolicy::Close {
                    return Err(err);
                }
            }
        }
    }
}

/// Dispatch until the connection closes; returns why it closed.
fn serve_authenticated(
    inner: &ServerInner,
    inbound: &mut InboundReader,
    connection: &Connection,
) -> String {
    let mut last_sweep = Instant::now();
    loop {
        if last_sweep.elapsed() >= inner.config.sweep_interval {
            connection.transmitter().sweep_expired();
            inner.transmitter.sweep_expired();
            last_sweep = Instant::now();
        }

        let envelope = match inbound.next(connection) {
            Inbound::Message(envelope) => envelope,
            Inbound::Idle => {
                if !inner.is_running() {
                    return "server shut down".to_string();
                }
                continue;
            }
            Inbound::Closed(None) => return "closed by peer".to_string(),
            Inbound::Closed(Some(err)) => return err.to_string(),
        };

        let type_tag = envelope.type_tag();
        if type_tag == Handshake::TYPE_TAG {
            debug!(peer = %connection, "ignoring handshake on authenticated connection");
            continue;
        }
        if let Some(index) = inner
            .packet_filters
            .iter()
            .position(|filter| !filter.allow(&envelope, connection))
        {
            warn!(type_tag, peer = %connection, filter = index, "packet filter dropped message");
            continue;
        }
        if let Err(err) = inner.transmitter.dispatch(envelope, Some(connection)) {
            warn!(type_tag, peer = %connection, error = %err, "dispatch failed");
        }
    }
}

struct PendingLabel(Option<SocketAddr>);

impl fmt::Display for PendingLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{addr}"),
            None => f.write_str("<unknown>"),
        }
    }
}

/// Address a local connect can reach when the listener is bound to a
/// wildcard address.
fn wake_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use wirelink_frame::{encode_message, FrameWriter, JsonMessage, JsonRequest, JsonResponse};

    use super::*;
    use crate::client::Client;
    use crate::handshake::require_property;

    const WAIT: Duration = Duration::from_secs(5);

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let started = Instant::now();
        while !condition() {
            assert!(started.elapsed() < WAIT, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn fast_config() -> PeerConfig {
        PeerConfig {
            sweep_interval: Duration::from_millis(20),
            ..PeerConfig::default()
        }
    }

    fn counting_actions(
        builder: ServerBuilder,
    ) -> (ServerBuilder, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let up = Arc::new(AtomicUsize::new(0));
        let down = Arc::new(AtomicUsize::new(0));
        let builder = {
            let up = Arc::clone(&up);
            let down = Arc::clone(&down);
            builder.on_connection(move |event, _| match event {
                ConnectionEvent::Authenticated => {
                    up.fetch_add(1, Ordering::SeqCst);
                }
                ConnectionEvent::Disconnected => {
                    down.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        (builder, up, down)
    }

    #[test]
    fn token_filter_promotes_only_matching_handshake() {
        let server = Server::builder()
            .with_config(fast_config())
            .with_filter(require_property("token", "x"))
            .bind("127.0.0.1:0")
            .expect("server should bind");
        let addr = server.local_addr();

        let identity = Identity::new("A");
        let _rejected =
            Client::connect(addr, identity.clone(), HashMap::new()).expect("client should connect");
        wait_until("pending connection", || server.pending_count() == 1);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.connection_count(), 0);

        let properties = HashMap::from([("token".to_string(), "x".to_string())]);
        let _accepted =
            Client::connect(addr, identity.clone(), properties).expect("client should connect");
        wait_until("promotion", || server.connection_count() == 1);

        let conn = server.first_named("a").expect("connection should be found by name");
        assert_eq!(conn.name(), "A");
        assert_eq!(conn.id(), identity.id());
        assert_eq!(server.connections_named("A").len(), 1);
        assert!(server.connection(identity.id()).is_some());
        assert_eq!(server.pending_count(), 1);
    }

    #[test]
    fn filter_chain_rejection_fires_no_action() {
        let builder = Server::builder()
            .with_config(fast_config())
            .with_filter(|_: &HandshakeCandidate<'_>| true)
            .with_filter(|_: &HandshakeCandidate<'_>| false);
        let (builder, up, _) = counting_actions(builder);
        let server = builder.bind("127.0.0.1:0").expect("server should bind");

        let _client = Client::connect(server.local_addr(), Identity::new("A"), HashMap::new())
            .expect("client should connect");
        wait_until("pending connection", || server.pending_count() == 1);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.connection_count(), 0);
        assert_eq!(up.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn filter_chain_acceptance_fires_one_action() {
        let builder = Server::builder()
            .with_config(fast_config())
            .with_filter(|_: &HandshakeCandidate<'_>| true)
            .with_filter(|_: &HandshakeCandidate<'_>| true);
        let (builder, up, down) = counting_actions(builder);
        let server = builder.bind("127.0.0.1:0").expect("server should bind");

        let client = Client::connect(server.local_addr(), Identity::new("A"), HashMap::new())
            .expect("client should connect");
        wait_until("promotion", || server.connection_count() == 1);
        assert_eq!(up.load(Ordering::SeqCst), 1);

        client.close();
        wait_until("disconnect", || down.load(Ordering::SeqCst) == 1);
        assert_eq!(server.connection_count(), 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(down.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejected_handshake_closes_under_close_policy() {
        let server = Server::builder()
            .with_config(fast_config())
            .with_handshake_config(HandshakeConfig {
                reject_policy: RejectPolicy::Close,
                ..HandshakeConfig::default()
            })
            .with_filter(require_property("token", "x"))
            .bind("127.0.0.1:0")
            .expect("server should bind");

        let _client = Client::connect(server.local_addr(), Identity::new("A"), HashMap::new())
            .expect("client should connect");
        wait_until("pending connection to close", || server.pending_count() == 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn pending_connection_times_out() {
        let server = Server::builder()
            .with_config(fast_config())
            .with_handshake_config(HandshakeConfig {
                timeout: Some(Duration::from_millis(100)),
                ..HandshakeConfig::default()
            })
            .bind("127.0.0.1:0")
            .expect("server should bind");

        let _silent =
            TcpTransport::connect(server.local_addr()).expect("raw socket should connect");
        wait_until("pending connection", || server.pending_count() == 1);
        wait_until("handshake timeout", || server.pending_count() == 0);
    }

    #[test]
    fn unauthenticated_and_unknown_frames_are_not_fatal() {
        let server = Server::builder()
            .with_config(fast_config())
            .bind("127.0.0.1:0")
            .expect("server should bind");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        server.transmitter().listen::<JsonMessage, _>("collect", move |_, message| {
            let _ = lock(&tx).send(message.document.clone());
        });

        let stream = TcpTransport::connect(server.local_addr()).expect("raw socket should connect");
        let mut writer = FrameWriter::new(stream);
        let early = encode_message(&JsonMessage::new(serde_json::json!("early")), None)
            .expect("message should encode");
        writer.write_frame(&early).expect("frame should write");

        let handshake = encode_message(&Handshake::new(Identity::new("raw")), None)
            .expect("handshake should encode");
        writer.write_frame(&handshake).expect("handshake should write");
        wait_until("promotion", || server.connection_count() == 1);

        writer
            .write_frame(&wirelink_frame::Frame::new("nobody.knows", None, vec![1u8, 2, 3]))
            .expect("unknown frame should write");
        let late = encode_message(&JsonMessage::new(serde_json::json!("late")), None)
            .expect("message should encode");
        writer.write_frame(&late).expect("frame should write");

        let received = rx.recv_timeout(WAIT).expect("late message should arrive");
        assert_eq!(received, Some(serde_json::json!("late")));
        assert!(rx.try_recv().is_err());
        assert_eq!(server.connection_count(), 1);
    }

    #[test]
    fn concurrent_queries_get_their_own_responses() {
        let server = Server::builder()
            .with_config(fast_config())
            .bind("127.0.0.1:0")
            .expect("server should bind");
        server
            .transmitter()
            .respond::<JsonRequest, _>("echo", |request| JsonResponse {
                document: request.document.clone(),
            });

        let client = Arc::new(
            Client::connect(server.local_addr(), Identity::new("many"), HashMap::new())
                .expect("client should connect"),
        );
        let handles: Vec<_> = (0..16)
            .map(|n| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    for round in 0..10 {
                        let document = serde_json::json!({ "thread": n, "round": round });
                        let response = client
                            .query_blocking(&JsonRequest::new(document.clone()))
                            .expect("query should succeed");
                        assert_eq!(response.document, Some(document));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("query thread should finish");
        }
        assert_eq!(client.transmitter().pending_count(), 0);
    }

    #[test]
    fn server_queries_client_responder() {
        let server = Server::builder()
            .with_config(fast_config())
            .bind("127.0.0.1:0")
            .expect("server should bind");
        let client = Client::builder(Identity::new("worker"))
            .with_config(fast_config())
            .connect(server.local_addr())
            .expect("client should connect");
        client
            .transmitter()
            .respond::<JsonRequest, _>("status", |_| JsonResponse::new(serde_json::json!("ok")));
        wait_until("promotion", || server.connection_count() == 1);

        let conn = server.first_named("worker").expect("client should be connected");
        let response = server
            .transmitter()
            .query_blocking(&conn, &JsonRequest::empty(), WAIT)
            .expect("client should answer");
        assert_eq!(response.document, Some(serde_json::json!("ok")));
    }

    #[test]
    fn request_without_responder_fails_fast() {
        let server = Server::builder()
            .with_config(fast_config())
            .bind("127.0.0.1:0")
            .expect("server should bind");
        let client = Client::connect(server.local_addr(), Identity::new("lonely"), HashMap::new())
            .expect("client should connect");

        let started = Instant::now();
        let err = client
            .connection()
            .query_blocking(&JsonRequest::empty(), WAIT)
            .unwrap_err();
        assert!(matches!(err, PeerError::QueryFailed(_)), "unexpected error: {err}");
        assert!(started.elapsed() < WAIT);
    }

    #[test]
    fn packet_filter_drops_messages() {
        let server = Server::builder()
            .with_config(fast_config())
            .with_packet_filter(|envelope: &Envelope, _: &Connection| {
                envelope
                    .downcast_ref::<JsonMessage>()
                    .map_or(true, |message| message.document.is_some())
            })
            .bind("127.0.0.1:0")
            .expect("server should bind");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        server.transmitter().listen::<JsonMessage, _>("collect", move |_, message| {
            let _ = lock(&tx).send(message.document.clone());
        });

        let client = Client::connect(server.local_addr(), Identity::new("f"), HashMap::new())
            .expect("client should connect");
        client.send(&JsonMessage::empty()).expect("send should succeed");
        client
            .send(&JsonMessage::new(serde_json::json!(1)))
            .expect("send should succeed");

        assert_eq!(
            rx.recv_timeout(WAIT).expect("message should arrive"),
            Some(serde_json::json!(1))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn broadcast_reaches_every_client() {
        let server = Server::builder()
            .with_config(fast_config())
            .bind("127.0.0.1:0")
            .expect("server should bind");
        let (tx, rx) = mpsc::channel();

        let clients: Vec<_> = (0..3)
            .map(|n| {
                let identity = Identity::new(format!("c{n}"));
                let client = Client::connect(server.local_addr(), identity, HashMap::new())
                    .expect("client should connect");
                let tx = Mutex::new(tx.clone());
                client.transmitter().listen::<JsonMessage, _>("b", move |_, _| {
                    let _ = lock(&tx).send(n);
                });
                client
            })
            .collect();
        wait_until("all promoted", || server.connection_count() == 3);

        assert_eq!(server.broadcast(&JsonMessage::empty()), 3);
        let mut got: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(WAIT).expect("broadcast should arrive"))
            .collect();
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2]);
        drop(clients);
    }

    #[test]
    fn shutdown_fails_outstanding_queries() {
        let server = Server::builder()
            .with_config(fast_config())
            .bind("127.0.0.1:0")
            .expect("server should bind");
        let client = Client::connect(server.local_addr(), Identity::new("x"), HashMap::new())
            .expect("client should connect");
        client
            .transmitter()
            .respond::<JsonRequest, _>("slow", |_| {
                thread::sleep(Duration::from_secs(1));
                JsonResponse::empty()
            });
        wait_until("promotion", || server.connection_count() == 1);

        let conn = server.first_named("x").expect("client should be connected");
        let (tx, rx) = mpsc::channel();
        conn.query(&JsonRequest::empty(), move |result| {
            let _ = tx.send(result.map(|_| ()));
        })
        .expect("query should send");

        server.shutdown();
        let result = rx.recv_timeout(WAIT).expect("callback should run");
        assert!(matches!(result, Err(PeerError::Disconnected(_))));
        assert!(!server.is_running());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn send_to_stalled_peer_times_out_and_closes() {
        let config = PeerConfig {
            frame: wirelink_frame::FrameConfig {
                write_timeout: Some(Duration::from_millis(200)),
                ..PeerConfig::default().frame
            },
            ..fast_config()
        };
        let (builder, _, down) = counting_actions(Server::builder().with_config(config));
        let server = builder.bind("127.0.0.1:0").expect("server should bind");

        // Handshakes, then never reads again.
        let stream = TcpTransport::connect(server.local_addr()).expect("raw socket should connect");
        let mut writer = FrameWriter::new(stream);
        let handshake = encode_message(&Handshake::new(Identity::new("stalled")), None)
            .expect("handshake should encode");
        writer.write_frame(&handshake).expect("handshake should write");
        wait_until("promotion", || server.connection_count() == 1);
        let conn = server.first_named("stalled").expect("raw client should be connected");

        let bulk = JsonMessage::new(serde_json::json!("x".repeat(1 << 20)));
        let started = Instant::now();
        let mut failure = None;
        for _ in 0..256 {
            if let Err(err) = conn.send(&bulk) {
                failure = Some(err);
                break;
            }
        }
        let err = failure.expect("send should fail once the socket buffers fill");
        assert!(err.is_disconnect(), "unexpected error: {err}");
        assert!(started.elapsed() < WAIT, "send stalled for {:?}", started.elapsed());

        // The link is torn down instead of carrying a partial frame.
        assert!(conn.is_closed());
        let err = conn.send(&JsonMessage::empty()).unwrap_err();
        assert!(matches!(err, PeerError::Disconnected(_)));
        wait_until("disconnect", || server.connection_count() == 0);
        assert_eq!(down.load(Ordering::SeqCst), 1);
        drop(writer);
    }

    #[test]
    fn wake_addr_maps_wildcards_to_loopback() {
        let v4: SocketAddr = "0.0.0.0:9000".parse().expect("address should parse");
        let loopback: SocketAddr = "127.0.0.1:9000".parse().expect("address should parse");
        assert_eq!(wake_addr(v4), loopback);
        let specific: SocketAddr = "10.0.0.1:9000".parse().expect("address should parse");
        assert_eq!(wake_addr(specific), specific);
    }
}
