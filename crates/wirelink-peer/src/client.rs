use std::collections::HashMap;
use std::fmt;
use std::net::ToSocketAddrs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};
use wirelink_frame::{encode_message, CorrelationId, Message, MessageRegistry, Request};
use wirelink_transport::TcpTransport;

use crate::connection::{Connection, Outbound, PeerConfig, StreamOutbound};
use crate::control::{default_registry, QueryError};
use crate::error::{PeerError, Result};
use crate::handshake::Handshake;
use crate::identity::Identity;
use crate::inbound::{Inbound, InboundReader};
use crate::sync::lock;
use crate::transmitter::Transmitter;

/// Whether a client's link to its server is still up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Disconnected,
}

type DisconnectAction = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Configures and connects a [`Client`].
pub struct ClientBuilder {
    identity: Identity,
    properties: HashMap<String, String>,
    config: PeerConfig,
    registry: MessageRegistry,
    transmitter: Arc<Transmitter>,
    actions: Vec<DisconnectAction>,
}

impl ClientBuilder {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            properties: HashMap::new(),
            config: PeerConfig::default(),
            registry: default_registry(),
            transmitter: Arc::new(Transmitter::new()),
            actions: Vec::new(),
        }
    }

    /// Add a handshake property, e.g. an access token.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn with_config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the message registry. The built-in handshake and query error
    /// messages are added at connect time.
    pub fn with_registry(mut self, registry: MessageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register an action run once when the connection closes.
    pub fn on_disconnected<F>(mut self, action: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.actions.push(Arc::new(action));
        self
    }

    /// Client transmitter, for registering handlers before connecting.
    pub fn transmitter(&self) -> &Arc<Transmitter> {
        &self.transmitter
    }

    /// Connect, send the handshake and start the reader thread.
    ///
    /// The connection is usable as soon as this returns. The server gives no
    /// explicit acceptance; messages sent before it authenticates the
    /// connection are dropped on its side.
    pub fn connect(mut self, addr: impl ToSocketAddrs + fmt::Debug) -> Result<Client> {
        self.registry
            .register::<Handshake>()?
            .register::<QueryError>()?;

        let handshake = Handshake {
            identity: self.identity,
            properties: self.properties,
        };
        handshake.validate()?;

        let stream = TcpTransport::connect(addr)?;
        let peer_addr = stream.peer_addr();
        let mut inbound = InboundReader::new(
            stream.try_clone()?,
            &self.config.frame,
            self.config.sweep_interval,
            Arc::new(self.registry),
        )?;
        let outbound = Arc::new(StreamOutbound::new(stream, self.config.frame.clone())?);
        outbound.send_frame(&encode_message(&handshake, None)?)?;

        let connection = Connection::new(
            handshake.identity,
            peer_addr,
            outbound,
            Arc::clone(&self.transmitter),
        );
        info!(peer = %connection, id = %connection.id(), "connected");

        let connected = Arc::new(AtomicBool::new(true));
        let reader = {
            let connection = connection.clone();
            let transmitter = Arc::clone(&self.transmitter);
            let connected = Arc::clone(&connected);
            let sweep_interval = self.config.sweep_interval;
            let actions = self.actions;
            thread::Builder::new()
                .name("wirelink-client".to_string())
                .spawn(move || {
                    let reason =
                        read_loop(&mut inbound, &connection, &transmitter, sweep_interval);
                    connected.store(false, Ordering::Release);
                    connection.close();
                    let failed = transmitter.fail_all(&reason);
                    info!(peer = %connection, %reason, failed_queries = failed, "disconnected");
                    for action in &actions {
                        if panic::catch_unwind(AssertUnwindSafe(|| action(&connection))).is_err() {
                            warn!(peer = %connection, "disconnect action panicked");
                        }
                    }
                })
                .map_err(|err| PeerError::Transport(err.into()))?
        };

        Ok(Client {
            connection,
            transmitter: self.transmitter,
            connected,
            query_timeout: self.config.query_timeout,
            reader: Mutex::new(Some(reader)),
        })
    }
}

fn read_loop(
    inbound: &mut InboundReader,
    connection: &Connection,
    transmitter: &Transmitter,
    sweep_interval: Duration,
) -> String {
    let mut last_sweep = Instant::now();
    loop {
        if last_sweep.elapsed() >= sweep_interval {
            transmitter.sweep_expired();
            last_sweep = Instant::now();
        }

        match inbound.next(connection) {
            Inbound::Message(envelope) => {
                let type_tag = envelope.type_tag();
                if let Err(err) = transmitter.dispatch(envelope, Some(connection)) {
                    warn!(type_tag, peer = %connection, error = %err, "dispatch failed");
                }
            }
            Inbound::Idle => {
                if connection.is_closed() {
                    return "closed locally".to_string();
                }
            }
            Inbound::Closed(None) => return "closed by server".to_string(),
            Inbound::Closed(Some(err)) => return err.to_string(),
        }
    }
}

/// Client side of a link: one connection to a server plus the thread that
/// reads from it.
///
/// Dropping the client closes the connection.
pub struct Client {
    connection: Connection,
    transmitter: Arc<Transmitter>,
    connected: Arc<AtomicBool>,
    query_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn builder(identity: Identity) -> ClientBuilder {
        ClientBuilder::new(identity)
    }

    /// Connect with default configuration.
    pub fn connect(
        addr: impl ToSocketAddrs + fmt::Debug,
        identity: Identity,
        properties: HashMap<String, String>,
    ) -> Result<Self> {
        ClientBuilder::new(identity)
            .with_properties(properties)
            .connect(addr)
    }

    pub fn state(&self) -> ClientState {
        if self.connected.load(Ordering::Acquire) {
            ClientState::Connected
        } else {
            ClientState::Disconnected
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn transmitter(&self) -> &Arc<Transmitter> {
        &self.transmitter
    }

    pub fn send<M: Message>(&self, message: &M) -> Result<()> {
        self.connection.send(message)
    }

    pub fn query<R, F>(&self, request: &R, callback: F) -> Result<CorrelationId>
    where
        R: Request,
        F: FnOnce(Result<R::Response>) + Send + 'static,
    {
        self.transmitter.query(&self.connection, request, callback)
    }

    pub fn query_with_timeout<R, F>(
        &self,
        request: &R,
        timeout: Duration,
        callback: F,
    ) -> Result<CorrelationId>
    where
        R: Request,
        F: FnOnce(Result<R::Response>) + Send + 'static,
    {
        self.transmitter
            .query_with_timeout(&self.connection, request, timeout, callback)
    }

    /// Blocking query bounded by [`PeerConfig::query_timeout`].
    pub fn query_blocking<R: Request>(&self, request: &R) -> Result<R::Response> {
        self.transmitter
            .query_blocking(&self.connection, request, self.query_timeout)
    }

    /// Close the connection and wait for the reader thread to finish.
    pub fn close(&self) {
        self.connection.close();
        let Some(reader) = lock(&self.reader).take() else {
            return;
        };
        if reader.thread().id() == thread::current().id() {
            return;
        }
        if reader.join().is_err() {
            warn!(peer = %self.connection, "client reader thread panicked");
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.connection)
            .field("state", &self.state())
            .finish()
    }
}
