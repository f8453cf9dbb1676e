use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace, warn};
use uuid::Uuid;
use wirelink_frame::{
    AnyMessage, CorrelationId, Frame, FrameConfig, FrameError, FrameWriter, Message, Request,
};
use wirelink_transport::WireStream;

use crate::error::{PeerError, Result};
use crate::identity::Identity;
use crate::sync::lock;
use crate::transmitter::Transmitter;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Longest a single frame write may stall on a peer that stopped reading.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime behavior shared by servers and clients.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Frame limits and stream timeouts. The write timeout bounds every
    /// [`Connection::send`]; `None` lets a stalled peer block senders forever.
    pub frame: FrameConfig,
    /// Timeout used by [`crate::Client::query_blocking`].
    pub query_timeout: Duration,
    /// How often a connection worker wakes to expire timed queries.
    pub sweep_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig {
                write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
                ..FrameConfig::default()
            },
            query_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(250),
        }
    }
}

/// Where a connection's outgoing frames go.
pub trait Outbound: Send + Sync {
    /// Write one complete frame. Concurrent callers must not interleave.
    fn send_frame(&self, frame: &Frame) -> wirelink_frame::Result<()>;

    /// Tear down the underlying transport. Idempotent.
    fn close(&self);
}

/// Outbound half of a TCP connection.
pub(crate) struct StreamOutbound {
    writer: Mutex<FrameWriter<WireStream>>,
    control: WireStream,
}

impl StreamOutbound {
    pub(crate) fn new(stream: WireStream, config: FrameConfig) -> Result<Self> {
        let control = stream.try_clone()?;
        let writer = FrameWriter::with_config_stream(stream, config)?;
        Ok(Self {
            writer: Mutex::new(writer),
            control,
        })
    }
}

impl Outbound for StreamOutbound {
    fn send_frame(&self, frame: &Frame) -> wirelink_frame::Result<()> {
        lock(&self.writer).write_frame(frame)
    }

    fn close(&self) {
        if let Err(err) = self.control.shutdown() {
            debug!(error = %err, "stream shutdown failed");
        }
    }
}

struct ConnectionInner {
    serial: u64,
    identity: Identity,
    peer_addr: Option<SocketAddr>,
    outbound: Arc<dyn Outbound>,
    transmitter: Arc<Transmitter>,
    closed: AtomicBool,
}

/// An authenticated link to a remote peer.
///
/// Cheap to clone; clones share the same transport and transmitter. Sends
/// from any thread are serialized so frames never interleave.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(
        identity: Identity,
        peer_addr: Option<SocketAddr>,
        outbound: Arc<dyn Outbound>,
        transmitter: Arc<Transmitter>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
                identity,
                peer_addr,
                outbound,
                transmitter,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Identity established by this link's handshake.
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn name(&self) -> &str {
        self.inner.identity.name()
    }

    pub fn id(&self) -> Uuid {
        self.inner.identity.id()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Per-connection transmitter, consulted after the owner's.
    pub fn transmitter(&self) -> &Arc<Transmitter> {
        &self.inner.transmitter
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn serial(&self) -> u64 {
        self.inner.serial
    }

    /// Whether both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Close the transport. The worker reading it notices and cleans up.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(peer = %self, "closing connection");
            self.inner.outbound.close();
        }
    }

    /// Send a message without a correlation id.
    pub fn send<M: Message>(&self, message: &M) -> Result<()> {
        self.send_dyn(message, None)
    }

    /// Send any message with an explicit correlation id.
    pub fn send_dyn(
        &self,
        message: &dyn AnyMessage,
        correlation_id: Option<CorrelationId>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(PeerError::Disconnected(format!("{self} is closed")));
        }

        let frame = wirelink_frame::encode_message(message, correlation_id).map_err(|err| {
            warn!(
                type_tag = message.type_tag(),
                peer = %self,
                error = %err,
                "failed to encode message"
            );
            err
        })?;

        // Size checks fail before any byte is written. An I/O failure may
        // leave part of the frame on the wire, so the link cannot be reused.
        self.inner.outbound.send_frame(&frame).map_err(|err| match err {
            FrameError::Io(_) | FrameError::ConnectionClosed => {
                warn!(
                    type_tag = message.type_tag(),
                    peer = %self,
                    error = %err,
                    "write failed, closing connection"
                );
                self.close();
                PeerError::Disconnected(format!("{self}: {err}"))
            }
            other => PeerError::Frame(other),
        })?;
        trace!(
            type_tag = message.type_tag(),
            correlation_id = ?correlation_id,
            peer = %self,
            "sent message"
        );
        Ok(())
    }

    /// Query this peer; see [`Transmitter::query`].
    pub fn query<R, F>(&self, request: &R, callback: F) -> Result<CorrelationId>
    where
        R: Request,
        F: FnOnce(Result<R::Response>) + Send + 'static,
    {
        self.inner.transmitter.query(self, request, callback)
    }

    /// Query this peer with a deadline; see [`Transmitter::query_with_timeout`].
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
        self.inner
            .transmitter
            .query_with_timeout(self, request, timeout, callback)
    }

    /// Query this peer and wait for the response.
    pub fn query_blocking<R: Request>(
        &self,
        request: &R,
        timeout: Duration,
    ) -> Result<R::Response> {
        self.inner.transmitter.query_blocking(self, request, timeout)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.peer_addr {
            Some(addr) => write!(f, "{}@{addr}", self.inner.identity.name()),
            None => f.write_str(self.inner.identity.name()),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("serial", &self.inner.serial)
            .field("identity", &self.inner.identity)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
