use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};
use uuid::Uuid;
use wirelink_frame::{AnyMessage, CorrelationId, Envelope, Message, MessageKind, Request};

use crate::connection::Connection;
use crate::control::QueryError;
use crate::error::{PeerError, Result};
use crate::sync::{lock, read, write};

type ListenerFn = Arc<dyn Fn(Option<&Connection>, &Envelope) + Send + Sync>;
type ResponderFn = Arc<dyn Fn(&Envelope) -> Option<Box<dyn AnyMessage>> + Send + Sync>;
type HookFn = Arc<dyn Fn(Option<&Connection>, &Envelope) + Send + Sync>;
type Callback = Box<dyn FnOnce(Result<Envelope>) + Send>;

enum Waiter {
    /// `query` / `query_with_timeout`: resolved by invoking the callback.
    Callback {
        callback: Callback,
        deadline: Option<(Instant, Duration)>,
    },
    /// `query_blocking`: resolved by filling the caller's slot.
    Blocking(SyncSender<Result<Envelope>>),
}

struct PendingQuery {
    expected: &'static str,
    target: u64,
    waiter: Waiter,
}

impl PendingQuery {
    fn resolve(self, result: Result<Envelope>) {
        match self.waiter {
            Waiter::Blocking(slot) => {
                // Capacity 1 and a single resolution per id: never full. A
                // caller that already gave up has dropped the receiver.
                let _ = slot.try_send(result);
            }
            Waiter::Callback { callback, .. } => {
                guarded("query callback", self.expected, None, move || {
                    callback(result)
                });
            }
        }
    }
}

/// Correlation engine: listener and responder registries, outstanding
/// queries, and the inbound dispatch algorithm.
///
/// A transmitter is shared by reference (`Arc`) between the connection worker
/// that dispatches into it and application threads that register handlers or
/// issue queries. All registries are internally synchronized, and no lock is
/// held while user callbacks run.
pub struct Transmitter {
    listeners: RwLock<HashMap<&'static str, HashMap<String, ListenerFn>>>,
    responders: RwLock<HashMap<&'static str, HashMap<String, ResponderFn>>>,
    pending: Mutex<HashMap<CorrelationId, PendingQuery>>,
    hook: RwLock<Option<HookFn>>,
}

impl Transmitter {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            responders: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            hook: RwLock::new(None),
        }
    }

    /// Register a listener for every inbound `M`, replacing any listener
    /// already registered under `key`.
    pub fn listen<M, F>(&self, key: impl Into<String>, listener: F)
    where
        M: Message,
        F: Fn(Option<&Connection>, &M) + Send + Sync + 'static,
    {
        let erased: ListenerFn =
            Arc::new(move |source: Option<&Connection>, envelope: &Envelope| {
                if let Some(message) = envelope.downcast_ref::<M>() {
                    listener(source, message);
                }
            });
        write(&self.listeners)
            .entry(M::TYPE_TAG)
            .or_default()
            .insert(key.into(), erased);
    }

    /// Register a listener under a generated key and return the key.
    pub fn listen_any<M, F>(&self, listener: F) -> String
    where
        M: Message,
        F: Fn(Option<&Connection>, &M) + Send + Sync + 'static,
    {
        let key = random_key();
        self.listen::<M, F>(key.clone(), listener);
        key
    }

    /// Remove the listener for `M` under `key`. Returns whether one existed.
    pub fn unregister_listener<M: Message>(&self, key: &str) -> bool {
        remove_keyed(&self.listeners, M::TYPE_TAG, key)
    }

    /// Register a responder answering every inbound `R`, replacing any
    /// responder already registered under `key`.
    pub fn respond<R, F>(&self, key: impl Into<String>, responder: F)
    where
        R: Request,
        F: Fn(&R) -> R::Response + Send + Sync + 'static,
    {
        debug_assert_request::<R>();
        let erased: ResponderFn = Arc::new(move |envelope: &Envelope| {
            envelope
                .downcast_ref::<R>()
                .map(|request| Box::new(responder(request)) as Box<dyn AnyMessage>)
        });
        write(&self.responders)
            .entry(R::TYPE_TAG)
            .or_default()
            .insert(key.into(), erased);
    }

    /// Register a responder under a generated key and return the key.
    pub fn respond_any<R, F>(&self, responder: F) -> String
    where
        R: Request,
        F: Fn(&R) -> R::Response + Send + Sync + 'static,
    {
        let key = random_key();
        self.respond::<R, F>(key.clone(), responder);
        key
    }

    /// Remove the responder for `R` under `key`. Returns whether one existed.
    pub fn unregister_responder<R: Request>(&self, key: &str) -> bool {
        remove_keyed(&self.responders, R::TYPE_TAG, key)
    }

    /// Install the generic action hook run for every dispatched message
    /// after responders and before listeners.
    pub fn set_dispatch_hook<F>(&self, hook: F)
    where
        F: Fn(Option<&Connection>, &Envelope) + Send + Sync + 'static,
    {
        *write(&self.hook) = Some(Arc::new(hook));
    }

    pub fn clear_dispatch_hook(&self) {
        *write(&self.hook) = None;
    }

    pub fn listener_count(&self, type_tag: &str) -> usize {
        read(&self.listeners).get(type_tag).map_or(0, HashMap::len)
    }

    pub fn responder_count(&self, type_tag: &str) -> usize {
        read(&self.responders).get(type_tag).map_or(0, HashMap::len)
    }

    /// Number of queries still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Fire-and-forget `message` to `target`.
    pub fn send<M: Message>(&self, target: &Connection, message: &M) -> Result<()> {
        target.send(message)
    }

    /// Send `request` to `target`; `callback` runs once with the response.
    ///
    /// The callback runs on the worker thread of the connection the response
    /// arrives on. Returns the correlation id assigned to the request.
    pub fn query<R, F>(
        &self,
        target: &Connection,
        request: &R,
        callback: F,
    ) -> Result<CorrelationId>
    where
        R: Request,
        F: FnOnce(Result<R::Response>) + Send + 'static,
    {
        self.query_callback(target, request, None, callback)
    }

    /// Like [`Transmitter::query`], but the callback receives
    /// [`PeerError::Timeout`] if no response arrives within `timeout`.
    ///
    /// Deadlines are checked on the owning connection's worker tick, so the
    /// timeout fires up to one [`crate::PeerConfig::sweep_interval`] late.
    pub fn query_with_timeout<R, F>(
        &self,
        target: &Connection,
        request: &R,
        timeout: Duration,
        callback: F,
    ) -> Result<CorrelationId>
    where
        R: Request,
        F: FnOnce(Result<R::Response>) + Send + 'static,
    {
        self.query_callback(target, request, Some(timeout), callback)
    }

    /// Send `request` to `target` and wait up to `timeout` for the response.
    ///
    /// The pending slot is removed on every exit path.
    pub fn query_blocking<R: Request>(
        &self,
        target: &Connection,
        request: &R,
        timeout: Duration,
    ) -> Result<R::Response> {
        debug_assert_request::<R>();
        let id = CorrelationId::generate();
        let (slot, result) = mpsc::sync_channel(1);
        self.insert_pending(
            id,
            PendingQuery {
                expected: <R::Response as Message>::TYPE_TAG,
                target: target.serial(),
                waiter: Waiter::Blocking(slot),
            },
        );
        let _guard = PendingGuard {
            transmitter: self,
            id,
        };

        target.send_dyn(request, Some(id))?;

        let response = match result.recv_timeout(timeout) {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) => {
                debug!(
                    type_tag = R::TYPE_TAG,
                    correlation_id = %id,
                    peer = %target,
                    ?timeout,
                    "blocking query timed out"
                );
                Err(PeerError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(PeerError::Disconnected(format!(
                "query slot for {id} dropped"
            ))),
        };
        response.and_then(into_response::<R::Response>)
    }

    /// Route one inbound message.
    ///
    /// In order:
    /// 1. A response matching an outstanding query resolves it and stops
    ///    here; listeners never see it.
    /// 2. A request is answered by every registered responder, each reply
    ///    carrying the request's correlation id back to `source`.
    /// 3. The dispatch hook runs.
    /// 4. Every listener registered for the message's type runs.
    ///
    /// When `source` carries its own transmitter, that transmitter's pending
    /// queries and responders back up this one's, and its listeners run after
    /// this one's.
    pub fn dispatch(&self, envelope: Envelope, source: Option<&Connection>) -> Result<()> {
        let type_tag = envelope.type_tag();
        let delegate = source
            .map(Connection::transmitter)
            .filter(|transmitter| !std::ptr::eq(Arc::as_ptr(*transmitter), self));

        trace!(
            type_tag,
            kind = %envelope.kind(),
            correlation_id = ?envelope.correlation_id,
            peer = %PeerLabel(source),
            "dispatching message"
        );

        if envelope.kind() == MessageKind::Response {
            if let Some(id) = envelope.correlation_id {
                let pending = self
                    .take_pending(id)
                    .or_else(|| delegate.and_then(|transmitter| transmitter.take_pending(id)));
                match pending {
                    Some(pending) => {
                        let result = check_response(envelope, pending.expected);
                        pending.resolve(result);
                    }
                    None => debug!(
                        type_tag,
                        correlation_id = %id,
                        peer = %PeerLabel(source),
                        "ignoring response with no outstanding query"
                    ),
                }
                return Ok(());
            }
        }

        let outcome = if envelope.kind() == MessageKind::Request {
            self.answer(&envelope, source, delegate)
        } else {
            Ok(())
        };

        let hook = read(&self.hook).clone();
        if let Some(hook) = hook {
            guarded("dispatch hook", type_tag, source, || hook(source, &envelope));
        }

        let mut listeners = self.listeners_for(type_tag);
        if let Some(delegate) = delegate {
            listeners.extend(delegate.listeners_for(type_tag));
        }
        for listener in listeners {
            guarded("listener", type_tag, source, || listener(source, &envelope));
        }

        outcome
    }

    /// Fail every timed query whose deadline has passed. Returns how many.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<_> = pending
                .iter()
                .filter(|(_, query)| {
                    matches!(
                        &query.waiter,
                        Waiter::Callback {
                            deadline: Some((deadline, _)),
                            ..
                        } if *deadline <= now
                    )
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|query| (id, query)))
                .collect()
        };

        let count = expired.len();
        for (id, query) in expired {
            let timeout = match &query.waiter {
                Waiter::Callback {
                    deadline: Some((_, timeout)),
                    ..
                } => *timeout,
                _ => Duration::ZERO,
            };
            debug!(type_tag = query.expected, correlation_id = %id, ?timeout, "query timed out");
            query.resolve(Err(PeerError::Timeout(timeout)));
        }
        count
    }

    /// Fail every query sent over the connection with serial `target`.
    pub(crate) fn fail_pending_for(&self, target: u64, reason: &str) -> usize {
        self.fail_where(|query| query.target == target, reason)
    }

    /// Fail every outstanding query.
    pub(crate) fn fail_all(&self, reason: &str) -> usize {
        self.fail_where(|_| true, reason)
    }

    fn fail_where(&self, predicate: impl Fn(&PendingQuery) -> bool, reason: &str) -> usize {
        let failed: Vec<_> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<_> = pending
                .iter()
                .filter(|(_, query)| predicate(query))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };

        let count = failed.len();
        for query in failed {
            query.resolve(Err(PeerError::Disconnected(reason.to_string())));
        }
        count
    }

    fn query_callback<R, F>(
        &self,
        target: &Connection,
        request: &R,
        timeout: Option<Duration>,
        callback: F,
    ) -> Result<CorrelationId>
    where
        R: Request,
        F: FnOnce(Result<R::Response>) + Send + 'static,
    {
        debug_assert_request::<R>();
        let id = CorrelationId::generate();
        let callback: Callback = Box::new(move |result: Result<Envelope>| {
            callback(result.and_then(into_response::<R::Response>))
        });
        self.insert_pending(
            id,
            PendingQuery {
                expected: <R::Response as Message>::TYPE_TAG,
                target: target.serial(),
                waiter: Waiter::Callback {
                    callback,
                    deadline: timeout.map(|timeout| (Instant::now() + timeout, timeout)),
                },
            },
        );

        // Registered before sending: the response may arrive before send returns.
        if let Err(err) = target.send_dyn(request, Some(id)) {
            self.take_pending(id);
            return Err(err);
        }
        Ok(id)
    }

    fn answer(
        &self,
        envelope: &Envelope,
        source: Option<&Connection>,
        delegate: Option<&Arc<Transmitter>>,
    ) -> Result<()> {
        let type_tag = envelope.type_tag();
        let mut responders = self.responders_for(type_tag);
        if responders.is_empty() {
            if let Some(delegate) = delegate {
                responders = delegate.responders_for(type_tag);
            }
        }

        let Some(source) = source else {
            warn!(type_tag, "request has no sender to answer");
            return Err(PeerError::UnroutableRequest(type_tag.to_string()));
        };

        if responders.is_empty() {
            warn!(type_tag, peer = %source, "no responder for request");
            if envelope.correlation_id.is_some() {
                let unroutable = PeerError::UnroutableRequest(type_tag.to_string());
                reply(source, &QueryError::new(unroutable.to_string()), envelope);
            }
            return Ok(());
        }

        for responder in responders {
            match guarded("responder", type_tag, Some(source), || responder(envelope)) {
                Some(Some(response)) => reply(source, &*response, envelope),
                Some(None) => {
                    warn!(type_tag, peer = %source, "responder registered for a different type");
                }
                None => {
                    if envelope.correlation_id.is_some() {
                        reply(source, &QueryError::new("responder panicked"), envelope);
                    }
                }
            }
        }
        Ok(())
    }

    fn listeners_for(&self, type_tag: &str) -> Vec<ListenerFn> {
        read(&self.listeners)
            .get(type_tag)
            .map(|keyed| keyed.values().cloned().collect())
            .unwrap_or_default()
    }

    fn responders_for(&self, type_tag: &str) -> Vec<ResponderFn> {
        read(&self.responders)
            .get(type_tag)
            .map(|keyed| keyed.values().cloned().collect())
            .unwrap_or_default()
    }

    fn insert_pending(&self, id: CorrelationId, query: PendingQuery) {
        lock(&self.pending).insert(id, query);
    }

    fn take_pending(&self, id: CorrelationId) -> Option<PendingQuery> {
        lock(&self.pending).remove(&id)
    }
}

impl Default for Transmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners: usize = read(&self.listeners).values().map(HashMap::len).sum();
        let responders: usize = read(&self.responders).values().map(HashMap::len).sum();
        f.debug_struct("Transmitter")
            .field("listeners", &listeners)
            .field("responders", &responders)
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Removes a blocking query's slot however the wait ends.
struct PendingGuard<'a> {
    transmitter: &'a Transmitter,
    id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.transmitter.take_pending(self.id);
    }
}

struct PeerLabel<'a>(Option<&'a Connection>);

impl fmt::Display for PeerLabel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(connection) => fmt::Display::fmt(connection, f),
            None => f.write_str("<local>"),
        }
    }
}

/// A request type left at `MessageKind::Plain` never reaches responders.
fn debug_assert_request<R: Request>() {
    debug_assert_eq!(
        R::KIND,
        MessageKind::Request,
        "{} is used as a request but does not declare KIND = MessageKind::Request",
        R::TYPE_TAG
    );
}

fn reply(source: &Connection, message: &dyn AnyMessage, request: &Envelope) {
    if let Err(err) = source.send_dyn(message, request.correlation_id) {
        warn!(
            type_tag = message.type_tag(),
            request = request.type_tag(),
            peer = %source,
            error = %err,
            "failed to send response"
        );
    }
}

fn check_response(envelope: Envelope, expected: &'static str) -> Result<Envelope> {
    if let Some(error) = envelope.downcast_ref::<QueryError>() {
        return Err(PeerError::QueryFailed(error.reason.clone()));
    }
    if envelope.type_tag() != expected {
        return Err(PeerError::UnexpectedResponse {
            expected,
            actual: envelope.type_tag().to_string(),
        });
    }
    Ok(envelope)
}

fn into_response<M: Message>(envelope: Envelope) -> Result<M> {
    let actual = envelope.type_tag();
    envelope
        .into_message::<M>()
        .ok_or_else(|| PeerError::UnexpectedResponse {
            expected: M::TYPE_TAG,
            actual: actual.to_string(),
        })
}

/// Run a user callback, logging instead of unwinding into the worker.
fn guarded<T>(
    what: &str,
    type_tag: &str,
    source: Option<&Connection>,
    f: impl FnOnce() -> T,
) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            warn!(
                type_tag,
                peer = %PeerLabel(source),
                panic = panic_message(payload.as_ref()),
                "{what} panicked"
            );
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

fn remove_keyed<V>(
    registry: &RwLock<HashMap<&'static str, HashMap<String, V>>>,
    type_tag: &str,
    key: &str,
) -> bool {
    let mut registry = write(registry);
    let Some(keyed) = registry.get_mut(type_tag) else {
        return false;
    };
    let removed = keyed.remove(key).is_some();
    if keyed.is_empty() {
        registry.remove(type_tag);
    }
    removed
}

fn random_key() -> String {
    Uuid::new_v4().simple().to_string()
}
