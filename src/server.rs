//! Server-side HTTP/1.x connections.
//!
//! A [`ServerConnection`] parses requests from any [`Transport`] and hands each one to a
//! [`RequestHandler`] as an [`Exchange`]. Responses are written in request order, whatever order
//! handlers answer in. [`HttpServer`] accepts TCP connections and drives them, on the caller's
//! thread via [`Session::drive`] or on its own I/O thread via [`HttpServer::start`].

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    fmt::Debug,
    net::SocketAddr,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant, SystemTime},
};

use http::{Method, StatusCode, Version};

use crate::{
    body::{Body, BodySink, BodySource, SinkDrain},
    buffer::GrowableCircleBuf,
    codec::{BodyEncoder, BodyFraming},
    config::ServerConfig,
    dispatch::WorkerPool,
    error::{HttpError, TimeoutKind},
    exchange::{Execution, InvokeOn},
    handler::{HandlerConfig, RequestHandler, Synchronization, TimeoutAware},
    liveness::Deadline,
    log::{debug, error, warning},
    message::{Headers, Request, RequestHeader, Response, ResponseHeader},
    parser::{encode_message, frame_response, ParseEvent, ParseState, RequestParser},
    session::{HttpSession, SessionManager},
    upgrade::Upgraded,
    DriveOutcome, Session, SessionStatus, Transport,
};

const READS_PER_DRIVE: usize = 16;
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
/// Session locks are pruned of unused entries past this many.
const MAX_IDLE_SESSION_LOCKS: usize = 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // a poisoned lock only means a handler panicked, the state itself stays consistent
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Identity of one server connection, as seen by handlers.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    id: u64,
    peer: Option<SocketAddr>,
    opened: Instant,
}
impl ConnectionInfo {
    fn new(peer: Option<SocketAddr>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            opened: Instant::now(),
        }
    }

    /// Unique within the process
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }
}

/// Named, typed attributes shared by every handler of a server.
///
/// A registry is owned by its server and cleared when the server stops.
#[derive(Clone, Default)]
pub struct Registry {
    attributes: Arc<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
}
impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `name`, replacing any previous value.
    pub fn insert<T: Any + Send + Sync>(&self, name: &str, value: T) {
        lock(&self.attributes).insert(name.to_owned(), Arc::new(value));
    }

    /// The value under `name`, if there is one of type `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let value = lock(&self.attributes).get(name).cloned()?;
        value.downcast::<T>().ok()
    }

    /// The value under `name`, inserting `init()` first if there is none.
    ///
    /// Fails if the existing value is not a `T`.
    pub fn get_or_insert_with<T, F>(&self, name: &str, init: F) -> Result<Arc<T>, HttpError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let value = Arc::clone(
            lock(&self.attributes)
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(init())),
        );
        value
            .downcast::<T>()
            .map_err(|_| HttpError::protocol(format!("registry entry {name:?} has another type")))
    }

    pub fn remove(&self, name: &str) -> bool {
        lock(&self.attributes).remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.attributes).contains_key(name)
    }

    pub fn len(&self) -> usize {
        lock(&self.attributes).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.attributes).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.attributes).clear();
    }
}
impl Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set()
            .entries(lock(&self.attributes).keys())
            .finish()
    }
}

/// Locks that serialize handler calls sharing a session cookie.
#[derive(Clone, Default)]
pub(crate) struct SessionLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}
impl SessionLocks {
    fn get(&self, session: &str) -> Arc<Mutex<()>> {
        let mut locks = lock(&self.locks);
        if locks.len() > MAX_IDLE_SESSION_LOCKS {
            locks.retain(|_, x| Arc::strong_count(x) > 1);
        }
        Arc::clone(locks.entry(session.to_owned()).or_default())
    }
}

type UpgradeCallback = Box<dyn FnOnce(Upgraded) + Send + 'static>;

enum OutItem {
    Bytes(Vec<u8>),
    Sink(BodySink),
    Source(BodySource, BodyEncoder),
    /// End of one response
    End { close: bool },
    /// Hand the transport over once everything before this is flushed
    Upgrade(ResponseHeader, UpgradeCallback),
}
impl OutItem {
    fn fail(self, err: &HttpError) {
        match self {
            OutItem::Sink(sink) => sink.fail(err.clone()),
            OutItem::Source(source, _) => source.destroy(),
            _ => {}
        }
    }
}

enum SlotState {
    /// The handler has not answered yet
    Pending,
    Ready(Vec<OutItem>),
    Upgrade {
        header: ResponseHeader,
        head: Vec<u8>,
        callback: UpgradeCallback,
    },
    /// Moved to the connection's write queue
    Taken,
    /// The connection closed before the answer was written
    Closed,
}

struct SlotInner {
    state: SlotState,
    /// Streaming body given to the handler by `send_header`
    sink: Option<BodySink>,
}

/// The place in a connection's response order reserved for one request.
struct ResponseSlot {
    inner: Mutex<SlotInner>,
}
impl ResponseSlot {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: SlotState::Pending,
                sink: None,
            }),
        }
    }

    fn is_pending(&self) -> bool {
        matches!(lock(&self.inner).state, SlotState::Pending)
    }

    fn fill(&self, state: SlotState, sink: Option<BodySink>) -> Result<(), HttpError> {
        let mut inner = lock(&self.inner);
        match inner.state {
            SlotState::Pending => {
                inner.state = state;
                inner.sink = sink;
                Ok(())
            }
            SlotState::Closed => Err(HttpError::ConnectionClosed),
            _ => Err(HttpError::protocol("a response was already sent for this request")),
        }
    }

    fn take(&self) -> Option<SlotState> {
        let mut inner = lock(&self.inner);
        match inner.state {
            SlotState::Pending | SlotState::Taken | SlotState::Closed => None,
            _ => Some(std::mem::replace(&mut inner.state, SlotState::Taken)),
        }
    }

    /// A handler failed. A streaming response already under way cannot be completed.
    fn on_handler_error(&self) {
        let sink = lock(&self.inner).sink.take();
        if let Some(sink) = sink {
            if sink.is_open() {
                sink.destroy();
            }
        }
    }

    fn abort(&self, err: &HttpError) {
        let mut inner = lock(&self.inner);
        if let Some(sink) = inner.sink.take() {
            sink.fail(err.clone());
        }
        if let SlotState::Ready(items) = std::mem::replace(&mut inner.state, SlotState::Closed) {
            for item in items {
                item.fail(err);
            }
        }
    }
}

/// What the response to one request may do to the connection.
#[derive(Debug, Clone)]
struct ResponseContext {
    method: Method,
    version: Version,
    /// The request allows the connection to persist after its response
    keep_alive: bool,
    close_on_error: bool,
    /// Requests left on this connection after this one, when bounded
    remaining: Option<u64>,
}
impl ResponseContext {
    /// For answering a request that could not be parsed.
    fn closing() -> Self {
        Self {
            method: Method::GET,
            version: Version::HTTP_11,
            keep_alive: false,
            close_on_error: true,
            remaining: None,
        }
    }

    /// Set framing and persistence headers, returning the framing and whether the connection closes after.
    fn prepare(
        &self,
        header: &mut ResponseHeader,
        body_len: Option<u64>,
    ) -> Result<(BodyFraming, bool), HttpError> {
        if self.version == Version::HTTP_10 {
            header.version = Version::HTTP_10;
        }
        if !header.headers.contains("Date") {
            header
                .headers
                .insert("Date", &httpdate::fmt_http_date(SystemTime::now()))?;
        }
        let framing = frame_response(header, body_len, &self.method, self.version)?;
        let status = header.status;
        let close = !self.keep_alive
            || header.headers.has_token("Connection", "close")
            || framing.is_close_delimited()
            || status.is_server_error()
            || (self.close_on_error && status.is_client_error());
        header.headers.remove("Keep-Alive");
        if close {
            header.headers.insert("Connection", "close")?;
        } else {
            if self.version == Version::HTTP_10 {
                header.headers.insert("Connection", "keep-alive")?;
            }
            if let Some(remaining) = self.remaining {
                header
                    .headers
                    .insert("Keep-Alive", &format!("max={remaining}"))?;
            }
        }
        Ok((framing, close))
    }
}

fn encode_head(header: &ResponseHeader) -> Vec<u8> {
    let mut head = Vec::new();
    header.encode(&mut head);
    head
}

/// Writes the answer to one request into its slot. An unanswered request gets a 500 on drop.
struct Responder {
    slot: Arc<ResponseSlot>,
    context: ResponseContext,
    /// The request body still being received when the handler was called
    request_body: Option<BodySource>,
}
impl Responder {
    fn new(slot: Arc<ResponseSlot>, context: ResponseContext) -> Self {
        Self {
            slot,
            context,
            request_body: None,
        }
    }

    fn with_request_body(mut self, source: BodySource) -> Self {
        self.request_body = Some(source);
        self
    }

    /// A destroyed request body leaves the connection unusable, so the response announces the close.
    fn context(&self) -> ResponseContext {
        let mut context = self.context.clone();
        if self.request_body.as_ref().is_some_and(|x| x.is_destroyed()) {
            context.keep_alive = false;
        }
        context
    }

    fn respond(&self, response: Response) -> Result<(), HttpError> {
        let (mut header, body) = response.into_parts();
        let context = self.context();
        let mut items = Vec::new();
        let close = match body {
            Body::Streaming(source) => {
                let (framing, close) = context.prepare(&mut header, None)?;
                items.push(OutItem::Bytes(encode_head(&header)));
                if framing != BodyFraming::Empty {
                    items.push(OutItem::Source(source, BodyEncoder::new(framing)));
                }
                close
            }
            body => {
                let data = body.as_bytes().unwrap_or_default();
                let (framing, close) = context.prepare(&mut header, Some(data.len() as u64))?;
                let head = encode_head(&header);
                let mut out = Vec::with_capacity(head.len() + data.len());
                encode_message(&head, framing, data, &mut out)?;
                items.push(OutItem::Bytes(out));
                close
            }
        };
        items.push(OutItem::End { close });
        self.slot.fill(SlotState::Ready(items), None)
    }

    fn respond_streaming(&self, mut header: ResponseHeader) -> Result<BodySink, HttpError> {
        let (framing, close) = self.context().prepare(&mut header, None)?;
        let sink = BodySink::new(framing);
        let mut items = vec![OutItem::Bytes(encode_head(&header))];
        if framing == BodyFraming::Empty {
            sink.close()?;
        } else {
            items.push(OutItem::Sink(sink.clone()));
        }
        items.push(OutItem::End { close });
        self.slot.fill(SlotState::Ready(items), Some(sink.clone()))?;
        Ok(sink)
    }

    fn upgrade(&self, header: ResponseHeader, callback: UpgradeCallback) -> Result<(), HttpError> {
        let switching = header.status == StatusCode::SWITCHING_PROTOCOLS
            || (self.context.method == Method::CONNECT && header.status.is_success());
        if !switching {
            return Err(HttpError::Upgrade(format!(
                "{} does not switch protocols",
                header.status
            )));
        }
        let head = encode_head(&header);
        self.slot.fill(
            SlotState::Upgrade {
                header,
                head,
                callback,
            },
            None,
        )
    }
}
impl Drop for Responder {
    fn drop(&mut self) {
        if self.slot.is_pending() {
            debug!("request dropped unanswered, sending 500");
            if let Err(err) = self.respond(Response::error(StatusCode::INTERNAL_SERVER_ERROR, None)) {
                debug!("could not answer dropped request: {err}");
            }
        }
    }
}

/// One request, answered through the exchange.
///
/// Every answering method consumes the exchange. Dropping an exchange without answering sends a `500`.
pub struct Exchange {
    request: Request,
    responder: Responder,
    connection: ConnectionInfo,
    registry: Registry,
    sessions: SessionManager,
    session_cookie: String,
    session: Option<HttpSession>,
    /// `Set-Cookie` value for a session created by this exchange
    new_session_cookie: Option<String>,
    chain: Option<(Arc<Vec<Arc<dyn RequestHandler>>>, usize)>,
}
impl Exchange {
    fn new(
        request: Request,
        responder: Responder,
        connection: ConnectionInfo,
        registry: Registry,
    ) -> Self {
        Self {
            request,
            responder,
            connection,
            registry,
            sessions: SessionManager::default(),
            session_cookie: String::new(),
            session: None,
            new_session_cookie: None,
            chain: None,
        }
    }

    fn with_sessions(mut self, sessions: SessionManager, cookie: &str) -> Self {
        self.sessions = sessions;
        self.session_cookie = cookie.to_owned();
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The session named by the request's session cookie.
    ///
    /// With `create`, a missing or expired session is replaced by a new one, and the response
    /// sets its cookie.
    pub fn session(&mut self, create: bool) -> Option<HttpSession> {
        if let Some(session) = self.session.as_ref().filter(|x| x.is_valid()) {
            return Some(session.clone());
        }
        let name = self.session_cookie.as_str();
        let sessions = &self.sessions;
        let found = self
            .request
            .headers()
            .get_all("Cookie")
            .flat_map(crate::cookie::parse_cookie_header)
            .filter(|(key, _)| *key == name)
            .find_map(|(_, id)| sessions.get(id));
        let session = match found {
            Some(x) => x,
            None if create => {
                let session = self.sessions.create();
                debug!("created session {} on connection {}", session.id(), self.connection.id);
                self.new_session_cookie = Some(format!("{name}={}; Path=/; HttpOnly", session.id()));
                session
            }
            None => return None,
        };
        self.session = Some(session.clone());
        Some(session)
    }

    fn apply_session_cookie(&mut self, headers: &mut Headers) -> Result<(), HttpError> {
        match self.new_session_cookie.take() {
            Some(cookie) => headers.append("Set-Cookie", &cookie),
            None => Ok(()),
        }
    }

    /// Send a complete response. A streaming body is pumped by the connection as it becomes available.
    pub fn send(mut self, mut response: Response) -> Result<(), HttpError> {
        self.apply_session_cookie(response.headers_mut())?;
        self.responder.respond(response)
    }

    /// Send a response head now and stream the body through the returned sink.
    ///
    /// With `content_length` the body is fixed-length, otherwise it is chunked
    /// (or close-delimited for an HTTP/1.0 client). A bodiless response, such as the answer to `HEAD`,
    /// returns a sink that is already closed.
    pub fn send_header(
        mut self,
        mut header: ResponseHeader,
        content_length: Option<u64>,
    ) -> Result<BodySink, HttpError> {
        if let Some(len) = content_length {
            header.headers.insert("Content-Length", &len.to_string())?;
        }
        self.apply_session_cookie(&mut header.headers)?;
        self.responder.respond_streaming(header)
    }

    /// Send an error page with the status and an optional message.
    pub fn send_error(self, status: StatusCode, message: Option<&str>) -> Result<(), HttpError> {
        self.send(Response::error(status, message))
    }

    /// Pass the exchange to the next entry of the chain it is running in, answering 404 past the end.
    pub fn forward(mut self) -> Result<(), HttpError> {
        match self.chain.take() {
            Some((entries, next)) if next < entries.len() => {
                let handler = Arc::clone(&entries[next]);
                self.chain = Some((entries, next + 1));
                handler.on_request(self)
            }
            _ => self.send_error(StatusCode::NOT_FOUND, None),
        }
    }

    pub(crate) fn with_chain(mut self, entries: Arc<Vec<Arc<dyn RequestHandler>>>) -> Self {
        self.chain = Some((entries, 0));
        self
    }

    /// Answer with `101 Switching Protocols` (or `2xx` to `CONNECT`) and take over the raw stream.
    ///
    /// `on_upgrade` is called on the I/O thread once the head is flushed, and must not block.
    pub fn upgrade<F>(mut self, mut header: ResponseHeader, on_upgrade: F) -> Result<(), HttpError>
    where
        F: FnOnce(Upgraded) + Send + 'static,
    {
        self.apply_session_cookie(&mut header.headers)?;
        self.responder.upgrade(header, Box::new(on_upgrade))
    }

    /// Complete a WebSocket handshake and hand the resulting session to `on_open`.
    #[cfg(feature = "websocket")]
    pub fn upgrade_websocket<F>(self, on_open: F) -> Result<(), HttpError>
    where
        F: FnOnce(crate::websocket::WebSocketSession) + Send + 'static,
    {
        let header = crate::websocket::handshake_response(self.request.header())?;
        self.upgrade(header, move |upgraded| {
            match crate::websocket::WebSocketSession::accept(upgraded) {
                Ok(session) => on_open(session),
                Err(err) => {
                    warning!("websocket session failed to open: {err}");
                }
            }
        })
    }
}
impl Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("method", self.request.method())
            .field("target", &self.request.target())
            .field("connection", &self.connection.id)
            .finish()
    }
}

/// The request currently being received.
enum Inbound {
    Idle,
    /// Handed to the handler on its head, waiting for the end of an empty body
    Dispatched,
    Streaming(BodySource),
    Buffering {
        header: RequestHeader,
        data: Vec<u8>,
        responder: Responder,
        config: HandlerConfig,
    },
}

/// A server connection over a byte [`Transport`].
pub struct ServerConnection<S> {
    transport: Option<S>,
    handler: Arc<dyn RequestHandler>,
    config: ServerConfig,
    registry: Registry,
    workers: Option<WorkerPool>,
    session_locks: SessionLocks,
    sessions: SessionManager,
    connection_lock: Arc<Mutex<()>>,
    info: ConnectionInfo,
    read_buf: Vec<u8>,
    parser: RequestParser,
    inbound: Inbound,
    slots: VecDeque<Arc<ResponseSlot>>,
    out_queue: VecDeque<OutItem>,
    write_buf: GrowableCircleBuf,
    idle_deadline: Deadline,
    request_deadline: Deadline,
    body_deadline: Deadline,
    requests: u64,
    responses: u64,
    /// Further requests will be read
    reading: bool,
    /// The request being received is the last one
    final_request: bool,
    /// Reading is paused until the answer to an `Upgrade` or `CONNECT` request is known
    upgrade_pending: bool,
    closed: bool,
}

impl<S: Transport + 'static> ServerConnection<S> {
    pub fn new(
        transport: S,
        handler: Arc<dyn RequestHandler>,
        config: &ServerConfig,
    ) -> Result<Self, HttpError> {
        Ok(Self {
            transport: Some(transport),
            handler,
            config: config.clone(),
            registry: Registry::default(),
            workers: None,
            session_locks: SessionLocks::default(),
            sessions: SessionManager::new(config.session_max_inactive),
            connection_lock: Arc::new(Mutex::new(())),
            info: ConnectionInfo::new(None),
            read_buf: Vec::new(),
            parser: RequestParser::new().with_max_header_size(config.max_header_size),
            inbound: Inbound::Idle,
            slots: VecDeque::new(),
            out_queue: VecDeque::new(),
            write_buf: GrowableCircleBuf::new(config.write_buffer_capacity)?,
            idle_deadline: Deadline::started(TimeoutKind::Idle, config.timeouts.idle),
            request_deadline: Deadline::new(TimeoutKind::Request, config.timeouts.request),
            body_deadline: Deadline::new(TimeoutKind::BodyReceive, config.timeouts.body_receive),
            requests: 0,
            responses: 0,
            reading: true,
            final_request: false,
            upgrade_pending: false,
            closed: false,
        })
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.info.peer = Some(peer);
        self
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Workers for handlers configured with [`Execution::WorkerPool`]. Without them such handlers run inline.
    pub fn with_workers(mut self, workers: Option<WorkerPool>) -> Self {
        self.workers = workers;
        self
    }

    /// The sessions handlers reach through [`Exchange::session`], usually shared by a whole server.
    pub fn with_sessions(mut self, sessions: SessionManager) -> Self {
        self.sessions = sessions;
        self
    }

    pub(crate) fn with_session_locks(mut self, session_locks: SessionLocks) -> Self {
        self.session_locks = session_locks;
        self
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Requests received so far
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Responses fully queued for writing so far
    pub fn responses(&self) -> u64 {
        self.responses
    }

    /// True while further requests will be read.
    pub fn is_persistent(&self) -> bool {
        self.reading && !self.closed
    }

    fn can_parse(&self) -> bool {
        self.reading && !self.upgrade_pending && !self.closed && self.transport.is_some()
    }

    fn is_idle(&self) -> bool {
        matches!(self.inbound, Inbound::Idle)
            && self.slots.is_empty()
            && self.out_queue.is_empty()
            && !self.parser.is_mid_message()
    }

    fn is_finished(&self) -> bool {
        !self.reading
            && !self.upgrade_pending
            && matches!(self.inbound, Inbound::Idle)
            && self.slots.is_empty()
            && self.out_queue.is_empty()
            && self.write_buf.is_empty()
    }

    fn shutdown(&mut self, err: HttpError) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reading = false;
        match std::mem::replace(&mut self.inbound, Inbound::Idle) {
            Inbound::Streaming(source) => source.fail(err.clone()),
            // dropping the responder fills its slot, which is aborted just below
            Inbound::Buffering { responder, .. } => drop(responder),
            Inbound::Idle | Inbound::Dispatched => {}
        }
        for slot in self.slots.drain(..) {
            slot.abort(&err);
        }
        for item in self.out_queue.drain(..) {
            item.fail(&err);
        }
        self.write_buf.clear();
        if let Some(transport) = self.transport.as_mut() {
            transport.close_transport();
        }
    }

    fn timeout_hook(&self, hook: impl Fn(&dyn TimeoutAware, &ConnectionInfo) -> bool) -> bool {
        self.handler
            .timeout_aware()
            .map(|x| hook(x, &self.info))
            .unwrap_or(false)
    }

    /// Stop reading once the handler destroys the request body it is receiving.
    ///
    /// The rest of that body is never parsed, so the connection closes after the pending responses.
    fn check_abandoned(&mut self) {
        let abandoned = match &self.inbound {
            Inbound::Streaming(source) => source.is_destroyed(),
            _ => false,
        };
        if !abandoned {
            return;
        }
        debug!(
            "request body abandoned on server connection {}, closing after response",
            self.info.id
        );
        self.inbound = Inbound::Idle;
        self.reading = false;
        self.final_request = true;
        self.upgrade_pending = false;
        self.read_buf.clear();
        self.request_deadline.disarm();
        self.body_deadline.disarm();
    }

    /// Enforce timers, returning true if the connection was closed.
    fn check_timers(&mut self) -> bool {
        if let Inbound::Streaming(source) = &self.inbound {
            if !source.wants_data() && self.body_deadline.is_armed() {
                // the handler is applying backpressure, not the peer stalling
                self.body_deadline.arm();
            }
        }
        if self.body_deadline.is_expired() {
            let err = self.body_deadline.error();
            debug!("server connection {}: {err}", self.info.id);
            self.shutdown(err);
            return true;
        }
        if self.request_deadline.is_expired() {
            if self.timeout_hook(|x, info| x.on_request_timeout(info)) {
                self.request_deadline.arm();
            } else {
                let err = self.request_deadline.error();
                debug!("server connection {}: {err}", self.info.id);
                self.shutdown(err);
                return true;
            }
        }
        if self.idle_deadline.is_expired() && self.is_idle() {
            if self.timeout_hook(|x, info| x.on_idle_timeout(info)) {
                self.idle_deadline.arm();
            } else {
                debug!("closing idle server connection {}", self.info.id);
                self.shutdown(HttpError::ConnectionClosed);
                return true;
            }
        }
        false
    }

    fn collect_ready(&mut self) {
        while let Some(slot) = self.slots.front() {
            match slot.take() {
                None => break,
                Some(SlotState::Ready(items)) => {
                    self.slots.pop_front();
                    self.out_queue.extend(items);
                }
                Some(SlotState::Upgrade {
                    header,
                    head,
                    callback,
                }) => {
                    self.slots.pop_front();
                    self.out_queue.push_back(OutItem::Bytes(head));
                    self.out_queue.push_back(OutItem::Upgrade(header, callback));
                    break;
                }
                Some(_) => {
                    self.slots.pop_front();
                }
            }
        }
    }

    fn write_out(&mut self) -> Result<DriveOutcome, HttpError> {
        if self.closed {
            return Ok(DriveOutcome::Idle);
        }
        let mut outcome = DriveOutcome::Idle;
        self.collect_ready();
        while let Some(item) = self.out_queue.pop_front() {
            match item {
                OutItem::Bytes(data) => {
                    if !self.write_buf.try_write(&[&data])? {
                        self.out_queue.push_front(OutItem::Bytes(data));
                        break;
                    }
                }
                OutItem::Sink(sink) => match sink.drain(self.write_buf.available()) {
                    SinkDrain::Data { data, finished } => {
                        if !data.is_empty() && !self.write_buf.try_write(&[&data])? {
                            return Err(HttpError::protocol("write buffer refused drained body"));
                        }
                        if !finished {
                            self.out_queue.push_front(OutItem::Sink(sink));
                            if data.is_empty() {
                                break;
                            }
                        }
                    }
                    SinkDrain::Destroyed => return Err(HttpError::ClosedChannel),
                },
                OutItem::Source(source, mut encoder) => {
                    if self.write_buf.len() > self.write_buf.capacity() / 2 {
                        self.out_queue.push_front(OutItem::Source(source, encoder));
                        break;
                    }
                    let mut out = Vec::new();
                    match source.read_available()? {
                        Some(data) if data.is_empty() => {
                            self.out_queue.push_front(OutItem::Source(source, encoder));
                            break;
                        }
                        Some(data) => {
                            encoder.encode(&data, &mut out)?;
                            self.out_queue.push_front(OutItem::Source(source, encoder));
                        }
                        None => encoder.finish(None, &mut out)?,
                    }
                    self.out_queue.push_front(OutItem::Bytes(out));
                }
                OutItem::End { close } => {
                    self.finish_response(close);
                    if close {
                        break;
                    }
                }
                item @ OutItem::Upgrade(..) => {
                    self.out_queue.push_front(item);
                    break;
                }
            }
            outcome = DriveOutcome::Active;
            if self.out_queue.is_empty() {
                self.collect_ready();
            }
        }
        if let Some(transport) = self.transport.as_mut() {
            while !self.write_buf.is_empty() {
                let wrote = transport.write_some(self.write_buf.peek_read())?;
                if wrote == 0 {
                    break;
                }
                self.write_buf.advance_read(wrote)?;
                outcome = DriveOutcome::Active;
            }
        }
        if self.write_buf.is_empty() && matches!(self.out_queue.front(), Some(OutItem::Upgrade(..))) {
            self.complete_upgrade();
            outcome = DriveOutcome::Active;
        }
        Ok(outcome)
    }

    fn exchange_bytes(&mut self) -> Result<DriveOutcome, HttpError> {
        let written = self.write_out()?;
        let read = self.read_in()?;
        Ok(written.merge(read).merge(self.write_out()?))
    }

    fn finish_response(&mut self, close: bool) {
        self.responses += 1;
        let more_queued = self
            .out_queue
            .iter()
            .any(|x| matches!(x, OutItem::End { .. } | OutItem::Upgrade(..)));
        if self.upgrade_pending && self.slots.is_empty() && !more_queued {
            // the upgrade was declined, so the peer keeps speaking HTTP
            self.upgrade_pending = false;
        }
        if close {
            debug!(
                "server connection {} closes after response {}",
                self.info.id, self.responses
            );
            self.reading = false;
            self.upgrade_pending = false;
            for item in self.out_queue.drain(..) {
                item.fail(&HttpError::ConnectionClosed);
            }
            for slot in self.slots.drain(..) {
                slot.abort(&HttpError::ConnectionClosed);
            }
        }
        if self.is_idle() {
            self.idle_deadline.arm();
        }
    }

    fn complete_upgrade(&mut self) {
        let Some(OutItem::Upgrade(header, callback)) = self.out_queue.pop_front() else {
            return;
        };
        let Some(transport) = self.transport.take() else {
            return;
        };
        debug!(
            "server connection {} switched protocols with {}",
            self.info.id, header.status
        );
        self.responses += 1;
        self.closed = true;
        self.reading = false;
        let err = HttpError::Upgrade("connection switched protocols".to_owned());
        for slot in self.slots.drain(..) {
            slot.abort(&err);
        }
        for item in self.out_queue.drain(..) {
            item.fail(&err);
        }
        let leftover = std::mem::take(&mut self.read_buf);
        callback(Upgraded::new(Box::new(transport), leftover).with_response(header));
    }

    fn read_in(&mut self) -> Result<DriveOutcome, HttpError> {
        let mut outcome = self.parse_buffered()?;
        for _ in 0..READS_PER_DRIVE {
            if !self.can_parse() {
                break;
            }
            if let Inbound::Streaming(source) = &self.inbound {
                if !source.wants_data() {
                    break;
                }
            }
            let Some(transport) = self.transport.as_mut() else {
                break;
            };
            match transport.read_some(&mut self.read_buf) {
                Ok(0) => break,
                Ok(_) => {
                    outcome = DriveOutcome::Active;
                    self.parse_buffered()?;
                }
                Err(HttpError::ConnectionClosed) => {
                    self.on_eof();
                    return Ok(DriveOutcome::Active);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }

    fn parse_buffered(&mut self) -> Result<DriveOutcome, HttpError> {
        let mut outcome = DriveOutcome::Idle;
        while self.can_parse() {
            if self.read_buf.is_empty() && self.parser.state() != ParseState::Body {
                break;
            }
            if !self.parser.is_mid_message()
                && self.read_buf.iter().any(|x| *x != b'\r' && *x != b'\n')
            {
                self.idle_deadline.disarm();
                self.request_deadline.arm();
            }
            let (consumed, event) = match self.parser.parse(&self.read_buf, &()) {
                Ok(x) => x,
                Err(err) => {
                    self.on_malformed(err)?;
                    return Ok(DriveOutcome::Active);
                }
            };
            self.read_buf.drain(..consumed);
            match event {
                ParseEvent::Pending => break,
                ParseEvent::Head(header, framing) => self.on_head(header, framing)?,
                ParseEvent::Data(data) => self.on_data(data),
                ParseEvent::Complete(trailers) => self.on_complete(trailers),
            }
            outcome = DriveOutcome::Active;
        }
        Ok(outcome)
    }

    fn on_head(&mut self, header: RequestHeader, framing: BodyFraming) -> Result<(), HttpError> {
        self.requests += 1;
        let remaining = self
            .config
            .max_transactions
            .map(|max| max.saturating_sub(self.requests));
        let keep_alive = header.is_keep_alive() && remaining != Some(0);
        if !keep_alive {
            self.final_request = true;
        }
        if header.method == Method::CONNECT || header.headers.contains("Upgrade") {
            self.upgrade_pending = true;
        }
        if self.config.auto_continue && header.expects_continue() && framing != BodyFraming::Empty {
            if self.slots.is_empty() && self.out_queue.is_empty() {
                self.out_queue.push_back(OutItem::Bytes(CONTINUE.to_vec()));
            } else {
                debug!("not sending 100 Continue behind pipelined responses");
            }
        }
        let context = ResponseContext {
            method: header.method.clone(),
            version: header.version,
            keep_alive,
            close_on_error: self.config.close_on_sending_error,
            remaining,
        };
        let slot = Arc::new(ResponseSlot::new());
        self.slots.push_back(Arc::clone(&slot));
        let responder = Responder::new(slot, context);
        let config = self.handler.config_for(&header);
        if framing == BodyFraming::Empty {
            self.inbound = Inbound::Dispatched;
            self.dispatch(Request::from_parts(header, Body::Empty), responder, config);
            return Ok(());
        }
        self.body_deadline.arm();
        match config.invoke_on {
            InvokeOn::OnHeader => {
                let source = BodySource::new();
                self.inbound = Inbound::Streaming(source.clone());
                self.dispatch(
                    Request::from_parts(header, Body::Streaming(source.clone())),
                    responder.with_request_body(source),
                    config,
                );
            }
            InvokeOn::OnMessage => {
                self.inbound = Inbound::Buffering {
                    header,
                    data: Vec::new(),
                    responder,
                    config,
                }
            }
        }
        Ok(())
    }

    fn on_data(&mut self, data: Vec<u8>) {
        self.body_deadline.arm();
        match &mut self.inbound {
            Inbound::Streaming(source) => source.push(data),
            Inbound::Buffering { data: buf, .. } => buf.extend_from_slice(&data),
            Inbound::Idle | Inbound::Dispatched => {}
        }
    }

    fn on_complete(&mut self, trailers: Option<Headers>) {
        self.request_deadline.disarm();
        self.body_deadline.disarm();
        match std::mem::replace(&mut self.inbound, Inbound::Idle) {
            Inbound::Streaming(source) => source.complete(trailers),
            Inbound::Buffering {
                mut header,
                data,
                responder,
                config,
            } => {
                for (name, value) in trailers.iter().flat_map(|x| x.iter()) {
                    if let Err(err) = header.headers.append(name, value) {
                        debug!("dropping trailer {name}: {err}");
                    }
                }
                let body = if data.is_empty() {
                    Body::Empty
                } else {
                    Body::Full(data)
                };
                self.dispatch(Request::from_parts(header, body), responder, config);
            }
            Inbound::Idle | Inbound::Dispatched => {}
        }
        if self.final_request {
            self.reading = false;
        }
    }

    fn on_malformed(&mut self, err: HttpError) -> Result<(), HttpError> {
        warning!("malformed request on connection {}: {err}", self.info.id);
        self.reading = false;
        self.upgrade_pending = false;
        self.read_buf.clear();
        self.request_deadline.disarm();
        self.body_deadline.disarm();
        let response = Response::error(StatusCode::BAD_REQUEST, Some(&err.to_string()));
        match std::mem::replace(&mut self.inbound, Inbound::Idle) {
            // the handler already owns the exchange and answers it
            Inbound::Streaming(source) => {
                source.fail(err);
                Ok(())
            }
            Inbound::Buffering { responder, .. } => responder.respond(response),
            Inbound::Idle | Inbound::Dispatched => {
                let slot = Arc::new(ResponseSlot::new());
                self.slots.push_back(Arc::clone(&slot));
                Responder::new(slot, ResponseContext::closing()).respond(response)
            }
        }
    }

    fn on_eof(&mut self) {
        self.reading = false;
        match self.parser.eof(&self.read_buf) {
            Ok(Some(ParseEvent::Complete(trailers))) => {
                self.read_buf.clear();
                self.on_complete(trailers);
            }
            Ok(_) => self.read_buf.clear(),
            Err(err) => {
                debug!(
                    "peer closed server connection {} mid-request: {err}",
                    self.info.id
                );
                self.shutdown(err);
            }
        }
    }

    fn session_lock(&self, header: &RequestHeader) -> Option<Arc<Mutex<()>>> {
        let name = self.config.session_cookie.as_str();
        header
            .headers
            .get_all("Cookie")
            .flat_map(crate::cookie::parse_cookie_header)
            .find(|(key, _)| *key == name)
            .map(|(_, value)| self.session_locks.get(value))
    }

    fn dispatch(&self, request: Request, responder: Responder, config: HandlerConfig) {
        let slot = Arc::clone(&responder.slot);
        let serialize = match config.synchronization {
            Synchronization::None => None,
            Synchronization::PerConnection => Some(Arc::clone(&self.connection_lock)),
            Synchronization::PerSession => self.session_lock(request.header()),
        };
        let exchange = Exchange::new(request, responder, self.info.clone(), self.registry.clone())
            .with_sessions(self.sessions.clone(), &self.config.session_cookie);
        let handler = Arc::clone(&self.handler);
        let job = move || {
            let _guard = serialize.as_ref().map(|x| lock(x));
            // unwinding drops the exchange, which answers 500 if nothing was sent yet
            match catch_unwind(AssertUnwindSafe(move || handler.on_request(exchange))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warning!("request handler failed: {err}");
                    slot.on_handler_error();
                }
                Err(_) => {
                    error!("request handler panicked");
                    slot.on_handler_error();
                }
            }
        };
        match (config.execution, &self.workers) {
            (Execution::WorkerPool, Some(workers)) => workers.execute_or_inline(Box::new(job)),
            _ => job(),
        }
    }
}

impl<S: Transport + 'static> Session for ServerConnection<S> {
    fn status(&self) -> SessionStatus {
        match &self.transport {
            Some(transport) if !self.closed => transport.transport_status(),
            _ => SessionStatus::Terminated,
        }
    }

    fn close(&mut self) {
        self.shutdown(HttpError::ConnectionClosed);
    }

    fn drive(&mut self) -> Result<DriveOutcome, HttpError> {
        if self.closed {
            return Err(HttpError::ConnectionClosed);
        }
        let Some(transport) = self.transport.as_mut() else {
            return Err(HttpError::ConnectionClosed);
        };
        let mut outcome = match transport.drive_transport() {
            Ok(x) => x,
            Err(err) => {
                debug!("server transport failed: {err}");
                self.shutdown(err);
                return Ok(DriveOutcome::Active);
            }
        };
        if transport.transport_status() != SessionStatus::Established {
            return Ok(outcome);
        }
        self.check_abandoned();
        if self.check_timers() {
            return Ok(DriveOutcome::Active);
        }
        match self.exchange_bytes() {
            Ok(x) => outcome = outcome.merge(x),
            Err(err) => {
                debug!("server connection {} failed: {err}", self.info.id);
                self.shutdown(err);
                outcome = DriveOutcome::Active;
            }
        }
        if !self.closed && self.is_finished() {
            debug!(
                "closing server connection {} after {} responses",
                self.info.id, self.responses
            );
            self.shutdown(HttpError::ConnectionClosed);
            outcome = DriveOutcome::Active;
        }
        Ok(outcome)
    }
}

impl<S: Transport> Debug for ServerConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.info.id)
            .field("transport", &self.transport)
            .field("requests", &self.requests)
            .field("responses", &self.responses)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(feature = "tcp")]
pub use self::tcp_server::{HttpServer, ServerHandle};

#[cfg(feature = "tcp")]
mod tcp_server {
    use std::{
        net::{SocketAddr, ToSocketAddrs},
        sync::Arc,
        time::{Duration, Instant},
    };

    use super::{Registry, ServerConnection, SessionLocks};
    use crate::{
        config::ServerConfig,
        dispatch::{Dispatcher, Task, TaskOutcome, WorkerPool},
        error::HttpError,
        handler::{RequestHandler, Router},
        log::{debug, info, warning},
        session::SessionManager,
        tcp::{TcpServer, TcpSession},
        DriveOutcome, Session, SessionStatus,
    };

    const ACCEPTS_PER_DRIVE: usize = 64;
    const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

    /// Accepts TCP connections and serves them with a [`Router`].
    pub struct HttpServer {
        listener: TcpServer,
        router: Router,
        handler: Option<Arc<dyn RequestHandler>>,
        config: ServerConfig,
        registry: Registry,
        workers: Option<WorkerPool>,
        session_locks: SessionLocks,
        sessions: SessionManager,
        last_sweep: Instant,
        connections: Vec<ServerConnection<TcpSession>>,
        closed: bool,
    }
    impl HttpServer {
        pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, HttpError> {
            Ok(Self::new(TcpServer::bind(addr)?))
        }

        pub fn new(listener: TcpServer) -> Self {
            Self {
                listener,
                router: Router::new(),
                handler: None,
                config: ServerConfig::default(),
                registry: Registry::default(),
                workers: None,
                session_locks: SessionLocks::default(),
                sessions: SessionManager::new(ServerConfig::default().session_max_inactive),
                last_sweep: Instant::now(),
                connections: Vec::new(),
                closed: false,
            }
        }

        /// Serve requests whose path matches `pattern` with `handler`.
        ///
        /// Routes are matched in registration order and must be added before the server is first driven.
        pub fn route<H: RequestHandler>(mut self, pattern: &str, handler: H) -> Self {
            self.router.add(pattern, Arc::new(handler));
            self
        }

        /// Serve every request not matched by an earlier route with `handler`.
        pub fn with_handler<H: RequestHandler>(self, handler: H) -> Self {
            self.route("*", handler)
        }

        pub fn with_config(mut self, config: ServerConfig) -> Self {
            self.sessions.set_max_inactive(config.session_max_inactive);
            self.config = config;
            self
        }

        pub fn local_addr(&self) -> Result<SocketAddr, HttpError> {
            self.listener.local_addr()
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        pub fn sessions(&self) -> &SessionManager {
            &self.sessions
        }

        /// Open connections
        pub fn connections(&self) -> usize {
            self.connections.len()
        }

        /// The routing handler, built and initialized on first use.
        fn handler(&mut self) -> Result<Arc<dyn RequestHandler>, HttpError> {
            if let Some(handler) = &self.handler {
                return Ok(Arc::clone(handler));
            }
            if self.workers.is_none() {
                self.workers = Some(WorkerPool::new(self.config.worker_threads, "nbhttp-worker")?);
            }
            let handler: Arc<dyn RequestHandler> = Arc::new(std::mem::take(&mut self.router));
            if let Some(lifecycle) = handler.lifecycle() {
                lifecycle.on_init(&self.registry);
            }
            self.handler = Some(Arc::clone(&handler));
            Ok(handler)
        }

        fn accept(&mut self, handler: &Arc<dyn RequestHandler>) -> Result<DriveOutcome, HttpError> {
            let mut outcome = DriveOutcome::Idle;
            for _ in 0..ACCEPTS_PER_DRIVE {
                let (session, peer) = match self.listener.accept() {
                    Ok(Some(x)) => x,
                    Ok(None) => break,
                    Err(err) => {
                        warning!("accept failed: {err}");
                        break;
                    }
                };
                let conn = ServerConnection::new(session, Arc::clone(handler), &self.config)?
                    .with_peer(peer)
                    .with_registry(self.registry.clone())
                    .with_workers(self.workers.clone())
                    .with_session_locks(self.session_locks.clone())
                    .with_sessions(self.sessions.clone());
                debug!("accepted connection {} from {peer}", conn.info().id());
                self.connections.push(conn);
                outcome = DriveOutcome::Active;
            }
            Ok(outcome)
        }

        /// Drive the server on its own I/O thread until the returned handle is stopped.
        pub fn start(mut self) -> Result<ServerHandle, HttpError> {
            let local_addr = self.local_addr()?;
            self.handler()?;
            let registry = self.registry.clone();
            let sessions = self.sessions.clone();
            let dispatcher = Dispatcher::start("nbhttp-server")?;
            dispatcher.spawn(ServerTask { server: self })?;
            info!("http server listening on {local_addr}");
            Ok(ServerHandle {
                dispatcher,
                local_addr,
                registry,
                sessions,
            })
        }
    }
    impl Session for HttpServer {
        fn status(&self) -> SessionStatus {
            if self.closed {
                SessionStatus::Terminated
            } else {
                SessionStatus::Established
            }
        }

        /// Close every connection, run the handlers' destroy hooks, and clear the registry and sessions.
        fn close(&mut self) {
            if self.closed {
                return;
            }
            self.closed = true;
            for mut conn in self.connections.drain(..) {
                conn.close();
            }
            if let Some(lifecycle) = self.handler.as_ref().and_then(|x| x.lifecycle()) {
                lifecycle.on_destroy();
            }
            self.registry.clear();
            self.sessions.close();
            debug!("http server closed");
        }

        fn drive(&mut self) -> Result<DriveOutcome, HttpError> {
            if self.closed {
                return Err(HttpError::ConnectionClosed);
            }
            let handler = self.handler()?;
            if self.last_sweep.elapsed() >= SESSION_SWEEP_INTERVAL {
                self.sessions.sweep();
                self.last_sweep = Instant::now();
            }
            let mut outcome = self.accept(&handler)?;
            self.connections.retain_mut(|conn| match conn.drive() {
                Ok(x) => {
                    outcome = outcome.merge(x);
                    conn.status() != SessionStatus::Terminated
                }
                Err(_) => false,
            });
            Ok(outcome)
        }
    }
    impl std::fmt::Debug for HttpServer {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("HttpServer")
                .field("local_addr", &self.listener.local_addr().ok())
                .field("connections", &self.connections.len())
                .field("closed", &self.closed)
                .finish()
        }
    }

    struct ServerTask {
        server: HttpServer,
    }
    impl Task for ServerTask {
        fn drive(&mut self) -> TaskOutcome {
            match self.server.drive() {
                Ok(x) => x.into(),
                Err(err) => {
                    warning!("http server stopped: {err}");
                    self.server.close();
                    TaskOutcome::Done
                }
            }
        }

        fn abort(&mut self) {
            self.server.close();
        }
    }

    /// A running [`HttpServer`].
    pub struct ServerHandle {
        dispatcher: Dispatcher,
        local_addr: SocketAddr,
        registry: Registry,
        sessions: SessionManager,
    }
    impl ServerHandle {
        pub fn local_addr(&self) -> SocketAddr {
            self.local_addr
        }

        pub fn registry(&self) -> &Registry {
            &self.registry
        }

        pub fn sessions(&self) -> &SessionManager {
            &self.sessions
        }

        /// Stop the I/O thread, closing every connection.
        pub fn stop(self) {
            self.dispatcher.shutdown();
        }
    }
    impl std::fmt::Debug for ServerHandle {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ServerHandle")
                .field("local_addr", &self.local_addr)
                .finish()
        }
    }
}
