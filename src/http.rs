//! A pooled, non-blocking HTTP client.
//!
//! [`HttpClient`] sends requests addressed by absolute URL. Connections are leased from a
//! [`ConnectionPool`] keyed by [`Destination`] and driven on a single [`Dispatcher`] I/O thread,
//! so `send` never blocks on the network. On top of the connection engine it adds
//! retries of idempotent requests, redirects, cookies, a response cache, transparent
//! decompression and forward proxying, each controlled by [`ClientConfig`]. Plain-http requests
//! are forwarded by the proxy in absolute form, https requests are tunnelled with `CONNECT`.
//!
//! ## Example
//!
//! ```no_run
//! use nbhttp::exchange::handler_fn;
//! use nbhttp::http::HttpClient;
//! use nbhttp::message::Request;
//!
//! let client = HttpClient::new().unwrap();
//! client
//!     .send(
//!         Request::get("http://127.0.0.1:8080/status"),
//!         handler_fn(|result| match result {
//!             Ok(response) => println!("status {}", response.status()),
//!             Err(err) => println!("failed: {err}"),
//!         }),
//!     )
//!     .unwrap();
//! ```

use std::{
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use http::{Method, StatusCode, Uri};

use crate::{
    body::{Body, BodySink},
    cache::{is_cacheable_request, CacheLookup, ResponseCache},
    client::HttpClientConnection,
    config::{ClientConfig, RedirectMode},
    cookie::CookieStore,
    dispatch::{assert_blocking_allowed, Dispatcher, Task, TaskOutcome, WorkerPool},
    error::{HttpError, TimeoutKind},
    exchange::{Completion, Execution, FutureResponse, InvokeOn, ResponseHandler},
    log::{debug, info},
    message::{Request, RequestHeader, Response},
    pool::{ConnectionPool, Destination, Lease, PoolConfig},
    tcp::TcpSession,
    Session,
};

type Connection = HttpClientConnection<TcpSession>;

/// The user's handler, shared so it can be recovered when a request never reaches a connection.
type HandlerSlot = Arc<Mutex<Option<Box<dyn ResponseHandler>>>>;

fn take_handler(slot: &HandlerSlot) -> Option<Box<dyn ResponseHandler>> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

fn peek_handler(slot: &HandlerSlot) -> MutexGuard<'_, Option<Box<dyn ResponseHandler>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Methods that may be repeated without changing the outcome.
pub fn is_idempotent(method: &Method) -> bool {
    [
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::TRACE,
        Method::PUT,
        Method::DELETE,
    ]
    .contains(method)
}

/// Statuses answered by an overloaded or failing server, worth asking again for idempotent requests.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 421 | 423 | 500 | 502 | 503 | 504 | 509)
}

/// Resolve a `Location` header against the URL it was received for.
pub fn resolve_location(base: &Uri, location: &str) -> Result<Uri, HttpError> {
    let location = location.trim();
    let invalid = |e: http::uri::InvalidUri| HttpError::protocol(format!("invalid location {location:?}: {e}"));
    if let Ok(uri) = location.parse::<Uri>() {
        if uri.scheme().is_some() {
            return Ok(uri);
        }
    }
    let scheme = base.scheme_str().unwrap_or("http");
    if let Some(rest) = location.strip_prefix("//") {
        return format!("{scheme}://{rest}").parse().map_err(invalid);
    }
    let authority = base
        .authority()
        .ok_or_else(|| HttpError::protocol(format!("{base} is not an absolute uri")))?;
    let path = if location.starts_with('/') {
        location.to_owned()
    } else {
        let dir = match base.path().rfind('/') {
            Some(x) => &base.path()[..=x],
            None => "/",
        };
        format!("{dir}{location}")
    };
    format!("{scheme}://{authority}{path}").parse().map_err(invalid)
}

/// One try at a request, along with what is needed to try again.
#[derive(Debug, Clone)]
struct Attempt {
    /// The request as given, with an absolute target
    header: RequestHeader,
    /// `None` for a streamed body, which cannot be sent twice
    replay: Option<Body>,
    uri: Uri,
    retries: usize,
    redirects: usize,
}
impl Attempt {
    fn new(header: RequestHeader, replay: Option<Body>) -> Result<Self, HttpError> {
        let uri = header
            .target
            .parse::<Uri>()
            .map_err(|e| HttpError::protocol(format!("invalid url {:?}: {e}", header.target)))?;
        Ok(Self {
            header,
            replay,
            uri,
            retries: 0,
            redirects: 0,
        })
    }

    fn cache_key(&self) -> String {
        self.uri.to_string()
    }
}

/// Where a request goes and the head written to that connection.
struct Route {
    dest: Destination,
    header: RequestHeader,
}

struct ClientInner {
    config: ClientConfig,
    pool: ConnectionPool<Connection>,
    dispatcher: Dispatcher,
    workers: WorkerPool,
    cookies: Option<CookieStore>,
    cache: Option<ResponseCache>,
}
impl ClientInner {
    fn route(&self, attempt: &Attempt) -> Result<Route, HttpError> {
        let origin = Destination::from_uri(&attempt.uri)?;
        let mut header = attempt.header.clone();
        if !header.headers.contains("Host") {
            header.headers.insert("Host", &origin.authority())?;
        }
        if let Some(cookies) = &self.cookies {
            if !header.headers.contains("Cookie") {
                if let Some(value) = cookies.cookie_header(&attempt.uri) {
                    header.headers.insert("Cookie", &value)?;
                }
            }
        }
        #[cfg(feature = "compress")]
        if self.config.auto_decompress && !header.headers.contains("Accept-Encoding") {
            header.headers.insert("Accept-Encoding", "gzip, deflate")?;
        }
        let dest = match &self.config.proxy {
            // tls destinations keep the origin as their key and are tunnelled when connected
            Some(proxy) if !origin.tls => {
                header.target = attempt.uri.to_string();
                if let Some(value) = proxy.authorization() {
                    header.headers.insert("Proxy-Authorization", &value)?;
                }
                Destination::new(proxy.host.clone(), proxy.port, false)
            }
            _ => {
                header.target = attempt
                    .uri
                    .path_and_query()
                    .map(|x| x.as_str().to_owned())
                    .filter(|x| !x.is_empty())
                    .unwrap_or_else(|| "/".to_owned());
                origin
            }
        };
        Ok(Route { dest, header })
    }

    /// Lease a connection to `dest`. A `fresh` lease never reuses an idle connection.
    fn lease(self: &Arc<Self>, dest: &Destination, fresh: bool) -> Result<Lease<Connection>, HttpError> {
        self.pool.sweep();
        let connect = |dest: &Destination| -> Result<Connection, HttpError> {
            debug!("opening connection to {dest}");
            let conn = match self.config.proxy.is_some() && dest.tls {
                true => HttpClientConnection::connect_tunnel(&dest.host, dest.port, &self.config)?,
                false => HttpClientConnection::connect_with_config(&dest.host, dest.port, dest.tls, &self.config)?,
            };
            Ok(conn.with_workers(Some(self.workers.clone())))
        };
        match fresh {
            true => self.pool.acquire_fresh(dest, connect),
            false => self.pool.acquire(dest, connect),
        }
    }

    /// Send one attempt. On `Err` the user's handler is still in `slot`.
    fn submit(self: &Arc<Self>, attempt: Attempt, body: Body, slot: HandlerSlot) -> Result<(), HttpError> {
        let mut route = self.route(&attempt)?;
        let mut cache_key = None;
        if let Some(cache) = &self.cache {
            if is_cacheable_request(&attempt.header) {
                let key = attempt.cache_key();
                match cache.lookup(&key) {
                    CacheLookup::Fresh(response) => {
                        debug!("serving {key} from cache");
                        if let Some(handler) = take_handler(&slot) {
                            Completion::new(handler)
                                .with_workers(Some(self.workers.clone()))
                                .succeed(response);
                        }
                        return Ok(());
                    }
                    CacheLookup::Stale(conditional) => {
                        for (name, value) in conditional.iter() {
                            route.header.headers.insert(name, value)?;
                        }
                    }
                    CacheLookup::Miss => {}
                }
                cache_key = Some(key);
            }
        }
        // a retry goes out on a new connection, the failed one may have been a stale idle one
        let mut lease = self.lease(&route.dest, attempt.retries > 0)?;
        let handler = ClientHandler::new(self, attempt, cache_key, slot);
        lease.send(Request::from_parts(route.header, body), handler)?;
        self.dispatcher.spawn(ConnectionTask { lease: Some(lease) })
    }

    /// Submit from a worker thread, reporting a failure to the handler.
    fn resubmit(self: &Arc<Self>, attempt: Attempt, slot: HandlerSlot) {
        let client = Arc::clone(self);
        self.workers.execute_or_inline(Box::new(move || {
            let body = attempt.replay.clone().unwrap_or_default();
            if let Err(err) = client.submit(attempt, body, Arc::clone(&slot)) {
                if let Some(handler) = take_handler(&slot) {
                    Completion::new(handler).fail(err);
                }
            }
        }));
    }

    /// The next attempt for a redirect response, if it should be followed.
    fn redirect(&self, attempt: &Attempt, response: &Response) -> Option<Result<Attempt, HttpError>> {
        let status = response.status().as_u16();
        if !matches!(status, 301 | 302 | 303 | 307 | 308) {
            return None;
        }
        let method = &attempt.header.method;
        let follow = match self.config.redirect_mode {
            RedirectMode::Off => false,
            RedirectMode::SafeMethods => *method == Method::GET || *method == Method::HEAD,
            RedirectMode::All => true,
        };
        if !follow {
            return None;
        }
        let location = response.headers().get("Location")?;
        if attempt.redirects >= self.config.max_redirects {
            return Some(Err(HttpError::protocol(format!(
                "more than {} redirects, last to {location}",
                self.config.max_redirects
            ))));
        }
        let uri = match resolve_location(&attempt.uri, location) {
            Ok(x) => x,
            Err(err) => return Some(Err(err)),
        };
        let mut header = attempt.header.clone();
        let mut replay = attempt.replay.clone();
        if status == 303 || (matches!(status, 301 | 302) && *method == Method::POST) {
            if header.method != Method::HEAD {
                header.method = Method::GET;
            }
            replay = Some(Body::Empty);
            for name in ["Content-Length", "Content-Type", "Transfer-Encoding"] {
                header.headers.remove(name);
            }
        } else if replay.is_none() {
            debug!("not following redirect of a streamed request body");
            return None;
        }
        if uri.authority() != attempt.uri.authority() {
            header.headers.remove("Authorization");
        }
        header.headers.remove("Host");
        header.target = uri.to_string();
        debug!("following {status} from {} to {uri}", attempt.uri);
        Some(Ok(Attempt {
            header,
            replay,
            uri,
            retries: 0,
            redirects: attempt.redirects + 1,
        }))
    }

    /// Whether `attempt` may be sent once more.
    fn can_retry(&self, attempt: &Attempt) -> bool {
        is_idempotent(&attempt.header.method)
            && attempt.replay.is_some()
            && !attempt.header.headers.contains("Upgrade")
            && attempt.retries < self.config.max_retries
    }

    fn should_retry(&self, attempt: &Attempt, invoke_on: InvokeOn, err: &HttpError) -> bool {
        invoke_on == InvokeOn::OnMessage && err.is_retryable() && self.can_retry(attempt)
    }
}
impl Drop for ClientInner {
    fn drop(&mut self) {
        self.pool.close();
    }
}

#[cfg(feature = "compress")]
fn decompress(config: &ClientConfig, response: Response) -> Result<Response, HttpError> {
    if config.auto_decompress {
        crate::compress::decode_response(response)
    } else {
        Ok(response)
    }
}

#[cfg(not(feature = "compress"))]
fn decompress(_config: &ClientConfig, response: Response) -> Result<Response, HttpError> {
    Ok(response)
}

/// Wraps the user's handler with cookies, caching, redirects and retries.
struct ClientHandler {
    client: Weak<ClientInner>,
    attempt: Attempt,
    cache_key: Option<String>,
    slot: HandlerSlot,
    invoke_on: InvokeOn,
    execution: Execution,
}
impl ClientHandler {
    fn new(client: &Arc<ClientInner>, attempt: Attempt, cache_key: Option<String>, slot: HandlerSlot) -> Self {
        let (invoke_on, execution) = match &*peek_handler(&slot) {
            Some(x) => (x.invoke_on(), x.execution()),
            None => (InvokeOn::default(), Execution::default()),
        };
        let invoke_on = if client.config.return_on_message {
            InvokeOn::OnMessage
        } else {
            invoke_on
        };
        Self {
            client: Arc::downgrade(client),
            attempt,
            cache_key,
            slot,
            invoke_on,
            execution,
        }
    }

    fn deliver(&mut self, outcome: Result<Response, HttpError>) {
        if let Some(mut handler) = take_handler(&self.slot) {
            match outcome {
                Ok(response) => handler.on_response(response),
                Err(err) => handler.on_error(err),
            }
        }
    }

    fn process(&mut self, client: &Arc<ClientInner>, mut response: Response) -> Result<Option<Response>, HttpError> {
        if let Some(cookies) = &client.cookies {
            cookies.store_response(&self.attempt.uri, response.headers());
        }
        if response.status() == StatusCode::NOT_MODIFIED {
            if let (Some(cache), Some(key)) = (&client.cache, &self.cache_key) {
                if let Some(cached) = cache.revalidated(key, response.header())? {
                    debug!("revalidated {key}");
                    return Ok(Some(cached));
                }
            }
        }
        if is_retryable_status(response.status()) && client.can_retry(&self.attempt) {
            if let Body::Streaming(source) = response.take_body() {
                source.destroy();
            }
            let mut next = self.attempt.clone();
            next.retries += 1;
            info!(
                "retrying {} {} after status {} ({} of {})",
                next.header.method,
                next.uri,
                response.status(),
                next.retries,
                client.config.max_retries
            );
            client.resubmit(next, Arc::clone(&self.slot));
            return Ok(None);
        }
        if let Some(next) = client.redirect(&self.attempt, &response) {
            let next = next?;
            if let Body::Streaming(source) = response.take_body() {
                source.destroy();
            }
            client.resubmit(next, Arc::clone(&self.slot));
            return Ok(None);
        }
        let response = decompress(&client.config, response)?;
        if let (Some(cache), Some(key)) = (&client.cache, &self.cache_key) {
            if cache.store(key, &self.attempt.header, &response) {
                debug!("cached {key}");
            }
        }
        Ok(Some(response))
    }
}
impl ResponseHandler for ClientHandler {
    fn on_response(&mut self, response: Response) {
        let Some(client) = self.client.upgrade() else {
            return self.deliver(Ok(response));
        };
        match self.process(&client, response) {
            Ok(Some(response)) => self.deliver(Ok(response)),
            Ok(None) => {}
            Err(err) => self.deliver(Err(err)),
        }
    }

    fn on_error(&mut self, error: HttpError) {
        if let Some(client) = self.client.upgrade() {
            if client.should_retry(&self.attempt, self.invoke_on, &error) {
                let mut next = self.attempt.clone();
                next.retries += 1;
                info!(
                    "retrying {} {} after {error} ({} of {})",
                    next.header.method, next.uri, next.retries, client.config.max_retries
                );
                return client.resubmit(next, Arc::clone(&self.slot));
            }
        }
        self.deliver(Err(error))
    }

    fn invoke_on(&self) -> InvokeOn {
        self.invoke_on
    }

    fn execution(&self) -> Execution {
        self.execution
    }

    fn is_cancelled(&self) -> bool {
        peek_handler(&self.slot)
            .as_ref()
            .map(|x| x.is_cancelled())
            .unwrap_or(false)
    }

    fn is_interrupted(&self) -> bool {
        peek_handler(&self.slot)
            .as_ref()
            .map(|x| x.is_interrupted())
            .unwrap_or(false)
    }
}

/// Drives one leased connection until its exchanges are done, then releases it.
struct ConnectionTask {
    lease: Option<Lease<Connection>>,
}
impl Task for ConnectionTask {
    fn drive(&mut self) -> TaskOutcome {
        let Some(lease) = self.lease.as_mut() else {
            return TaskOutcome::Done;
        };
        match lease.drive() {
            Ok(outcome) if lease.pending() > 0 => outcome.into(),
            Ok(_) => {
                // back to the pool, or closed if it cannot be reused
                self.lease = None;
                TaskOutcome::Done
            }
            Err(err) => {
                debug!("connection to {} failed: {err}", lease.destination());
                if let Some(lease) = self.lease.take() {
                    lease.discard();
                }
                TaskOutcome::Done
            }
        }
    }

    fn abort(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.discard();
        }
    }
}

/// A pooled HTTP/1.x client. Cheap to clone, and every clone shares the same pool.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}
impl HttpClient {
    pub fn new() -> Result<Self, HttpError> {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Result<Self, HttpError> {
        let inner = ClientInner {
            pool: ConnectionPool::new(PoolConfig::from(&config)),
            dispatcher: Dispatcher::start("nbhttp-client")?,
            workers: WorkerPool::new(config.worker_threads, "nbhttp-client-worker")?,
            cookies: config.auto_cookies.then(CookieStore::new),
            cache: (config.cache_size > 0).then(|| ResponseCache::new(config.cache_size)),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Cookies collected so far, when `auto_cookies` is enabled.
    pub fn cookies(&self) -> Option<&CookieStore> {
        self.inner.cookies.as_ref()
    }

    /// The response cache, when `cache_size` is not zero.
    pub fn cache(&self) -> Option<&ResponseCache> {
        self.inner.cache.as_ref()
    }

    pub fn active_connections(&self) -> usize {
        self.inner.pool.active_count()
    }

    pub fn idle_connections(&self) -> usize {
        self.inner.pool.idle_count()
    }

    /// Send a request to the absolute URL in its target.
    ///
    /// On `Err`, such as an invalid URL or [`HttpError::MaxConnectionsExceeded`], the handler is
    /// never invoked. Otherwise it receives exactly one outcome.
    pub fn send<H: ResponseHandler>(&self, request: Request, handler: H) -> Result<(), HttpError> {
        let (header, body) = request.into_parts();
        let replay = match &body {
            Body::Streaming(_) => None,
            x => Some(x.clone()),
        };
        let attempt = Attempt::new(header, replay)?;
        let slot: HandlerSlot = Arc::new(Mutex::new(Some(Box::new(handler))));
        self.inner.submit(attempt, body, slot)
    }

    pub fn send_future(&self, request: Request) -> Result<FutureResponse, HttpError> {
        let future = FutureResponse::new();
        let invoke_on = if self.inner.config.return_on_message {
            InvokeOn::OnMessage
        } else {
            InvokeOn::OnHeader
        };
        self.send(request, future.handler(invoke_on))?;
        Ok(future)
    }

    /// Send a request and wait up to `call_timeout` for its complete response.
    ///
    /// Fails when called from an I/O dispatch thread.
    pub fn call(&self, request: Request) -> Result<Response, HttpError> {
        assert_blocking_allowed()?;
        let future = FutureResponse::new();
        self.send(request, future.handler(InvokeOn::OnMessage))?;
        let result = future.get(self.inner.config.call_timeout);
        if let Err(HttpError::Timeout(TimeoutKind::Call, _)) = &result {
            future.cancel(true);
        }
        result
    }

    /// Send a request head now and stream its body through the returned sink.
    ///
    /// Streamed requests are neither retried nor cached.
    pub fn send_streaming<H: ResponseHandler>(
        &self,
        header: RequestHeader,
        handler: H,
    ) -> Result<BodySink, HttpError> {
        let attempt = Attempt::new(header, None)?;
        let route = self.inner.route(&attempt)?;
        let mut lease = self.inner.lease(&route.dest, false)?;
        let slot: HandlerSlot = Arc::new(Mutex::new(Some(Box::new(handler))));
        let handler = ClientHandler::new(&self.inner, attempt, None, slot);
        let sink = lease.send_streaming(route.header, handler)?;
        self.inner.dispatcher.spawn(ConnectionTask { lease: Some(lease) })?;
        Ok(sink)
    }

    /// Close idle connections and refuse new ones. In-flight exchanges still finish.
    pub fn close(&self) {
        self.inner.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }
}
impl Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("pool", &self.inner.pool)
            .field("cache", &self.inner.cache)
            .finish()
    }
}
