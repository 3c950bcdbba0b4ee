//! A single client-side HTTP/1.x connection.
//!
//! [`HttpClientConnection`] writes requests and parses responses over any [`Transport`].
//! Requests may be pipelined: every exchange is answered in the order it was sent.
//! Nothing happens until the connection is driven with [`Session::drive`].

use std::{
    collections::VecDeque,
    fmt::Debug,
    time::{Duration, Instant},
};

use http::{Method, StatusCode, Uri};

use crate::{
    body::{Body, BodySink, BodySource, SinkDrain},
    buffer::GrowableCircleBuf,
    codec::{BodyEncoder, BodyFraming},
    config::{ClientConfig, Timeouts},
    dispatch::{assert_blocking_allowed, WorkerPool},
    error::{HttpError, TimeoutKind},
    exchange::{Completion, FutureResponse, InvokeOn, ResponseHandler},
    liveness::Deadline,
    log::{debug, warning},
    message::{keep_alive_max, Request, RequestHeader, Response, ResponseHeader},
    parser::{encode_message, frame_request, ParseEvent, ParseState, ResponseParser},
    upgrade::Upgraded,
    DriveOutcome, Session, SessionStatus, Transport,
};

/// Reads attempted by one call to `drive`.
const READS_PER_DRIVE: usize = 16;

enum OutItem {
    Bytes(Vec<u8>),
    Sink(BodySink),
    Source(BodySource, BodyEncoder),
}

struct ClientExchange {
    method: Method,
    completion: Option<Completion>,
    response_deadline: Deadline,
    seen_bytes: bool,
}

/// The response currently being received.
enum Inbound {
    /// Waiting for a head
    Idle,
    /// Skipping an interim `1xx` response
    Informational,
    /// Delivered on its head, waiting for the end of an empty body
    Delivered,
    Streaming(BodySource),
    Buffering(ResponseHeader, Vec<u8>),
}

/// A client connection over a byte [`Transport`].
pub struct HttpClientConnection<S> {
    transport: S,
    host: Option<String>,
    timeouts: Timeouts,
    default_invoke_on: InvokeOn,
    workers: Option<WorkerPool>,
    write_buf: GrowableCircleBuf,
    out_queue: VecDeque<OutItem>,
    read_buf: Vec<u8>,
    parser: ResponseParser,
    exchanges: VecDeque<ClientExchange>,
    inbound: Inbound,
    connect_deadline: Deadline,
    idle_deadline: Deadline,
    body_deadline: Deadline,
    persistent: bool,
    keep_alive_remaining: Option<u64>,
    transactions: u64,
    upgraded: Option<ResponseHeader>,
    closed: bool,
    last_activity: Instant,
}

#[cfg(feature = "tcp")]
impl HttpClientConnection<crate::tcp::TcpSession> {
    /// Start connecting to `host:port` over TCP, with TLS when `tls` is set.
    ///
    /// The connect completes while the connection is driven.
    pub fn connect(host: &str, port: u16, tls: bool) -> Result<Self, HttpError> {
        Self::connect_with_config(host, port, tls, &ClientConfig::default())
    }

    pub fn connect_with_config(
        host: &str,
        port: u16,
        tls: bool,
        config: &ClientConfig,
    ) -> Result<Self, HttpError> {
        let mut session = crate::tcp::TcpSession::connect(&format!("{host}:{port}"))?;
        if tls {
            session = session.into_tls(host, tcp_stream::TLSConfig::default())?;
        }
        let default_port = if tls { 443 } else { 80 };
        let host_header = if port == default_port {
            host.to_owned()
        } else {
            format!("{host}:{port}")
        };
        Ok(Self::new(session, config)?.with_host(host_header))
    }

    /// Connect to `host:port` over TLS through a `CONNECT` tunnel opened by `config.proxy`.
    ///
    /// The tunnel is part of establishing the transport, so the connect timeout covers it.
    pub fn connect_tunnel(host: &str, port: u16, config: &ClientConfig) -> Result<Self, HttpError> {
        let proxy = config
            .proxy
            .as_ref()
            .ok_or_else(|| HttpError::protocol("no proxy configured for a tunnel"))?;
        let authority = match host.contains(':') {
            true => format!("[{host}]:{port}"),
            false => format!("{host}:{port}"),
        };
        let mut header = RequestHeader::new(Method::CONNECT, authority.clone());
        header.headers.insert("Host", &authority)?;
        if let Some(value) = proxy.authorization() {
            header.headers.insert("Proxy-Authorization", &value)?;
        }
        let mut request = Vec::new();
        header.encode(&mut request);
        debug!("opening tunnel to {authority} through {}:{}", proxy.host, proxy.port);
        let session = crate::tcp::TcpSession::connect(&format!("{}:{}", proxy.host, proxy.port))?
            .through_tunnel(request)?
            .into_tls(host, tcp_stream::TLSConfig::default())?;
        let host_header = if port == 443 {
            host.to_owned()
        } else {
            format!("{host}:{port}")
        };
        Ok(Self::new(session, config)?.with_host(host_header))
    }
}

impl<S: Transport> HttpClientConnection<S> {
    /// Wrap a transport, which may still be establishing.
    pub fn new(transport: S, config: &ClientConfig) -> Result<Self, HttpError> {
        let connect_deadline = match transport.transport_status() {
            SessionStatus::Establishing => {
                Deadline::started(TimeoutKind::Connect, config.timeouts.connect)
            }
            _ => Deadline::new(TimeoutKind::Connect, config.timeouts.connect),
        };
        Ok(Self {
            transport,
            host: None,
            timeouts: config.timeouts,
            default_invoke_on: if config.return_on_message {
                InvokeOn::OnMessage
            } else {
                InvokeOn::OnHeader
            },
            workers: None,
            write_buf: GrowableCircleBuf::new(config.write_buffer_capacity)?,
            out_queue: VecDeque::new(),
            read_buf: Vec::new(),
            parser: ResponseParser::new().with_max_header_size(config.max_header_size),
            exchanges: VecDeque::new(),
            inbound: Inbound::Idle,
            connect_deadline,
            idle_deadline: Deadline::started(TimeoutKind::Idle, config.timeouts.idle),
            body_deadline: Deadline::new(TimeoutKind::BodyReceive, config.timeouts.body_receive),
            persistent: true,
            keep_alive_remaining: None,
            transactions: 0,
            upgraded: None,
            closed: false,
            last_activity: Instant::now(),
        })
    }

    /// `Host` header value added to requests that carry none.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Worker pool used by handlers that ask for [`crate::exchange::Execution::WorkerPool`].
    pub fn with_workers(mut self, workers: Option<WorkerPool>) -> Self {
        self.workers = workers;
        self
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Send a request. The outcome is delivered to `handler` while the connection is driven.
    ///
    /// On `Err` the request was not queued and the handler is never invoked.
    pub fn send<H: ResponseHandler>(&mut self, request: Request, handler: H) -> Result<(), HttpError> {
        self.check_sendable()?;
        let (mut header, body) = request.into_parts();
        self.prepare_header(&mut header)?;
        match body {
            Body::Streaming(source) => {
                let framing = frame_request(&mut header, None)?;
                let mut head = Vec::new();
                header.encode(&mut head);
                self.out_queue.push_back(OutItem::Bytes(head));
                if framing != BodyFraming::Empty {
                    self.out_queue
                        .push_back(OutItem::Source(source, BodyEncoder::new(framing)));
                }
            }
            body => {
                let data = body.as_bytes().unwrap_or_default();
                let framing = frame_request(&mut header, Some(data.len() as u64))?;
                let mut head = Vec::new();
                header.encode(&mut head);
                let mut out = Vec::with_capacity(head.len() + data.len());
                encode_message(&head, framing, data, &mut out)?;
                self.out_queue.push_back(OutItem::Bytes(out));
            }
        }
        self.push_exchange(header.method, Box::new(handler));
        Ok(())
    }

    /// Send a request, returning a future of its response.
    pub fn send_future(&mut self, request: Request) -> Result<FutureResponse, HttpError> {
        let future = FutureResponse::new();
        self.send(request, future.handler(self.default_invoke_on))?;
        Ok(future)
    }

    /// Send a request head now and stream its body through the returned sink.
    ///
    /// The body is chunked unless the header declares a `Content-Length`.
    pub fn send_streaming<H: ResponseHandler>(
        &mut self,
        mut header: RequestHeader,
        handler: H,
    ) -> Result<BodySink, HttpError> {
        self.check_sendable()?;
        self.prepare_header(&mut header)?;
        let framing = frame_request(&mut header, None)?;
        let mut head = Vec::new();
        header.encode(&mut head);
        self.out_queue.push_back(OutItem::Bytes(head));
        let sink = BodySink::new(framing);
        if framing == BodyFraming::Empty {
            // nothing to stream, the sink is already finished
            sink.close()?;
        } else {
            self.out_queue.push_back(OutItem::Sink(sink.clone()));
        }
        self.push_exchange(header.method, Box::new(handler));
        Ok(sink)
    }

    /// Send a request and drive the connection on this thread until its full response arrives.
    ///
    /// Fails when called from an I/O dispatch thread.
    pub fn call(&mut self, request: Request, timeout: Duration) -> Result<Response, HttpError> {
        assert_blocking_allowed()?;
        let future = FutureResponse::new();
        self.send(request, future.handler(InvokeOn::OnMessage))?;
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(result) = future.try_get() {
                return result;
            }
            if deadline.is_some_and(|x| Instant::now() >= x) {
                future.cancel(true);
                self.close();
                return Err(HttpError::Timeout(TimeoutKind::Call, timeout));
            }
            match self.drive() {
                Ok(DriveOutcome::Active) => {}
                Ok(DriveOutcome::Idle) => std::thread::yield_now(),
                Err(err) => {
                    return future.try_get().unwrap_or(Err(err));
                }
            }
        }
    }

    /// True while the connection may carry further exchanges.
    pub fn is_persistent(&self) -> bool {
        self.persistent && !self.closed && self.upgraded.is_none()
    }

    /// True when the connection is idle and may be handed to a new user.
    pub fn is_reusable(&self) -> bool {
        self.is_persistent()
            && self.transport.transport_status() == SessionStatus::Established
            && self.exchanges.is_empty()
            && self.out_queue.is_empty()
            && self.write_buf.is_empty()
            && self.keep_alive_remaining != Some(0)
    }

    /// Exchanges completed on this connection.
    pub fn transactions(&self) -> u64 {
        self.transactions
    }

    /// Exchanges sent and not yet completed.
    pub fn pending(&self) -> usize {
        self.exchanges.len()
    }

    /// True once a `101` or `CONNECT` response switched protocols.
    pub fn is_upgraded(&self) -> bool {
        self.upgraded.is_some()
    }

    /// Time since bytes last moved in either direction.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// The underlying transport along with bytes received but not parsed.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.transport, self.read_buf)
    }

    pub fn transport(&self) -> &S {
        &self.transport
    }

    fn check_sendable(&self) -> Result<(), HttpError> {
        if self.closed || self.transport.transport_status() == SessionStatus::Terminated {
            return Err(HttpError::ConnectionClosed);
        }
        if self.upgraded.is_some() {
            return Err(HttpError::Upgrade("connection switched protocols".to_owned()));
        }
        if !self.persistent || self.keep_alive_remaining == Some(0) {
            return Err(HttpError::ConnectionClosed);
        }
        Ok(())
    }

    fn prepare_header(&self, header: &mut RequestHeader) -> Result<(), HttpError> {
        if !header.headers.contains("Host") {
            let from_target = header
                .target
                .parse::<Uri>()
                .ok()
                .and_then(|uri| uri.authority().map(|x| x.to_string()));
            if let Some(host) = from_target.as_deref().or(self.host.as_deref()) {
                header.headers.insert("Host", host)?;
            }
        }
        Ok(())
    }

    fn push_exchange(&mut self, method: Method, handler: Box<dyn ResponseHandler>) {
        if let Some(remaining) = self.keep_alive_remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        self.idle_deadline.disarm();
        self.exchanges.push_back(ClientExchange {
            method,
            completion: Some(Completion::new(handler).with_workers(self.workers.clone())),
            response_deadline: Deadline::started(TimeoutKind::Response, self.timeouts.response),
            seen_bytes: false,
        });
    }

    /// Fail every outstanding exchange and close the transport.
    ///
    /// An exchange whose response had started arriving is reported as interrupted.
    fn abort(&mut self, err: HttpError) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.persistent = false;
        let interrupted = if (err.is_timeout() && !err.is_retryable())
            || matches!(err, HttpError::ResponseInterrupted(_))
        {
            err.clone()
        } else {
            HttpError::ResponseInterrupted(err.to_string())
        };
        match std::mem::replace(&mut self.inbound, Inbound::Idle) {
            Inbound::Streaming(source) => source.fail(interrupted.clone()),
            Inbound::Buffering(..) | Inbound::Informational => {
                if let Some(front) = self.exchanges.front_mut() {
                    front.seen_bytes = true;
                }
            }
            Inbound::Idle | Inbound::Delivered => {}
        }
        for (index, exchange) in self.exchanges.drain(..).enumerate() {
            if let Some(completion) = exchange.completion {
                if index > 0 {
                    // never answered, safe to send again elsewhere
                    completion.fail(HttpError::ConnectionClosed);
                } else if exchange.seen_bytes {
                    completion.fail(interrupted.clone());
                } else {
                    completion.fail(err.clone());
                }
            }
        }
        for item in self.out_queue.drain(..) {
            if let OutItem::Sink(sink) = item {
                sink.fail(err.clone());
            }
        }
        self.write_buf.clear();
        self.transport.close_transport();
        debug!("client connection closed: {err}");
    }

    fn check_timers(&mut self) -> Option<HttpError> {
        let now = Instant::now();
        if self.transport.transport_status() == SessionStatus::Establishing {
            if self.connect_deadline.is_expired_at(now) {
                return Some(self.connect_deadline.error());
            }
            return None;
        }
        self.connect_deadline.disarm();
        if let Some(index) = self
            .exchanges
            .iter()
            .position(|x| x.response_deadline.is_expired_at(now))
        {
            let err = self.exchanges[index].response_deadline.error();
            if let Some(exchange) = self.exchanges.remove(index) {
                // a partially received response is never safe to send again
                let err = match exchange.seen_bytes {
                    true => HttpError::ResponseInterrupted(err.to_string()),
                    false => err,
                };
                if let Some(completion) = exchange.completion {
                    completion.fail(err);
                }
            }
            return Some(HttpError::ConnectionClosed);
        }
        if self.body_deadline.is_expired_at(now) {
            return Some(self.body_deadline.error());
        }
        if let Some(index) = self.exchanges.iter().position(|x| {
            x.completion
                .as_ref()
                .map(|c| c.is_interrupted())
                .unwrap_or(false)
        }) {
            // a cancelled completion is dropped without delivering anything
            self.exchanges.remove(index);
            return Some(HttpError::ConnectionClosed);
        }
        if let Inbound::Streaming(source) = &self.inbound {
            if source.is_destroyed() {
                return Some(HttpError::ClosedChannel);
            }
        }
        None
    }

    fn write_out(&mut self) -> Result<DriveOutcome, HttpError> {
        let mut outcome = DriveOutcome::Idle;
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
                            // available() said this fits, so the buffer is broken
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
            }
            outcome = DriveOutcome::Active;
        }
        while !self.write_buf.is_empty() {
            let wrote = self.transport.write_some(self.write_buf.peek_read())?;
            if wrote == 0 {
                break;
            }
            self.write_buf.advance_read(wrote)?;
            self.last_activity = Instant::now();
            outcome = DriveOutcome::Active;
        }
        Ok(outcome)
    }

    fn read_in(&mut self) -> Result<DriveOutcome, HttpError> {
        let mut outcome = self.parse_buffered()?;
        for _ in 0..READS_PER_DRIVE {
            if self.upgraded.is_some() || self.closed {
                break;
            }
            if let Inbound::Streaming(source) = &self.inbound {
                if !source.wants_data() {
                    break;
                }
            }
            match self.transport.read_some(&mut self.read_buf) {
                Ok(0) => break,
                Ok(_) => {
                    self.last_activity = Instant::now();
                    outcome = DriveOutcome::Active;
                    self.parse_buffered()?;
                }
                Err(HttpError::ConnectionClosed) => {
                    self.on_eof()?;
                    return Ok(DriveOutcome::Active);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }

    fn parse_buffered(&mut self) -> Result<DriveOutcome, HttpError> {
        let mut outcome = DriveOutcome::Idle;
        while self.upgraded.is_none() && !self.closed {
            if self.read_buf.is_empty() && self.parser.state() != ParseState::Body {
                break;
            }
            let method = match self.exchanges.front_mut() {
                Some(front) => {
                    front.seen_bytes |= self.read_buf.iter().any(|x| *x != b'\r' && *x != b'\n');
                    front.method.clone()
                }
                None if self.read_buf.iter().all(|x| *x == b'\r' || *x == b'\n') => {
                    self.read_buf.clear();
                    break;
                }
                None => return Err(HttpError::protocol("received data with no outstanding request")),
            };
            let (consumed, event) = self.parser.parse(&self.read_buf, &method)?;
            self.read_buf.drain(..consumed);
            match event {
                ParseEvent::Pending => break,
                event => self.on_event(event, &method)?,
            }
            outcome = DriveOutcome::Active;
        }
        Ok(outcome)
    }

    fn on_event(&mut self, event: ParseEvent<ResponseHeader>, method: &Method) -> Result<(), HttpError> {
        match event {
            ParseEvent::Head(head, framing) => self.on_head(head, framing, method),
            ParseEvent::Data(data) => {
                self.body_deadline.arm();
                match &mut self.inbound {
                    Inbound::Streaming(source) => source.push(data),
                    Inbound::Buffering(_, buf) => buf.extend_from_slice(&data),
                    _ => return Err(HttpError::protocol("body data without a response head")),
                }
                Ok(())
            }
            ParseEvent::Complete(trailers) => {
                self.body_deadline.disarm();
                match std::mem::replace(&mut self.inbound, Inbound::Idle) {
                    Inbound::Informational => return Ok(()),
                    Inbound::Idle => {
                        return Err(HttpError::protocol("message end without a response head"))
                    }
                    Inbound::Delivered => {}
                    Inbound::Streaming(source) => source.complete(trailers),
                    Inbound::Buffering(head, data) => {
                        if let Some(completion) = self.front_completion() {
                            completion.succeed(Response::from_parts(head, Body::Full(data)));
                        }
                    }
                }
                self.finish_exchange();
                Ok(())
            }
            ParseEvent::Pending => Ok(()),
        }
    }

    fn on_head(
        &mut self,
        head: ResponseHeader,
        framing: BodyFraming,
        method: &Method,
    ) -> Result<(), HttpError> {
        let status = head.status;
        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            debug!("skipping interim response {status}");
            self.inbound = Inbound::Informational;
            return Ok(());
        }
        if let Some(front) = self.exchanges.front_mut() {
            front.response_deadline.disarm();
        }
        if status == StatusCode::SWITCHING_PROTOCOLS
            || (*method == Method::CONNECT && status.is_success())
        {
            return self.on_upgrade(head);
        }
        if !head.is_keep_alive() || framing.is_close_delimited() {
            self.persistent = false;
        }
        if let Some(max) = keep_alive_max(&head.headers) {
            self.keep_alive_remaining = Some(max);
        }
        let invoke_on = self
            .exchanges
            .front()
            .and_then(|x| x.completion.as_ref())
            .map(|x| x.invoke_on())
            .unwrap_or_default();
        if framing == BodyFraming::Empty {
            if let Some(completion) = self.front_completion() {
                completion.succeed(Response::from_parts(head, Body::Empty));
            }
            self.inbound = Inbound::Delivered;
            return Ok(());
        }
        self.body_deadline.arm();
        match invoke_on {
            InvokeOn::OnHeader => {
                let source = BodySource::new();
                self.inbound = Inbound::Streaming(source.clone());
                if let Some(completion) = self.front_completion() {
                    completion.succeed(Response::from_parts(head, Body::Streaming(source)));
                }
            }
            InvokeOn::OnMessage => self.inbound = Inbound::Buffering(head, Vec::new()),
        }
        Ok(())
    }

    fn on_upgrade(&mut self, head: ResponseHeader) -> Result<(), HttpError> {
        debug!("connection switched protocols with {}", head.status);
        self.upgraded = Some(head.clone());
        self.persistent = false;
        if let Some(completion) = self.front_completion() {
            completion.succeed(Response::from_parts(head, Body::Empty));
        }
        self.finish_exchange();
        for exchange in self.exchanges.drain(..) {
            if let Some(completion) = exchange.completion {
                completion.fail(HttpError::Upgrade(
                    "connection switched protocols before this exchange".to_owned(),
                ));
            }
        }
        Ok(())
    }

    fn front_completion(&mut self) -> Option<Completion> {
        self.exchanges.front_mut().and_then(|x| x.completion.take())
    }

    fn finish_exchange(&mut self) {
        self.exchanges.pop_front();
        self.transactions += 1;
        if self.exchanges.is_empty() {
            self.idle_deadline.arm();
        }
        if !self.persistent && self.upgraded.is_none() {
            // the server will not read anything else
            self.abort(HttpError::ConnectionClosed);
        }
    }

    fn on_eof(&mut self) -> Result<(), HttpError> {
        let method = self
            .exchanges
            .front()
            .map(|x| x.method.clone())
            .unwrap_or(Method::GET);
        match self.parser.eof(&self.read_buf)? {
            Some(event) => {
                self.persistent = false;
                self.read_buf.clear();
                self.on_event(event, &method)?;
            }
            None => {}
        }
        self.abort(HttpError::ConnectionClosed);
        Ok(())
    }
}

impl<S: Transport + 'static> HttpClientConnection<S> {
    /// Take over the raw stream after a protocol switch.
    pub fn into_upgraded(self) -> Result<Upgraded, HttpError> {
        match self.upgraded {
            Some(head) => {
                Ok(Upgraded::new(Box::new(self.transport), self.read_buf).with_response(head))
            }
            None => {
                let mut this = self;
                this.close();
                Err(HttpError::Upgrade("connection did not switch protocols".to_owned()))
            }
        }
    }
}

impl<S: Transport> Session for HttpClientConnection<S> {
    fn status(&self) -> SessionStatus {
        if self.closed {
            SessionStatus::Terminated
        } else {
            self.transport.transport_status()
        }
    }

    fn close(&mut self) {
        self.abort(HttpError::ConnectionClosed);
    }

    fn drive(&mut self) -> Result<DriveOutcome, HttpError> {
        if self.closed {
            return Err(HttpError::ConnectionClosed);
        }
        let mut outcome = match self.transport.drive_transport() {
            Ok(x) => x,
            Err(err) => {
                warning!("client transport failed: {err}");
                self.abort(err);
                return Ok(DriveOutcome::Active);
            }
        };
        if let Some(err) = self.check_timers() {
            debug!("client connection timer fired: {err}");
            self.abort(err);
            return Ok(DriveOutcome::Active);
        }
        if self.exchanges.is_empty() && self.idle_deadline.is_expired() {
            debug!("closing idle client connection");
            self.abort(HttpError::ConnectionClosed);
            return Ok(DriveOutcome::Active);
        }
        if self.transport.transport_status() != SessionStatus::Established {
            return Ok(outcome);
        }
        if self.upgraded.is_some() {
            // the raw stream now belongs to whoever takes it with into_upgraded
            return Ok(outcome);
        }
        let step = self.write_out().and_then(|written| {
            self.read_in()
                .map(|read| written.merge(read))
        });
        match step {
            Ok(x) => outcome = outcome.merge(x),
            Err(err) => {
                if err.is_malformed() {
                    warning!("malformed response: {err}");
                }
                self.abort(err);
                outcome = DriveOutcome::Active;
            }
        }
        Ok(outcome)
    }
}

impl<S: Transport> Debug for HttpClientConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientConnection")
            .field("transport", &self.transport)
            .field("host", &self.host)
            .field("pending", &self.exchanges.len())
            .field("transactions", &self.transactions)
            .field("persistent", &self.persistent)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use http::{Method, StatusCode};

    use super::HttpClientConnection;
    use crate::{
        body::Body,
        config::{ClientConfig, Timeouts},
        error::{HttpError, TimeoutKind},
        exchange::{handler_fn, FutureResponse, InvokeOn},
        message::{Request, RequestHeader, Response},
        mock::{MockHandle, MockTransport},
        Session, SessionStatus,
    };

    fn connection() -> (HttpClientConnection<MockTransport>, MockHandle) {
        let (transport, handle) = MockTransport::new();
        let conn = HttpClientConnection::new(transport, &ClientConfig::default())
            .unwrap()
            .with_host("example.com");
        (conn, handle)
    }

    fn drive_until_done(conn: &mut HttpClientConnection<MockTransport>, future: &FutureResponse) {
        for _ in 0..100 {
            if future.is_done() {
                return;
            }
            let _ = conn.drive();
        }
        panic!("exchange did not complete");
    }

    #[test]
    fn test_get_and_reuse() {
        let (mut conn, handle) = connection();
        let future = conn.send_future(Request::get("/hello")).unwrap();
        conn.drive().unwrap();
        assert_eq!(
            handle.take_written_string(),
            "GET /hello HTTP/1.1\r\nHost: example.com\r\n\r\n"
        );
        handle.push(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");
        drive_until_done(&mut conn, &future);
        let response = future.try_get().unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        match response.body() {
            Body::Streaming(source) => {
                assert_eq!(source.read_to_end(Duration::from_secs(1)).unwrap(), b"OK")
            }
            x => panic!("unexpected body {x:?}"),
        }
        conn.drive().unwrap();
        assert!(conn.is_reusable());
        assert_eq!(conn.transactions(), 1);

        let future = conn.send_future(Request::get("/again")).unwrap();
        conn.drive().unwrap();
        handle.push(b"HTTP/1.1 204 No Content\r\n\r\n");
        drive_until_done(&mut conn, &future);
        assert_eq!(future.try_get().unwrap().unwrap().status(), StatusCode::NO_CONTENT);
        assert_eq!(conn.transactions(), 2);
    }

    #[test]
    fn test_pipelined_responses_in_order() {
        let (mut conn, handle) = connection();
        let order = Arc::new(Mutex::new(Vec::new()));
        for path in ["/1", "/2", "/3"] {
            let order = Arc::clone(&order);
            conn.send(
                Request::get(path),
                handler_fn(move |result: Result<Response, HttpError>| {
                    let response = result.unwrap();
                    order.lock().unwrap().push(response.body().as_text().unwrap().to_owned())
                })
                .with_invoke_on(InvokeOn::OnMessage),
            )
            .unwrap();
        }
        conn.drive().unwrap();
        let written = handle.take_written_string();
        assert_eq!(written.matches("GET /").count(), 3);
        // chunked, fixed and split across reads
        handle.push(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\n0\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb");
        handle.push(b"HTTP/1.1 200 OK\r\nContent-Le");
        handle.push(b"ngth: 1\r\n\r\nc");
        for _ in 0..10 {
            conn.drive().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(conn.transactions(), 3);
    }

    #[test]
    fn test_interim_response_is_skipped() {
        let (mut conn, handle) = connection();
        let future = conn
            .send_future(
                Request::post("/upload", "data")
                    .with_header("Expect", "100-continue")
                    .unwrap(),
            )
            .unwrap();
        conn.drive().unwrap();
        handle.push(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n");
        drive_until_done(&mut conn, &future);
        assert_eq!(future.try_get().unwrap().unwrap().status(), StatusCode::CREATED);
    }

    #[test]
    fn test_close_fails_outstanding_once() {
        let (mut conn, handle) = connection();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            conn.send(
                Request::get("/"),
                handler_fn(move |result: Result<Response, HttpError>| {
                    calls.lock().unwrap().push(result)
                }),
            )
            .unwrap();
        }
        conn.drive().unwrap();
        handle.push(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
        conn.drive().unwrap();
        handle.close();
        conn.drive().unwrap();
        conn.close();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        // the first response was delivered on its head, so its body fails instead
        let source = match calls[0].as_ref().unwrap().body() {
            Body::Streaming(source) => source.clone(),
            x => panic!("unexpected body {x:?}"),
        };
        assert!(matches!(
            source.read_to_end(Duration::from_secs(1)).unwrap_err(),
            HttpError::ResponseInterrupted(_)
        ));
        assert!(matches!(
            calls[1].as_ref().unwrap_err(),
            HttpError::ConnectionClosed
        ));
        assert!(!conn.is_persistent());
        assert!(conn.send_future(Request::get("/")).is_err());
    }

    #[test]
    fn test_cancel_with_interrupt_closes() {
        let (mut conn, handle) = connection();
        let future = conn.send_future(Request::get("/")).unwrap();
        conn.drive().unwrap();
        assert!(future.cancel(true));
        conn.drive().unwrap();
        assert!(handle.is_closed());
        assert!(matches!(future.try_get().unwrap().unwrap_err(), HttpError::Cancelled));
    }

    #[test]
    fn test_truncated_buffered_response_is_interrupted() {
        let (mut conn, handle) = connection();
        let future = FutureResponse::new();
        conn.send(Request::get("/"), future.handler(InvokeOn::OnMessage))
            .unwrap();
        conn.drive().unwrap();
        handle.push(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
        handle.close();
        drive_until_done(&mut conn, &future);
        let err = future.try_get().unwrap().unwrap_err();
        assert!(matches!(err, HttpError::ResponseInterrupted(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_close_delimited_body() {
        let (mut conn, handle) = connection();
        let future = FutureResponse::new();
        conn.send(Request::get("/"), future.handler(InvokeOn::OnMessage))
            .unwrap();
        conn.drive().unwrap();
        handle.push(b"HTTP/1.0 200 OK\r\n\r\nuntil the end");
        handle.close();
        drive_until_done(&mut conn, &future);
        let response = future.try_get().unwrap().unwrap();
        assert_eq!(response.body().as_text(), Some("until the end"));
        assert!(!conn.is_persistent());
    }

    #[test]
    fn test_head_response_has_no_body() {
        let (mut conn, handle) = connection();
        let future = conn.send_future(Request::head("/")).unwrap();
        conn.drive().unwrap();
        handle.push(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n");
        drive_until_done(&mut conn, &future);
        assert!(future.try_get().unwrap().unwrap().body().is_empty());
        conn.drive().unwrap();
        assert!(conn.is_reusable());
    }

    #[test]
    fn test_connection_close_header_is_not_reused() {
        let (mut conn, handle) = connection();
        let future = conn.send_future(Request::get("/")).unwrap();
        conn.drive().unwrap();
        handle.push(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
        drive_until_done(&mut conn, &future);
        assert!(future.try_get().unwrap().is_ok());
        assert!(!conn.is_reusable());
        assert!(handle.is_closed());
    }

    #[test]
    fn test_response_timeout() {
        let (transport, _handle) = MockTransport::new();
        let config = ClientConfig::default()
            .with_timeouts(Timeouts::new().with_response(Some(Duration::from_millis(10))));
        let mut conn = HttpClientConnection::new(transport, &config).unwrap();
        let future = conn.send_future(Request::get("/slow")).unwrap();
        conn.drive().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        conn.drive().unwrap();
        assert!(matches!(
            future.try_get().unwrap().unwrap_err(),
            HttpError::Timeout(TimeoutKind::Response, _)
        ));
        assert!(!conn.is_persistent());
    }

    #[test]
    fn test_response_timeout_after_partial_head_is_not_retryable() {
        let (transport, handle) = MockTransport::new();
        let config = ClientConfig::default()
            .with_timeouts(Timeouts::new().with_response(Some(Duration::from_millis(10))));
        let mut conn = HttpClientConnection::new(transport, &config).unwrap();
        let future = conn.send_future(Request::get("/slow")).unwrap();
        conn.drive().unwrap();
        handle.push(b"HTTP/1.1 200 OK\r\nServer: me\r\n");
        conn.drive().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        conn.drive().unwrap();
        let err = future.try_get().unwrap().unwrap_err();
        assert!(matches!(err, HttpError::ResponseInterrupted(_)), "{err:?}");
        assert!(!err.is_retryable());
        assert!(!conn.is_persistent());
    }

    #[test]
    fn test_connect_timeout() {
        let (transport, handle) = MockTransport::new();
        let transport = transport.with_status(SessionStatus::Establishing);
        let config = ClientConfig::default()
            .with_timeouts(Timeouts::new().with_connect(Some(Duration::from_millis(10))));
        let mut conn = HttpClientConnection::new(transport, &config).unwrap();
        let future = conn.send_future(Request::get("/")).unwrap();
        conn.drive().unwrap();
        assert!(!future.is_done());
        std::thread::sleep(Duration::from_millis(20));
        conn.drive().unwrap();
        let err = future.try_get().unwrap().unwrap_err();
        assert!(matches!(err, HttpError::Timeout(TimeoutKind::Connect, _)), "{err:?}");
        assert!(err.is_retryable());
        assert!(handle.take_written().is_empty());
    }

    #[test]
    fn test_idle_timeout_closes_connection() {
        let (transport, handle) = MockTransport::new();
        let config = ClientConfig::default()
            .with_timeouts(Timeouts::new().with_idle(Some(Duration::from_millis(10))));
        let mut conn = HttpClientConnection::new(transport, &config).unwrap();
        conn.drive().unwrap();
        assert!(!handle.is_closed());
        std::thread::sleep(Duration::from_millis(20));
        conn.drive().unwrap();
        assert!(handle.is_closed());
        assert!(!conn.is_persistent());
    }

    #[test]
    fn test_body_receive_timeout() {
        let (transport, handle) = MockTransport::new();
        let config = ClientConfig::default()
            .with_timeouts(Timeouts::new().with_body_receive(Some(Duration::from_millis(10))));
        let mut conn = HttpClientConnection::new(transport, &config).unwrap();
        let future = FutureResponse::new();
        conn.send(Request::get("/"), future.handler(InvokeOn::OnMessage))
            .unwrap();
        conn.drive().unwrap();
        handle.push(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
        conn.drive().unwrap();
        assert!(!future.is_done());
        std::thread::sleep(Duration::from_millis(20));
        conn.drive().unwrap();
        let err = future.try_get().unwrap().unwrap_err();
        assert!(matches!(err, HttpError::Timeout(TimeoutKind::BodyReceive, _)), "{err:?}");
        assert!(!err.is_retryable());
        assert!(handle.is_closed());
    }

    #[test]
    fn test_streaming_request_body() {
        let (mut conn, handle) = connection();
        let future = FutureResponse::new();
        let sink = conn
            .send_streaming(
                RequestHeader::new(Method::POST, "/stream"),
                future.handler(InvokeOn::OnMessage),
            )
            .unwrap();
        sink.write(b"test").unwrap();
        conn.drive().unwrap();
        sink.write(b"12345").unwrap();
        sink.close().unwrap();
        conn.drive().unwrap();
        assert_eq!(
            handle.take_written_string(),
            "POST /stream HTTP/1.1\r\nHost: example.com\r\nTransfer-Encoding: chunked\r\n\r\n\
4\r\ntest\r\n5\r\n12345\r\n0\r\n\r\n"
        );
        handle.push(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        drive_until_done(&mut conn, &future);
        assert!(future.try_get().unwrap().is_ok());
    }

    #[test]
    fn test_switching_protocols() {
        let (mut conn, handle) = connection();
        let future = conn
            .send_future(Request::get("/chat").with_header("Upgrade", "echo").unwrap())
            .unwrap();
        conn.drive().unwrap();
        handle.push(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: echo\r\n\r\nhi");
        drive_until_done(&mut conn, &future);
        assert_eq!(
            future.try_get().unwrap().unwrap().status(),
            StatusCode::SWITCHING_PROTOCOLS
        );
        assert!(conn.is_upgraded());
        let upgraded = conn.into_upgraded().unwrap();
        assert_eq!(upgraded.leftover(), b"hi");
    }

    #[test]
    fn test_call_from_caller_thread() {
        let (transport, handle) = MockTransport::new();
        handle.push(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let mut conn = HttpClientConnection::new(transport, &ClientConfig::default()).unwrap();
        let response = conn
            .call(Request::get("/"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(response.body().as_text(), Some("hello"));
    }
}
