//! # Description
//!
//! A non-blocking HTTP/1.0 and HTTP/1.1 message engine.
//!
//! The crate incrementally parses HTTP messages from a byte stream, transfers bodies as
//! fixed-length, chunked, or close-delimited data, and drives request/response exchanges over
//! persistent, pipelined, and pooled connections. Every connection is a [`Session`]: it does no
//! work until [`Session::drive`] is called, and never blocks while being driven.
//!
//! # Sessions
//!
//! The core [`Session`] trait encapsulates controlling a single instance of a connection or logical session.
//! [`Publish`] and [`Receive`] move payloads in and out of a session using associated types, and the
//! [`Transport`] trait is the byte-stream view over any session that publishes and receives `&[u8]`.
//!
//! Both [`client::HttpClientConnection`] and [`server::ServerConnection`] are generic over a [`Transport`],
//! so the same engine runs over [`tcp::TcpSession`] in production and over [`mock::MockTransport`] in tests.
//!
//! # Errors
//!
//! An [`Err`] always represents a transport, protocol, timeout, capacity, or cancellation failure,
//! reported as an [`error::HttpError`]. Partial progress is never an error: it is reported as
//! [`ReceiveOutcome::Idle`], [`ReceiveOutcome::Buffered`], or [`PublishOutcome::Incomplete`].
//!
//! # Threading
//!
//! Connections can be driven by hand, or handed to a [`dispatch::Dispatcher`] I/O thread, which is what
//! [`http::HttpClient`] and [`server::HttpServer`] do. Handlers and callbacks run inline on the
//! I/O thread unless configured with [`exchange::Execution::WorkerPool`]. Blocking calls made from an
//! I/O thread fail instead of stalling it.
//!
//! # Features
//!
//! - `tcp`: [`tcp::TcpSession`], [`http::HttpClient`], and [`server::HttpServer`]
//! - `websocket`: [`websocket::WebSocketSession`]
//! - `compress`: transparent gzip decoding
//! - `log`: logging through the `log` facade
//! - `mock`: [`mock::MockTransport`]
//!
//! # Examples
//!
//! ## Blocking Call
//!
//! ```no_run
//! use nbhttp::http::HttpClient;
//! use nbhttp::message::Request;
//!
//! let client = HttpClient::new().unwrap();
//! let response = client.call(Request::get("http://127.0.0.1:8080/hello")).unwrap();
//! println!("{} {}", response.status(), response.body().as_text().unwrap_or_default());
//! ```
//!
//! ## Driving A Connection
//!
//! ```no_run
//! use nbhttp::{client::HttpClientConnection, message::Request, Session};
//!
//! let mut conn = HttpClientConnection::connect("127.0.0.1", 8080, false).unwrap();
//! let future = conn.send_future(Request::get("/hello")).unwrap();
//! while !future.is_done() {
//!     conn.drive().unwrap();
//! }
//! ```
//!
//! ## Serving Requests
//!
//! ```no_run
//! use nbhttp::handler::handler_fn;
//! use nbhttp::message::Response;
//! use nbhttp::server::HttpServer;
//!
//! let server = HttpServer::bind("127.0.0.1:8080")
//!     .unwrap()
//!     .with_handler(handler_fn(|exchange| exchange.send(Response::text(200, "OK"))));
//! let handle = server.start().unwrap();
//! handle.stop();
//! ```

pub extern crate http as hyperium_http;
#[cfg(feature = "tcp")]
pub extern crate tcp_stream;
#[cfg(feature = "websocket")]
pub extern crate tungstenite;

mod log;

pub mod body;
pub mod buffer;
pub mod cache;
pub mod client;
pub mod codec;
#[cfg(feature = "compress")]
pub mod compress;
pub mod config;
pub mod cookie;
pub mod dispatch;
#[cfg(feature = "tcp")]
pub mod dns;
pub mod error;
pub mod exchange;
pub mod frame;
pub mod handler;
#[cfg(feature = "tcp")]
pub mod http;
pub mod liveness;
pub mod message;
#[cfg(feature = "mock")]
pub mod mock;
pub mod multipart;
pub mod parser;
pub mod pool;
pub mod server;
pub mod session;
pub mod sse;
#[cfg(feature = "tcp")]
pub mod tcp;
pub mod upgrade;
#[cfg(feature = "websocket")]
pub mod websocket;

use std::fmt::Debug;

use error::HttpError;

/// An instance of a connection or logical session, which may also support [`Receive`] and [`Publish`].
///
/// ## Connecting
///
/// Some implementations may not default to an established state, in which case immediate calls to `publish()` and `receive()` will fail.
/// The [`Session::status`] function provides the current status, which will not return `Established` until all required handshakes are complete.
/// When [`Session::status`] returns [`SessionStatus::Establishing`], you may drive the connection process via the [`Session::drive`] function.
///
/// ## Duty Cycles
///
/// The [`Session::drive`] operation is used to finish connecting, to service reading/writing buffered data, to enforce timers, and to dispatch callbacks.
pub trait Session: Debug {
    /// Check the current session status.
    fn status(&self) -> SessionStatus;

    /// Force the session to move to a [`SessionStatus::Terminated`] state immediately.
    fn close(&mut self);

    /// Perform any pending work.
    /// This function will return [`DriveOutcome::Active`] if work was done, indicating to any scheduler that more work may be pending.
    /// When this function returns [`DriveOutcome::Idle`], only then should a scheduler yield or idle.
    fn drive(&mut self) -> Result<DriveOutcome, HttpError>;
}

/// Returned by the [`Session::status`] function, providing the current connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Session attempting to connect, handshake, or otherwise establish
    Establishing,
    /// Session is currently established
    Established,
    /// Session terminal state, connection has been closed
    Terminated,
}

/// Returned by the [`Session::drive`] function, providing the result of the drive operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveOutcome {
    /// Work was done, [`Session::drive`] should be called again as soon as possible.
    Active,
    /// No work was done, the caller may decide to yield or backoff.
    Idle,
}
impl DriveOutcome {
    pub(crate) fn merge(self, other: DriveOutcome) -> DriveOutcome {
        if self == DriveOutcome::Active || other == DriveOutcome::Active {
            DriveOutcome::Active
        } else {
            DriveOutcome::Idle
        }
    }
}

/// A [`Session`] implementation that can receive payloads via polling.
pub trait Receive: Session {
    /// The type returned by the `receive(..)` function.
    type ReceivePayload<'a>
    where
        Self: 'a;

    /// Attempt to receive a `payload` from the session.
    fn receive<'a>(&'a mut self) -> Result<ReceiveOutcome<Self::ReceivePayload<'a>>, HttpError>;
}

/// Returned by the [`Receive::receive`] function.
#[derive(Debug, Clone)]
pub enum ReceiveOutcome<T> {
    /// Contains a payload received from the [`Receive::receive`] action.
    Payload(T),
    /// A partial payload was buffered, but is not complete.
    Buffered,
    /// No work was done.
    Idle,
}

/// A [`Session`] implementation that can publish payloads.
pub trait Publish: Session {
    /// The type given to the `publish(..)` function.
    type PublishPayload<'a>
    where
        Self: 'a;

    /// Write the given `payload` to the session.
    ///
    /// This will return [`PublishOutcome::Incomplete`] if the publish is not immediately completed fully,
    /// in which case the returned remainder must be retried.
    fn publish<'a>(
        &mut self,
        payload: Self::PublishPayload<'a>,
    ) -> Result<PublishOutcome<Self::PublishPayload<'a>>, HttpError>;
}

/// A [`Publish`] implementation that exposes a blocking flush operation.
pub trait Flush: Publish {
    fn flush(&mut self) -> Result<(), HttpError>;
}

/// Returned by the [`Publish::publish`] function.
#[derive(Debug, Clone)]
pub enum PublishOutcome<T> {
    /// The publish action completed fully
    Published,
    /// The publish action was not performed or was partially performed, and the remainder must be retried.
    Incomplete(T),
}

/// Object-safe byte-stream view over a [`Session`] that publishes and receives `&[u8]`.
///
/// This is implemented for every such session, and is what HTTP connections are generic over.
/// Method names are distinct from [`Session`] so both traits may be in scope together.
pub trait Transport: Debug + Send {
    fn transport_status(&self) -> SessionStatus;

    fn close_transport(&mut self);

    fn drive_transport(&mut self) -> Result<DriveOutcome, HttpError>;

    /// Write as much of `data` as possible, returning the number of bytes accepted.
    fn write_some(&mut self, data: &[u8]) -> Result<usize, HttpError>;

    /// Append received bytes to `out`, returning how many were appended.
    ///
    /// A clean peer close is reported as [`HttpError::ConnectionClosed`].
    fn read_some(&mut self, out: &mut Vec<u8>) -> Result<usize, HttpError>;
}
impl<T> Transport for T
where
    T: for<'a> Publish<PublishPayload<'a> = &'a [u8]>
        + for<'a> Receive<ReceivePayload<'a> = &'a [u8]>
        + Send
        + 'static,
{
    fn transport_status(&self) -> SessionStatus {
        Session::status(self)
    }

    fn close_transport(&mut self) {
        Session::close(self)
    }

    fn drive_transport(&mut self) -> Result<DriveOutcome, HttpError> {
        Session::drive(self)
    }

    fn write_some(&mut self, data: &[u8]) -> Result<usize, HttpError> {
        match self.publish(data)? {
            PublishOutcome::Published => Ok(data.len()),
            PublishOutcome::Incomplete(remaining) => Ok(data.len() - remaining.len()),
        }
    }

    fn read_some(&mut self, out: &mut Vec<u8>) -> Result<usize, HttpError> {
        match self.receive()? {
            ReceiveOutcome::Payload(data) => {
                out.extend_from_slice(data);
                Ok(data.len())
            }
            ReceiveOutcome::Buffered | ReceiveOutcome::Idle => Ok(0),
        }
    }
}
