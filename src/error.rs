//! The single error type used across the crate.
//!
//! Every failure is an [`HttpError`], and [`HttpError::kind`] collapses the variants to the
//! handful of [`ErrorKind`] classes callers usually branch on.

use std::{fmt, io, time::Duration};

use thiserror::Error;

/// Coarse classification of an [`HttpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input from the peer, or a contract violation by the application.
    Protocol,
    /// One of the timeouts described by [`TimeoutKind`] fired.
    Timeout,
    /// The underlying connection failed or closed.
    Transport,
    /// A pool refused to open another connection.
    Capacity,
    /// The exchange was cancelled by the caller.
    Cancelled,
}

/// Identifies which timer produced a [`HttpError::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    Connect,
    Idle,
    Request,
    Response,
    BodyReceive,
    /// A caller-side wait, such as [`crate::exchange::FutureResponse::get`].
    Call,
}
impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Idle => "idle",
            Self::Request => "request",
            Self::Response => "response",
            Self::BodyReceive => "body receive",
            Self::Call => "call",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed start line: {0}")]
    MalformedStartLine(String),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("message head exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("malformed chunk: {0}")]
    ChunkFormat(String),

    #[error("body ended prematurely: {0}")]
    PrematureBodyEnd(String),

    /// The connection failed after part of the response had already been received.
    #[error("response interrupted: {0}")]
    ResponseInterrupted(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("body channel is closed")]
    ClosedChannel,

    #[error("{0} timeout after {1:?}")]
    Timeout(TimeoutKind, Duration),

    #[error("max connections exceeded for {0}")]
    MaxConnectionsExceeded(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("exchange cancelled")]
    Cancelled,

    #[error("upgrade failed: {0}")]
    Upgrade(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
impl HttpError {
    pub(crate) fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedStartLine(_)
            | Self::MalformedHeader(_)
            | Self::HeaderTooLarge { .. }
            | Self::ChunkFormat(_)
            | Self::Protocol(_)
            | Self::ClosedChannel
            | Self::Upgrade(_) => ErrorKind::Protocol,
            Self::Timeout(_, _) => ErrorKind::Timeout,
            Self::PrematureBodyEnd(_)
            | Self::ResponseInterrupted(_)
            | Self::ConnectionClosed
            | Self::Io(_) => ErrorKind::Transport,
            Self::MaxConnectionsExceeded(_) => ErrorKind::Capacity,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True for malformed-message errors, after which a connection cannot resynchronize.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::MalformedStartLine(_)
                | Self::MalformedHeader(_)
                | Self::HeaderTooLarge { .. }
                | Self::ChunkFormat(_)
        )
    }

    /// True when the failure happened before any response byte was seen, so replaying the
    /// request on a fresh connection is safe for idempotent methods.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed
                | Self::Io(_)
                | Self::Timeout(TimeoutKind::Connect, _)
                | Self::Timeout(TimeoutKind::Response, _)
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}
impl Clone for HttpError {
    fn clone(&self) -> Self {
        match self {
            Self::MalformedStartLine(x) => Self::MalformedStartLine(x.clone()),
            Self::MalformedHeader(x) => Self::MalformedHeader(x.clone()),
            Self::HeaderTooLarge { limit } => Self::HeaderTooLarge { limit: *limit },
            Self::ChunkFormat(x) => Self::ChunkFormat(x.clone()),
            Self::PrematureBodyEnd(x) => Self::PrematureBodyEnd(x.clone()),
            Self::ResponseInterrupted(x) => Self::ResponseInterrupted(x.clone()),
            Self::Protocol(x) => Self::Protocol(x.clone()),
            Self::ClosedChannel => Self::ClosedChannel,
            Self::Timeout(kind, after) => Self::Timeout(*kind, *after),
            Self::MaxConnectionsExceeded(x) => Self::MaxConnectionsExceeded(x.clone()),
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::Cancelled => Self::Cancelled,
            Self::Upgrade(x) => Self::Upgrade(x.clone()),
            // io::Error is not Clone, keep its kind and message
            Self::Io(err) => Self::Io(io::Error::new(err.kind(), err.to_string())),
        }
    }
}
impl From<http::Error> for HttpError {
    fn from(err: http::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
