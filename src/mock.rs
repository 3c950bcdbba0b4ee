//! In-memory transports, most useful for testing
//!
//! A [`MockTransport`] reads from and writes to shared in-memory pipes. The other ends are either a
//! [`MockHandle`], for scripting raw bytes against one connection, or a second transport created
//! by [`MockTransport::pair`], for wiring a client connection straight to a server connection.

use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    error::HttpError, DriveOutcome, Publish, PublishOutcome, Receive, ReceiveOutcome, Session,
    SessionStatus,
};

#[derive(Default)]
struct Pipe {
    chunks: VecDeque<Vec<u8>>,
    closed: bool,
}

type SharedPipe = Arc<Mutex<Pipe>>;

fn lock(pipe: &SharedPipe) -> MutexGuard<'_, Pipe> {
    pipe.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A byte transport over in-memory pipes.
///
/// Receiving returns one pushed chunk at a time. Once the inbound pipe is closed and drained,
/// receiving fails with [`HttpError::ConnectionClosed`], like a peer EOF on a socket.
pub struct MockTransport {
    inbound: SharedPipe,
    outbound: SharedPipe,
    current: Vec<u8>,
    status: SessionStatus,
    write_limit: Option<usize>,
}
impl MockTransport {
    fn with_pipes(inbound: SharedPipe, outbound: SharedPipe) -> Self {
        Self {
            inbound,
            outbound,
            current: Vec::new(),
            status: SessionStatus::Established,
            write_limit: None,
        }
    }

    /// Create a transport along with the handle that scripts its peer.
    pub fn new() -> (Self, MockHandle) {
        let inbound = SharedPipe::default();
        let outbound = SharedPipe::default();
        let handle = MockHandle {
            inbound: Arc::clone(&inbound),
            outbound: Arc::clone(&outbound),
        };
        (Self::with_pipes(inbound, outbound), handle)
    }

    /// Create two transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let a_to_b = SharedPipe::default();
        let b_to_a = SharedPipe::default();
        (
            Self::with_pipes(Arc::clone(&b_to_a), Arc::clone(&a_to_b)),
            Self::with_pipes(a_to_b, b_to_a),
        )
    }

    /// Report `status` until closed, to stand in for a transport that never finishes connecting.
    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    /// Accept at most `limit` bytes per write, to exercise partial writes.
    pub fn with_write_limit(mut self, limit: Option<usize>) -> Self {
        self.write_limit = limit;
        self
    }
}
impl Session for MockTransport {
    fn status(&self) -> SessionStatus {
        self.status
    }

    fn close(&mut self) {
        if self.status != SessionStatus::Terminated {
            self.status = SessionStatus::Terminated;
            lock(&self.outbound).closed = true;
            lock(&self.inbound).closed = true;
        }
    }

    fn drive(&mut self) -> Result<DriveOutcome, HttpError> {
        if self.status == SessionStatus::Terminated {
            return Err(HttpError::ConnectionClosed);
        }
        Ok(DriveOutcome::Idle)
    }
}
impl Publish for MockTransport {
    type PublishPayload<'a> = &'a [u8];

    fn publish<'a>(
        &mut self,
        payload: Self::PublishPayload<'a>,
    ) -> Result<PublishOutcome<Self::PublishPayload<'a>>, HttpError> {
        if self.status != SessionStatus::Established {
            return Err(HttpError::ConnectionClosed);
        }
        let mut outbound = lock(&self.outbound);
        if outbound.closed {
            // peer went away
            return Err(HttpError::ConnectionClosed);
        }
        let take = self.write_limit.unwrap_or(usize::MAX).min(payload.len());
        if take > 0 {
            outbound.chunks.push_back(payload[..take].to_vec());
        }
        if take == payload.len() {
            Ok(PublishOutcome::Published)
        } else {
            Ok(PublishOutcome::Incomplete(&payload[take..]))
        }
    }
}
impl Receive for MockTransport {
    type ReceivePayload<'a> = &'a [u8];

    fn receive<'a>(&'a mut self) -> Result<ReceiveOutcome<Self::ReceivePayload<'a>>, HttpError> {
        if self.status != SessionStatus::Established {
            return Err(HttpError::ConnectionClosed);
        }
        let mut inbound = lock(&self.inbound);
        match inbound.chunks.pop_front() {
            Some(chunk) => {
                drop(inbound);
                self.current = chunk;
                Ok(ReceiveOutcome::Payload(&self.current))
            }
            None if inbound.closed => Err(HttpError::ConnectionClosed),
            None => Ok(ReceiveOutcome::Idle),
        }
    }
}
impl Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("status", &self.status)
            .finish()
    }
}

/// Scripts the peer side of a [`MockTransport`].
#[derive(Clone)]
pub struct MockHandle {
    inbound: SharedPipe,
    outbound: SharedPipe,
}
impl MockHandle {
    /// Queue bytes to be received by the transport.
    pub fn push(&self, data: &[u8]) {
        lock(&self.inbound).chunks.push_back(data.to_vec());
    }

    /// Close the transport's inbound direction, as if the peer closed the connection.
    pub fn close(&self) {
        lock(&self.inbound).closed = true;
    }

    /// Take every byte the transport has written so far.
    pub fn take_written(&self) -> Vec<u8> {
        let mut outbound = lock(&self.outbound);
        let mut out = Vec::new();
        for chunk in outbound.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        out
    }

    pub fn take_written_string(&self) -> String {
        String::from_utf8_lossy(&self.take_written()).into_owned()
    }

    /// True once the transport was closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.outbound).closed
    }
}
impl Debug for MockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MockHandle")
    }
}
