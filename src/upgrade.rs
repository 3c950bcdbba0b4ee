//! The raw byte stream left behind by `101 Switching Protocols` or a `CONNECT` tunnel.

use std::fmt::Debug;

use crate::{
    error::HttpError, message::ResponseHeader, DriveOutcome, Publish, PublishOutcome, Receive,
    ReceiveOutcome, Session, SessionStatus, Transport,
};

/// A connection taken over from the HTTP engine after a protocol switch.
///
/// Bytes the engine read past the switching response (or request) are replayed first,
/// so nothing sent by the peer immediately after the head is lost.
pub struct Upgraded {
    transport: Box<dyn Transport>,
    leftover: Vec<u8>,
    read_buf: Vec<u8>,
    response: Option<ResponseHeader>,
}
impl Upgraded {
    pub fn new(transport: Box<dyn Transport>, leftover: Vec<u8>) -> Self {
        Self {
            transport,
            leftover,
            read_buf: Vec::new(),
            response: None,
        }
    }

    /// Attach the response head that completed the switch.
    pub fn with_response(mut self, response: ResponseHeader) -> Self {
        self.response = Some(response);
        self
    }

    /// The `101` or `2xx` head that switched protocols, when known.
    pub fn response(&self) -> Option<&ResponseHeader> {
        self.response.as_ref()
    }

    /// Bytes received after the head that have not been read yet.
    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }

    pub fn into_inner(self) -> (Box<dyn Transport>, Vec<u8>) {
        (self.transport, self.leftover)
    }
}
impl Session for Upgraded {
    fn status(&self) -> SessionStatus {
        self.transport.transport_status()
    }

    fn close(&mut self) {
        self.leftover.clear();
        self.transport.close_transport()
    }

    fn drive(&mut self) -> Result<DriveOutcome, HttpError> {
        self.transport.drive_transport()
    }
}
impl Publish for Upgraded {
    type PublishPayload<'a> = &'a [u8];

    fn publish<'a>(
        &mut self,
        payload: Self::PublishPayload<'a>,
    ) -> Result<PublishOutcome<Self::PublishPayload<'a>>, HttpError> {
        let wrote = self.transport.write_some(payload)?;
        if wrote == payload.len() {
            Ok(PublishOutcome::Published)
        } else {
            Ok(PublishOutcome::Incomplete(&payload[wrote..]))
        }
    }
}
impl Receive for Upgraded {
    type ReceivePayload<'a> = &'a [u8];

    fn receive<'a>(&'a mut self) -> Result<ReceiveOutcome<Self::ReceivePayload<'a>>, HttpError> {
        if !self.leftover.is_empty() {
            self.read_buf = std::mem::take(&mut self.leftover);
            return Ok(ReceiveOutcome::Payload(&self.read_buf));
        }
        self.read_buf.clear();
        match self.transport.read_some(&mut self.read_buf)? {
            0 => Ok(ReceiveOutcome::Idle),
            _ => Ok(ReceiveOutcome::Payload(&self.read_buf)),
        }
    }
}
impl Debug for Upgraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgraded")
            .field("transport", &self.transport)
            .field("leftover", &self.leftover.len())
            .finish()
    }
}
