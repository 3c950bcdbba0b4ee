//! Framed [`Receive`] and [`Publish`] over a raw byte [`Transport`].
//!
//! [`FrameDuplex`] turns a byte stream into a stream of parsed frames using a [`DeserializeFrame`] and a
//! [`SerializeFrame`] implementation. This is how WebSocket messages are carried over the
//! [`crate::upgrade::Upgraded`] stream left behind by an HTTP upgrade.

use std::fmt::Debug;

use crate::{
    buffer::GrowableCircleBuf, error::HttpError, DriveOutcome, Flush, Publish, PublishOutcome,
    Receive, ReceiveOutcome, Session, SessionStatus, Transport,
};

/// # FrameDuplex
///
/// Encapsulates a bi-directional byte [`Transport`], providing framing using the given [`SerializeFrame`] and [`DeserializeFrame`] traits.
///
/// ## Drive
///
/// The `drive` function must be called regularly.
/// It is responsible for writing bytes from the internal write buffer to the underlying [`Transport`].
///
/// ## Publish Buffering
///
/// Frames passed into `publish` are serialized into an internal circular buffer.
/// If the entire frame does not fit in the remaining space, none of it is copied and [`PublishOutcome::Incomplete`]
/// hands the frame back to be retried later. A frame larger than the whole buffer is accepted only when the buffer is empty.
///
/// ## Receive Buffering
///
/// Each call to receive first checks whether the read buffer already holds a full frame.
/// The underlying transport is only read when it does not, so the buffer never grows past one frame plus one read.
pub struct FrameDuplex<S, DF, SF> {
    session: S,
    deserialize_frame: DF,
    serialize_frame: SF,
    write_buffer: GrowableCircleBuf,
    read_buffer: Vec<u8>,
    read_advance: usize,
    eof: bool,
}
impl<S, DF, SF> FrameDuplex<S, DF, SF>
where
    S: Transport + 'static,
    DF: DeserializeFrame + 'static,
    SF: SerializeFrame + 'static,
{
    /// Create a new [`FrameDuplex`]
    ///
    /// # Parameters
    /// - `session`: The underlying byte [`Transport`]
    /// - `deserialize_frame`: Converts received bytes to frames
    /// - `serialize_frame`: Converts published frames to bytes
    /// - `write_buffer_capacity`: The capacity, **in bytes**, of the circular buffer that holds serialized frames
    pub fn new(
        session: S,
        deserialize_frame: DF,
        serialize_frame: SF,
        write_buffer_capacity: usize,
    ) -> Result<Self, HttpError> {
        Ok(Self {
            session,
            deserialize_frame,
            serialize_frame,
            write_buffer: GrowableCircleBuf::new(write_buffer_capacity)?,
            read_buffer: Vec::new(),
            read_advance: 0,
            eof: false,
        })
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Serialized bytes waiting to be written.
    pub fn pending_write_len(&self) -> usize {
        self.write_buffer.len()
    }

    fn compact_read_buffer(&mut self) {
        if self.read_advance != 0 {
            self.read_buffer.drain(..self.read_advance);
            self.read_advance = 0;
        }
    }
}
impl<S, DF, SF> Session for FrameDuplex<S, DF, SF>
where
    S: Transport + 'static,
    DF: DeserializeFrame + 'static,
    SF: SerializeFrame + 'static,
{
    fn status(&self) -> SessionStatus {
        self.session.transport_status()
    }

    fn close(&mut self) {
        self.write_buffer.clear();
        self.session.close_transport()
    }

    fn drive(&mut self) -> Result<DriveOutcome, HttpError> {
        let mut outcome = self.session.drive_transport()?;
        if self.write_buffer.is_empty() {
            return Ok(outcome);
        }
        let wrote_len = self.session.write_some(self.write_buffer.peek_read())?;
        self.write_buffer.advance_read(wrote_len)?;
        if wrote_len > 0 {
            outcome = DriveOutcome::Active;
        }
        Ok(outcome)
    }
}
impl<S, DF, SF> Publish for FrameDuplex<S, DF, SF>
where
    S: Transport + 'static,
    DF: DeserializeFrame + 'static,
    SF: SerializeFrame + 'static,
{
    type PublishPayload<'a> = SF::SerializedFrame<'a>;

    fn publish<'a>(
        &mut self,
        frame: Self::PublishPayload<'a>,
    ) -> Result<PublishOutcome<Self::PublishPayload<'a>>, HttpError> {
        if self.session.transport_status() != SessionStatus::Established {
            return Err(HttpError::ConnectionClosed);
        }
        self.serialize_frame
            .serialize_frame(frame, &mut self.write_buffer)
    }
}
impl<S, DF, SF> Flush for FrameDuplex<S, DF, SF>
where
    S: Transport + 'static,
    DF: DeserializeFrame + 'static,
    SF: SerializeFrame + 'static,
{
    /// Spin on `drive` until the write buffer is empty.
    fn flush(&mut self) -> Result<(), HttpError> {
        while !self.write_buffer.is_empty() {
            self.drive()?;
        }
        Ok(())
    }
}
impl<S, DF, SF> Receive for FrameDuplex<S, DF, SF>
where
    S: Transport + 'static,
    DF: DeserializeFrame + 'static,
    SF: SerializeFrame + 'static,
{
    type ReceivePayload<'a> = DF::DeserializedFrame<'a>;

    fn receive<'a>(&'a mut self) -> Result<ReceiveOutcome<Self::ReceivePayload<'a>>, HttpError> {
        self.compact_read_buffer();
        // deserialize before reading more, so a slow consumer does not grow the buffer forever
        if self
            .deserialize_frame
            .check_deserialize_frame(&self.read_buffer, self.eof)?
        {
            let de = self
                .deserialize_frame
                .deserialize_frame(&self.read_buffer)?;
            self.read_advance = de.size;
            return Ok(ReceiveOutcome::Payload(de.frame));
        }
        if self.eof {
            return Err(HttpError::ConnectionClosed);
        }
        match self.session.read_some(&mut self.read_buffer) {
            Ok(0) => Ok(ReceiveOutcome::Idle),
            Ok(_) => Ok(ReceiveOutcome::Buffered),
            Err(HttpError::ConnectionClosed) if !self.read_buffer.is_empty() => {
                // give the deserializer one last look at a trailing partial frame
                self.eof = true;
                Ok(ReceiveOutcome::Buffered)
            }
            Err(err) => Err(err),
        }
    }
}
impl<S, DF, SF> Debug for FrameDuplex<S, DF, SF>
where
    S: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDuplex")
            .field("session", &self.session)
            .field("buffered_read", &(self.read_buffer.len() - self.read_advance))
            .field("buffered_write", &self.write_buffer.len())
            .finish()
    }
}

/// Deserialize frames from buffer slices.
pub trait DeserializeFrame {
    /// Type returned by `deserialize_frame`
    type DeserializedFrame<'a>
    where
        Self: 'a;

    /// Returns true if the given buffer contains a full frame starting at offset 0.
    ///
    /// This is always called before `deserialize_frame(..)`, which is only called after `Ok(true)`.
    /// It is called repeatedly with the same growing data until `Ok(true)` or an `Err` is returned,
    /// so partially parsed frame information may be cached between calls.
    fn check_deserialize_frame(&mut self, data: &[u8], eof: bool) -> Result<bool, HttpError>;

    /// Deserialize the frame at the start of `data`, returning it along with its serialized length.
    ///
    /// The data may contain bytes beyond the frame. The returned size advances the read buffer.
    fn deserialize_frame<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Result<SizedFrame<Self::DeserializedFrame<'a>>, HttpError>;
}

/// Serialize frames into a [`GrowableCircleBuf`].
pub trait SerializeFrame {
    /// Type accepted by `serialize_frame`
    type SerializedFrame<'a>
    where
        Self: 'a;

    /// Serialize and write the given frame to the buffer.
    ///
    /// Returns [`PublishOutcome::Incomplete`] with the frame when the buffer cannot take all of it.
    fn serialize_frame<'a>(
        &mut self,
        frame: Self::SerializedFrame<'a>,
        buffer: &mut GrowableCircleBuf,
    ) -> Result<PublishOutcome<Self::SerializedFrame<'a>>, HttpError>;
}

/// A deserialized frame along with the number of bytes it occupied.
pub struct SizedFrame<T> {
    pub frame: T,
    pub size: usize,
}
impl<T> SizedFrame<T> {
    pub fn new(frame: T, size: usize) -> Self {
        Self { frame, size }
    }
}

#[cfg(test)]
mod test {
    use super::{DeserializeFrame, FrameDuplex, SerializeFrame, SizedFrame};
    use crate::{
        buffer::GrowableCircleBuf, error::HttpError, mock::MockTransport, Publish,
        PublishOutcome, Receive, ReceiveOutcome, Session,
    };

    /// Newline-delimited lines, enough to exercise the duplex.
    struct Lines;
    impl DeserializeFrame for Lines {
        type DeserializedFrame<'a> = &'a str;

        fn check_deserialize_frame(&mut self, data: &[u8], _eof: bool) -> Result<bool, HttpError> {
            Ok(data.contains(&b'\n'))
        }

        fn deserialize_frame<'a>(
            &'a mut self,
            data: &'a [u8],
        ) -> Result<SizedFrame<Self::DeserializedFrame<'a>>, HttpError> {
            let end = data.iter().position(|x| *x == b'\n').unwrap();
            let line = std::str::from_utf8(&data[..end])
                .map_err(|err| HttpError::protocol(err.to_string()))?;
            Ok(SizedFrame::new(line, end + 1))
        }
    }
    impl SerializeFrame for Lines {
        type SerializedFrame<'a> = &'a str;

        fn serialize_frame<'a>(
            &mut self,
            frame: Self::SerializedFrame<'a>,
            buffer: &mut GrowableCircleBuf,
        ) -> Result<PublishOutcome<Self::SerializedFrame<'a>>, HttpError> {
            if buffer.try_write(&[frame.as_bytes(), b"\n"])? {
                Ok(PublishOutcome::Published)
            } else {
                Ok(PublishOutcome::Incomplete(frame))
            }
        }
    }

    fn receive_line(duplex: &mut FrameDuplex<MockTransport, Lines, Lines>) -> String {
        for _ in 0..100 {
            duplex.drive().unwrap();
            if let ReceiveOutcome::Payload(line) = duplex.receive().unwrap() {
                return line.to_owned();
            }
        }
        panic!("no line received");
    }

    #[test]
    fn test_duplex_echo() {
        let (a, b) = MockTransport::pair();
        let mut client = FrameDuplex::new(a, Lines, Lines, 1024).unwrap();
        let mut server = FrameDuplex::new(b, Lines, Lines, 1024).unwrap();

        assert!(matches!(client.publish("test").unwrap(), PublishOutcome::Published));
        assert!(matches!(client.publish("12345").unwrap(), PublishOutcome::Published));
        client.drive().unwrap();

        assert_eq!(receive_line(&mut server), "test");
        assert_eq!(receive_line(&mut server), "12345");

        server.publish("ok").unwrap();
        server.drive().unwrap();
        assert_eq!(receive_line(&mut client), "ok");
    }

    #[test]
    fn test_full_buffer_returns_frame() {
        let (a, _b) = MockTransport::pair();
        let mut duplex = FrameDuplex::new(a, Lines, Lines, 8).unwrap();
        assert!(matches!(duplex.publish("abc").unwrap(), PublishOutcome::Published));
        match duplex.publish("defghij").unwrap() {
            PublishOutcome::Incomplete(frame) => assert_eq!(frame, "defghij"),
            PublishOutcome::Published => panic!("expected backpressure"),
        }
        duplex.drive().unwrap();
        assert_eq!(duplex.pending_write_len(), 0);
        assert!(matches!(duplex.publish("defghij").unwrap(), PublishOutcome::Published));
    }

    #[test]
    fn test_publish_after_close_fails() {
        let (a, _b) = MockTransport::pair();
        let mut duplex = FrameDuplex::new(a, Lines, Lines, 64).unwrap();
        duplex.close();
        assert!(matches!(
            duplex.publish("late").unwrap_err(),
            HttpError::ConnectionClosed
        ));
    }
}
