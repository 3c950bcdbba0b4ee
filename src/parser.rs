//! Incremental message parsing and outbound message framing.
//!
//! A [`MessageParser`] tracks one inbound direction of a connection. Callers hand it the
//! unconsumed bytes of their read buffer and drop whatever it reports as consumed; a head is
//! only consumed once it is complete, so a partial head is re-parsed on the next call.

use std::marker::PhantomData;

use http::{Method, Version};

use crate::{
    codec::{encode_chunked, BodyDecoder, BodyFraming},
    error::HttpError,
    message::{
        parse_request_head, parse_response_head, Headers, RequestHeader, ResponseHeader,
        DEFAULT_MAX_HEADER_SIZE,
    },
};

/// Largest chunk emitted when a buffered body is sent chunked.
const FULL_BODY_CHUNK_SIZE: usize = 16 * 1024;

/// Inbound state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseState {
    /// Waiting for the first byte of a message
    Idle,
    StartLine,
    Headers,
    Body,
    MessageComplete,
    Failed,
}

/// Returned by [`MessageParser::parse`].
#[derive(Debug)]
pub enum ParseEvent<H> {
    /// A complete head, followed by a body of the given framing.
    Head(H, BodyFraming),
    /// Decoded body bytes
    Data(Vec<u8>),
    /// The message is complete, with trailers if the body was chunked and had any.
    Complete(Option<Headers>),
    /// More input is needed.
    Pending,
}

/// A head type the [`MessageParser`] can produce.
pub trait MessageHead: Sized {
    /// What, besides the head itself, determines body framing
    type Context;

    fn parse_head(buf: &[u8], max: usize) -> Result<Option<(Self, usize)>, HttpError>;

    fn body_framing(&self, context: &Self::Context) -> Result<BodyFraming, HttpError>;
}
impl MessageHead for RequestHeader {
    type Context = ();

    fn parse_head(buf: &[u8], max: usize) -> Result<Option<(Self, usize)>, HttpError> {
        parse_request_head(buf, max)
    }

    fn body_framing(&self, _: &()) -> Result<BodyFraming, HttpError> {
        self.framing()
    }
}
impl MessageHead for ResponseHeader {
    /// The method of the request being answered
    type Context = Method;

    fn parse_head(buf: &[u8], max: usize) -> Result<Option<(Self, usize)>, HttpError> {
        parse_response_head(buf, max)
    }

    fn body_framing(&self, method: &Method) -> Result<BodyFraming, HttpError> {
        self.framing(method)
    }
}

/// Parses a stream of messages of one direction.
#[derive(Debug)]
pub struct MessageParser<H> {
    state: ParseState,
    decoder: BodyDecoder,
    max_header_size: usize,
    _head: PhantomData<fn() -> H>,
}
pub type RequestParser = MessageParser<RequestHeader>;
pub type ResponseParser = MessageParser<ResponseHeader>;

impl<H: MessageHead> MessageParser<H> {
    pub fn new() -> Self {
        Self {
            state: ParseState::Idle,
            decoder: BodyDecoder::Empty,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            _head: PhantomData,
        }
    }

    pub fn with_max_header_size(mut self, max_header_size: usize) -> Self {
        self.max_header_size = max_header_size;
        self
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// True between the first byte of a message and its completion.
    pub fn is_mid_message(&self) -> bool {
        matches!(
            self.state,
            ParseState::StartLine | ParseState::Headers | ParseState::Body
        )
    }

    /// Parse from the front of `buf`, returning the bytes consumed and what was found.
    ///
    /// After [`ParseEvent::Complete`] the next call starts a new message.
    pub fn parse(
        &mut self,
        buf: &[u8],
        context: &H::Context,
    ) -> Result<(usize, ParseEvent<H>), HttpError> {
        match self.parse_inner(buf, context) {
            Ok(x) => Ok(x),
            Err(err) => {
                self.state = ParseState::Failed;
                Err(err)
            }
        }
    }

    fn parse_inner(
        &mut self,
        buf: &[u8],
        context: &H::Context,
    ) -> Result<(usize, ParseEvent<H>), HttpError> {
        match self.state {
            ParseState::Failed => Err(HttpError::protocol("parser failed on an earlier message")),
            ParseState::Body => self.parse_body(buf),
            ParseState::Idle | ParseState::MessageComplete => {
                self.state = ParseState::Idle;
                // empty lines between messages are tolerated
                let skip = buf
                    .iter()
                    .take_while(|x| **x == b'\r' || **x == b'\n')
                    .count();
                if skip == buf.len() {
                    return Ok((skip, ParseEvent::Pending));
                }
                self.state = ParseState::StartLine;
                let (consumed, event) = self.parse_head(&buf[skip..], context)?;
                Ok((skip + consumed, event))
            }
            ParseState::StartLine | ParseState::Headers => self.parse_head(buf, context),
        }
    }

    fn parse_head(
        &mut self,
        buf: &[u8],
        context: &H::Context,
    ) -> Result<(usize, ParseEvent<H>), HttpError> {
        match H::parse_head(buf, self.max_header_size)? {
            None => {
                if buf.contains(&b'\n') {
                    self.state = ParseState::Headers;
                }
                Ok((0, ParseEvent::Pending))
            }
            Some((head, len)) => {
                let framing = head.body_framing(context)?;
                self.decoder = BodyDecoder::new(framing);
                self.state = ParseState::Body;
                Ok((len, ParseEvent::Head(head, framing)))
            }
        }
    }

    fn parse_body(&mut self, buf: &[u8]) -> Result<(usize, ParseEvent<H>), HttpError> {
        let mut out = Vec::new();
        let decoded = self.decoder.feed(buf, &mut out)?;
        if !out.is_empty() {
            // completion is reported by the next call
            return Ok((decoded.consumed, ParseEvent::Data(out)));
        }
        if decoded.complete {
            self.state = ParseState::MessageComplete;
            return Ok((decoded.consumed, ParseEvent::Complete(self.decoder.take_trailers())));
        }
        Ok((decoded.consumed, ParseEvent::Pending))
    }

    /// Signal that the peer closed the connection, with `pending` the unconsumed buffered bytes.
    ///
    /// Returns the completion of a close-delimited body, `None` at a clean message boundary,
    /// or the error for a message cut short.
    pub fn eof(&mut self, pending: &[u8]) -> Result<Option<ParseEvent<H>>, HttpError> {
        match self.state {
            ParseState::Idle | ParseState::MessageComplete => {
                if pending.iter().all(|x| *x == b'\r' || *x == b'\n') {
                    Ok(None)
                } else {
                    self.state = ParseState::Failed;
                    Err(HttpError::ConnectionClosed)
                }
            }
            ParseState::StartLine | ParseState::Headers => {
                self.state = ParseState::Failed;
                Err(HttpError::ConnectionClosed)
            }
            ParseState::Body => match self.decoder.eof() {
                Ok(()) => {
                    self.state = ParseState::MessageComplete;
                    Ok(Some(ParseEvent::Complete(self.decoder.take_trailers())))
                }
                Err(err) => {
                    self.state = ParseState::Failed;
                    Err(err)
                }
            },
            ParseState::Failed => Ok(None),
        }
    }
}
impl<H: MessageHead> Default for MessageParser<H> {
    fn default() -> Self {
        Self::new()
    }
}

fn is_body_method(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

/// Set the framing headers of an outbound request and return its framing.
///
/// `body_len` is the length of a buffered body, or `None` for a streamed one.
pub fn frame_request(
    header: &mut RequestHeader,
    body_len: Option<u64>,
) -> Result<BodyFraming, HttpError> {
    if header.headers.contains("Transfer-Encoding") {
        header.headers.remove("Content-Length");
        return header.framing();
    }
    if let Some(declared) = crate::message::content_length(&header.headers)? {
        if let Some(len) = body_len.filter(|len| *len != declared) {
            return Err(HttpError::protocol(format!(
                "content-length {declared} does not match body of {len} bytes"
            )));
        }
        return header.framing();
    }
    match body_len {
        Some(0) => {
            if is_body_method(&header.method) {
                header.headers.insert("Content-Length", "0")?;
            }
            Ok(BodyFraming::Empty)
        }
        Some(len) => {
            header.headers.insert("Content-Length", &len.to_string())?;
            Ok(BodyFraming::FixedLength(len))
        }
        None if header.version == Version::HTTP_10 => Err(HttpError::protocol(
            "a streamed HTTP/1.0 request body needs a content-length",
        )),
        None => {
            header.headers.insert("Transfer-Encoding", "chunked")?;
            Ok(BodyFraming::Chunked)
        }
    }
}

/// Set the framing headers of an outbound response and return its framing.
///
/// `body_len` is the length of a buffered body, or `None` for a streamed one.
/// An HTTP/1.0 peer cannot receive chunks, so a streamed body is close-delimited instead.
pub fn frame_response(
    header: &mut ResponseHeader,
    body_len: Option<u64>,
    request_method: &Method,
    request_version: Version,
) -> Result<BodyFraming, HttpError> {
    if !header.has_body(request_method) {
        if *request_method == Method::HEAD && !header.headers.contains("Content-Length") {
            if let Some(len) = body_len.filter(|x| *x > 0) {
                header.headers.insert("Content-Length", &len.to_string())?;
            }
        }
        return Ok(BodyFraming::Empty);
    }
    let chunked_allowed = request_version != Version::HTTP_10;
    if header.headers.contains("Transfer-Encoding") {
        header.headers.remove("Content-Length");
        if chunked_allowed {
            return header.framing(request_method);
        }
        header.headers.remove("Transfer-Encoding");
        header.headers.insert("Connection", "close")?;
        return Ok(BodyFraming::CloseDelimited);
    }
    if let Some(declared) = crate::message::content_length(&header.headers)? {
        if let Some(len) = body_len.filter(|len| *len != declared) {
            return Err(HttpError::protocol(format!(
                "content-length {declared} does not match body of {len} bytes"
            )));
        }
        return header.framing(request_method);
    }
    match body_len {
        Some(len) => {
            header.headers.insert("Content-Length", &len.to_string())?;
            Ok(if len == 0 {
                BodyFraming::Empty
            } else {
                BodyFraming::FixedLength(len)
            })
        }
        None if chunked_allowed => {
            header.headers.insert("Transfer-Encoding", "chunked")?;
            Ok(BodyFraming::Chunked)
        }
        None => {
            header.headers.insert("Connection", "close")?;
            Ok(BodyFraming::CloseDelimited)
        }
    }
}

/// Append an encoded head followed by a buffered body in the given framing.
pub fn encode_message(
    head: &[u8],
    framing: BodyFraming,
    body: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), HttpError> {
    out.extend_from_slice(head);
    match framing {
        BodyFraming::Empty => {}
        BodyFraming::FixedLength(_) | BodyFraming::CloseDelimited => out.extend_from_slice(body),
        BodyFraming::Chunked => encode_chunked(body, FULL_BODY_CHUNK_SIZE, out)?,
    }
    Ok(())
}
