//! WebSocket sessions over an upgraded HTTP connection.
//!
//! The opening handshake runs through the HTTP engine: a client sends an `Upgrade: websocket`
//! request on an [`HttpClientConnection`], and a server answers one with
//! [`crate::server::Exchange::upgrade_websocket`]. The [`Upgraded`] stream left behind is then
//! framed by a [`FrameDuplex`] using tungstenite's [`FrameHeader`] coding.
//!
//! Clients mask every frame they send, and servers require masked frames from clients.
//! Fragmented messages are reassembled, and control frames interleaved with fragments are
//! delivered as they arrive. Pings are not answered automatically.

use std::{borrow::Cow, fmt::Debug, io::Cursor};

use http::{Method, StatusCode};
use tungstenite::{
    handshake::{client::generate_key, derive_accept_key},
    protocol::{
        frame::{
            coding::{Control, Data, OpCode},
            FrameHeader,
        },
        CloseFrame,
    },
};

use crate::{
    body::Body,
    buffer::GrowableCircleBuf,
    client::HttpClientConnection,
    config::ClientConfig,
    error::HttpError,
    exchange::FutureResponse,
    frame::{DeserializeFrame, FrameDuplex, SerializeFrame, SizedFrame},
    log::debug,
    message::{Request, RequestHeader, ResponseHeader},
    upgrade::Upgraded,
    DriveOutcome, Flush, Publish, PublishOutcome, Receive, ReceiveOutcome, Session, SessionStatus,
    Transport,
};

const DEFAULT_WRITE_BUFFER_CAPACITY: usize = 4096;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

fn ws_error(err: tungstenite::Error) -> HttpError {
    HttpError::protocol(format!("websocket: {err}"))
}

fn handshake_error(message: &str) -> HttpError {
    HttpError::Upgrade(format!("websocket handshake: {message}"))
}

/// The `101 Switching Protocols` answer to a WebSocket opening request.
pub fn handshake_response(request: &RequestHeader) -> Result<ResponseHeader, HttpError> {
    if request.method != Method::GET {
        return Err(handshake_error("method must be GET"));
    }
    if !request.headers.has_token("Upgrade", "websocket")
        || !request.headers.has_token("Connection", "upgrade")
    {
        return Err(handshake_error("missing Upgrade: websocket"));
    }
    if request.headers.get("Sec-WebSocket-Version").map(str::trim) != Some("13") {
        return Err(handshake_error("unsupported Sec-WebSocket-Version"));
    }
    let key = request
        .headers
        .get("Sec-WebSocket-Key")
        .ok_or_else(|| handshake_error("missing Sec-WebSocket-Key"))?;
    let mut header = ResponseHeader::new(StatusCode::SWITCHING_PROTOCOLS);
    header.headers.insert("Upgrade", "websocket")?;
    header.headers.insert("Connection", "Upgrade")?;
    header
        .headers
        .insert("Sec-WebSocket-Accept", &derive_accept_key(key.trim().as_bytes()))?;
    Ok(header)
}

/// An opening request for `target` along with the key its answer must acknowledge.
pub fn client_request(target: &str) -> Result<(RequestHeader, String), HttpError> {
    let key = generate_key();
    let mut header = RequestHeader::new(Method::GET, target);
    header.headers.insert("Upgrade", "websocket")?;
    header.headers.insert("Connection", "Upgrade")?;
    header.headers.insert("Sec-WebSocket-Key", &key)?;
    header.headers.insert("Sec-WebSocket-Version", "13")?;
    Ok((header, key))
}

/// Check a server's answer to an opening request sent with `key`.
pub fn verify_handshake(response: &ResponseHeader, key: &str) -> Result<(), HttpError> {
    if response.status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(handshake_error(&format!("server answered {}", response.status)));
    }
    let expected = derive_accept_key(key.as_bytes());
    match response.headers.get("Sec-WebSocket-Accept") {
        Some(accept) if accept.trim() == expected => Ok(()),
        _ => Err(handshake_error("invalid Sec-WebSocket-Accept")),
    }
}

/// A complete WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage<'a> {
    Text(Cow<'a, str>),
    Binary(Cow<'a, [u8]>),
    Ping(Cow<'a, [u8]>),
    Pong(Cow<'a, [u8]>),
    Close(Option<CloseFrame<'a>>),
}
impl<'a> WsMessage<'a> {
    pub fn text(text: impl Into<Cow<'a, str>>) -> Self {
        Self::Text(text.into())
    }

    pub fn binary(data: impl Into<Cow<'a, [u8]>>) -> Self {
        Self::Binary(data.into())
    }

    pub fn into_owned(self) -> WsMessage<'static> {
        match self {
            Self::Text(x) => WsMessage::Text(Cow::Owned(x.into_owned())),
            Self::Binary(x) => WsMessage::Binary(Cow::Owned(x.into_owned())),
            Self::Ping(x) => WsMessage::Ping(Cow::Owned(x.into_owned())),
            Self::Pong(x) => WsMessage::Pong(Cow::Owned(x.into_owned())),
            Self::Close(x) => WsMessage::Close(x.map(|x| x.into_owned())),
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

fn apply_mask(payload: &[u8], mask: Option<[u8; 4]>) -> Cow<'_, [u8]> {
    match mask {
        None => Cow::Borrowed(payload),
        Some(mask) => Cow::Owned(
            payload
                .iter()
                .enumerate()
                .map(|(i, x)| x ^ mask[i % 4])
                .collect(),
        ),
    }
}

fn data_message(opcode: Data, payload: Cow<'_, [u8]>) -> Result<WsMessage<'_>, HttpError> {
    let invalid_text = || HttpError::protocol("websocket text message is not valid utf-8");
    match opcode {
        Data::Text => match payload {
            Cow::Borrowed(x) => std::str::from_utf8(x)
                .map(|x| WsMessage::Text(Cow::Borrowed(x)))
                .map_err(|_| invalid_text()),
            Cow::Owned(x) => String::from_utf8(x)
                .map(|x| WsMessage::Text(Cow::Owned(x)))
                .map_err(|_| invalid_text()),
        },
        Data::Binary => Ok(WsMessage::Binary(payload)),
        opcode => Err(HttpError::protocol(format!(
            "unexpected websocket opcode {opcode:?}"
        ))),
    }
}

fn control_message(control: Control, payload: Cow<'_, [u8]>) -> Result<WsMessage<'_>, HttpError> {
    match control {
        Control::Ping => Ok(WsMessage::Ping(payload)),
        Control::Pong => Ok(WsMessage::Pong(payload)),
        Control::Close => parse_close(&payload).map(WsMessage::Close),
        control => Err(HttpError::protocol(format!(
            "unexpected websocket opcode {control:?}"
        ))),
    }
}

fn parse_close(payload: &[u8]) -> Result<Option<CloseFrame<'static>>, HttpError> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(HttpError::protocol("websocket close frame with a 1 byte payload")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]).into();
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| HttpError::protocol("websocket close reason is not valid utf-8"))?;
            Ok(Some(CloseFrame {
                code,
                reason: Cow::Owned(reason.to_owned()),
            }))
        }
    }
}

fn close_payload(close: &Option<CloseFrame<'_>>) -> Vec<u8> {
    let mut payload = Vec::new();
    if let Some(x) = close {
        payload.extend_from_slice(&u16::from(x.code).to_be_bytes());
        payload.extend_from_slice(x.reason.as_bytes());
    }
    payload
}

/// Deserializes [`WsMessage`]s, reassembling fragmented data frames.
pub struct WsFrameReader {
    expect_masked: bool,
    max_message_size: usize,
    /// Opcode and payload of a message still missing its final fragment
    fragments: Option<(Data, Vec<u8>)>,
}
impl WsFrameReader {
    /// A reader for the server side, which requires masked frames, or the client side, which forbids them.
    pub fn new(expect_masked: bool) -> Self {
        Self {
            expect_masked,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            fragments: None,
        }
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    fn check_header(&self, header: &FrameHeader, len: u64) -> Result<(), HttpError> {
        if header.mask.is_some() != self.expect_masked {
            return Err(HttpError::protocol(if self.expect_masked {
                "unmasked websocket frame from client"
            } else {
                "masked websocket frame from server"
            }));
        }
        let buffered = self.fragments.as_ref().map(|x| x.1.len()).unwrap_or(0) as u64;
        if buffered + len > self.max_message_size as u64 {
            return Err(HttpError::protocol(format!(
                "websocket message exceeds {} bytes",
                self.max_message_size
            )));
        }
        Ok(())
    }
}
impl Default for WsFrameReader {
    fn default() -> Self {
        Self::new(false)
    }
}
impl DeserializeFrame for WsFrameReader {
    type DeserializedFrame<'a> = WsMessage<'a>;

    fn check_deserialize_frame(&mut self, data: &[u8], _eof: bool) -> Result<bool, HttpError> {
        let mut cursor = Cursor::new(data);
        loop {
            let Some((header, len)) = FrameHeader::parse(&mut cursor).map_err(ws_error)? else {
                return Ok(false);
            };
            self.check_header(&header, len)?;
            let end = cursor.position() + len;
            if end > data.len() as u64 {
                return Ok(false);
            }
            if header.is_final || matches!(header.opcode, OpCode::Control(_)) {
                return Ok(true);
            }
            cursor.set_position(end);
        }
    }

    fn deserialize_frame<'a>(
        &'a mut self,
        data: &'a [u8],
    ) -> Result<SizedFrame<Self::DeserializedFrame<'a>>, HttpError> {
        let mut cursor = Cursor::new(data);
        loop {
            let Some((header, len)) = FrameHeader::parse(&mut cursor).map_err(ws_error)? else {
                return Err(HttpError::protocol("incomplete websocket frame"));
            };
            let start = cursor.position() as usize;
            let end = start.saturating_add(len as usize);
            if end > data.len() {
                return Err(HttpError::protocol("incomplete websocket frame"));
            }
            cursor.set_position(end as u64);
            let payload = apply_mask(&data[start..end], header.mask);
            match header.opcode {
                OpCode::Control(control) => {
                    if !header.is_final {
                        return Err(HttpError::protocol("fragmented websocket control frame"));
                    }
                    return Ok(SizedFrame::new(control_message(control, payload)?, end));
                }
                OpCode::Data(Data::Continue) => {
                    let Some((_, buffered)) = self.fragments.as_mut() else {
                        return Err(HttpError::protocol("websocket continuation without a message"));
                    };
                    buffered.extend_from_slice(&payload);
                    if header.is_final {
                        if let Some((opcode, buffered)) = self.fragments.take() {
                            return Ok(SizedFrame::new(
                                data_message(opcode, Cow::Owned(buffered))?,
                                end,
                            ));
                        }
                    }
                }
                OpCode::Data(opcode) => {
                    if self.fragments.is_some() {
                        return Err(HttpError::protocol(
                            "websocket message started before the previous one finished",
                        ));
                    }
                    if header.is_final {
                        return Ok(SizedFrame::new(data_message(opcode, payload)?, end));
                    }
                    self.fragments = Some((opcode, payload.into_owned()));
                }
            }
        }
    }
}

/// Serializes [`WsMessage`]s as single unfragmented frames.
pub struct WsFrameWriter {
    mask: bool,
}
impl WsFrameWriter {
    /// A writer that masks frames, as clients must, or leaves them unmasked, as servers must.
    pub fn new(mask: bool) -> Self {
        Self { mask }
    }
}
impl SerializeFrame for WsFrameWriter {
    type SerializedFrame<'a> = WsMessage<'a>;

    fn serialize_frame<'a>(
        &mut self,
        frame: Self::SerializedFrame<'a>,
        buffer: &mut GrowableCircleBuf,
    ) -> Result<PublishOutcome<Self::SerializedFrame<'a>>, HttpError> {
        let written = {
            let (opcode, payload): (OpCode, Cow<'_, [u8]>) = match &frame {
                WsMessage::Text(x) => (OpCode::Data(Data::Text), Cow::Borrowed(x.as_bytes())),
                WsMessage::Binary(x) => (OpCode::Data(Data::Binary), Cow::Borrowed(x.as_ref())),
                WsMessage::Ping(x) => (OpCode::Control(Control::Ping), Cow::Borrowed(x.as_ref())),
                WsMessage::Pong(x) => (OpCode::Control(Control::Pong), Cow::Borrowed(x.as_ref())),
                WsMessage::Close(x) => (OpCode::Control(Control::Close), Cow::Owned(close_payload(x))),
            };
            if matches!(opcode, OpCode::Control(_)) && payload.len() > 125 {
                return Err(HttpError::protocol("websocket control frame payload exceeds 125 bytes"));
            }
            let mut header = FrameHeader::default();
            header.is_final = true;
            header.opcode = opcode;
            header.mask = self.mask.then(rand::random::<[u8; 4]>);
            let mut head = Vec::with_capacity(14);
            header
                .format(payload.len() as u64, &mut head)
                .map_err(ws_error)?;
            let payload = match header.mask {
                Some(mask) => Cow::Owned(apply_mask(&payload, Some(mask)).into_owned()),
                None => payload,
            };
            buffer.try_write(&[&head, &payload])?
        };
        if written {
            Ok(PublishOutcome::Published)
        } else {
            Ok(PublishOutcome::Incomplete(frame))
        }
    }
}

/// A WebSocket framed over an [`Upgraded`] stream.
pub type WsDuplex = FrameDuplex<Upgraded, WsFrameReader, WsFrameWriter>;

/// A client opening handshake in progress.
trait Handshake: Send {
    fn drive(&mut self) -> Result<(DriveOutcome, Option<Upgraded>), HttpError>;

    fn close(&mut self);
}

struct ClientHandshake<S> {
    conn: Option<HttpClientConnection<S>>,
    future: FutureResponse,
    key: String,
}
impl<S: Transport + 'static> Handshake for ClientHandshake<S> {
    fn drive(&mut self) -> Result<(DriveOutcome, Option<Upgraded>), HttpError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(HttpError::ConnectionClosed);
        };
        let outcome = conn.drive()?;
        let Some(result) = self.future.try_get() else {
            return Ok((outcome, None));
        };
        verify_handshake(result?.header(), &self.key)?;
        match self.conn.take() {
            Some(conn) => Ok((DriveOutcome::Active, Some(conn.into_upgraded()?))),
            None => Err(HttpError::ConnectionClosed),
        }
    }

    fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
    }
}

enum State {
    Handshaking(Box<dyn Handshake>),
    Open(WsDuplex),
    Closed,
}

/// A WebSocket connection, publishing and receiving whole [`WsMessage`]s.
///
/// A client session starts in [`SessionStatus::Establishing`] until its opening handshake completes
/// while driven. Messages published during the handshake are handed back as [`PublishOutcome::Incomplete`].
pub struct WebSocketSession {
    state: State,
    response: Option<ResponseHeader>,
    write_buffer_capacity: usize,
}
impl WebSocketSession {
    /// Wrap the stream of a connection that already completed a server-side handshake.
    pub fn accept(upgraded: Upgraded) -> Result<Self, HttpError> {
        Self::open(upgraded, true, DEFAULT_WRITE_BUFFER_CAPACITY)
    }

    /// Wrap an upgraded stream, as the server or as the client.
    pub fn open(upgraded: Upgraded, server: bool, write_buffer_capacity: usize) -> Result<Self, HttpError> {
        let response = upgraded.response().cloned();
        let duplex = FrameDuplex::new(
            upgraded,
            WsFrameReader::new(server),
            WsFrameWriter::new(!server),
            write_buffer_capacity,
        )?;
        Ok(Self {
            state: State::Open(duplex),
            response,
            write_buffer_capacity,
        })
    }

    /// Start a client handshake for `target` over any transport.
    pub fn client<S: Transport + 'static>(
        transport: S,
        host: &str,
        target: &str,
        config: &ClientConfig,
    ) -> Result<Self, HttpError> {
        let conn = HttpClientConnection::new(transport, config)?.with_host(host);
        Self::handshake(conn, target, config.write_buffer_capacity)
    }

    /// Connect to a `ws://` or `wss://` URL. The handshake completes while the session is driven.
    #[cfg(feature = "tcp")]
    pub fn connect(url: &str) -> Result<Self, HttpError> {
        let uri = url
            .parse::<http::Uri>()
            .map_err(|e| HttpError::protocol(format!("invalid url {url:?}: {e}")))?;
        let tls = match uri.scheme_str() {
            Some("ws") | Some("http") => false,
            Some("wss") | Some("https") => true,
            _ => return Err(HttpError::protocol(format!("{url} is not a websocket url"))),
        };
        let host = uri
            .host()
            .ok_or_else(|| HttpError::protocol(format!("{url} has no host")))?;
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let target = uri.path_and_query().map(|x| x.as_str()).unwrap_or("/");
        let config = ClientConfig::default();
        let conn = HttpClientConnection::connect_with_config(host, port, tls, &config)?;
        Self::handshake(conn, target, config.write_buffer_capacity)
    }

    fn handshake<S: Transport + 'static>(
        mut conn: HttpClientConnection<S>,
        target: &str,
        write_buffer_capacity: usize,
    ) -> Result<Self, HttpError> {
        let (header, key) = client_request(if target.is_empty() { "/" } else { target })?;
        let future = conn.send_future(Request::from_parts(header, Body::Empty))?;
        Ok(Self {
            state: State::Handshaking(Box::new(ClientHandshake {
                conn: Some(conn),
                future,
                key,
            })),
            response: None,
            write_buffer_capacity,
        })
    }

    /// The `101` response that opened the session.
    pub fn response(&self) -> Option<&ResponseHeader> {
        self.response.as_ref()
    }
}
impl Session for WebSocketSession {
    fn status(&self) -> SessionStatus {
        match &self.state {
            State::Handshaking(_) => SessionStatus::Establishing,
            State::Open(x) => x.status(),
            State::Closed => SessionStatus::Terminated,
        }
    }

    fn close(&mut self) {
        match &mut self.state {
            State::Handshaking(x) => x.close(),
            State::Open(x) => x.close(),
            State::Closed => {}
        }
        self.state = State::Closed;
    }

    fn drive(&mut self) -> Result<DriveOutcome, HttpError> {
        let result = match &mut self.state {
            State::Open(x) => return x.drive(),
            State::Closed => return Err(HttpError::ConnectionClosed),
            State::Handshaking(x) => x.drive(),
        };
        match result {
            Ok((outcome, None)) => Ok(outcome),
            Ok((_, Some(upgraded))) => {
                debug!("websocket handshake complete");
                self.response = upgraded.response().cloned();
                self.state = State::Open(FrameDuplex::new(
                    upgraded,
                    WsFrameReader::new(false),
                    WsFrameWriter::new(true),
                    self.write_buffer_capacity,
                )?);
                Ok(DriveOutcome::Active)
            }
            Err(err) => {
                debug!("websocket handshake failed: {err}");
                self.close();
                Err(err)
            }
        }
    }
}
impl Publish for WebSocketSession {
    type PublishPayload<'a> = WsMessage<'a>;

    fn publish<'a>(
        &mut self,
        payload: Self::PublishPayload<'a>,
    ) -> Result<PublishOutcome<Self::PublishPayload<'a>>, HttpError> {
        match &mut self.state {
            State::Open(x) => x.publish(payload),
            State::Handshaking(_) => Ok(PublishOutcome::Incomplete(payload)),
            State::Closed => Err(HttpError::ConnectionClosed),
        }
    }
}
impl Receive for WebSocketSession {
    type ReceivePayload<'a> = WsMessage<'a>;

    fn receive<'a>(&'a mut self) -> Result<ReceiveOutcome<Self::ReceivePayload<'a>>, HttpError> {
        match &mut self.state {
            State::Open(x) => x.receive(),
            State::Handshaking(_) => Ok(ReceiveOutcome::Idle),
            State::Closed => Err(HttpError::ConnectionClosed),
        }
    }
}
impl Flush for WebSocketSession {
    /// Drive the handshake if needed, then spin until every published message is written.
    fn flush(&mut self) -> Result<(), HttpError> {
        loop {
            match &mut self.state {
                State::Open(x) => return x.flush(),
                State::Closed => return Err(HttpError::ConnectionClosed),
                State::Handshaking(_) => {
                    self.drive()?;
                }
            }
        }
    }
}
impl Debug for WebSocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Handshaking(_) => "handshaking",
            State::Open(_) => "open",
            State::Closed => "closed",
        };
        f.debug_struct("WebSocketSession")
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::{
        borrow::Cow,
        sync::{Arc, Mutex},
    };

    use http::{Method, StatusCode};

    use super::{
        client_request, handshake_response, verify_handshake, WebSocketSession, WsFrameReader,
        WsFrameWriter, WsMessage,
    };
    use crate::{
        config::{ClientConfig, ServerConfig},
        frame::{DeserializeFrame, FrameDuplex},
        handler::handler_fn,
        message::RequestHeader,
        mock::MockTransport,
        server::ServerConnection,
        Publish, PublishOutcome, Receive, ReceiveOutcome, Session, SessionStatus,
    };

    fn read_all(reader: &mut WsFrameReader, mut data: &[u8]) -> Vec<WsMessage<'static>> {
        let mut messages = Vec::new();
        while reader.check_deserialize_frame(data, false).unwrap() {
            let sized = reader.deserialize_frame(data).unwrap();
            let size = sized.size;
            messages.push(sized.frame.into_owned());
            data = &data[size..];
        }
        messages
    }

    #[test]
    fn test_handshake_accept_key() {
        let mut request = RequestHeader::new(Method::GET, "/chat");
        request.headers.insert("Upgrade", "websocket").unwrap();
        request.headers.insert("Connection", "keep-alive, Upgrade").unwrap();
        request.headers.insert("Sec-WebSocket-Version", "13").unwrap();
        request
            .headers
            .insert("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .unwrap();
        let response = handshake_response(&request).unwrap();
        assert_eq!(response.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(
            response.headers.get("Sec-WebSocket-Accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
        assert!(verify_handshake(&response, "dGhlIHNhbXBsZSBub25jZQ==").is_ok());
        assert!(verify_handshake(&response, "another key").is_err());

        request.headers.remove("Upgrade");
        assert!(handshake_response(&request).is_err());

        let (client, key) = client_request("/chat").unwrap();
        assert_eq!(client.headers.get("Sec-WebSocket-Key"), Some(key.as_str()));
        assert!(handshake_response(&client).is_ok());
    }

    #[test]
    fn test_fragments_reassembled_around_ping() {
        let mut reader = WsFrameReader::new(false);
        let data = [
            0x01, 0x03, b'h', b'e', b'l', // text, not final
            0x89, 0x00, // ping
            0x80, 0x02, b'l', b'o', // final continuation
        ];
        assert!(!reader.check_deserialize_frame(&data[..5], false).unwrap());
        assert_eq!(
            read_all(&mut reader, &data),
            vec![WsMessage::Ping(Cow::Borrowed(&[])), WsMessage::text("hello")]
        );
    }

    #[test]
    fn test_mask_direction_is_enforced() {
        let unmasked = [0x81, 0x01, b'x'];
        let mut server_side = WsFrameReader::new(true);
        assert!(server_side.check_deserialize_frame(&unmasked, false).is_err());

        let masked = [0x81, 0x81, 1, 2, 3, 4, b'x' ^ 1];
        assert_eq!(read_all(&mut server_side, &masked), vec![WsMessage::text("x")]);
        let mut client_side = WsFrameReader::new(false);
        assert!(client_side.check_deserialize_frame(&masked, false).is_err());
    }

    #[test]
    fn test_client_frames_are_masked_on_the_wire() {
        let (transport, handle) = MockTransport::new();
        let mut duplex = FrameDuplex::new(
            transport,
            WsFrameReader::new(false),
            WsFrameWriter::new(true),
            1024,
        )
        .unwrap();
        duplex.publish(WsMessage::text("hi")).unwrap();
        duplex.drive().unwrap();
        let written = handle.take_written();
        assert_eq!(written.len(), 2 + 4 + 2);
        assert_eq!(written[0], 0x81);
        assert_eq!(written[1], 0x80 | 2);
        let mut server_side = WsFrameReader::new(true);
        assert_eq!(read_all(&mut server_side, &written), vec![WsMessage::text("hi")]);
    }

    #[test]
    fn test_handshake_and_echo_through_server_connection() {
        let (client_transport, server_transport) = MockTransport::pair();
        let opened: Arc<Mutex<Option<WebSocketSession>>> = Arc::new(Mutex::new(None));
        let captured = Arc::clone(&opened);
        let handler = handler_fn(move |exchange| {
            let captured = Arc::clone(&captured);
            exchange.upgrade_websocket(move |session| *captured.lock().unwrap() = Some(session))
        });
        let mut server =
            ServerConnection::new(server_transport, Arc::new(handler), &ServerConfig::default())
                .unwrap();
        let mut client =
            WebSocketSession::client(client_transport, "localhost", "/ws", &ClientConfig::default())
                .unwrap();
        assert_eq!(client.status(), SessionStatus::Establishing);
        assert!(matches!(
            client.publish(WsMessage::text("early")).unwrap(),
            PublishOutcome::Incomplete(_)
        ));

        for _ in 0..50 {
            let _ = client.drive();
            let _ = server.drive();
            if client.status() == SessionStatus::Established && opened.lock().unwrap().is_some() {
                break;
            }
        }
        assert_eq!(client.status(), SessionStatus::Established);
        assert_eq!(
            client.response().map(|x| x.status),
            Some(StatusCode::SWITCHING_PROTOCOLS)
        );
        let mut accepted = opened.lock().unwrap().take().unwrap();

        assert!(matches!(
            client.publish(WsMessage::text("ping me")).unwrap(),
            PublishOutcome::Published
        ));
        let mut echoed = None;
        for _ in 0..50 {
            client.drive().unwrap();
            accepted.drive().unwrap();
            let received = match accepted.receive().unwrap() {
                ReceiveOutcome::Payload(message) => Some(message.into_owned()),
                _ => None,
            };
            if let Some(message) = received {
                accepted.publish(message).unwrap();
            }
            echoed = match client.receive().unwrap() {
                ReceiveOutcome::Payload(message) => Some(message.into_owned()),
                _ => None,
            };
            if echoed.is_some() {
                break;
            }
        }
        assert_eq!(echoed, Some(WsMessage::text("ping me")));
    }
}
