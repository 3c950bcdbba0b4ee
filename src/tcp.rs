//! Provides a TCP [`Session`] implementation and simple [`TcpServer`]

use std::{
    fmt::Debug,
    io::{self, ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, ToSocketAddrs},
    time::Duration,
};

use http::Method;
use native_tls::Certificate;
use tcp_stream::{
    HandshakeError, HandshakeResult, Identity, MidHandshakeTlsStream, NativeTlsConnector, OwnedIdentity,
    OwnedTLSConfig, TLSConfig, TcpStream,
};

use crate::{
    dns::{AddrResolutionOutcome, AddrResolver, AddrResolverProvider, DEFAULT_ADDR_RESOLVER_PROVIDER},
    error::HttpError,
    log::debug,
    parser::{ParseEvent, ResponseParser},
    DriveOutcome, Flush, Publish, PublishOutcome, Receive, ReceiveOutcome, Session, SessionStatus,
};

const DEFAULT_READ_BUFFER_CAPACITY: usize = 16 * 1024;
/// Largest proxy answer accepted while opening a tunnel.
const MAX_TUNNEL_RESPONSE: usize = 8 * 1024;

/// A `CONNECT` exchange with a proxy, run once the socket connects and before any TLS handshake.
struct Tunnel {
    request: Vec<u8>,
    written: usize,
    received: Vec<u8>,
    parser: ResponseParser,
    tls: Option<(String, OwnedTLSConfig)>,
}
impl Tunnel {
    fn new(request: Vec<u8>) -> Self {
        Self {
            request,
            written: 0,
            received: Vec::new(),
            parser: ResponseParser::new().with_max_header_size(MAX_TUNNEL_RESPONSE),
            tls: None,
        }
    }

    /// Write the request and read the answer, returning true once the proxy opened the tunnel.
    fn advance(&mut self, stream: &mut TcpStream, active: &mut bool) -> Result<bool, HttpError> {
        while self.written < self.request.len() {
            match stream.write(&self.request[self.written..]) {
                Ok(0) => return Err(HttpError::ConnectionClosed),
                Ok(n) => {
                    self.written += n;
                    *active = true;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
        // the proxy sends nothing past its answer until the client speaks again
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return Err(HttpError::ConnectionClosed),
                Ok(n) => {
                    self.received.extend_from_slice(&buf[..n]);
                    *active = true;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(err.into()),
            }
            if let (_, ParseEvent::Head(head, _)) = self.parser.parse(&self.received, &Method::CONNECT)? {
                if !head.status.is_success() {
                    return Err(HttpError::Upgrade(format!(
                        "proxy refused the tunnel with {}",
                        head.status
                    )));
                }
                return Ok(true);
            }
        }
    }
}

/// Internal state machine of a TCP connection
enum TcpConnection {
    AddressResolution(Box<dyn AddrResolver>, Option<(String, OwnedTLSConfig)>),
    Initializing(
        mio::net::TcpStream,
        mio::Poll,
        mio::Events,
        Option<(String, OwnedTLSConfig)>,
    ),
    Connecting(TcpStream),
    Tunnelling(TcpStream, Box<Tunnel>),
    MidTlsHandshake(MidHandshakeTlsStream),
    Connected(TcpStream),
}
impl TcpConnection {
    fn name(&self) -> &'static str {
        match self {
            Self::AddressResolution(_, _) => "in address resolution",
            Self::Initializing(_, _, _, _) => "initializing",
            Self::Connecting(_) => "connecting",
            Self::Tunnelling(_, _) => "opening a proxy tunnel",
            Self::MidTlsHandshake(_) => "mid-handshake",
            Self::Connected(_) => "connected",
        }
    }
}
impl Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn not_connected(state: &str) -> HttpError {
    HttpError::Io(io::Error::new(
        ErrorKind::NotConnected,
        format!("stream is {state}"),
    ))
}

fn other<E: std::error::Error + Send + Sync + 'static>(err: E) -> HttpError {
    HttpError::Io(io::Error::new(ErrorKind::Other, err))
}

fn owned_tls_config(config: TLSConfig<'_, '_, '_>) -> OwnedTLSConfig {
    OwnedTLSConfig {
        identity: config.identity.map(|x| match x {
            Identity::PKCS12 { der, password } => OwnedIdentity::PKCS12 {
                der: der.to_vec(),
                password: password.to_owned(),
            },
            Identity::PKCS8 { pem, key } => OwnedIdentity::PKCS8 {
                pem: pem.to_vec(),
                key: key.to_vec(),
            },
        }),
        cert_chain: config.cert_chain.map(|x| x.to_owned()),
    }
}

/// A [`Session`] that can [`Publish`] and [`Receive`] that encapsulates a [`TcpStream`].
///
/// Buffers are returned as they are read from the underlying socket, and writes may be partially completed,
/// with the remaining slice returned as [`PublishOutcome::Incomplete`].
/// A clean close by the peer is reported as [`HttpError::ConnectionClosed`].
///
/// A plain TCP session can be converted to a TLS session by initiating a TLS handshake via [`TcpSession::into_tls`].
/// The TLS handshake is considered part of the connection process and is driven to completion by [`Session::drive`].
pub struct TcpSession {
    read_buffer: Vec<u8>,
    connection: Option<TcpConnection>,
    accept_invalid_hostnames: bool,
    peer: Option<String>,
    tunnel: Option<Box<Tunnel>>,
}
impl TcpSession {
    /// Create a TcpSession that wraps an existing [`TcpStream`]
    pub fn new<I: Into<TcpStream>>(stream: I) -> Result<Self, HttpError> {
        let stream = stream.into();
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            connection: if stream.is_connected() {
                Some(TcpConnection::Connected(stream))
            } else {
                Some(TcpConnection::Connecting(stream))
            },
            read_buffer: vec![0; DEFAULT_READ_BUFFER_CAPACITY],
            accept_invalid_hostnames: false,
            peer: None,
            tunnel: None,
        })
    }

    /// Start a non-blocking connection to `host:port`, resolved in the background.
    pub fn connect(addr: &str) -> Result<Self, HttpError> {
        Self::connect_with_resolver(addr, &DEFAULT_ADDR_RESOLVER_PROVIDER)
    }

    /// Start a non-blocking connection using the given [`AddrResolverProvider`].
    pub fn connect_with_resolver(
        addr: &str,
        resolver: &dyn AddrResolverProvider,
    ) -> Result<Self, HttpError> {
        Ok(Self {
            connection: Some(TcpConnection::AddressResolution(
                resolver.start(addr.to_owned()),
                None,
            )),
            read_buffer: vec![0; DEFAULT_READ_BUFFER_CAPACITY],
            accept_invalid_hostnames: false,
            peer: Some(addr.to_owned()),
            tunnel: None,
        })
    }

    /// Send `request`, a `CONNECT` head, as soon as the socket connects and wait for a `2xx` answer.
    ///
    /// The session is [`SessionStatus::Establishing`] until the tunnel is open, and a TLS handshake
    /// requested with [`TcpSession::into_tls`] runs through the tunnel afterwards.
    pub fn through_tunnel(mut self, request: Vec<u8>) -> Result<Self, HttpError> {
        match &self.connection {
            Some(TcpConnection::AddressResolution(_, None))
            | Some(TcpConnection::Initializing(_, _, _, None)) => {
                self.tunnel = Some(Box::new(Tunnel::new(request)));
                Ok(self)
            }
            _ => Err(HttpError::protocol(
                "a tunnel must be requested before connecting or starting TLS",
            )),
        }
    }

    /// Set the underlying read buffer capacity, which must be greater than or equal to the current read buffer length
    pub fn with_read_buffer_capacity(mut self, read_buffer_capacity: usize) -> Result<Self, HttpError> {
        if read_buffer_capacity < self.read_buffer.len() {
            return Err(HttpError::protocol(
                "new read buffer capacity must be greater than or equal to than current length",
            ));
        }
        self.read_buffer.resize(read_buffer_capacity, 0);
        Ok(self)
    }

    fn addr_to_stream(addrs: Vec<SocketAddr>) -> Result<(mio::net::TcpStream, mio::Poll), HttpError> {
        let mut last_err = None;
        for addr in addrs {
            match mio::net::TcpStream::connect(addr) {
                Ok(mut stream) => {
                    let poll = mio::Poll::new()?;
                    poll.registry()
                        .register(&mut stream, mio::Token(0), mio::Interest::WRITABLE)?;
                    return Ok((stream, poll));
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(match last_err {
            Some(err) => HttpError::Io(err),
            None => HttpError::Io(io::Error::new(ErrorKind::Other, "could not connect to addr")),
        })
    }

    /// Start the TLS handshake.
    ///
    /// While the TLS handshake is in progress, [`Session::status`] will return [`SessionStatus::Establishing`].
    pub fn into_tls(mut self, domain: &str, config: TLSConfig<'_, '_, '_>) -> Result<Self, HttpError> {
        let stream = match self.connection.take() {
            Some(TcpConnection::Initializing(stream, poll, events, None)) => {
                self.connection = Some(TcpConnection::Initializing(
                    stream,
                    poll,
                    events,
                    Some((domain.to_owned(), owned_tls_config(config))),
                ));
                return Ok(self);
            }
            Some(TcpConnection::AddressResolution(x, None)) => {
                self.connection = Some(TcpConnection::AddressResolution(
                    x,
                    Some((domain.to_owned(), owned_tls_config(config))),
                ));
                return Ok(self);
            }
            Some(TcpConnection::Initializing(_, _, _, Some(_)))
            | Some(TcpConnection::AddressResolution(_, Some(_))) => {
                return Err(HttpError::protocol("stream already initialized for TLS"))
            }
            Some(TcpConnection::Tunnelling(stream, mut tunnel)) => {
                let initialized = tunnel.tls.is_some();
                if !initialized {
                    tunnel.tls = Some((domain.to_owned(), owned_tls_config(config)));
                }
                self.connection = Some(TcpConnection::Tunnelling(stream, tunnel));
                if initialized {
                    return Err(HttpError::protocol("stream already initialized for TLS"));
                }
                return Ok(self);
            }
            Some(TcpConnection::MidTlsHandshake(_)) => {
                return Err(HttpError::protocol("stream already mid-handshake"))
            }
            Some(TcpConnection::Connecting(x)) | Some(TcpConnection::Connected(x)) => x,
            None => return Err(not_connected("closed")),
        };
        match stream.into_tls(domain, config) {
            Ok(x) => self.connection = Some(TcpConnection::Connected(x)),
            Err(HandshakeError::WouldBlock(x)) => {
                self.connection = Some(TcpConnection::MidTlsHandshake(x))
            }
            Err(HandshakeError::Failure(err)) => return Err(err.into()),
        }
        Ok(self)
    }

    /// Set whether we should accept invalid hostnames or not
    pub fn with_accept_invalid_hostnames(mut self, accept_invalid_hostnames: bool) -> Self {
        self.accept_invalid_hostnames = accept_invalid_hostnames;
        self
    }

    /// Set ttl on the underlying stream
    pub fn set_ttl(&self, ttl: u32) -> Result<(), HttpError> {
        Ok(self.stream()?.set_ttl(ttl)?)
    }

    pub fn with_ttl(self, ttl: u32) -> Result<Self, HttpError> {
        self.set_ttl(ttl)?;
        Ok(self)
    }

    fn stream(&self) -> Result<&TcpStream, HttpError> {
        match self.connection.as_ref() {
            Some(TcpConnection::Connecting(x)) | Some(TcpConnection::Connected(x)) => Ok(x),
            Some(x) => Err(not_connected(x.name())),
            None => Err(not_connected("closed")),
        }
    }

    fn connected(&mut self) -> Result<&mut TcpStream, HttpError> {
        match self.connection.as_mut() {
            Some(TcpConnection::Connected(x)) => Ok(x),
            Some(x) => Err(not_connected(x.name())),
            None => Err(not_connected("closed")),
        }
    }

    fn into_tls_impl(
        &self,
        s: TcpStream,
        domain: &str,
        config: TLSConfig<'_, '_, '_>,
    ) -> HandshakeResult {
        let mut builder = NativeTlsConnector::builder();
        if self.accept_invalid_hostnames {
            builder.danger_accept_invalid_hostnames(true);
        }
        if let Some(identity) = config.identity {
            match identity {
                Identity::PKCS12 { der, password } => builder.identity(
                    native_tls::Identity::from_pkcs12(der, password)
                        .map_err(|e| io::Error::new(ErrorKind::Other, e))?,
                ),
                Identity::PKCS8 { pem, key } => builder.identity(
                    native_tls::Identity::from_pkcs8(pem, key)
                        .map_err(|e| io::Error::new(ErrorKind::Other, e))?,
                ),
            };
        }
        if let Some(cert_chain) = config.cert_chain {
            let mut cert_chain = io::BufReader::new(cert_chain.as_bytes());
            for cert in rustls_pemfile::read_all(&mut cert_chain) {
                if let rustls_pemfile::Item::X509Certificate(cert) = cert? {
                    builder.add_root_certificate(
                        Certificate::from_der(&cert[..])
                            .map_err(|e| io::Error::new(ErrorKind::Other, e))?,
                    );
                }
            }
        }
        let connector = builder
            .build()
            .map_err(|e| io::Error::new(ErrorKind::Other, e))?;
        s.into_native_tls(&connector, domain)
    }

    fn start_tls(&mut self, stream: TcpStream, domain: &str, config: &OwnedTLSConfig) -> Result<(), HttpError> {
        match self.into_tls_impl(stream, domain, config.as_ref()) {
            Ok(x) => self.connection = Some(TcpConnection::Connected(x)),
            Err(HandshakeError::WouldBlock(x)) => {
                self.connection = Some(TcpConnection::MidTlsHandshake(x))
            }
            Err(HandshakeError::Failure(err)) => return Err(err.into()),
        }
        Ok(())
    }
}
impl Session for TcpSession {
    fn status(&self) -> SessionStatus {
        match &self.connection {
            None => SessionStatus::Terminated,
            Some(TcpConnection::Connected(_)) => SessionStatus::Established,
            Some(_) => SessionStatus::Establishing,
        }
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!("closing tcp session to {:?}", self.peer);
            shutdown(connection);
        }
    }

    fn drive(&mut self) -> Result<DriveOutcome, HttpError> {
        match self.connection.take() {
            Some(TcpConnection::AddressResolution(mut resolver, tls)) => match resolver.poll()? {
                AddrResolutionOutcome::Resolved(addrs) => {
                    let (stream, poll) = Self::addr_to_stream(addrs)?;
                    let events = mio::Events::with_capacity(1);
                    self.connection = Some(TcpConnection::Initializing(stream, poll, events, tls));
                    Ok(DriveOutcome::Active)
                }
                outcome => {
                    self.connection = Some(TcpConnection::AddressResolution(resolver, tls));
                    Ok(match outcome {
                        AddrResolutionOutcome::Active => DriveOutcome::Active,
                        _ => DriveOutcome::Idle,
                    })
                }
            },
            Some(TcpConnection::Connected(x)) => {
                self.connection = Some(TcpConnection::Connected(x));
                Ok(DriveOutcome::Idle)
            }
            Some(TcpConnection::Initializing(stream, mut poll, mut events, tls)) => {
                poll.poll(&mut events, Some(Duration::ZERO))?;
                if let Ok(Some(err)) | Err(err) = stream.take_error() {
                    return Err(err.into());
                }
                match stream.peer_addr() {
                    Ok(..) => {
                        let stream: TcpStream = unsafe { into_tcpstream(stream) };
                        stream.set_nonblocking(true)?;
                        stream.set_nodelay(true)?;
                        match (self.tunnel.take(), tls) {
                            (Some(mut tunnel), tls) => {
                                debug!("opening proxy tunnel via {:?}", self.peer);
                                tunnel.tls = tls;
                                self.connection = Some(TcpConnection::Tunnelling(stream, tunnel));
                            }
                            (None, None) => self.connection = Some(TcpConnection::Connected(stream)),
                            (None, Some((domain, config))) => self.start_tls(stream, &domain, &config)?,
                        }
                        Ok(DriveOutcome::Active)
                    }
                    // `NotConnected`/`ENOTCONN` => still connecting
                    Err(err)
                        if err.kind() == ErrorKind::NotConnected
                            || err.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        self.connection = Some(TcpConnection::Initializing(stream, poll, events, tls));
                        Ok(DriveOutcome::Idle)
                    }
                    Err(err) => Err(err.into()),
                }
            }
            Some(TcpConnection::Connecting(mut x)) => {
                if x.try_connect()? {
                    self.connection = Some(TcpConnection::Connected(x));
                    Ok(DriveOutcome::Active)
                } else {
                    self.connection = Some(TcpConnection::Connecting(x));
                    Ok(DriveOutcome::Idle)
                }
            }
            Some(TcpConnection::Tunnelling(mut stream, mut tunnel)) => {
                let mut active = false;
                if !tunnel.advance(&mut stream, &mut active)? {
                    self.connection = Some(TcpConnection::Tunnelling(stream, tunnel));
                    return Ok(if active {
                        DriveOutcome::Active
                    } else {
                        DriveOutcome::Idle
                    });
                }
                match tunnel.tls.take() {
                    None => self.connection = Some(TcpConnection::Connected(stream)),
                    Some((domain, config)) => self.start_tls(stream, &domain, &config)?,
                }
                Ok(DriveOutcome::Active)
            }
            Some(TcpConnection::MidTlsHandshake(x)) => match x.handshake() {
                Ok(x) => {
                    self.connection = Some(TcpConnection::Connected(x));
                    Ok(DriveOutcome::Active)
                }
                Err(HandshakeError::WouldBlock(x)) => {
                    self.connection = Some(TcpConnection::MidTlsHandshake(x));
                    Ok(DriveOutcome::Idle)
                }
                Err(HandshakeError::Failure(err)) => Err(err.into()),
            },
            None => Err(not_connected("closed")),
        }
    }
}
impl Publish for TcpSession {
    type PublishPayload<'a> = &'a [u8];

    fn publish<'a>(
        &mut self,
        data: Self::PublishPayload<'a>,
    ) -> Result<PublishOutcome<Self::PublishPayload<'a>>, HttpError> {
        let stream = self.connected()?;
        if data.is_empty() {
            return Ok(PublishOutcome::Published);
        }
        let wrote = match stream.write(data) {
            Ok(0) => {
                // a zero-length write means the stream will no longer accept bytes
                self.close();
                return Err(HttpError::ConnectionClosed);
            }
            Ok(x) => x,
            Err(err) if err.kind() == ErrorKind::WouldBlock => 0,
            Err(err) => {
                self.close();
                return Err(err.into());
            }
        };
        if wrote == data.len() {
            Ok(PublishOutcome::Published)
        } else {
            Ok(PublishOutcome::Incomplete(&data[wrote..]))
        }
    }
}
impl Flush for TcpSession {
    fn flush(&mut self) -> Result<(), HttpError> {
        Ok(self.connected()?.flush()?)
    }
}
impl Receive for TcpSession {
    type ReceivePayload<'a> = &'a [u8];

    fn receive<'a>(&'a mut self) -> Result<ReceiveOutcome<Self::ReceivePayload<'a>>, HttpError> {
        let Some(TcpConnection::Connected(stream)) = self.connection.as_mut() else {
            return Err(match &self.connection {
                Some(x) => not_connected(x.name()),
                None => not_connected("closed"),
            });
        };
        match stream.read(self.read_buffer.as_mut_slice()) {
            Ok(0) => {
                self.close();
                Err(HttpError::ConnectionClosed)
            }
            Ok(read) => Ok(ReceiveOutcome::Payload(&self.read_buffer[..read])),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(ReceiveOutcome::Idle),
            Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                self.close();
                Err(HttpError::ConnectionClosed)
            }
            Err(err) => {
                self.close();
                Err(err.into())
            }
        }
    }
}
impl Debug for TcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSession")
            .field("peer", &self.peer)
            .field("connection", &self.connection)
            .finish()
    }
}
impl Drop for TcpSession {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            shutdown(connection);
        }
    }
}

fn shutdown(mut connection: TcpConnection) {
    match &mut connection {
        TcpConnection::Initializing(stream, _, _, _) => stream.shutdown(Shutdown::Both).ok(),
        TcpConnection::Connecting(stream)
        | TcpConnection::Connected(stream)
        | TcpConnection::Tunnelling(stream, _) => stream.shutdown(Shutdown::Both).ok(),
        TcpConnection::AddressResolution(_, _) => Some(()),
        TcpConnection::MidTlsHandshake(x) => x.get_mut().shutdown(Shutdown::Both).ok(),
    };
}

#[cfg(unix)]
unsafe fn into_tcpstream(stream: mio::net::TcpStream) -> TcpStream {
    use std::os::fd::{FromRawFd, IntoRawFd};
    TcpStream::from_raw_fd(stream.into_raw_fd())
}

#[cfg(windows)]
unsafe fn into_tcpstream(stream: mio::net::TcpStream) -> TcpStream {
    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
    TcpStream::from_raw_socket(stream.into_raw_socket())
}

/// A TcpServer, which produces connected, nonblocking [`TcpSession`] on calling `accept`.
pub struct TcpServer {
    listener: TcpListener,
}
impl TcpServer {
    /// Encapsulate the given [`TcpListener`]
    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    /// Bind to the given socket address in nonblocking mode.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, HttpError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self::new(listener))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HttpError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept a new TCP Session, immediately returning None if there are no new sessions.
    pub fn accept(&self) -> Result<Option<(TcpSession, SocketAddr)>, HttpError> {
        let (stream, addr) = match self.listener.accept() {
            Ok(v) => v,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut session = TcpSession::new(TcpStream::Plain(stream, true))?;
        session.peer = Some(addr.to_string());
        Ok(Some((session, addr)))
    }
}
impl Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        thread,
        time::{Duration, Instant},
    };

    use super::{TcpServer, TcpSession};
    use crate::{error::HttpError, Session, SessionStatus, Transport};

    const CONNECT: &[u8] = b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n";

    fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[test]
    fn test_tunnel_opens_before_data() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let head = read_head(&mut stream);
            stream
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .unwrap();
            let mut data = [0u8; 5];
            stream.read_exact(&mut data).unwrap();
            (head, data)
        });

        let mut client = TcpSession::connect(&addr.to_string())
            .unwrap()
            .through_tunnel(CONNECT.to_vec())
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while client.status() != SessionStatus::Established {
            assert!(Instant::now() < deadline, "tunnel did not open");
            client.drive().unwrap();
        }
        let mut written = 0;
        while written < 5 {
            written += client.write_some(&b"hello"[written..]).unwrap();
        }
        let (head, data) = proxy.join().unwrap();
        assert_eq!(head.as_bytes(), CONNECT);
        assert_eq!(&data, b"hello");
    }

    #[test]
    fn test_refused_tunnel_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_head(&mut stream);
            stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
            // hold the socket open until the client gives up
            let _ = stream.read(&mut [0u8; 1]);
        });

        let mut client = TcpSession::connect(&addr.to_string())
            .unwrap()
            .through_tunnel(CONNECT.to_vec())
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            assert!(Instant::now() < deadline, "tunnel was neither opened nor refused");
            match client.drive() {
                Ok(_) => assert_ne!(client.status(), SessionStatus::Established),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, HttpError::Upgrade(_)), "{err:?}");
        client.close();
        proxy.join().unwrap();
    }

    #[test]
    fn test_connect_write_read_and_eof() {
        let server = TcpServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let mut client = TcpSession::connect(&addr.to_string()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut accepted = None;
        while accepted.is_none() || client.status() != SessionStatus::Established {
            assert!(Instant::now() < deadline, "connect timed out");
            client.drive().unwrap();
            if accepted.is_none() {
                accepted = server.accept().unwrap();
            }
        }
        let (mut session, _) = accepted.unwrap();

        let mut written = 0;
        while written < 5 {
            written += client.write_some(&b"hello"[written..]).unwrap();
        }
        let mut received = Vec::new();
        while received.len() < 5 {
            assert!(Instant::now() < deadline, "read timed out");
            session.read_some(&mut received).unwrap();
        }
        assert_eq!(received, b"hello");

        client.close();
        assert_eq!(client.status(), SessionStatus::Terminated);
        loop {
            assert!(Instant::now() < deadline, "eof timed out");
            match session.read_some(&mut received) {
                Ok(_) => continue,
                Err(HttpError::ConnectionClosed) => break,
                Err(err) => panic!("unexpected {err:?}"),
            }
        }
    }
}
