//! Request and response heads, header multimaps, and the message types built on them.
//!
//! Heads are parsed with `httparse` and serialized by hand, preserving header insertion order
//! and the original case of header names on the wire.

use std::fmt::{self, Display, Write as _};

use http::{header::HeaderName, HeaderValue, Method, StatusCode, Uri, Version};

use crate::{
    body::{Body, IntoBody},
    codec::BodyFraming,
    error::HttpError,
};

/// Default cap for a request or response head, including the start line.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderEntry {
    name: String,
    value: HeaderValue,
}

/// An ordered, case-insensitive header multimap.
///
/// Repeated names are kept as separate entries and serialized in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<HeaderEntry>,
}
impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(name, value)` pairs in insertion order. Values that are not visible ASCII are skipped.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter_map(|x| x.value.to_str().ok().map(|v| (x.name.as_str(), v)))
    }

    /// Add a header, keeping existing entries of the same name.
    pub fn append(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
        self.append_raw(name, value.as_bytes())
    }

    /// Add a header with a value that may contain obs-text bytes.
    pub fn append_raw(&mut self, name: &str, value: &[u8]) -> Result<(), HttpError> {
        validate_name(name)?;
        let value = HeaderValue::from_bytes(trim_bytes(value))
            .map_err(|_| HttpError::MalformedHeader(format!("invalid value for {name}")))?;
        self.entries.push(HeaderEntry {
            name: name.to_owned(),
            value,
        });
        Ok(())
    }

    /// Replace every entry of `name` with a single one.
    pub fn insert(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
        validate_name(name)?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| HttpError::MalformedHeader(format!("invalid value for {name}")))?;
        match self
            .entries
            .iter()
            .position(|x| x.name.eq_ignore_ascii_case(name))
        {
            Some(first) => {
                self.entries[first].value = value;
                let mut index = 0;
                self.entries.retain(|x| {
                    let keep = index <= first || !x.name.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push(HeaderEntry {
                name: name.to_owned(),
                value,
            }),
        }
        Ok(())
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|x| x.name.eq_ignore_ascii_case(name))
            .and_then(|x| x.value.to_str().ok())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |x| x.name.eq_ignore_ascii_case(name))
            .filter_map(|x| x.value.to_str().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|x| x.name.eq_ignore_ascii_case(name))
    }

    /// Remove every entry of `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|x| !x.name.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// True if any comma-separated element of any `name` value equals `token`, ignoring case.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|x| x.split(','))
            .any(|x| x.trim().eq_ignore_ascii_case(token))
    }

    /// Serialize as `Name: value\r\n` lines, without the terminating blank line.
    pub fn encode(&self, out: &mut Vec<u8>) {
        for entry in &self.entries {
            out.extend_from_slice(entry.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(entry.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}
impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;
    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

fn validate_name(name: &str) -> Result<(), HttpError> {
    HeaderName::from_bytes(name.as_bytes())
        .map(|_| ())
        .map_err(|_| HttpError::MalformedHeader(format!("invalid header name {name:?}")))
}

fn trim_bytes(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

pub(crate) fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn parse_version(s: &str) -> Result<Version, HttpError> {
    match s {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        x => Err(HttpError::MalformedStartLine(format!(
            "unsupported version {x:?}"
        ))),
    }
}

/// Declared `Content-Length`, failing on a non-numeric or conflicting value.
pub fn content_length(headers: &Headers) -> Result<Option<u64>, HttpError> {
    let mut found: Option<u64> = None;
    for value in headers.get_all("Content-Length").flat_map(|x| x.split(',')) {
        let len = value
            .trim()
            .parse::<u64>()
            .map_err(|_| HttpError::MalformedHeader(format!("invalid content-length {value:?}")))?;
        match found {
            Some(x) if x != len => {
                return Err(HttpError::MalformedHeader(
                    "conflicting content-length values".into(),
                ))
            }
            _ => found = Some(len),
        }
    }
    Ok(found)
}

/// True if `chunked` is the final transfer coding.
pub fn is_chunked(headers: &Headers) -> bool {
    headers
        .get_all("Transfer-Encoding")
        .flat_map(|x| x.split(','))
        .last()
        .map(|x| x.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// Whether a message keeps its connection open, from its version and `Connection` header.
pub fn is_keep_alive(version: Version, headers: &Headers) -> bool {
    if headers.has_token("Connection", "close") {
        return false;
    }
    match version {
        Version::HTTP_10 => headers.has_token("Connection", "keep-alive"),
        _ => true,
    }
}

/// The `max` parameter of a `Keep-Alive` header.
pub fn keep_alive_max(headers: &Headers) -> Option<u64> {
    headers
        .get_all("Keep-Alive")
        .flat_map(|x| x.split(','))
        .filter_map(|x| x.trim().split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("max"))
        .and_then(|(_, v)| v.trim().parse().ok())
}

/// A parsed request or status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: Method,
        target: String,
        version: Version,
    },
    Status {
        version: Version,
        status: StatusCode,
        reason: String,
    },
}

/// Parse a single start line, without its line terminator.
pub fn parse_start_line(line: &str) -> Result<StartLine, HttpError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let malformed = || HttpError::MalformedStartLine(line.to_owned());
    if line.starts_with("HTTP/") {
        let mut parts = line.splitn(3, ' ');
        let version = parse_version(parts.next().ok_or_else(malformed)?)?;
        let code = parts.next().ok_or_else(malformed)?;
        if code.len() != 3 {
            return Err(malformed());
        }
        let status = code
            .parse::<u16>()
            .ok()
            .and_then(|x| StatusCode::from_u16(x).ok())
            .ok_or_else(malformed)?;
        let reason = parts.next().unwrap_or("").to_owned();
        Ok(StartLine::Status {
            version,
            status,
            reason,
        })
    } else {
        let mut parts = line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        let method = Method::from_bytes(method.as_bytes()).map_err(|_| malformed())?;
        if target.is_empty() {
            return Err(malformed());
        }
        Ok(StartLine::Request {
            method,
            target: target.to_owned(),
            version: parse_version(version)?,
        })
    }
}

fn map_httparse(err: httparse::Error, max: usize) -> HttpError {
    match err {
        httparse::Error::Token | httparse::Error::Version | httparse::Error::Status => {
            HttpError::MalformedStartLine(err.to_string())
        }
        httparse::Error::TooManyHeaders => HttpError::HeaderTooLarge { limit: max },
        _ => HttpError::MalformedHeader(err.to_string()),
    }
}

/// Enough header slots for every line that could be in the head.
fn header_slots<'b>(buf: &[u8], max: usize) -> Vec<httparse::Header<'b>> {
    let window = &buf[..buf.len().min(max)];
    let lines = window.iter().filter(|x| **x == b'\n').count();
    vec![httparse::EMPTY_HEADER; lines + 1]
}

fn check_head_size(parsed: httparse::Status<usize>, buf: &[u8], max: usize) -> Result<Option<usize>, HttpError> {
    match parsed {
        httparse::Status::Complete(len) if len > max => Err(HttpError::HeaderTooLarge { limit: max }),
        httparse::Status::Complete(len) => Ok(Some(len)),
        httparse::Status::Partial if buf.len() > max => Err(HttpError::HeaderTooLarge { limit: max }),
        httparse::Status::Partial => Ok(None),
    }
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<Headers, HttpError> {
    let mut headers = Headers::new();
    for header in raw {
        headers.append_raw(header.name, header.value)?;
    }
    Ok(headers)
}

fn httparse_version(version: Option<u8>) -> Version {
    match version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

/// Parse a request head from the front of `buf`.
///
/// Returns `None` if more bytes are needed, or the head and its length in bytes.
pub fn parse_request_head(
    buf: &[u8],
    max: usize,
) -> Result<Option<(RequestHeader, usize)>, HttpError> {
    let mut slots = header_slots(buf, max);
    let mut request = httparse::Request::new(&mut slots);
    let parsed = request.parse(buf).map_err(|e| map_httparse(e, max))?;
    let Some(len) = check_head_size(parsed, buf, max)? else {
        return Ok(None);
    };
    let method = request
        .method
        .ok_or_else(|| HttpError::MalformedStartLine("missing method".into()))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| HttpError::MalformedStartLine(format!("invalid method {method:?}")))?;
    let target = request
        .path
        .ok_or_else(|| HttpError::MalformedStartLine("missing target".into()))?
        .to_owned();
    Ok(Some((
        RequestHeader {
            method,
            target,
            version: httparse_version(request.version),
            headers: collect_headers(request.headers)?,
        },
        len,
    )))
}

/// Parse a response head from the front of `buf`.
///
/// Returns `None` if more bytes are needed, or the head and its length in bytes.
pub fn parse_response_head(
    buf: &[u8],
    max: usize,
) -> Result<Option<(ResponseHeader, usize)>, HttpError> {
    let mut slots = header_slots(buf, max);
    let mut response = httparse::Response::new(&mut slots);
    let parsed = response.parse(buf).map_err(|e| map_httparse(e, max))?;
    let Some(len) = check_head_size(parsed, buf, max)? else {
        return Ok(None);
    };
    let code = response
        .code
        .ok_or_else(|| HttpError::MalformedStartLine("missing status".into()))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| HttpError::MalformedStartLine(format!("invalid status {code}")))?;
    Ok(Some((
        ResponseHeader {
            version: httparse_version(response.version),
            status,
            reason: response.reason.filter(|x| !x.is_empty()).map(str::to_owned),
            headers: collect_headers(response.headers)?,
        },
        len,
    )))
}

/// Start line and headers of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}
impl RequestHeader {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: Version::HTTP_11,
            headers: Headers::new(),
        }
    }

    /// How the body following this head is delimited.
    pub fn framing(&self) -> Result<BodyFraming, HttpError> {
        if self.headers.contains("Transfer-Encoding") {
            if is_chunked(&self.headers) {
                return Ok(BodyFraming::Chunked);
            }
            return Err(HttpError::protocol(
                "request transfer-encoding must end with chunked",
            ));
        }
        match content_length(&self.headers)? {
            Some(0) | None => Ok(BodyFraming::Empty),
            Some(len) => Ok(BodyFraming::FixedLength(len)),
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        is_keep_alive(self.version, &self.headers)
    }

    pub fn expects_continue(&self) -> bool {
        self.version != Version::HTTP_10 && self.headers.has_token("Expect", "100-continue")
    }

    /// The path component of the target, for origin-form and absolute-form targets alike.
    pub fn path(&self) -> &str {
        let target = self.target.as_str();
        let without_scheme = match target.find("://") {
            Some(i) => {
                let rest = &target[i + 3..];
                match rest.find('/') {
                    Some(j) => &rest[j..],
                    None => "/",
                }
            }
            None => target,
        };
        without_scheme
            .split(['?', '#'])
            .next()
            .unwrap_or(without_scheme)
    }

    pub fn query(&self) -> Option<&str> {
        self.target
            .split_once('?')
            .map(|(_, q)| q.split('#').next().unwrap_or(q))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.target.as_bytes());
        out.push(b' ');
        out.extend_from_slice(version_str(self.version).as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.encode(out);
        out.extend_from_slice(b"\r\n");
    }
}
impl Display for RequestHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.target, version_str(self.version))
    }
}

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase, defaulting to the canonical one when `None`
    pub reason: Option<String>,
    pub headers: Headers,
}
impl ResponseHeader {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: Headers::new(),
        }
    }

    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }

    /// How the body following this head is delimited, given the method of the request it answers.
    pub fn framing(&self, request_method: &Method) -> Result<BodyFraming, HttpError> {
        if !self.has_body(request_method) {
            return Ok(BodyFraming::Empty);
        }
        if self.headers.contains("Transfer-Encoding") {
            if is_chunked(&self.headers) {
                return Ok(BodyFraming::Chunked);
            }
            return Ok(BodyFraming::CloseDelimited);
        }
        match content_length(&self.headers)? {
            Some(0) => Ok(BodyFraming::Empty),
            Some(len) => Ok(BodyFraming::FixedLength(len)),
            None => Ok(BodyFraming::CloseDelimited),
        }
    }

    /// HEAD responses, 1xx, 204, 304 and a 2xx reply to CONNECT never carry a body.
    pub fn has_body(&self, request_method: &Method) -> bool {
        let status = self.status;
        !(*request_method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || (*request_method == Method::CONNECT && status.is_success()))
    }

    pub fn is_keep_alive(&self) -> bool {
        is_keep_alive(self.version, &self.headers)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut line = String::new();
        let _ = write!(
            line,
            "{} {} {}\r\n",
            version_str(self.version),
            self.status.as_u16(),
            self.reason()
        );
        out.extend_from_slice(line.as_bytes());
        self.headers.encode(out);
        out.extend_from_slice(b"\r\n");
    }
}
impl Display for ResponseHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            version_str(self.version),
            self.status.as_u16(),
            self.reason()
        )
    }
}

/// An HTTP request: a head plus a [`Body`].
#[derive(Debug, Clone)]
pub struct Request {
    header: RequestHeader,
    body: Body,
}
impl Request {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            header: RequestHeader::new(method, target),
            body: Body::Empty,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn head(target: impl Into<String>) -> Self {
        Self::new(Method::HEAD, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::DELETE, target)
    }

    pub fn post<B: IntoBody>(target: impl Into<String>, body: B) -> Self {
        Self::new(Method::POST, target).with_body(body)
    }

    pub fn put<B: IntoBody>(target: impl Into<String>, body: B) -> Self {
        Self::new(Method::PUT, target).with_body(body)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, HttpError> {
        self.header.headers.append(name, value)?;
        Ok(self)
    }

    pub fn with_body<B: IntoBody>(mut self, body: B) -> Self {
        self.body = body.into_body();
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.header.version = version;
        self
    }

    pub fn method(&self) -> &Method {
        &self.header.method
    }

    pub fn target(&self) -> &str {
        &self.header.target
    }

    pub fn version(&self) -> Version {
        self.header.version
    }

    pub fn headers(&self) -> &Headers {
        &self.header.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.header.headers
    }

    pub fn header(&self) -> &RequestHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut RequestHeader {
        &mut self.header
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn uri(&self) -> Result<Uri, HttpError> {
        self.header
            .target
            .parse::<Uri>()
            .map_err(|e| HttpError::protocol(format!("invalid target: {e}")))
    }

    pub fn into_parts(self) -> (RequestHeader, Body) {
        (self.header, self.body)
    }

    pub fn from_parts(header: RequestHeader, body: Body) -> Self {
        Self { header, body }
    }
}
impl<B: IntoBody> TryFrom<http::Request<B>> for Request {
    type Error = HttpError;
    fn try_from(value: http::Request<B>) -> Result<Self, Self::Error> {
        let (parts, body) = value.into_parts();
        let mut header = RequestHeader::new(parts.method, parts.uri.to_string());
        header.version = parts.version;
        for (name, value) in &parts.headers {
            header.headers.append_raw(name.as_str(), value.as_bytes())?;
        }
        Ok(Self::from_parts(header, body.into_body()))
    }
}

/// An HTTP response: a head plus a [`Body`].
#[derive(Debug, Clone)]
pub struct Response {
    header: ResponseHeader,
    body: Body,
}
impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            header: ResponseHeader::new(status),
            body: Body::Empty,
        }
    }

    fn status_or_500(status: u16) -> StatusCode {
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// A `text/plain` response.
    pub fn text(status: u16, text: &str) -> Self {
        Self::with_content(status, "text/plain; charset=utf-8", text)
    }

    /// A response with the given content type and body.
    pub fn with_content<B: IntoBody>(status: u16, content_type: &str, body: B) -> Self {
        let mut response = Self::new(Self::status_or_500(status));
        if HeaderValue::from_str(content_type).is_ok() {
            // validated just above
            let _ = response.header.headers.insert("Content-Type", content_type);
        }
        response.body = body.into_body();
        response
    }

    /// An error page with an optional message as its body.
    pub fn error(status: StatusCode, message: Option<&str>) -> Self {
        let text = match message {
            Some(x) => x.to_owned(),
            None => format!(
                "{} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Error")
            ),
        };
        Self::text(status.as_u16(), &text)
    }

    pub fn from_parts(header: ResponseHeader, body: Body) -> Self {
        Self { header, body }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, HttpError> {
        self.header.headers.append(name, value)?;
        Ok(self)
    }

    pub fn with_body<B: IntoBody>(mut self, body: B) -> Self {
        self.body = body.into_body();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.header.status
    }

    pub fn version(&self) -> Version {
        self.header.version
    }

    pub fn headers(&self) -> &Headers {
        &self.header.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.header.headers
    }

    pub fn header(&self) -> &ResponseHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut ResponseHeader {
        &mut self.header
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn into_parts(self) -> (ResponseHeader, Body) {
        (self.header, self.body)
    }

    /// Convert into an `http::Response`, dropping headers that `http` rejects.
    pub fn into_http(self) -> http::Response<Body> {
        let mut builder = http::Response::builder()
            .status(self.header.status)
            .version(self.header.version);
        for (name, value) in self.header.headers.iter() {
            builder = builder.header(name, value);
        }
        match builder.body(Body::Empty) {
            Ok(mut response) => {
                *response.body_mut() = self.body;
                response
            }
            Err(_) => {
                let mut response = http::Response::new(self.body);
                *response.status_mut() = self.header.status;
                response
            }
        }
    }
}
