//! `multipart/*` bodies and byte-range responses.
//!
//! [`Multipart`] builds and parses bodies made of boundary-delimited parts, such as
//! `multipart/form-data` and `multipart/byteranges`. [`parse_range`] and [`byteranges_response`]
//! answer `Range` requests against a fully buffered body.

use std::{
    fmt::Write,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use http::StatusCode;

use crate::{
    error::HttpError,
    message::{Headers, Request, Response},
};

const MAX_PART_HEADERS: usize = 64;

static BOUNDARY_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn generate_boundary() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|x| x.as_nanos() as u64)
        .unwrap_or(0);
    let sequence = BOUNDARY_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("nbhttp-{nanos:016x}{sequence:08x}")
}

/// Value of a `name=value` parameter in a header such as `Content-Type` or `Content-Disposition`.
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    value.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().trim_matches('"'))
    })
}

/// One part of a multipart body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    pub headers: Headers,
    pub body: Vec<u8>,
}
impl Part {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// A `form-data` field.
    pub fn form_field(name: &str, value: &str) -> Result<Self, HttpError> {
        let mut part = Self::new(value.as_bytes());
        part.headers
            .insert("Content-Disposition", &form_disposition(name, None))?;
        Ok(part)
    }

    /// A `form-data` file upload.
    pub fn form_file(
        name: &str,
        filename: &str,
        content_type: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<Self, HttpError> {
        let mut part = Self::new(body);
        part.headers
            .insert("Content-Disposition", &form_disposition(name, Some(filename)))?;
        part.headers.insert("Content-Type", content_type)?;
        Ok(part)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, HttpError> {
        self.headers.append(name, value)?;
        Ok(self)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("Content-Type")
    }

    /// The `name` of a `form-data` part.
    pub fn name(&self) -> Option<&str> {
        header_param(self.headers.get("Content-Disposition")?, "name")
    }

    pub fn filename(&self) -> Option<&str> {
        header_param(self.headers.get("Content-Disposition")?, "filename")
    }

    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// A multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multipart {
    subtype: String,
    boundary: String,
    parts: Vec<Part>,
}
impl Multipart {
    /// An empty body of `multipart/<subtype>` with a generated boundary.
    pub fn new(subtype: &str) -> Self {
        Self {
            subtype: subtype.to_owned(),
            boundary: generate_boundary(),
            parts: Vec::new(),
        }
    }

    pub fn form_data() -> Self {
        Self::new("form-data")
    }

    pub fn with_boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = boundary.into();
        self
    }

    pub fn with_part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    pub fn push(&mut self, part: Part) {
        self.parts.push(part);
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<Part> {
        self.parts
    }

    /// The first part with the given `form-data` name.
    pub fn part(&self, name: &str) -> Option<&Part> {
        self.parts.iter().find(|x| x.name() == Some(name))
    }

    pub fn content_type(&self) -> String {
        format!("multipart/{}; boundary={}", self.subtype, self.boundary)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in &self.parts {
            out.extend_from_slice(b"--");
            out.extend_from_slice(self.boundary.as_bytes());
            out.extend_from_slice(b"\r\n");
            part.headers.encode(&mut out);
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&part.body);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--");
        out.extend_from_slice(self.boundary.as_bytes());
        out.extend_from_slice(b"--\r\n");
        out
    }

    pub fn into_request(self, target: impl Into<String>) -> Result<Request, HttpError> {
        let content_type = self.content_type();
        Request::post(target, self.encode()).with_header("Content-Type", &content_type)
    }

    pub fn into_response(self, status: u16) -> Response {
        Response::with_content(status, &self.content_type(), self.encode())
    }

    /// Parse a body whose `Content-Type` is `content_type`.
    pub fn parse(content_type: &str, body: &[u8]) -> Result<Self, HttpError> {
        let media = content_type.split(';').next().unwrap_or_default().trim();
        let subtype = media
            .strip_prefix("multipart/")
            .ok_or_else(|| HttpError::protocol(format!("{media} is not a multipart type")))?;
        let boundary = header_param(content_type, "boundary")
            .filter(|x| !x.is_empty())
            .ok_or_else(|| HttpError::protocol("multipart content type without a boundary"))?;
        let parts = parse_parts(boundary, body)?;
        Ok(Self {
            subtype: subtype.to_owned(),
            boundary: boundary.to_owned(),
            parts,
        })
    }

    /// Parse the multipart body of a request.
    pub fn from_request(request: &Request) -> Result<Self, HttpError> {
        let content_type = request
            .headers()
            .get("Content-Type")
            .ok_or_else(|| HttpError::protocol("request has no Content-Type"))?;
        let body = request
            .body()
            .as_bytes()
            .ok_or_else(|| HttpError::protocol("multipart body is still streaming"))?;
        Self::parse(content_type, body)
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|x| x == needle)
        .map(|x| x + from)
}

fn parse_parts(boundary: &str, body: &[u8]) -> Result<Vec<Part>, HttpError> {
    let delimiter = format!("--{boundary}").into_bytes();
    let inner_delimiter = format!("\r\n--{boundary}").into_bytes();
    let mut pos = match body.starts_with(&delimiter) {
        true => 0,
        // anything before the first delimiter is preamble
        false => find(body, &inner_delimiter, 0)
            .map(|x| x + 2)
            .ok_or_else(|| HttpError::protocol("multipart body without a boundary"))?,
    };
    let mut parts = Vec::new();
    loop {
        pos += delimiter.len();
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        let line_end = find(body, b"\n", pos)
            .ok_or_else(|| HttpError::protocol("truncated multipart body"))?;
        let start = line_end + 1;
        let end = find(body, &inner_delimiter, start)
            .ok_or_else(|| HttpError::protocol("multipart body without a closing boundary"))?;
        parts.push(parse_part(&body[start..end])?);
        pos = end + 2;
    }
}

fn parse_part(data: &[u8]) -> Result<Part, HttpError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
    let (consumed, parsed) = match httparse::parse_headers(data, &mut raw) {
        Ok(httparse::Status::Complete(x)) => x,
        Ok(httparse::Status::Partial) => {
            return Err(HttpError::MalformedHeader("truncated part headers".to_owned()))
        }
        Err(err) => return Err(HttpError::MalformedHeader(format!("part headers: {err}"))),
    };
    let mut headers = Headers::new();
    for header in parsed {
        headers.append_raw(header.name, header.value)?;
    }
    Ok(Part {
        headers,
        body: data[consumed..].to_vec(),
    })
}

/// An inclusive byte range of a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}
impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{total}", self.start, self.end)
    }
}

/// The outcome of evaluating a `Range` header against a body length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ranges {
    Satisfiable(Vec<ByteRange>),
    /// Every requested range lies past the end of the body
    Unsatisfiable,
}

/// Evaluate a `Range` header of the `bytes=` unit against a body of `len` bytes.
///
/// `a-b`, `a-` and the suffix form `-n` are accepted, with ends clamped to the body.
/// `None` means the header is invalid or uses another unit, so the range is ignored and the whole body served.
pub fn parse_range(header: &str, len: u64) -> Option<Ranges> {
    let spec = header.trim().strip_prefix("bytes=")?;
    let mut ranges = Vec::new();
    for item in spec.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (first, last) = item.split_once('-')?;
        let (first, last) = (first.trim(), last.trim());
        let range = if first.is_empty() {
            let suffix: u64 = last.parse().ok()?;
            if suffix == 0 || len == 0 {
                continue;
            }
            ByteRange {
                start: len.saturating_sub(suffix),
                end: len - 1,
            }
        } else {
            let start: u64 = first.parse().ok()?;
            let end = match last {
                "" => None,
                x => Some(x.parse::<u64>().ok()?),
            };
            if end.map(|x| x < start).unwrap_or(false) {
                return None;
            }
            if start >= len {
                continue;
            }
            ByteRange {
                start,
                end: end.map(|x| x.min(len - 1)).unwrap_or(len - 1),
            }
        };
        ranges.push(range);
    }
    if ranges.is_empty() {
        Some(Ranges::Unsatisfiable)
    } else {
        Some(Ranges::Satisfiable(ranges))
    }
}

/// Answer a request for `body`, honoring its `Range` header.
///
/// Without a usable range the whole body is sent with `200`. One range yields a `206` with
/// `Content-Range`, several yield a `206` of `multipart/byteranges`, and an unsatisfiable
/// range yields a `416`.
pub fn byteranges_response(
    range: Option<&str>,
    content_type: &str,
    body: &[u8],
) -> Result<Response, HttpError> {
    let total = body.len() as u64;
    let ranges = match range.and_then(|x| parse_range(x, total)) {
        None => {
            return Response::with_content(200, content_type, body)
                .with_header("Accept-Ranges", "bytes")
        }
        Some(Ranges::Unsatisfiable) => {
            return Response::error(StatusCode::RANGE_NOT_SATISFIABLE, None)
                .with_header("Content-Range", &format!("bytes */{total}"))
        }
        Some(Ranges::Satisfiable(x)) => x,
    };
    let slice = |range: &ByteRange| &body[range.start as usize..=range.end as usize];
    if let [single] = ranges.as_slice() {
        return Response::with_content(206, content_type, slice(single))
            .with_header("Content-Range", &single.content_range(total))?
            .with_header("Accept-Ranges", "bytes");
    }
    let mut multipart = Multipart::new("byteranges");
    for range in &ranges {
        let mut part = Part::new(slice(range));
        part.headers.insert("Content-Type", content_type)?;
        part.headers
            .insert("Content-Range", &range.content_range(total))?;
        multipart.push(part);
    }
    multipart
        .into_response(206)
        .with_header("Accept-Ranges", "bytes")
}

/// A `Content-Disposition` header value for a `form-data` part, quoting as needed.
pub fn form_disposition(name: &str, filename: Option<&str>) -> String {
    let mut out = String::from("form-data");
    let _ = write!(out, "; name=\"{}\"", name.replace('"', "\\\""));
    if let Some(filename) = filename {
        let _ = write!(out, "; filename=\"{}\"", filename.replace('"', "\\\""));
    }
    out
}

#[cfg(test)]
mod test {
    use http::StatusCode;

    use super::{byteranges_response, parse_range, ByteRange, Multipart, Part, Ranges};

    #[test]
    fn test_build_and_parse_form_data() {
        let form = Multipart::form_data()
            .with_boundary("XyZ")
            .with_part(Part::form_field("title", "hello").unwrap())
            .with_part(Part::form_file("upload", "a.txt", "text/plain", "line1\r\nline2").unwrap());
        let content_type = form.content_type();
        assert_eq!(content_type, "multipart/form-data; boundary=XyZ");
        let encoded = form.encode();
        assert!(encoded.starts_with(b"--XyZ\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello\r\n"));
        assert!(encoded.ends_with(b"--XyZ--\r\n"));

        let parsed = Multipart::parse(&content_type, &encoded).unwrap();
        assert_eq!(parsed, form);
        let upload = parsed.part("upload").unwrap();
        assert_eq!(upload.filename(), Some("a.txt"));
        assert_eq!(upload.text(), Some("line1\r\nline2"));
    }

    #[test]
    fn test_parse_with_preamble_and_no_part_headers() {
        let body = b"preamble\r\n--b\r\n\r\nfirst\r\n--b\r\nContent-Type: text/plain\r\n\r\nsecond\r\n--b--";
        let parsed = Multipart::parse("multipart/mixed; boundary=\"b\"", body).unwrap();
        assert_eq!(parsed.subtype(), "mixed");
        assert_eq!(parsed.parts().len(), 2);
        assert_eq!(parsed.parts()[0].text(), Some("first"));
        assert_eq!(parsed.parts()[1].content_type(), Some("text/plain"));
        assert!(Multipart::parse("text/plain", body).is_err());
        assert!(Multipart::parse("multipart/mixed; boundary=b", b"--b\r\n\r\nunterminated").is_err());
    }

    #[test]
    fn test_parse_range_forms() {
        let satisfiable = |x: &str| match parse_range(x, 100) {
            Some(Ranges::Satisfiable(ranges)) => ranges,
            other => panic!("{x}: {other:?}"),
        };
        assert_eq!(satisfiable("bytes=0-9"), vec![ByteRange { start: 0, end: 9 }]);
        assert_eq!(satisfiable("bytes=90-"), vec![ByteRange { start: 90, end: 99 }]);
        assert_eq!(satisfiable("bytes=-5"), vec![ByteRange { start: 95, end: 99 }]);
        assert_eq!(satisfiable("bytes=95-200"), vec![ByteRange { start: 95, end: 99 }]);
        assert_eq!(satisfiable("bytes=0-0, 10-19").len(), 2);
        assert_eq!(parse_range("bytes=100-", 100), Some(Ranges::Unsatisfiable));
        assert_eq!(parse_range("bytes=9-1", 100), None);
        assert_eq!(parse_range("items=0-1", 100), None);
    }

    #[test]
    fn test_byteranges_responses() {
        let body = b"0123456789";
        let full = byteranges_response(None, "text/plain", body).unwrap();
        assert_eq!(full.status(), StatusCode::OK);

        let single = byteranges_response(Some("bytes=2-4"), "text/plain", body).unwrap();
        assert_eq!(single.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(single.headers().get("Content-Range"), Some("bytes 2-4/10"));
        assert_eq!(single.body().as_text(), Some("234"));

        let multi = byteranges_response(Some("bytes=0-1,-2"), "text/plain", body).unwrap();
        let content_type = multi.headers().get("Content-Type").unwrap().to_owned();
        assert!(content_type.starts_with("multipart/byteranges; boundary="));
        let parts = Multipart::parse(&content_type, multi.body().as_bytes().unwrap()).unwrap();
        assert_eq!(parts.parts()[0].text(), Some("01"));
        assert_eq!(parts.parts()[1].headers.get("Content-Range"), Some("bytes 8-9/10"));

        let unsatisfiable = byteranges_response(Some("bytes=50-"), "text/plain", body).unwrap();
        assert_eq!(unsatisfiable.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(unsatisfiable.headers().get("Content-Range"), Some("bytes */10"));
    }
}
