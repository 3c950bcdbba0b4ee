//! Transparent decoding of `gzip` and `deflate` content codings, backed by `flate2`.

use std::io::{Read, Write};

use flate2::{
    write::{GzDecoder, ZlibDecoder},
    Compression,
};

use crate::{
    body::{Body, BodySource},
    error::HttpError,
    log::debug,
    message::{Headers, Response},
};

/// A content coding this module can undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Coding {
    Gzip,
    Deflate,
}
impl Coding {
    /// The coding named by a `Content-Encoding` header, if it is the only one applied.
    pub fn from_headers(headers: &Headers) -> Option<Self> {
        let value = headers.get("Content-Encoding")?.trim();
        if value.eq_ignore_ascii_case("gzip") || value.eq_ignore_ascii_case("x-gzip") {
            Some(Self::Gzip)
        } else if value.eq_ignore_ascii_case("deflate") {
            Some(Self::Deflate)
        } else {
            None
        }
    }
}

enum Inflater {
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}
impl Inflater {
    fn new(coding: Coding) -> Self {
        match coding {
            Coding::Gzip => Self::Gzip(GzDecoder::new(Vec::new())),
            Coding::Deflate => Self::Deflate(ZlibDecoder::new(Vec::new())),
        }
    }

    /// Feed compressed bytes, returning whatever inflated output is ready.
    fn feed(&mut self, data: &[u8]) -> Result<Vec<u8>, HttpError> {
        match self {
            Self::Gzip(x) => {
                x.write_all(data)?;
                Ok(std::mem::take(x.get_mut()))
            }
            Self::Deflate(x) => {
                x.write_all(data)?;
                Ok(std::mem::take(x.get_mut()))
            }
        }
    }

    fn finish(&mut self) -> Result<Vec<u8>, HttpError> {
        match self {
            Self::Gzip(x) => {
                x.try_finish()?;
                Ok(std::mem::take(x.get_mut()))
            }
            Self::Deflate(x) => {
                x.try_finish()?;
                Ok(std::mem::take(x.get_mut()))
            }
        }
    }
}

/// Inflate a complete body.
pub fn decode(coding: Coding, data: &[u8]) -> Result<Vec<u8>, HttpError> {
    let mut inflater = Inflater::new(coding);
    let mut out = inflater.feed(data)?;
    out.extend(inflater.finish()?);
    Ok(out)
}

/// Gzip a complete body.
pub fn gzip(data: &[u8]) -> Result<Vec<u8>, HttpError> {
    let mut encoder = flate2::read::GzEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    encoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Undo the content coding of a response, leaving unknown codings untouched.
///
/// Full bodies are inflated immediately. Streaming bodies are inflated as their data arrives.
/// The `Content-Encoding` and `Content-Length` headers are dropped from a decoded response.
pub fn decode_response(response: Response) -> Result<Response, HttpError> {
    let Some(coding) = Coding::from_headers(response.headers()) else {
        return Ok(response);
    };
    let (mut header, body) = response.into_parts();
    header.headers.remove("Content-Encoding");
    header.headers.remove("Content-Length");
    let body = match body {
        Body::Empty => Body::Empty,
        Body::Full(data) => Body::Full(decode(coding, &data)?),
        Body::Streaming(source) => Body::Streaming(inflate_source(coding, source)),
    };
    Ok(Response::from_parts(header, body))
}

/// A source yielding the inflated data of `compressed`.
fn inflate_source(coding: Coding, compressed: BodySource) -> BodySource {
    let inflated = BodySource::new();
    let output = inflated.clone();
    let mut inflater = Inflater::new(coding);
    compressed.set_data_handler(move |source| {
        if output.is_destroyed() {
            source.destroy();
            return;
        }
        let step = match source.read_available() {
            Ok(Some(data)) => inflater.feed(&data).map(|x| (x, false)),
            Ok(None) => inflater.finish().map(|x| (x, true)),
            Err(err) => Err(err),
        };
        match step {
            Ok((data, finished)) => {
                output.push(data);
                if finished {
                    output.complete(source.trailers());
                }
            }
            Err(err) => {
                debug!("inflating body failed: {err}");
                output.fail(HttpError::protocol(format!("invalid compressed body: {err}")));
                source.destroy();
            }
        }
    });
    inflated
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{decode, decode_response, gzip, Coding};
    use crate::{
        body::{Body, BodySource},
        message::Response,
    };

    #[test]
    fn test_gzip_round_trip() {
        let compressed = gzip(b"hello hello hello").unwrap();
        assert_ne!(compressed, b"hello hello hello");
        assert_eq!(decode(Coding::Gzip, &compressed).unwrap(), b"hello hello hello");
        assert!(decode(Coding::Gzip, b"not gzip").is_err());
    }

    #[test]
    fn test_decode_full_response() {
        let response = Response::with_content(200, "text/plain", gzip(b"payload").unwrap())
            .with_header("Content-Encoding", "gzip")
            .unwrap();
        let decoded = decode_response(response).unwrap();
        assert_eq!(decoded.body().as_text(), Some("payload"));
        assert!(decoded.headers().get("Content-Encoding").is_none());
    }

    #[test]
    fn test_decode_streaming_response() {
        let compressed = gzip(b"streamed payload").unwrap();
        let source = BodySource::new();
        let response = Response::with_content(200, "text/plain", source.clone())
            .with_header("Content-Encoding", "gzip")
            .unwrap();
        let decoded = decode_response(response).unwrap();
        let (first, rest) = compressed.split_at(compressed.len() / 2);
        source.push(first.to_vec());
        source.push(rest.to_vec());
        source.complete(None);
        let Body::Streaming(inflated) = decoded.body().clone() else {
            panic!("expected a streaming body");
        };
        assert_eq!(
            inflated.read_to_end(Duration::from_secs(1)).unwrap(),
            b"streamed payload"
        );
    }
}
