//! Body transfer strategies: fixed-length, chunked, and close-delimited codecs.
//!
//! A [`BodyDecoder`] consumes raw connection bytes and yields body bytes, and a [`BodyEncoder`]
//! does the reverse. Both are independent from threading and from the transport, and are driven
//! by the connection state machines in [`crate::parser`], [`crate::client`], and [`crate::server`].

use std::io::Write;

use crate::{error::HttpError, message::Headers};

/// Longest accepted chunk-size or trailer line
const MAX_LINE_LENGTH: usize = 8 * 1024;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyFraming {
    /// No body at all
    Empty,
    /// Exactly N bytes, declared by `Content-Length`
    FixedLength(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Body ends when the peer closes the connection
    CloseDelimited,
}
impl BodyFraming {
    /// True if the body ends only at connection close, making the connection non-persistent.
    pub fn is_close_delimited(&self) -> bool {
        *self == BodyFraming::CloseDelimited
    }
}

/// Returned by [`BodyDecoder::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Raw bytes consumed from the input
    pub consumed: usize,
    /// True once the body is complete; bytes beyond `consumed` belong to the next message.
    pub complete: bool,
}

/// Incremental body decoder.
#[derive(Debug)]
pub enum BodyDecoder {
    Empty,
    FixedLength { remaining: u64, received: u64 },
    Chunked(ChunkedDecoder),
    CloseDelimited { eof: bool },
}
impl BodyDecoder {
    pub fn new(framing: BodyFraming) -> Self {
        match framing {
            BodyFraming::Empty | BodyFraming::FixedLength(0) => Self::Empty,
            BodyFraming::FixedLength(len) => Self::FixedLength {
                remaining: len,
                received: 0,
            },
            BodyFraming::Chunked => Self::Chunked(ChunkedDecoder::new()),
            BodyFraming::CloseDelimited => Self::CloseDelimited { eof: false },
        }
    }

    /// Consume as much of `input` as belongs to this body, appending decoded data to `out`.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<Decoded, HttpError> {
        match self {
            Self::Empty => Ok(Decoded {
                consumed: 0,
                complete: true,
            }),
            Self::FixedLength {
                remaining,
                received,
            } => {
                let take = (*remaining).min(input.len() as u64) as usize;
                out.extend_from_slice(&input[..take]);
                *remaining -= take as u64;
                *received += take as u64;
                Ok(Decoded {
                    consumed: take,
                    complete: *remaining == 0,
                })
            }
            Self::Chunked(decoder) => decoder.feed(input, out),
            Self::CloseDelimited { eof } => {
                out.extend_from_slice(input);
                Ok(Decoded {
                    consumed: input.len(),
                    complete: *eof,
                })
            }
        }
    }

    /// Signal that the peer closed the connection.
    ///
    /// Completes a close-delimited body, and fails any other body that is not yet complete.
    pub fn eof(&mut self) -> Result<(), HttpError> {
        match self {
            Self::Empty => Ok(()),
            Self::FixedLength {
                remaining,
                received,
            } => {
                if *remaining == 0 {
                    Ok(())
                } else {
                    Err(HttpError::PrematureBodyEnd(format!(
                        "received {received} of {} declared bytes",
                        *received + *remaining
                    )))
                }
            }
            Self::Chunked(decoder) => {
                if decoder.is_complete() {
                    Ok(())
                } else {
                    Err(HttpError::PrematureBodyEnd(
                        "connection closed before terminating chunk".into(),
                    ))
                }
            }
            Self::CloseDelimited { eof } => {
                *eof = true;
                Ok(())
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::FixedLength { remaining, .. } => *remaining == 0,
            Self::Chunked(decoder) => decoder.is_complete(),
            Self::CloseDelimited { eof } => *eof,
        }
    }

    /// Trailers received after the last chunk, if any.
    pub fn take_trailers(&mut self) -> Option<Headers> {
        match self {
            Self::Chunked(decoder) => decoder.trailers.take().filter(|x| !x.is_empty()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataCr,
    DataLf,
    Trailers,
    Done,
}

/// Chunked transfer decoder.
///
/// Chunk boundaries may fall at any byte offset across calls to `feed`. Line terminators may be
/// `\r\n` or a bare `\n`, and chunk extensions are ignored.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    line: Vec<u8>,
    trailers: Option<Headers>,
}
impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::new(),
            trailers: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkState::Done
    }

    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<Decoded, HttpError> {
        let mut pos = 0;
        while pos < input.len() && self.state != ChunkState::Done {
            match self.state {
                ChunkState::Size => {
                    if let Some(line) = self.take_line(input, &mut pos)? {
                        let size = parse_chunk_size(&line)?;
                        self.state = if size == 0 {
                            self.trailers = Some(Headers::new());
                            ChunkState::Trailers
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                }
                ChunkState::Data(remaining) => {
                    let take = remaining.min((input.len() - pos) as u64) as usize;
                    out.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        ChunkState::DataCr
                    } else {
                        ChunkState::Data(remaining)
                    };
                }
                ChunkState::DataCr => {
                    match input[pos] {
                        b'\r' => self.state = ChunkState::DataLf,
                        b'\n' => self.state = ChunkState::Size,
                        x => {
                            return Err(HttpError::ChunkFormat(format!(
                                "expected line break after chunk data, found {x:#04x}"
                            )))
                        }
                    }
                    pos += 1;
                }
                ChunkState::DataLf => {
                    if input[pos] != b'\n' {
                        return Err(HttpError::ChunkFormat(
                            "expected LF after CR following chunk data".into(),
                        ));
                    }
                    pos += 1;
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    if let Some(line) = self.take_line(input, &mut pos)? {
                        if line.is_empty() {
                            self.state = ChunkState::Done;
                        } else {
                            let trailers = self.trailers.get_or_insert_with(Headers::new);
                            parse_trailer(&line, trailers)?;
                        }
                    }
                }
                ChunkState::Done => {}
            }
        }
        Ok(Decoded {
            consumed: pos,
            complete: self.state == ChunkState::Done,
        })
    }

    /// Accumulate a line across calls, returning it without its terminator once complete.
    fn take_line(&mut self, input: &[u8], pos: &mut usize) -> Result<Option<Vec<u8>>, HttpError> {
        let rest = &input[*pos..];
        match rest.iter().position(|x| *x == b'\n') {
            Some(idx) => {
                self.line.extend_from_slice(&rest[..idx]);
                *pos += idx + 1;
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            None => {
                self.line.extend_from_slice(rest);
                *pos = input.len();
                if self.line.len() > MAX_LINE_LENGTH {
                    return Err(HttpError::ChunkFormat("chunk line too long".into()));
                }
                Ok(None)
            }
        }
    }
}
impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let size = match line.iter().position(|x| *x == b';') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let size = std::str::from_utf8(size)
        .map_err(|_| HttpError::ChunkFormat("chunk size is not ascii".into()))?
        .trim();
    if size.is_empty() {
        return Err(HttpError::ChunkFormat("empty chunk size".into()));
    }
    u64::from_str_radix(size, 16)
        .map_err(|_| HttpError::ChunkFormat(format!("invalid chunk size '{size}'")))
}

fn parse_trailer(line: &[u8], trailers: &mut Headers) -> Result<(), HttpError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HttpError::ChunkFormat("trailer is not valid utf-8".into()))?;
    match text.split_once(':') {
        Some((name, value)) => trailers.append(name.trim(), value.trim()),
        None => Err(HttpError::ChunkFormat(format!("invalid trailer '{text}'"))),
    }
}

/// Incremental body encoder, enforcing the declared framing.
#[derive(Debug)]
pub struct BodyEncoder {
    framing: BodyFraming,
    written: u64,
    finished: bool,
}
impl BodyEncoder {
    pub fn new(framing: BodyFraming) -> Self {
        Self {
            framing,
            written: 0,
            finished: false,
        }
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes of body written so far, excluding framing overhead.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Encode `data`, returning the number of body bytes accepted.
    ///
    /// Each call emits one chunk when chunked.
    pub fn encode(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<usize, HttpError> {
        if self.finished {
            return Err(HttpError::ClosedChannel);
        }
        if data.is_empty() {
            return Ok(0);
        }
        match self.framing {
            BodyFraming::Empty => {
                return Err(HttpError::protocol("message does not allow a body"));
            }
            BodyFraming::FixedLength(declared) => {
                if self.written + data.len() as u64 > declared {
                    return Err(HttpError::protocol(format!(
                        "write of {} bytes exceeds declared content-length {declared} ({} already written)",
                        data.len(),
                        self.written
                    )));
                }
                out.extend_from_slice(data);
            }
            BodyFraming::Chunked => {
                out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            BodyFraming::CloseDelimited => out.extend_from_slice(data),
        }
        self.written += data.len() as u64;
        Ok(data.len())
    }

    /// Terminate the body, emitting the last chunk and any trailers when chunked.
    pub fn finish(&mut self, trailers: Option<&Headers>, out: &mut Vec<u8>) -> Result<(), HttpError> {
        if self.finished {
            return Err(HttpError::ClosedChannel);
        }
        if let BodyFraming::FixedLength(declared) = self.framing {
            if self.written < declared {
                return Err(HttpError::protocol(format!(
                    "close attempted before declared length fully written ({} of {declared} bytes)",
                    self.written
                )));
            }
        }
        if self.framing == BodyFraming::Chunked {
            out.extend_from_slice(b"0\r\n");
            if let Some(trailers) = trailers {
                trailers.encode(out);
            }
            out.extend_from_slice(b"\r\n");
        }
        self.finished = true;
        Ok(())
    }
}

/// Serialize a complete body as chunks of at most `chunk_size` bytes, followed by the last chunk.
pub fn encode_chunked(body: &[u8], chunk_size: usize, out: &mut Vec<u8>) -> Result<(), HttpError> {
    let mut encoder = chunked_transfer::Encoder::with_chunks_size(out, chunk_size.max(1));
    encoder.write_all(body)?;
    // dropping the encoder writes the pending chunk and the last chunk
    drop(encoder);
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use super::{encode_chunked, BodyDecoder, BodyEncoder, BodyFraming};
    use crate::error::HttpError;

    fn decode_all(framing: BodyFraming, input: &[u8]) -> (Vec<u8>, usize, bool) {
        let mut decoder = BodyDecoder::new(framing);
        let mut out = Vec::new();
        let decoded = decoder.feed(input, &mut out).unwrap();
        (out, decoded.consumed, decoded.complete)
    }

    #[test]
    fn test_chunked_mixed_line_breaks() {
        let input = b"5\r\n12345\n3\n678\r\n4\r\n9012\n3\r\n345\r\n0\n\r\n";
        let (out, consumed, complete) = decode_all(BodyFraming::Chunked, input);
        assert_eq!(out, b"123456789012345");
        assert_eq!(consumed, input.len());
        assert!(complete);
    }

    #[test]
    fn test_chunked_split_at_every_offset() {
        let input = b"5\r\n12345\r\n3\r\n678\r\n4\r\n9012\r\n3\r\n345\r\n0\r\n\r\nNEXT";
        for split in 0..input.len() {
            let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
            let mut out = Vec::new();
            let first = decoder.feed(&input[..split], &mut out).unwrap();
            assert_eq!(first.consumed, split.min(input.len() - 4));
            let second = decoder.feed(&input[first.consumed..], &mut out).unwrap();
            assert!(second.complete, "split at {split}");
            assert_eq!(first.consumed + second.consumed, input.len() - 4);
            assert_eq!(out, b"123456789012345");
        }
    }

    #[test]
    fn test_chunked_extensions_and_trailers() {
        let input = b"4;name=value\r\nwiki\r\n0\r\nExpires: never\r\nX-Sum: 9\r\n\r\n";
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let mut out = Vec::new();
        let decoded = decoder.feed(input, &mut out).unwrap();
        assert!(decoded.complete);
        assert_eq!(out, b"wiki");
        let trailers = decoder.take_trailers().unwrap();
        assert_eq!(trailers.get("expires"), Some("never"));
        assert_eq!(trailers.get("X-SUM"), Some("9"));
    }

    #[test]
    fn test_chunked_non_hex_size() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let err = decoder.feed(b"zz\r\nabc", &mut Vec::new()).unwrap_err();
        assert!(matches!(err, HttpError::ChunkFormat(_)));
    }

    #[test]
    fn test_chunked_missing_crlf_after_data() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        let err = decoder.feed(b"3\r\nabcX", &mut Vec::new()).unwrap_err();
        assert!(matches!(err, HttpError::ChunkFormat(_)));
    }

    #[test]
    fn test_chunked_premature_eof() {
        let mut decoder = BodyDecoder::new(BodyFraming::Chunked);
        decoder.feed(b"5\r\n123", &mut Vec::new()).unwrap();
        assert!(matches!(
            decoder.eof().unwrap_err(),
            HttpError::PrematureBodyEnd(_)
        ));
    }

    #[test]
    fn test_fixed_length_stops_at_declared_length() {
        let (out, consumed, complete) = decode_all(BodyFraming::FixedLength(4), b"testGET /");
        assert_eq!(out, b"test");
        assert_eq!(consumed, 4);
        assert!(complete);
    }

    #[test]
    fn test_fixed_length_premature_eof() {
        let mut decoder = BodyDecoder::new(BodyFraming::FixedLength(10));
        decoder.feed(b"abc", &mut Vec::new()).unwrap();
        assert!(!decoder.is_complete());
        assert!(matches!(
            decoder.eof().unwrap_err(),
            HttpError::PrematureBodyEnd(_)
        ));
    }

    #[test]
    fn test_close_delimited_completes_on_eof() {
        let mut decoder = BodyDecoder::new(BodyFraming::CloseDelimited);
        let mut out = Vec::new();
        assert!(!decoder.feed(b"abc", &mut out).unwrap().complete);
        assert!(!decoder.feed(b"def", &mut out).unwrap().complete);
        decoder.eof().unwrap();
        assert!(decoder.is_complete());
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn test_fixed_length_encoder_exactness() {
        let mut out = Vec::new();
        let mut exact = BodyEncoder::new(BodyFraming::FixedLength(5));
        exact.encode(b"12", &mut out).unwrap();
        exact.encode(b"345", &mut out).unwrap();
        exact.finish(None, &mut out).unwrap();
        assert_eq!(out, b"12345");

        let mut short = BodyEncoder::new(BodyFraming::FixedLength(5));
        short.encode(b"123", &mut out).unwrap();
        assert!(matches!(
            short.finish(None, &mut out).unwrap_err(),
            HttpError::Protocol(_)
        ));

        let mut long = BodyEncoder::new(BodyFraming::FixedLength(5));
        long.encode(b"1234", &mut out).unwrap();
        assert!(matches!(
            long.encode(b"56", &mut out).unwrap_err(),
            HttpError::Protocol(_)
        ));
    }

    #[test]
    fn test_write_after_finish() {
        let mut out = Vec::new();
        let mut encoder = BodyEncoder::new(BodyFraming::Chunked);
        encoder.encode(b"abc", &mut out).unwrap();
        encoder.finish(None, &mut out).unwrap();
        assert_eq!(out, b"3\r\nabc\r\n0\r\n\r\n");
        assert!(matches!(
            encoder.encode(b"x", &mut out).unwrap_err(),
            HttpError::ClosedChannel
        ));
    }

    #[test]
    fn test_chunked_interop_with_chunked_transfer() {
        let payload: Vec<u8> = (0..10_000u32).map(|x| (x % 251) as u8).collect();
        for size in [0usize, 1, 10_000] {
            let body = &payload[..size];

            // our encoder, their decoder
            let mut out = Vec::new();
            let mut encoder = BodyEncoder::new(BodyFraming::Chunked);
            for part in body.chunks(777) {
                encoder.encode(part, &mut out).unwrap();
            }
            encoder.finish(None, &mut out).unwrap();
            let mut decoded = Vec::new();
            chunked_transfer::Decoder::new(out.as_slice())
                .read_to_end(&mut decoded)
                .unwrap();
            assert_eq!(decoded, body);

            // their encoder, our decoder
            let mut out = Vec::new();
            encode_chunked(body, 512, &mut out).unwrap();
            let (decoded, _, complete) = decode_all(BodyFraming::Chunked, &out);
            assert!(complete);
            assert_eq!(decoded, body);
        }
    }
}
