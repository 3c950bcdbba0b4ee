//! Message bodies and the non-blocking body source/sink handles.
//!
//! A [`BodySource`] is the receiving end of a streamed body: the connection pushes decoded data
//! into it while the application reads, registers a data handler, or suspends delivery.
//! A [`BodySink`] is the sending end: the application writes into it and the connection drains
//! the encoded bytes to the wire as buffer space allows.
//!
//! Both are cheap to clone and safe to share between the I/O thread and application threads.

use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::{
    codec::{BodyEncoder, BodyFraming},
    dispatch::assert_blocking_allowed,
    error::{HttpError, TimeoutKind},
    message::Headers,
};

/// Buffered bytes above which a connection stops reading for a body source
const DEFAULT_HIGH_WATER_MARK: usize = 1024 * 1024;

/// A message body.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    /// A fully buffered body
    Full(Vec<u8>),
    /// A body that is still being received
    Streaming(BodySource),
}
impl Body {
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Full(x) => x.is_empty(),
            Body::Streaming(_) => false,
        }
    }

    /// The buffered bytes, or `None` for a streaming body.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Empty => Some(&[]),
            Body::Full(x) => Some(x),
            Body::Streaming(_) => None,
        }
    }

    /// The buffered bytes as UTF-8, or `None` for a streaming or non-UTF-8 body.
    pub fn as_text(&self) -> Option<&str> {
        self.as_bytes().and_then(|x| std::str::from_utf8(x).ok())
    }

    /// Length known without reading, if any.
    pub fn known_len(&self) -> Option<u64> {
        self.as_bytes().map(|x| x.len() as u64)
    }

    /// Read the whole body, blocking up to `timeout` for a streaming body.
    pub fn into_bytes(self, timeout: Duration) -> Result<Vec<u8>, HttpError> {
        match self {
            Body::Empty => Ok(Vec::new()),
            Body::Full(x) => Ok(x),
            Body::Streaming(source) => source.read_to_end(timeout),
        }
    }

    pub fn into_string(self, timeout: Duration) -> Result<String, HttpError> {
        String::from_utf8(self.into_bytes(timeout)?)
            .map_err(|_| HttpError::protocol("body is not valid utf-8"))
    }
}

/// Extensible public trait to support a variety of body types.
pub trait IntoBody {
    fn into_body(self) -> Body;
}
impl IntoBody for Body {
    fn into_body(self) -> Body {
        self
    }
}
impl IntoBody for String {
    fn into_body(self) -> Body {
        Body::Full(self.into_bytes())
    }
}
impl IntoBody for &str {
    fn into_body(self) -> Body {
        Body::Full(self.as_bytes().to_vec())
    }
}
impl IntoBody for Vec<u8> {
    fn into_body(self) -> Body {
        Body::Full(self)
    }
}
impl IntoBody for &[u8] {
    fn into_body(self) -> Body {
        Body::Full(self.to_vec())
    }
}
impl IntoBody for () {
    fn into_body(self) -> Body {
        Body::Empty
    }
}
impl IntoBody for BodySource {
    fn into_body(self) -> Body {
        Body::Streaming(self)
    }
}

type DataHandler = Box<dyn FnMut(&BodySource) + Send + 'static>;

struct SourceState {
    chunks: VecDeque<Vec<u8>>,
    buffered: usize,
    complete: bool,
    error: Option<HttpError>,
    destroyed: bool,
    suspended: bool,
    handler: Option<DataHandler>,
    handler_running: bool,
    /// An event arrived while the handler was running
    renotify: bool,
    high_water_mark: usize,
    trailers: Option<Headers>,
}

struct SourceShared {
    state: Mutex<SourceState>,
    ready: Condvar,
}

/// The receiving end of a streamed body.
#[derive(Clone)]
pub struct BodySource {
    shared: Arc<SourceShared>,
}
impl BodySource {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(SourceShared {
                state: Mutex::new(SourceState {
                    chunks: VecDeque::new(),
                    buffered: 0,
                    complete: false,
                    error: None,
                    destroyed: false,
                    suspended: false,
                    handler: None,
                    handler_running: false,
                    renotify: false,
                    high_water_mark: DEFAULT_HIGH_WATER_MARK,
                    trailers: None,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    /// A source that is already complete with the given bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let source = Self::new();
        source.push(data);
        source.complete(None);
        source
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        // a poisoned lock only means a handler panicked, the state itself stays consistent
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bytes currently buffered, or `None` once the body has been fully consumed.
    pub fn available(&self) -> Result<Option<usize>, HttpError> {
        let state = self.lock();
        if state.buffered > 0 {
            return Ok(Some(state.buffered));
        }
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        if state.destroyed {
            return Err(HttpError::ClosedChannel);
        }
        if state.complete {
            Ok(None)
        } else {
            Ok(Some(0))
        }
    }

    /// Take all buffered bytes without blocking, or `None` once the body has been fully consumed.
    pub fn read_available(&self) -> Result<Option<Vec<u8>>, HttpError> {
        let mut state = self.lock();
        if state.buffered > 0 {
            return Ok(Some(drain_chunks(&mut state)));
        }
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        if state.destroyed {
            return Err(HttpError::ClosedChannel);
        }
        if state.complete {
            Ok(None)
        } else {
            Ok(Some(Vec::new()))
        }
    }

    /// Block until the body is complete, up to `timeout`.
    ///
    /// Fails when called from an I/O dispatch thread.
    pub fn read_to_end(&self, timeout: Duration) -> Result<Vec<u8>, HttpError> {
        assert_blocking_allowed()?;
        // too far out to represent means no deadline at all
        let deadline = Instant::now().checked_add(timeout);
        let mut out = Vec::new();
        let mut state = self.lock();
        loop {
            out.extend(drain_chunks(&mut state));
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
            if state.destroyed {
                return Err(HttpError::ClosedChannel);
            }
            if state.complete {
                return Ok(out);
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(HttpError::Timeout(TimeoutKind::Call, timeout));
                    }
                    self.shared
                        .ready
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                None => self
                    .shared
                    .ready
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }

    pub fn read_string(&self, timeout: Duration) -> Result<String, HttpError> {
        String::from_utf8(self.read_to_end(timeout)?)
            .map_err(|_| HttpError::protocol("body is not valid utf-8"))
    }

    /// Register a callback invoked whenever data arrives or the body completes or fails.
    ///
    /// The callback runs on whichever thread delivers the data, usually the I/O thread, and must not block.
    /// It is invoked immediately if data is already available.
    pub fn set_data_handler<F>(&self, handler: F)
    where
        F: FnMut(&BodySource) + Send + 'static,
    {
        let ready = {
            let mut state = self.lock();
            state.handler = Some(Box::new(handler));
            state.buffered > 0 || state.complete || state.error.is_some()
        };
        if ready {
            self.notify();
        }
    }

    /// Stop the connection from reading more data for this body.
    pub fn suspend(&self) {
        self.lock().suspended = true;
    }

    pub fn resume(&self) {
        self.lock().suspended = false;
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    /// Abandon the body. The connection delivering it is closed and will not be reused.
    pub fn destroy(&self) {
        let mut state = self.lock();
        state.destroyed = true;
        state.chunks.clear();
        state.buffered = 0;
        drop(state);
        self.shared.ready.notify_all();
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// True once all data has been received, whether or not it has been read.
    pub fn is_complete(&self) -> bool {
        self.lock().complete
    }

    pub fn trailers(&self) -> Option<Headers> {
        self.lock().trailers.clone()
    }

    /// Upper bound of buffered bytes before the connection stops reading.
    pub fn set_high_water_mark(&self, bytes: usize) {
        self.lock().high_water_mark = bytes.max(1);
    }

    /// True when the producer should deliver more data.
    pub(crate) fn wants_data(&self) -> bool {
        let state = self.lock();
        !state.suspended && !state.destroyed && state.buffered < state.high_water_mark
    }

    pub(crate) fn push(&self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        {
            let mut state = self.lock();
            if state.destroyed || state.complete || state.error.is_some() {
                return;
            }
            state.buffered += data.len();
            state.chunks.push_back(data);
        }
        self.shared.ready.notify_all();
        self.notify();
    }

    pub(crate) fn complete(&self, trailers: Option<Headers>) {
        {
            let mut state = self.lock();
            if state.complete || state.error.is_some() {
                return;
            }
            state.complete = true;
            state.trailers = trailers;
        }
        self.shared.ready.notify_all();
        self.notify();
    }

    pub(crate) fn fail(&self, err: HttpError) {
        {
            let mut state = self.lock();
            if state.complete || state.error.is_some() {
                return;
            }
            state.error = Some(err);
        }
        self.shared.ready.notify_all();
        self.notify();
    }

    pub(crate) fn is_finished(&self) -> bool {
        let state = self.lock();
        state.complete || state.error.is_some() || state.destroyed
    }

    /// Run the data handler outside of the lock, tolerating re-entrant registration.
    ///
    /// Events arriving while the handler runs make it run again once it returns.
    fn notify(&self) {
        let mut handler = {
            let mut state = self.lock();
            if state.handler_running {
                state.renotify = true;
                return;
            }
            match state.handler.take() {
                Some(x) => {
                    state.handler_running = true;
                    x
                }
                None => return,
            }
        };
        loop {
            handler(self);
            let mut state = self.lock();
            if state.handler.is_none() {
                state.handler = Some(handler);
            }
            if !state.renotify {
                state.handler_running = false;
                return;
            }
            state.renotify = false;
            match state.handler.take() {
                Some(x) => handler = x,
                None => {
                    state.handler_running = false;
                    return;
                }
            }
        }
    }
}
impl Debug for BodySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("BodySource")
            .field("buffered", &state.buffered)
            .field("complete", &state.complete)
            .field("destroyed", &state.destroyed)
            .field("suspended", &state.suspended)
            .finish()
    }
}

fn drain_chunks(state: &mut SourceState) -> Vec<u8> {
    state.buffered = 0;
    match state.chunks.len() {
        0 => Vec::new(),
        1 => state.chunks.pop_front().unwrap_or_default(),
        _ => {
            let mut out = Vec::new();
            for chunk in state.chunks.drain(..) {
                out.extend_from_slice(&chunk);
            }
            out
        }
    }
}

struct SinkState {
    encoder: BodyEncoder,
    pending: Vec<u8>,
    destroyed: bool,
    error: Option<HttpError>,
}

struct SinkShared {
    state: Mutex<SinkState>,
    drained: Condvar,
}

/// The sending end of a streamed body.
///
/// Writes never block: encoded bytes queue inside the sink until the connection drains them.
/// Use [`BodySink::pending_len`] to apply backpressure, or [`BodySink::flush`] from a thread that may block.
#[derive(Clone)]
pub struct BodySink {
    shared: Arc<SinkShared>,
}
impl BodySink {
    pub(crate) fn new(framing: BodyFraming) -> Self {
        Self {
            shared: Arc::new(SinkShared {
                state: Mutex::new(SinkState {
                    encoder: BodyEncoder::new(framing),
                    pending: Vec::new(),
                    destroyed: false,
                    error: None,
                }),
                drained: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_open(state: &SinkState) -> Result<(), HttpError> {
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        if state.destroyed {
            return Err(HttpError::ClosedChannel);
        }
        Ok(())
    }

    /// Write body data, returning the number of bytes accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize, HttpError> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        let SinkState {
            encoder, pending, ..
        } = &mut *state;
        encoder.encode(data, pending)
    }

    pub fn write_str(&self, data: &str) -> Result<usize, HttpError> {
        self.write(data.as_bytes())
    }

    /// Gracefully finish the body.
    pub fn close(&self) -> Result<(), HttpError> {
        self.close_with_trailers(None)
    }

    /// Finish a chunked body with trailer headers.
    pub fn close_with_trailers(&self, trailers: Option<&Headers>) -> Result<(), HttpError> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        let SinkState {
            encoder, pending, ..
        } = &mut *state;
        encoder.finish(trailers, pending)
    }

    /// Abandon the body without a terminator. The connection is closed and will not be reused.
    pub fn destroy(&self) {
        let mut state = self.lock();
        state.destroyed = true;
        state.pending.clear();
        drop(state);
        self.shared.drained.notify_all();
    }

    pub fn is_open(&self) -> bool {
        let state = self.lock();
        !state.destroyed && state.error.is_none() && !state.encoder.is_finished()
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Encoded bytes not yet taken by the connection.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn framing(&self) -> BodyFraming {
        self.lock().encoder.framing()
    }

    /// Block until the connection has taken every pending byte, up to `timeout`.
    ///
    /// Fails when called from an I/O dispatch thread.
    pub fn flush(&self, timeout: Duration) -> Result<(), HttpError> {
        assert_blocking_allowed()?;
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            Self::check_open(&state)?;
            if state.pending.is_empty() {
                return Ok(());
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(HttpError::Timeout(TimeoutKind::Call, timeout));
                    }
                    self.shared
                        .drained
                        .wait_timeout(state, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                None => self
                    .shared
                    .drained
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }

    /// Take up to `max` pending bytes for the wire.
    pub(crate) fn drain(&self, max: usize) -> SinkDrain {
        let mut state = self.lock();
        if state.destroyed {
            return SinkDrain::Destroyed;
        }
        if state.error.is_some() {
            return SinkDrain::Destroyed;
        }
        let take = state.pending.len().min(max);
        let data: Vec<u8> = if take == state.pending.len() {
            std::mem::take(&mut state.pending)
        } else {
            state.pending.drain(..take).collect()
        };
        let finished = state.encoder.is_finished() && state.pending.is_empty();
        drop(state);
        if !data.is_empty() {
            self.shared.drained.notify_all();
        }
        SinkDrain::Data { data, finished }
    }

    /// Fail the sink because its connection went away.
    pub(crate) fn fail(&self, err: HttpError) {
        let mut state = self.lock();
        if state.error.is_none() {
            state.error = Some(err);
        }
        drop(state);
        self.shared.drained.notify_all();
    }
}
impl Debug for BodySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("BodySink")
            .field("framing", &state.encoder.framing())
            .field("pending", &state.pending.len())
            .field("finished", &state.encoder.is_finished())
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

/// Returned by [`BodySink::drain`]
pub(crate) enum SinkDrain {
    Data { data: Vec<u8>, finished: bool },
    Destroyed,
}

#[cfg(test)]
mod test {
    use std::{
        sync::{mpsc, Arc, Mutex},
        thread,
        time::Duration,
    };

    use super::{BodySink, BodySource, SinkDrain};
    use crate::{codec::BodyFraming, error::HttpError};

    #[test]
    fn test_source_available_signals_end() {
        let source = BodySource::new();
        assert_eq!(source.available().unwrap(), Some(0));
        source.push(b"abc".to_vec());
        assert_eq!(source.available().unwrap(), Some(3));
        source.complete(None);
        assert_eq!(source.available().unwrap(), Some(3));
        assert_eq!(source.read_available().unwrap(), Some(b"abc".to_vec()));
        assert_eq!(source.available().unwrap(), None);
        assert_eq!(source.read_available().unwrap(), None);
    }

    #[test]
    fn test_source_read_to_end_across_threads() {
        let source = BodySource::new();
        let producer = source.clone();
        let handle = thread::spawn(move || {
            for part in ["12", "34", "5"] {
                producer.push(part.as_bytes().to_vec());
                thread::sleep(Duration::from_millis(5));
            }
            producer.complete(None);
        });
        assert_eq!(
            source.read_string(Duration::from_secs(5)).unwrap(),
            "12345"
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_source_read_to_end_times_out() {
        let source = BodySource::new();
        source.push(b"partial".to_vec());
        assert!(matches!(
            source.read_to_end(Duration::from_millis(10)).unwrap_err(),
            HttpError::Timeout(_, _)
        ));
    }

    #[test]
    fn test_source_data_handler() {
        let source = BodySource::new();
        source.push(b"early".to_vec());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        source.set_data_handler(move |source| {
            if let Ok(Some(data)) = source.read_available() {
                sink.lock().unwrap().extend_from_slice(&data);
            }
        });
        source.push(b" late".to_vec());
        source.complete(None);
        assert_eq!(received.lock().unwrap().as_slice(), b"early late");
    }

    #[test]
    fn test_source_data_handler_sees_events_from_other_threads() {
        let source = BodySource::new();
        let received = Arc::new(Mutex::new((Vec::new(), false)));
        let seen = Arc::clone(&received);
        let (started, wait_started) = mpsc::channel();
        let mut first = true;
        source.set_data_handler(move |source| {
            if first {
                first = false;
                let _ = started.send(());
                thread::sleep(Duration::from_millis(100));
            }
            loop {
                match source.read_available() {
                    Ok(Some(data)) if data.is_empty() => break,
                    Ok(Some(data)) => seen.lock().unwrap().0.extend_from_slice(&data),
                    Ok(None) => {
                        seen.lock().unwrap().1 = true;
                        break;
                    }
                    Err(_) => break,
                }
            }
        });
        let producer = source.clone();
        let handle = thread::spawn(move || {
            wait_started.recv().unwrap();
            producer.push(b"b".to_vec());
            producer.complete(None);
        });
        // runs the handler on this thread, which sleeps while the producer finishes
        source.push(b"a".to_vec());
        handle.join().unwrap();
        let received = received.lock().unwrap();
        assert_eq!(received.0, b"ab");
        assert!(received.1, "handler never saw the end of the body");
    }

    #[test]
    fn test_source_read_to_end_without_deadline() {
        let source = BodySource::from_bytes(b"done".to_vec());
        assert_eq!(source.read_to_end(Duration::MAX).unwrap(), b"done");
        let sink = BodySink::new(BodyFraming::Chunked);
        sink.flush(Duration::MAX).unwrap();
    }

    #[test]
    fn test_source_error_after_data() {
        let source = BodySource::new();
        source.push(b"abc".to_vec());
        source.fail(HttpError::ConnectionClosed);
        assert_eq!(source.read_available().unwrap(), Some(b"abc".to_vec()));
        assert!(matches!(
            source.read_available().unwrap_err(),
            HttpError::ConnectionClosed
        ));
    }

    #[test]
    fn test_source_backpressure() {
        let source = BodySource::new();
        source.set_high_water_mark(4);
        assert!(source.wants_data());
        source.push(b"12345".to_vec());
        assert!(!source.wants_data());
        source.read_available().unwrap();
        assert!(source.wants_data());
        source.suspend();
        assert!(!source.wants_data());
        source.resume();
        assert!(source.wants_data());
    }

    #[test]
    fn test_sink_chunked_drain() {
        let sink = BodySink::new(BodyFraming::Chunked);
        sink.write(b"test").unwrap();
        sink.write(b"12345").unwrap();
        match sink.drain(4) {
            SinkDrain::Data { data, finished } => {
                assert_eq!(data, b"4\r\nt");
                assert!(!finished);
            }
            SinkDrain::Destroyed => panic!("destroyed"),
        }
        sink.close().unwrap();
        match sink.drain(usize::MAX) {
            SinkDrain::Data { data, finished } => {
                assert_eq!(data, b"est\r\n5\r\n12345\r\n0\r\n\r\n");
                assert!(finished);
            }
            SinkDrain::Destroyed => panic!("destroyed"),
        }
        assert!(matches!(
            sink.write(b"late").unwrap_err(),
            HttpError::ClosedChannel
        ));
    }

    #[test]
    fn test_sink_destroy() {
        let sink = BodySink::new(BodyFraming::FixedLength(10));
        sink.write(b"abc").unwrap();
        sink.destroy();
        assert!(sink.is_destroyed());
        assert!(matches!(sink.drain(100), SinkDrain::Destroyed));
        assert!(sink.write(b"x").is_err());
    }

    #[test]
    fn test_sink_fixed_length_close_early() {
        let sink = BodySink::new(BodyFraming::FixedLength(10));
        sink.write(b"abc").unwrap();
        assert!(matches!(sink.close().unwrap_err(), HttpError::Protocol(_)));
    }
}
