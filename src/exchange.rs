//! Pairing of an outbound request with its eventual response.
//!
//! Every exchange ends with exactly one outcome. A [`Completion`] owns the [`ResponseHandler`]
//! of one exchange and is consumed by delivering it, and a completion that is dropped
//! undelivered reports [`HttpError::ConnectionClosed`]. [`FutureResponse`] is the future-style
//! view of the same guarantee.

use std::{
    fmt::Debug,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::{
    dispatch::{assert_blocking_allowed, WorkerPool},
    error::{HttpError, TimeoutKind},
    message::Response,
};

/// When a response handler is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InvokeOn {
    /// As soon as the head is parsed, with a streaming body.
    #[default]
    OnHeader,
    /// Once the whole body has been received, with a buffered body.
    OnMessage,
}

/// Where a handler is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Execution {
    /// On the I/O thread. The handler must not block.
    #[default]
    Inline,
    /// On a worker thread, where blocking is allowed.
    WorkerPool,
}

/// Receives the outcome of one exchange.
///
/// Exactly one of `on_response` or `on_error` is called, once.
pub trait ResponseHandler: Send + 'static {
    fn on_response(&mut self, response: Response);

    fn on_error(&mut self, error: HttpError);

    fn invoke_on(&self) -> InvokeOn {
        InvokeOn::OnHeader
    }

    fn execution(&self) -> Execution {
        Execution::Inline
    }

    /// A cancelled exchange still completes on the wire, but its outcome is not delivered.
    fn is_cancelled(&self) -> bool {
        false
    }

    /// True if cancellation should also abort the underlying connection.
    fn is_interrupted(&self) -> bool {
        false
    }
}

/// Adapts a closure into a [`ResponseHandler`].
pub struct FnHandler<F> {
    f: Option<F>,
    invoke_on: InvokeOn,
    execution: Execution,
}
impl<F> FnHandler<F>
where
    F: FnOnce(Result<Response, HttpError>) + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f: Some(f),
            invoke_on: InvokeOn::default(),
            execution: Execution::default(),
        }
    }

    pub fn with_invoke_on(mut self, invoke_on: InvokeOn) -> Self {
        self.invoke_on = invoke_on;
        self
    }

    pub fn with_execution(mut self, execution: Execution) -> Self {
        self.execution = execution;
        self
    }
}
impl<F> ResponseHandler for FnHandler<F>
where
    F: FnOnce(Result<Response, HttpError>) + Send + 'static,
{
    fn on_response(&mut self, response: Response) {
        if let Some(f) = self.f.take() {
            f(Ok(response))
        }
    }

    fn on_error(&mut self, error: HttpError) {
        if let Some(f) = self.f.take() {
            f(Err(error))
        }
    }

    fn invoke_on(&self) -> InvokeOn {
        self.invoke_on
    }

    fn execution(&self) -> Execution {
        self.execution
    }
}

/// Shorthand for [`FnHandler::new`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: FnOnce(Result<Response, HttpError>) + Send + 'static,
{
    FnHandler::new(f)
}

/// Delivers the outcome of one exchange to its handler, exactly once.
pub struct Completion {
    handler: Option<Box<dyn ResponseHandler>>,
    workers: Option<WorkerPool>,
}
impl Completion {
    pub fn new(handler: Box<dyn ResponseHandler>) -> Self {
        Self {
            handler: Some(handler),
            workers: None,
        }
    }

    /// Worker pool used by handlers configured with [`Execution::WorkerPool`].
    pub fn with_workers(mut self, workers: Option<WorkerPool>) -> Self {
        self.workers = workers;
        self
    }

    pub fn invoke_on(&self) -> InvokeOn {
        self.handler
            .as_ref()
            .map(|x| x.invoke_on())
            .unwrap_or_default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.handler.as_ref().map(|x| x.is_cancelled()).unwrap_or(true)
    }

    pub fn is_interrupted(&self) -> bool {
        self.handler
            .as_ref()
            .map(|x| x.is_cancelled() && x.is_interrupted())
            .unwrap_or(false)
    }

    pub fn succeed(mut self, response: Response) {
        self.deliver(Ok(response));
    }

    pub fn fail(mut self, error: HttpError) {
        self.deliver(Err(error));
    }

    pub fn complete(mut self, outcome: Result<Response, HttpError>) {
        self.deliver(outcome);
    }

    fn deliver(&mut self, outcome: Result<Response, HttpError>) {
        let Some(mut handler) = self.handler.take() else {
            return;
        };
        if handler.is_cancelled() {
            return;
        }
        match (&self.workers, handler.execution()) {
            (Some(workers), Execution::WorkerPool) => {
                workers.execute_or_inline(Box::new(move || invoke(handler.as_mut(), outcome)))
            }
            _ => invoke(handler.as_mut(), outcome),
        }
    }
}
impl Drop for Completion {
    fn drop(&mut self) {
        self.deliver(Err(HttpError::ConnectionClosed));
    }
}
impl Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.handler.is_some())
            .finish()
    }
}

fn invoke(handler: &mut dyn ResponseHandler, outcome: Result<Response, HttpError>) {
    match outcome {
        Ok(response) => handler.on_response(response),
        Err(err) => handler.on_error(err),
    }
}

enum FutureState {
    Pending,
    Done(Result<Response, HttpError>),
    Cancelled { interrupt: bool },
}

struct FutureShared {
    state: Mutex<FutureState>,
    ready: Condvar,
}

/// Future-style handle to a response.
#[derive(Clone)]
pub struct FutureResponse {
    shared: Arc<FutureShared>,
}
impl FutureResponse {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(FutureShared {
                state: Mutex::new(FutureState::Pending),
                ready: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FutureState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// True once a result arrived or the future was cancelled.
    pub fn is_done(&self) -> bool {
        !matches!(*self.lock(), FutureState::Pending)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.lock(), FutureState::Cancelled { .. })
    }

    /// Cancel a pending exchange. Returns false if the exchange was already done.
    ///
    /// With `may_interrupt`, the connection carrying the exchange is closed instead of being
    /// left to finish reading the response.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let mut state = self.lock();
        if !matches!(*state, FutureState::Pending) {
            return false;
        }
        *state = FutureState::Cancelled {
            interrupt: may_interrupt,
        };
        drop(state);
        self.shared.ready.notify_all();
        true
    }

    /// Wait up to `timeout` for the response.
    ///
    /// Fails when called from an I/O dispatch thread.
    pub fn get(&self, timeout: Duration) -> Result<Response, HttpError> {
        assert_blocking_allowed()?;
        // too far out to represent means no deadline at all
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            match &*state {
                FutureState::Done(result) => return result.clone(),
                FutureState::Cancelled { .. } => return Err(HttpError::Cancelled),
                FutureState::Pending => {}
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

    /// The result without waiting, if done.
    pub fn try_get(&self) -> Option<Result<Response, HttpError>> {
        match &*self.lock() {
            FutureState::Pending => None,
            FutureState::Done(result) => Some(result.clone()),
            FutureState::Cancelled { .. } => Some(Err(HttpError::Cancelled)),
        }
    }

    /// The handler that completes this future.
    pub fn handler(&self, invoke_on: InvokeOn) -> FutureHandler {
        FutureHandler {
            future: self.clone(),
            invoke_on,
        }
    }

    fn complete(&self, outcome: Result<Response, HttpError>) {
        let mut state = self.lock();
        if let FutureState::Pending = *state {
            *state = FutureState::Done(outcome);
            drop(state);
            self.shared.ready.notify_all();
        }
    }
}
impl Default for FutureResponse {
    fn default() -> Self {
        Self::new()
    }
}
impl Debug for FutureResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lock() {
            FutureState::Pending => "pending",
            FutureState::Done(Ok(_)) => "response",
            FutureState::Done(Err(_)) => "error",
            FutureState::Cancelled { .. } => "cancelled",
        };
        f.debug_struct("FutureResponse")
            .field("state", &state)
            .finish()
    }
}

/// [`ResponseHandler`] feeding a [`FutureResponse`].
pub struct FutureHandler {
    future: FutureResponse,
    invoke_on: InvokeOn,
}
impl ResponseHandler for FutureHandler {
    fn on_response(&mut self, response: Response) {
        self.future.complete(Ok(response));
    }

    fn on_error(&mut self, error: HttpError) {
        self.future.complete(Err(error));
    }

    fn invoke_on(&self) -> InvokeOn {
        self.invoke_on
    }

    fn is_cancelled(&self) -> bool {
        self.future.is_cancelled()
    }

    fn is_interrupted(&self) -> bool {
        matches!(
            *self.future.lock(),
            FutureState::Cancelled { interrupt: true }
        )
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };

    use super::{handler_fn, Completion, FutureResponse, InvokeOn};
    use crate::{error::HttpError, message::Response};

    #[test]
    fn test_completion_delivers_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let completion = Completion::new(Box::new(handler_fn(move |result| {
            assert_eq!(result.unwrap().status().as_u16(), 200);
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        completion.succeed(Response::text(200, "OK"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_completion_reports_closed() {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let completion = Completion::new(Box::new(handler_fn(move |result| {
            assert!(matches!(result.unwrap_err(), HttpError::ConnectionClosed));
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        drop(completion);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_future_get_across_threads() {
        let future = FutureResponse::new();
        let completion = Completion::new(Box::new(future.handler(InvokeOn::OnMessage)));
        assert!(!future.is_done());
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            completion.succeed(Response::text(200, "OK"));
        });
        let response = future.get(Duration::from_secs(5)).unwrap();
        assert_eq!(response.body().as_text(), Some("OK"));
        assert!(future.is_done());
        // repeated gets return the same result
        assert!(future.get(Duration::ZERO).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_future_get_without_deadline() {
        let future = FutureResponse::new();
        Completion::new(Box::new(future.handler(InvokeOn::OnMessage)))
            .succeed(Response::text(200, "OK"));
        assert_eq!(future.get(Duration::MAX).unwrap().body().as_text(), Some("OK"));
    }

    #[test]
    fn test_future_get_times_out() {
        let future = FutureResponse::new();
        assert!(matches!(
            future.get(Duration::from_millis(5)).unwrap_err(),
            HttpError::Timeout(_, _)
        ));
    }

    #[test]
    fn test_cancel_discards_late_result() {
        let future = FutureResponse::new();
        let completion = Completion::new(Box::new(future.handler(InvokeOn::OnHeader)));
        assert!(future.cancel(false));
        assert!(completion.is_cancelled());
        assert!(!completion.is_interrupted());
        completion.succeed(Response::text(200, "late"));
        assert!(future.is_cancelled());
        assert!(matches!(
            future.try_get().unwrap().unwrap_err(),
            HttpError::Cancelled
        ));
        assert!(!future.cancel(true));
    }

    #[test]
    fn test_cancel_after_done_has_no_effect() {
        let future = FutureResponse::new();
        Completion::new(Box::new(future.handler(InvokeOn::OnHeader)))
            .fail(HttpError::ConnectionClosed);
        assert!(!future.cancel(true));
        assert!(!future.is_cancelled());
    }
}
