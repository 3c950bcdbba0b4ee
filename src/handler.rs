//! Server-side request handlers.
//!
//! A [`RequestHandler`] receives each request as an [`Exchange`] and answers it through that exchange.
//! Handlers may be composed with a [`Router`], which dispatches on the request path, or a [`Chain`],
//! where each entry either answers or calls [`Exchange::forward`].

use std::{fmt::Debug, sync::Arc};

use http::StatusCode;

use crate::{
    error::HttpError,
    exchange::{Execution, InvokeOn},
    message::RequestHeader,
    server::{ConnectionInfo, Exchange, Registry},
};

/// How concurrent calls to a handler are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Synchronization {
    /// Calls may overlap freely
    #[default]
    None,
    /// One call at a time per connection
    PerConnection,
    /// One call at a time per session cookie
    PerSession,
}

/// When and where a handler is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HandlerConfig {
    pub execution: Execution,
    pub invoke_on: InvokeOn,
    pub synchronization: Synchronization,
}
impl HandlerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_execution(mut self, execution: Execution) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_invoke_on(mut self, invoke_on: InvokeOn) -> Self {
        self.invoke_on = invoke_on;
        self
    }

    pub fn with_synchronization(mut self, synchronization: Synchronization) -> Self {
        self.synchronization = synchronization;
        self
    }
}

/// Answers requests.
///
/// Returning `Err` answers with a 500, or destroys the connection when a response head was already sent.
pub trait RequestHandler: Send + Sync + 'static {
    fn on_request(&self, exchange: Exchange) -> Result<(), HttpError>;

    fn config(&self) -> HandlerConfig {
        HandlerConfig::default()
    }

    /// The config for one request, for composite handlers that dispatch on the head.
    fn config_for(&self, _head: &RequestHeader) -> HandlerConfig {
        self.config()
    }

    fn timeout_aware(&self) -> Option<&dyn TimeoutAware> {
        None
    }

    fn lifecycle(&self) -> Option<&dyn Lifecycle> {
        None
    }
}
impl<H: RequestHandler + ?Sized> RequestHandler for Arc<H> {
    fn on_request(&self, exchange: Exchange) -> Result<(), HttpError> {
        (**self).on_request(exchange)
    }

    fn config(&self) -> HandlerConfig {
        (**self).config()
    }

    fn config_for(&self, head: &RequestHeader) -> HandlerConfig {
        (**self).config_for(head)
    }

    fn timeout_aware(&self) -> Option<&dyn TimeoutAware> {
        (**self).timeout_aware()
    }

    fn lifecycle(&self) -> Option<&dyn Lifecycle> {
        (**self).lifecycle()
    }
}

/// Hooks consulted when a server connection times out.
///
/// Returning true keeps the connection waiting, false closes it.
pub trait TimeoutAware: Send + Sync {
    fn on_request_timeout(&self, _connection: &ConnectionInfo) -> bool {
        false
    }

    fn on_idle_timeout(&self, _connection: &ConnectionInfo) -> bool {
        false
    }
}

/// Hooks run when a server starts and stops.
pub trait Lifecycle: Send + Sync {
    fn on_init(&self, _registry: &Registry) {}

    fn on_destroy(&self) {}
}

/// Adapts a closure into a [`RequestHandler`].
pub struct FnHandler<F> {
    f: F,
    config: HandlerConfig,
}
impl<F> FnHandler<F>
where
    F: Fn(Exchange) -> Result<(), HttpError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            config: HandlerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }
}
impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(Exchange) -> Result<(), HttpError> + Send + Sync + 'static,
{
    fn on_request(&self, exchange: Exchange) -> Result<(), HttpError> {
        (self.f)(exchange)
    }

    fn config(&self) -> HandlerConfig {
        self.config
    }
}

/// Shorthand for [`FnHandler::new`].
pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(Exchange) -> Result<(), HttpError> + Send + Sync + 'static,
{
    FnHandler::new(f)
}

/// A path pattern: exact, a `prefix/*` wildcard, or `*` for everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    Prefix(String),
    Any,
}
impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" || pattern == "/*" {
            Self::Any
        } else if let Some(prefix) = pattern.strip_suffix("/*") {
            Self::Prefix(prefix.to_owned())
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            Self::Prefix(prefix.trim_end_matches('/').to_owned())
        } else {
            Self::Exact(pattern.to_owned())
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(x) => x == path,
            Self::Prefix(prefix) => {
                path == prefix
                    || (path.starts_with(prefix.as_str())
                        && path[prefix.len()..].starts_with('/'))
            }
        }
    }
}

struct Route {
    pattern: PathPattern,
    handler: Arc<dyn RequestHandler>,
}

/// Dispatches to the first route whose pattern matches the request path, in registration order.
///
/// Unmatched requests get a 404.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}
impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<H: RequestHandler>(mut self, pattern: &str, handler: H) -> Self {
        self.add(pattern, Arc::new(handler));
        self
    }

    pub fn add(&mut self, pattern: &str, handler: Arc<dyn RequestHandler>) {
        self.routes.push(Route {
            pattern: PathPattern::parse(pattern),
            handler,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn find(&self, path: &str) -> Option<&Arc<dyn RequestHandler>> {
        self.routes
            .iter()
            .find(|x| x.pattern.matches(path))
            .map(|x| &x.handler)
    }
}
impl RequestHandler for Router {
    fn on_request(&self, exchange: Exchange) -> Result<(), HttpError> {
        match self.find(exchange.request().header().path()) {
            Some(handler) => handler.on_request(exchange),
            None => exchange.send_error(StatusCode::NOT_FOUND, None),
        }
    }

    fn config_for(&self, head: &RequestHeader) -> HandlerConfig {
        self.find(head.path())
            .map(|x| x.config_for(head))
            .unwrap_or_default()
    }

    fn timeout_aware(&self) -> Option<&dyn TimeoutAware> {
        self.routes.iter().find_map(|x| x.handler.timeout_aware())
    }

    fn lifecycle(&self) -> Option<&dyn Lifecycle> {
        Some(self)
    }
}
impl Lifecycle for Router {
    fn on_init(&self, registry: &Registry) {
        for route in &self.routes {
            if let Some(x) = route.handler.lifecycle() {
                x.on_init(registry);
            }
        }
    }

    fn on_destroy(&self) {
        for route in &self.routes {
            if let Some(x) = route.handler.lifecycle() {
                x.on_destroy();
            }
        }
    }
}
impl Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|x| &x.pattern))
            .finish()
    }
}

/// An ordered list of filters. Each entry answers or calls [`Exchange::forward`]; the end of the chain answers 404.
#[derive(Clone, Default)]
pub struct Chain {
    entries: Arc<Vec<Arc<dyn RequestHandler>>>,
}
impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<H: RequestHandler>(mut self, handler: H) -> Self {
        let mut entries: Vec<Arc<dyn RequestHandler>> = self.entries.iter().cloned().collect();
        entries.push(Arc::new(handler));
        self.entries = Arc::new(entries);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entries(&self) -> Arc<Vec<Arc<dyn RequestHandler>>> {
        Arc::clone(&self.entries)
    }
}
impl RequestHandler for Chain {
    fn on_request(&self, exchange: Exchange) -> Result<(), HttpError> {
        exchange.with_chain(self.entries()).forward()
    }

    fn config_for(&self, head: &RequestHeader) -> HandlerConfig {
        self.entries
            .first()
            .map(|x| x.config_for(head))
            .unwrap_or_default()
    }

    fn lifecycle(&self) -> Option<&dyn Lifecycle> {
        Some(self)
    }
}
impl Lifecycle for Chain {
    fn on_init(&self, registry: &Registry) {
        for entry in self.entries.iter() {
            if let Some(x) = entry.lifecycle() {
                x.on_init(registry);
            }
        }
    }

    fn on_destroy(&self) {
        for entry in self.entries.iter() {
            if let Some(x) = entry.lifecycle() {
                x.on_destroy();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::PathPattern;

    #[test]
    fn test_path_patterns() {
        let any = PathPattern::parse("*");
        assert!(any.matches("/anything"));

        let prefix = PathPattern::parse("/static/*");
        assert_eq!(prefix, PathPattern::Prefix("/static".to_owned()));
        assert!(prefix.matches("/static/app.js"));
        assert!(prefix.matches("/static"));
        assert!(!prefix.matches("/staticfile"));

        let exact = PathPattern::parse("/hello");
        assert!(exact.matches("/hello"));
        assert!(!exact.matches("/hello/world"));
    }
}
