//! Client and server configuration.
//!
//! Every setting has a `with_*` builder. `from_env()` starts from the defaults and applies
//! any `NBHTTP_*` environment overrides, for example `NBHTTP_IDLE_TIMEOUT_MS=30000`.

use std::{env, str::FromStr, time::Duration};

use base64ct::{Base64, Encoding};

use crate::{error::HttpError, message::DEFAULT_MAX_HEADER_SIZE};

/// The smallest request timeout a server accepts.
pub const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

const DEFAULT_WRITE_BUFFER_CAPACITY: usize = 64 * 1024;

/// The independent timeout classes. `None` disables a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeouts {
    /// Establishing the transport connection
    pub connect: Option<Duration>,
    /// No activity while no exchange is outstanding
    pub idle: Option<Duration>,
    /// Server: receiving a complete request
    pub request: Option<Duration>,
    /// Client: receiving a response head after sending a request
    pub response: Option<Duration>,
    /// Inactivity gap while a body is being received
    pub body_receive: Option<Duration>,
}
impl Timeouts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect(mut self, timeout: Option<Duration>) -> Self {
        self.connect = timeout;
        self
    }

    pub fn with_idle(mut self, timeout: Option<Duration>) -> Self {
        self.idle = timeout;
        self
    }

    pub fn with_request(mut self, timeout: Option<Duration>) -> Self {
        self.request = timeout;
        self
    }

    pub fn with_response(mut self, timeout: Option<Duration>) -> Self {
        self.response = timeout;
        self
    }

    pub fn with_body_receive(mut self, timeout: Option<Duration>) -> Self {
        self.body_receive = timeout;
        self
    }

    fn apply_env(&mut self, prefix: &str) -> Result<(), HttpError> {
        self.connect = env_millis(prefix, "CONNECT_TIMEOUT_MS")?.or(self.connect);
        self.idle = env_millis(prefix, "IDLE_TIMEOUT_MS")?.or(self.idle);
        self.request = env_millis(prefix, "REQUEST_TIMEOUT_MS")?.or(self.request);
        self.response = env_millis(prefix, "RESPONSE_TIMEOUT_MS")?.or(self.response);
        self.body_receive = env_millis(prefix, "BODY_RECEIVE_TIMEOUT_MS")?.or(self.body_receive);
        Ok(())
    }
}

/// How redirects are followed by [`crate::http::HttpClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RedirectMode {
    #[default]
    Off,
    /// Follow redirects of GET and HEAD requests only
    SafeMethods,
    All,
}
impl FromStr for RedirectMode {
    type Err = HttpError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "safe" | "safe_methods" | "safemethods" => Ok(Self::SafeMethods),
            "all" => Ok(Self::All),
            x => Err(HttpError::protocol(format!("unknown redirect mode {x:?}"))),
        }
    }
}

/// A forward proxy. Plain-http requests are forwarded, https requests go through a `CONNECT` tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// `(user, password)` sent as `Proxy-Authorization: Basic`
    pub credentials: Option<(String, String)>,
}
impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((user.into(), password.into()));
        self
    }

    /// The `Proxy-Authorization` value for the configured credentials.
    pub fn authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(|(user, password)| {
            format!("Basic {}", Base64::encode_string(format!("{user}:{password}").as_bytes()))
        })
    }
}

/// Configuration for [`crate::client::HttpClientConnection`] and [`crate::http::HttpClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub timeouts: Timeouts,
    /// Connections across all destinations, `None` for unbounded
    pub max_active: Option<usize>,
    pub max_active_per_destination: Option<usize>,
    pub max_idle: usize,
    /// Retries after the first attempt
    pub max_retries: usize,
    pub redirect_mode: RedirectMode,
    pub max_redirects: usize,
    pub auto_decompress: bool,
    pub auto_cookies: bool,
    /// Cached responses, 0 disables the cache
    pub cache_size: usize,
    pub proxy: Option<ProxyConfig>,
    /// Buffer whole bodies before delivering responses
    pub return_on_message: bool,
    /// Bound for blocking calls such as [`crate::http::HttpClient::call`]
    pub call_timeout: Duration,
    pub worker_threads: usize,
    pub max_header_size: usize,
    pub write_buffer_capacity: usize,
}
impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default()
                .with_connect(Some(Duration::from_secs(10)))
                .with_idle(Some(Duration::from_secs(60))),
            max_active: None,
            max_active_per_destination: None,
            max_idle: 20,
            max_retries: 4,
            redirect_mode: RedirectMode::Off,
            max_redirects: 5,
            auto_decompress: true,
            auto_cookies: true,
            cache_size: 0,
            proxy: None,
            return_on_message: false,
            call_timeout: Duration::from_secs(60),
            worker_threads: 4,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            write_buffer_capacity: DEFAULT_WRITE_BUFFER_CAPACITY,
        }
    }
}
impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with `NBHTTP_*` environment overrides applied.
    pub fn from_env() -> Result<Self, HttpError> {
        let mut config = Self::default();
        config.timeouts.apply_env("NBHTTP_")?;
        if let Some(x) = env_parse("NBHTTP_", "MAX_ACTIVE")? {
            config.max_active = Some(x);
        }
        if let Some(x) = env_parse("NBHTTP_", "MAX_ACTIVE_PER_DESTINATION")? {
            config.max_active_per_destination = Some(x);
        }
        config.max_idle = env_parse("NBHTTP_", "MAX_IDLE")?.unwrap_or(config.max_idle);
        config.max_retries = env_parse("NBHTTP_", "MAX_RETRIES")?.unwrap_or(config.max_retries);
        config.redirect_mode =
            env_parse("NBHTTP_", "REDIRECT_MODE")?.unwrap_or(config.redirect_mode);
        config.max_redirects =
            env_parse("NBHTTP_", "MAX_REDIRECTS")?.unwrap_or(config.max_redirects);
        config.auto_decompress =
            env_parse("NBHTTP_", "AUTO_DECOMPRESS")?.unwrap_or(config.auto_decompress);
        config.auto_cookies = env_parse("NBHTTP_", "AUTO_COOKIES")?.unwrap_or(config.auto_cookies);
        config.cache_size = env_parse("NBHTTP_", "CACHE_SIZE")?.unwrap_or(config.cache_size);
        config.worker_threads =
            env_parse("NBHTTP_", "WORKER_THREADS")?.unwrap_or(config.worker_threads);
        if let Some(host) = env_string("NBHTTP_", "PROXY_HOST") {
            let port = env_parse("NBHTTP_", "PROXY_PORT")?.unwrap_or(80);
            let mut proxy = ProxyConfig::new(host, port);
            if let Some(user) = env_string("NBHTTP_", "PROXY_USER") {
                proxy = proxy.with_credentials(
                    user,
                    env_string("NBHTTP_", "PROXY_PASSWORD").unwrap_or_default(),
                );
            }
            config.proxy = Some(proxy);
        }
        Ok(config)
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_active(mut self, max_active: Option<usize>) -> Self {
        self.max_active = max_active;
        self
    }

    pub fn with_max_active_per_destination(mut self, max: Option<usize>) -> Self {
        self.max_active_per_destination = max;
        self
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_redirect_mode(mut self, redirect_mode: RedirectMode) -> Self {
        self.redirect_mode = redirect_mode;
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    pub fn with_auto_decompress(mut self, auto_decompress: bool) -> Self {
        self.auto_decompress = auto_decompress;
        self
    }

    pub fn with_auto_cookies(mut self, auto_cookies: bool) -> Self {
        self.auto_cookies = auto_cookies;
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_return_on_message(mut self, return_on_message: bool) -> Self {
        self.return_on_message = return_on_message;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_max_header_size(mut self, max_header_size: usize) -> Self {
        self.max_header_size = max_header_size;
        self
    }

    pub fn with_write_buffer_capacity(mut self, capacity: usize) -> Self {
        self.write_buffer_capacity = capacity;
        self
    }
}

/// Configuration for [`crate::server::ServerConnection`] and [`crate::server::HttpServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub timeouts: Timeouts,
    /// Requests served per connection before it is closed, `None` for unbounded
    pub max_transactions: Option<u64>,
    /// Close the connection after sending any 4xx or 5xx response
    pub close_on_sending_error: bool,
    /// Answer `Expect: 100-continue` automatically
    pub auto_continue: bool,
    /// Cookie carrying the [`crate::session::HttpSession`] id, also keying
    /// [`crate::handler::Synchronization::PerSession`]
    pub session_cookie: String,
    /// Sessions unused for longer expire, `None` to keep them until invalidated
    pub session_max_inactive: Option<Duration>,
    pub max_header_size: usize,
    pub worker_threads: usize,
    pub write_buffer_capacity: usize,
}
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default().with_idle(Some(Duration::from_secs(60))),
            max_transactions: None,
            close_on_sending_error: false,
            auto_continue: true,
            session_cookie: "sessionid".to_owned(),
            session_max_inactive: Some(Duration::from_secs(30 * 60)),
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            worker_threads: 4,
            write_buffer_capacity: DEFAULT_WRITE_BUFFER_CAPACITY,
        }
    }
}
impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with `NBHTTP_SERVER_*` environment overrides applied.
    pub fn from_env() -> Result<Self, HttpError> {
        let mut config = Self::default();
        config.timeouts.apply_env("NBHTTP_SERVER_")?;
        if let Some(x) = env_parse("NBHTTP_SERVER_", "MAX_TRANSACTIONS")? {
            config.max_transactions = Some(x);
        }
        config.close_on_sending_error = env_parse("NBHTTP_SERVER_", "CLOSE_ON_SENDING_ERROR")?
            .unwrap_or(config.close_on_sending_error);
        config.auto_continue =
            env_parse("NBHTTP_SERVER_", "AUTO_CONTINUE")?.unwrap_or(config.auto_continue);
        if let Some(x) = env_string("NBHTTP_SERVER_", "SESSION_COOKIE") {
            config.session_cookie = x;
        }
        config.session_max_inactive =
            env_millis("NBHTTP_SERVER_", "SESSION_MAX_INACTIVE_MS")?.or(config.session_max_inactive);
        config.worker_threads =
            env_parse("NBHTTP_SERVER_", "WORKER_THREADS")?.unwrap_or(config.worker_threads);
        Ok(config.normalized())
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self.normalized()
    }

    pub fn with_max_transactions(mut self, max_transactions: Option<u64>) -> Self {
        self.max_transactions = max_transactions;
        self
    }

    pub fn with_close_on_sending_error(mut self, close_on_sending_error: bool) -> Self {
        self.close_on_sending_error = close_on_sending_error;
        self
    }

    pub fn with_auto_continue(mut self, auto_continue: bool) -> Self {
        self.auto_continue = auto_continue;
        self
    }

    pub fn with_session_cookie(mut self, name: impl Into<String>) -> Self {
        self.session_cookie = name.into();
        self
    }

    pub fn with_session_max_inactive(mut self, max_inactive: Option<Duration>) -> Self {
        self.session_max_inactive = max_inactive;
        self
    }

    pub fn with_max_header_size(mut self, max_header_size: usize) -> Self {
        self.max_header_size = max_header_size;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    pub fn with_write_buffer_capacity(mut self, capacity: usize) -> Self {
        self.write_buffer_capacity = capacity;
        self
    }

    /// Clamp the request timeout to [`MIN_REQUEST_TIMEOUT`].
    fn normalized(mut self) -> Self {
        self.timeouts.request = self.timeouts.request.map(|x| x.max(MIN_REQUEST_TIMEOUT));
        self
    }
}

fn env_string(prefix: &str, name: &str) -> Option<String> {
    env::var(format!("{prefix}{name}")).ok().filter(|x| !x.is_empty())
}

fn env_parse<T: FromStr>(prefix: &str, name: &str) -> Result<Option<T>, HttpError> {
    match env_string(prefix, name) {
        None => Ok(None),
        Some(x) => x
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| HttpError::protocol(format!("invalid value for {prefix}{name}: {x:?}"))),
    }
}

fn env_millis(prefix: &str, name: &str) -> Result<Option<Duration>, HttpError> {
    Ok(env_parse::<u64>(prefix, name)?.map(Duration::from_millis))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{ClientConfig, ProxyConfig, RedirectMode, ServerConfig, Timeouts, MIN_REQUEST_TIMEOUT};

    #[test]
    fn test_proxy_authorization() {
        let proxy = ProxyConfig::new("proxy", 3128);
        assert_eq!(proxy.authorization(), None);
        let proxy = proxy.with_credentials("user", "secret");
        assert_eq!(proxy.authorization().as_deref(), Some("Basic dXNlcjpzZWNyZXQ="));
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.max_redirects, 5);
        assert_eq!(config.redirect_mode, RedirectMode::Off);
        assert!(config.auto_decompress);
        assert_eq!(config.cache_size, 0);
        assert_eq!(ServerConfig::default().session_cookie, "sessionid");
    }

    #[test]
    fn test_request_timeout_floor() {
        let config = ServerConfig::new()
            .with_timeouts(Timeouts::new().with_request(Some(Duration::from_millis(10))));
        assert_eq!(config.timeouts.request, Some(MIN_REQUEST_TIMEOUT));
    }

    #[test]
    fn test_client_from_env() {
        std::env::set_var("NBHTTP_MAX_RETRIES", "2");
        std::env::set_var("NBHTTP_RESPONSE_TIMEOUT_MS", "1500");
        std::env::set_var("NBHTTP_REDIRECT_MODE", "all");
        let config = ClientConfig::from_env().unwrap();
        std::env::remove_var("NBHTTP_MAX_RETRIES");
        std::env::remove_var("NBHTTP_RESPONSE_TIMEOUT_MS");
        std::env::remove_var("NBHTTP_REDIRECT_MODE");
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.timeouts.response, Some(Duration::from_millis(1500)));
        assert_eq!(config.redirect_mode, RedirectMode::All);
    }

    #[test]
    fn test_invalid_env_value() {
        std::env::set_var("NBHTTP_SERVER_MAX_TRANSACTIONS", "many");
        let result = ServerConfig::from_env();
        std::env::remove_var("NBHTTP_SERVER_MAX_TRANSACTIONS");
        assert!(result.is_err());
    }
}
