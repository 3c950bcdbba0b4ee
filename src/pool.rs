//! Reuse of persistent client connections.
//!
//! A [`ConnectionPool`] hands out [`Lease`]s. Dropping a lease returns its connection to the
//! idle set when it is still reusable, and closes it otherwise. Capacity is checked when a new
//! connection would be opened, and a refusal is reported right away as
//! [`HttpError::MaxConnectionsExceeded`].

use std::{
    collections::HashMap,
    fmt::{Debug, Display},
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use http::Uri;

use crate::{
    client::HttpClientConnection,
    config::ClientConfig,
    error::HttpError,
    log::{debug, info},
    Session, SessionStatus, Transport,
};

/// Where a pooled connection leads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}
impl Destination {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    /// The destination of an absolute `http` or `https` URI.
    pub fn from_uri(uri: &Uri) -> Result<Self, HttpError> {
        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(x) => return Err(HttpError::protocol(format!("unsupported scheme {x}"))),
            None => return Err(HttpError::protocol(format!("{uri} is not an absolute uri"))),
        };
        let host = uri
            .host()
            .ok_or_else(|| HttpError::protocol(format!("{uri} has no host")))?;
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
        Ok(Self::new(host.trim_start_matches('[').trim_end_matches(']'), port, tls))
    }

    /// The value of a `Host` header for this destination.
    pub fn authority(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}
impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// A connection that can be parked in a [`ConnectionPool`].
pub trait Poolable: Send + 'static {
    /// True when the connection may carry a new exchange.
    fn is_reusable(&self) -> bool;

    /// False once the connection is closed.
    fn is_alive(&self) -> bool;

    fn close(&mut self);
}
impl<S: Transport + 'static> Poolable for HttpClientConnection<S> {
    fn is_reusable(&self) -> bool {
        HttpClientConnection::is_reusable(self)
    }

    fn is_alive(&self) -> bool {
        self.status() != SessionStatus::Terminated
    }

    fn close(&mut self) {
        Session::close(self)
    }
}

/// Capacity settings of a [`ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Leased connections across all destinations
    pub max_active: Option<usize>,
    pub max_active_per_destination: Option<usize>,
    /// Idle connections kept across all destinations
    pub max_idle: usize,
    /// Idle connections older than this are closed instead of reused
    pub idle_timeout: Option<Duration>,
}
impl PoolConfig {
    pub fn new() -> Self {
        Self::from(&ClientConfig::default())
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

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}
impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}
impl From<&ClientConfig> for PoolConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_active: config.max_active,
            max_active_per_destination: config.max_active_per_destination,
            max_idle: config.max_idle,
            idle_timeout: config.timeouts.idle,
        }
    }
}

struct IdleEntry<C> {
    conn: C,
    since: Instant,
}

struct PoolState<C> {
    idle: HashMap<Destination, Vec<IdleEntry<C>>>,
    idle_total: usize,
    active: HashMap<Destination, usize>,
    active_total: usize,
    closed: bool,
}

struct PoolShared<C> {
    config: PoolConfig,
    state: Mutex<PoolState<C>>,
}

/// A shared set of idle connections with capacity limits.
pub struct ConnectionPool<C> {
    shared: Arc<PoolShared<C>>,
}
impl<C> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}
impl<C: Poolable> ConnectionPool<C> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                state: Mutex::new(PoolState {
                    idle: HashMap::new(),
                    idle_total: 0,
                    active: HashMap::new(),
                    active_total: 0,
                    closed: false,
                }),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_stale(&self, entry: &IdleEntry<C>, now: Instant) -> bool {
        !entry.conn.is_alive()
            || !entry.conn.is_reusable()
            || self
                .shared
                .config
                .idle_timeout
                .map(|x| now.duration_since(entry.since) >= x)
                .unwrap_or(false)
    }

    /// Lease an idle connection to `dest`, or open one with `connect` when capacity allows.
    ///
    /// `connect` runs outside the pool lock.
    pub fn acquire<F>(&self, dest: &Destination, connect: F) -> Result<Lease<C>, HttpError>
    where
        F: FnOnce(&Destination) -> Result<C, HttpError>,
    {
        self.acquire_with(dest, true, connect)
    }

    /// Lease a newly opened connection to `dest`, leaving idle connections parked.
    pub fn acquire_fresh<F>(&self, dest: &Destination, connect: F) -> Result<Lease<C>, HttpError>
    where
        F: FnOnce(&Destination) -> Result<C, HttpError>,
    {
        self.acquire_with(dest, false, connect)
    }

    fn acquire_with<F>(&self, dest: &Destination, reuse: bool, connect: F) -> Result<Lease<C>, HttpError>
    where
        F: FnOnce(&Destination) -> Result<C, HttpError>,
    {
        let mut stale = Vec::new();
        {
            let mut state = self.lock();
            if state.closed {
                return Err(HttpError::ClosedChannel);
            }
            let now = Instant::now();
            let mut found = None;
            if let Some(entries) = state.idle.get_mut(dest).filter(|_| reuse) {
                // most recently used first
                while let Some(entry) = entries.pop() {
                    if self.is_stale(&entry, now) {
                        stale.push(entry.conn);
                    } else {
                        found = Some(entry.conn);
                        break;
                    }
                }
            }
            let removed = stale.len() + usize::from(found.is_some());
            state.idle_total -= removed;
            if let Some(conn) = found {
                *state.active.entry(dest.clone()).or_insert(0) += 1;
                state.active_total += 1;
                drop(state);
                close_all(stale);
                return Ok(Lease::new(conn, dest.clone(), self.clone()));
            }
            let per_destination = state.active.get(dest).copied().unwrap_or(0);
            if let Some(max) = self.shared.config.max_active_per_destination {
                if per_destination >= max {
                    drop(state);
                    close_all(stale);
                    info!("refusing connection to {dest}: {max} active");
                    return Err(HttpError::MaxConnectionsExceeded(format!(
                        "{max} active connections to {dest}"
                    )));
                }
            }
            if let Some(max) = self.shared.config.max_active {
                if state.active_total >= max {
                    drop(state);
                    close_all(stale);
                    info!("refusing connection to {dest}: {max} active overall");
                    return Err(HttpError::MaxConnectionsExceeded(format!(
                        "{max} active connections"
                    )));
                }
            }
            // reserve the slot before connecting
            *state.active.entry(dest.clone()).or_insert(0) += 1;
            state.active_total += 1;
        }
        close_all(stale);
        match connect(dest) {
            Ok(conn) => {
                debug!("opened connection to {dest}");
                Ok(Lease::new(conn, dest.clone(), self.clone()))
            }
            Err(err) => {
                self.release_slot(dest);
                Err(err)
            }
        }
    }

    fn release_slot(&self, dest: &Destination) -> MutexGuard<'_, PoolState<C>> {
        let mut state = self.lock();
        if let Some(count) = state.active.get_mut(dest) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.active.remove(dest);
            }
        }
        state.active_total = state.active_total.saturating_sub(1);
        state
    }

    fn release(&self, dest: &Destination, mut conn: C) {
        let mut state = self.release_slot(dest);
        if state.closed || !conn.is_alive() || !conn.is_reusable() {
            drop(state);
            conn.close();
            return;
        }
        if state.idle_total >= self.shared.config.max_idle {
            drop(state);
            debug!("idle set is full, closing connection to {dest}");
            conn.close();
            return;
        }
        state.idle_total += 1;
        state.idle.entry(dest.clone()).or_default().push(IdleEntry {
            conn,
            since: Instant::now(),
        });
    }

    /// Leased connections.
    pub fn active_count(&self) -> usize {
        self.lock().active_total
    }

    pub fn active_count_for(&self, dest: &Destination) -> usize {
        self.lock().active.get(dest).copied().unwrap_or(0)
    }

    /// Parked connections.
    pub fn idle_count(&self) -> usize {
        self.lock().idle_total
    }

    pub fn idle_count_for(&self, dest: &Destination) -> usize {
        self.lock().idle.get(dest).map(|x| x.len()).unwrap_or(0)
    }

    /// Close idle connections that died or outlived the idle timeout, returning how many were closed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut stale = Vec::new();
        {
            let mut state = self.lock();
            let mut kept_total = 0;
            for entries in state.idle.values_mut() {
                let mut kept = Vec::with_capacity(entries.len());
                for entry in entries.drain(..) {
                    if self.is_stale(&entry, now) {
                        stale.push(entry.conn);
                    } else {
                        kept.push(entry);
                    }
                }
                kept_total += kept.len();
                *entries = kept;
            }
            state.idle.retain(|_, x| !x.is_empty());
            state.idle_total = kept_total;
        }
        let count = stale.len();
        close_all(stale);
        count
    }

    /// Close every idle connection and refuse further leases. Leased connections are closed when released.
    pub fn close(&self) {
        let idle: Vec<C> = {
            let mut state = self.lock();
            state.closed = true;
            state.idle_total = 0;
            state
                .idle
                .drain()
                .flat_map(|(_, entries)| entries.into_iter().map(|x| x.conn))
                .collect()
        };
        close_all(idle);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
impl<C> Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f.debug_struct("ConnectionPool")
            .field("active", &state.active_total)
            .field("idle", &state.idle_total)
            .field("closed", &state.closed)
            .finish()
    }
}

fn close_all<C: Poolable>(conns: Vec<C>) {
    for mut conn in conns {
        conn.close();
    }
}

/// A connection checked out of a [`ConnectionPool`], released back on drop.
pub struct Lease<C: Poolable> {
    conn: Option<C>,
    dest: Destination,
    pool: ConnectionPool<C>,
}
impl<C: Poolable> Lease<C> {
    fn new(conn: C, dest: Destination, pool: ConnectionPool<C>) -> Self {
        Self {
            conn: Some(conn),
            dest,
            pool,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.dest
    }

    /// Close the connection instead of returning it to the idle set.
    pub fn discard(mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
            drop(self.pool.release_slot(&self.dest));
        }
    }

    /// Take the connection out of the pool's accounting for good.
    pub fn detach(mut self) -> Option<C> {
        let conn = self.conn.take();
        drop(self.pool.release_slot(&self.dest));
        conn
    }
}
impl<C: Poolable> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(x) => x,
            // conn is only taken by methods consuming the lease
            None => unreachable!("lease used after release"),
        }
    }
}
impl<C: Poolable> DerefMut for Lease<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(x) => x,
            None => unreachable!("lease used after release"),
        }
    }
}
impl<C: Poolable> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(&self.dest, conn);
        }
    }
}
impl<C: Poolable> Debug for Lease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("dest", &self.dest).finish()
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::{ConnectionPool, Destination, PoolConfig, Poolable};
    use crate::error::HttpError;

    struct FakeConn {
        id: usize,
        reusable: bool,
        closed: Arc<AtomicBool>,
    }
    impl Poolable for FakeConn {
        fn is_reusable(&self) -> bool {
            self.reusable
        }

        fn is_alive(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn connector(counter: &Arc<AtomicUsize>) -> impl Fn(&Destination) -> Result<FakeConn, HttpError> {
        let counter = Arc::clone(counter);
        move |_| {
            Ok(FakeConn {
                id: counter.fetch_add(1, Ordering::SeqCst),
                reusable: true,
                closed: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    #[test]
    fn test_reuses_released_connection() {
        let pool = ConnectionPool::new(PoolConfig::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let dest = Destination::new("localhost", 80, false);
        let lease = pool.acquire(&dest, connector(&counter)).unwrap();
        assert_eq!(lease.id, 0);
        assert_eq!(pool.active_count(), 1);
        drop(lease);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 1);
        let lease = pool.acquire(&dest, connector(&counter)).unwrap();
        assert_eq!(lease.id, 0);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fresh_acquire_skips_idle() {
        let pool = ConnectionPool::new(PoolConfig::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let dest = Destination::new("localhost", 80, false);
        drop(pool.acquire(&dest, connector(&counter)).unwrap());
        assert_eq!(pool.idle_count(), 1);
        let lease = pool.acquire_fresh(&dest, connector(&counter)).unwrap();
        assert_eq!(lease.id, 1);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.active_count(), 1);
        drop(lease);
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn test_non_reusable_is_closed_on_release() {
        let pool = ConnectionPool::new(PoolConfig::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let dest = Destination::new("localhost", 80, false);
        let mut lease = pool.acquire(&dest, connector(&counter)).unwrap();
        lease.reusable = false;
        let closed = Arc::clone(&lease.closed);
        drop(lease);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_capacity_limits() {
        let pool = ConnectionPool::new(
            PoolConfig::new()
                .with_max_active(Some(3))
                .with_max_active_per_destination(Some(2)),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        let a = Destination::new("a", 80, false);
        let b = Destination::new("b", 80, false);
        let a1 = pool.acquire(&a, connector(&counter)).unwrap();
        let _a2 = pool.acquire(&a, connector(&counter)).unwrap();
        assert!(matches!(
            pool.acquire(&a, connector(&counter)).unwrap_err(),
            HttpError::MaxConnectionsExceeded(_)
        ));
        let _b1 = pool.acquire(&b, connector(&counter)).unwrap();
        assert!(matches!(
            pool.acquire(&b, connector(&counter)).unwrap_err(),
            HttpError::MaxConnectionsExceeded(_)
        ));
        drop(a1);
        assert!(pool.acquire(&a, connector(&counter)).is_ok());
    }

    #[test]
    fn test_failed_connect_releases_slot() {
        let pool: ConnectionPool<FakeConn> =
            ConnectionPool::new(PoolConfig::new().with_max_active(Some(1)));
        let dest = Destination::new("a", 80, false);
        assert!(pool
            .acquire(&dest, |_| Err(HttpError::ConnectionClosed))
            .is_err());
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn test_sweep_closes_expired_idle() {
        let pool = ConnectionPool::new(
            PoolConfig::new().with_idle_timeout(Some(Duration::from_millis(5))),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        let dest = Destination::new("a", 80, false);
        drop(pool.acquire(&dest, connector(&counter)).unwrap());
        assert_eq!(pool.idle_count(), 1);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(pool.sweep(), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_max_idle() {
        let pool = ConnectionPool::new(PoolConfig::new().with_max_idle(1));
        let counter = Arc::new(AtomicUsize::new(0));
        let dest = Destination::new("a", 80, false);
        let a = pool.acquire(&dest, connector(&counter)).unwrap();
        let b = pool.acquire(&dest, connector(&counter)).unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_destination_from_uri() {
        let dest = Destination::from_uri(&"https://example.com/x".parse().unwrap()).unwrap();
        assert_eq!(dest, Destination::new("example.com", 443, true));
        assert_eq!(dest.authority(), "example.com");
        let dest = Destination::from_uri(&"http://127.0.0.1:8080/".parse().unwrap()).unwrap();
        assert_eq!(dest.authority(), "127.0.0.1:8080");
        assert!(Destination::from_uri(&"/relative".parse().unwrap()).is_err());
    }
}
