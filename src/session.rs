//! Server-side sessions, identified by a cookie.
//!
//! A [`SessionManager`] is shared by every connection of a server. Handlers reach the session of
//! the current request through [`crate::server::Exchange::session`], which also sets the cookie
//! for a newly created session on the response.

use std::{
    any::Any,
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::{error::HttpError, log::debug};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SessionState {
    attributes: HashMap<String, Arc<dyn Any + Send + Sync>>,
    last_accessed: Instant,
    max_inactive: Option<Duration>,
    valid: bool,
}
impl SessionState {
    /// Expire the session once it has been unused for longer than allowed.
    fn check(&mut self, now: Instant) -> bool {
        if self.valid
            && self
                .max_inactive
                .is_some_and(|x| now.saturating_duration_since(self.last_accessed) > x)
        {
            self.valid = false;
            self.attributes.clear();
        }
        self.valid
    }
}

/// State kept for one client between requests.
///
/// Clones share the same state. Once invalidated, explicitly or by expiring, a session holds no
/// attributes and refuses new ones.
#[derive(Clone)]
pub struct HttpSession {
    id: Arc<str>,
    created: Instant,
    state: Arc<Mutex<SessionState>>,
}
impl HttpSession {
    fn new(id: String, max_inactive: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            created: now,
            state: Arc::new(Mutex::new(SessionState {
                attributes: HashMap::new(),
                last_accessed: now,
                max_inactive,
                valid: true,
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// When a request last looked the session up
    pub fn last_accessed(&self) -> Instant {
        lock(&self.state).last_accessed
    }

    fn touch(&self) {
        lock(&self.state).last_accessed = Instant::now();
    }

    pub fn max_inactive(&self) -> Option<Duration> {
        lock(&self.state).max_inactive
    }

    /// `None` keeps the session until it is invalidated.
    pub fn set_max_inactive(&self, max_inactive: Option<Duration>) {
        lock(&self.state).max_inactive = max_inactive;
    }

    pub fn is_valid(&self) -> bool {
        lock(&self.state).check(Instant::now())
    }

    pub fn invalidate(&self) {
        let mut state = lock(&self.state);
        state.valid = false;
        state.attributes.clear();
    }

    fn valid_state(&self) -> Result<MutexGuard<'_, SessionState>, HttpError> {
        let mut state = lock(&self.state);
        match state.check(Instant::now()) {
            true => Ok(state),
            false => Err(HttpError::protocol(format!("session {} is invalid", self.id))),
        }
    }

    /// The value under `name`, if there is one of type `T`.
    pub fn attribute<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let value = self.valid_state().ok()?.attributes.get(name).cloned()?;
        value.downcast::<T>().ok()
    }

    /// Store `value` under `name`, replacing any previous value. Fails on an invalid session.
    pub fn set_attribute<T: Any + Send + Sync>(&self, name: &str, value: T) -> Result<(), HttpError> {
        self.valid_state()?
            .attributes
            .insert(name.to_owned(), Arc::new(value));
        Ok(())
    }

    pub fn remove_attribute(&self, name: &str) -> bool {
        self.valid_state()
            .map(|mut x| x.attributes.remove(name).is_some())
            .unwrap_or(false)
    }

    /// Attribute names in sorted order
    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.valid_state() {
            Ok(state) => state.attributes.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}
impl Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("HttpSession")
            .field("id", &self.id)
            .field("valid", &state.valid)
            .field("attributes", &state.attributes.len())
            .finish()
    }
}

#[derive(Default)]
struct ManagerState {
    sessions: HashMap<String, HttpSession>,
    max_inactive: Option<Duration>,
    created: u64,
    removed: u64,
    expired: u64,
}
impl ManagerState {
    fn drop_invalid(&mut self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, x| x.is_valid());
        let dropped = before - self.sessions.len();
        self.expired += dropped as u64;
        dropped
    }
}

/// The sessions of one server, keyed by id.
#[derive(Clone, Default)]
pub struct SessionManager {
    state: Arc<Mutex<ManagerState>>,
}
impl SessionManager {
    /// Sessions created from now on expire after `max_inactive` without a lookup.
    pub fn new(max_inactive: Option<Duration>) -> Self {
        let manager = Self::default();
        manager.set_max_inactive(max_inactive);
        manager
    }

    pub fn set_max_inactive(&self, max_inactive: Option<Duration>) {
        lock(&self.state).max_inactive = max_inactive;
    }

    /// Start a session under a new random id.
    pub fn create(&self) -> HttpSession {
        let mut state = lock(&self.state);
        let mut id = format!("{:032x}", rand::random::<u128>());
        while state.sessions.contains_key(&id) {
            id = format!("{:032x}", rand::random::<u128>());
        }
        let session = HttpSession::new(id.clone(), state.max_inactive);
        state.sessions.insert(id, session.clone());
        state.created += 1;
        session
    }

    /// The valid session under `id`, marked as accessed now.
    pub fn get(&self, id: &str) -> Option<HttpSession> {
        let mut state = lock(&self.state);
        let session = state.sessions.get(id).cloned()?;
        if !session.is_valid() {
            debug!("dropping invalid session {id}");
            state.sessions.remove(id);
            state.expired += 1;
            return None;
        }
        session.touch();
        Some(session)
    }

    /// Forget the session under `id`, invalidating it.
    pub fn remove(&self, id: &str) -> bool {
        let mut state = lock(&self.state);
        match state.sessions.remove(id) {
            Some(session) => {
                session.invalidate();
                state.removed += 1;
                true
            }
            None => false,
        }
    }

    /// Drop expired and invalidated sessions, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        let dropped = lock(&self.state).drop_invalid();
        if dropped > 0 {
            debug!("swept {dropped} expired sessions");
        }
        dropped
    }

    /// Invalidate and forget every session.
    pub fn close(&self) {
        let sessions: Vec<HttpSession> = lock(&self.state).sessions.drain().map(|(_, x)| x).collect();
        for session in sessions {
            session.invalidate();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).sessions.is_empty()
    }

    /// Sessions created so far
    pub fn created(&self) -> u64 {
        lock(&self.state).created
    }

    /// Sessions removed by [`SessionManager::remove`]
    pub fn removed(&self) -> u64 {
        lock(&self.state).removed
    }

    /// Sessions dropped after expiring or being invalidated
    pub fn expired(&self) -> u64 {
        lock(&self.state).expired
    }
}
impl Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("SessionManager")
            .field("sessions", &state.sessions.len())
            .field("created", &state.created)
            .field("expired", &state.expired)
            .finish()
    }
}
