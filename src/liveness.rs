//! Liveness timers used by connections to enforce their timeout classes.
//!
//! A [`Deadline`] is armed with an optional timeout and checked on every call to `drive`.
//! A `None` timeout never expires, so every timeout class can be disabled individually.

use std::time::{Duration, Instant};

use crate::error::{HttpError, TimeoutKind};

/// A resettable deadline for one [`TimeoutKind`].
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    kind: TimeoutKind,
    timeout: Option<Duration>,
    due: Option<Instant>,
}
impl Deadline {
    /// Create a disarmed deadline.
    pub fn new(kind: TimeoutKind, timeout: Option<Duration>) -> Self {
        Self {
            kind,
            timeout,
            due: None,
        }
    }

    /// Create a deadline that is already running.
    pub fn started(kind: TimeoutKind, timeout: Option<Duration>) -> Self {
        let mut x = Self::new(kind, timeout);
        x.arm();
        x
    }

    pub fn kind(&self) -> TimeoutKind {
        self.kind
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Change the timeout, restarting the deadline if it was running.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
        if self.is_armed() {
            self.arm();
        }
    }

    /// Start, or restart, counting from now.
    pub fn arm(&mut self) {
        // a timeout too long to represent never expires
        self.due = self.timeout.and_then(|x| Instant::now().checked_add(x));
    }

    pub fn disarm(&mut self) {
        self.due = None;
    }

    pub fn is_armed(&self) -> bool {
        self.due.is_some()
    }

    /// Time left before expiry, or `None` if disarmed.
    pub fn remaining(&self) -> Option<Duration> {
        self.due
            .map(|x| x.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.due {
            Some(due) => now >= due,
            None => false,
        }
    }

    /// The error reported when this deadline expires.
    pub fn error(&self) -> HttpError {
        HttpError::Timeout(self.kind, self.timeout.unwrap_or_default())
    }

    /// Return the timeout error if expired, disarming the deadline.
    pub fn check(&mut self) -> Result<(), HttpError> {
        if self.is_expired() {
            self.disarm();
            Err(self.error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use std::{thread, time::Duration};

    use super::Deadline;
    use crate::error::{HttpError, TimeoutKind};

    #[test]
    fn test_disabled_never_expires() {
        let mut deadline = Deadline::started(TimeoutKind::Idle, None);
        assert!(!deadline.is_armed());
        assert!(deadline.check().is_ok());
    }

    #[test]
    fn test_unrepresentable_timeout_never_expires() {
        let mut deadline = Deadline::started(TimeoutKind::Idle, Some(Duration::MAX));
        assert!(!deadline.is_expired());
        assert!(deadline.check().is_ok());
    }

    #[test]
    fn test_expiry_and_rearm() {
        let mut deadline = Deadline::new(TimeoutKind::Response, Some(Duration::from_millis(5)));
        assert!(deadline.check().is_ok());
        deadline.arm();
        assert!(!deadline.is_expired());
        thread::sleep(Duration::from_millis(10));
        match deadline.check().unwrap_err() {
            HttpError::Timeout(TimeoutKind::Response, after) => {
                assert_eq!(after, Duration::from_millis(5))
            }
            x => panic!("unexpected {x:?}"),
        }
        // disarmed after firing
        assert!(deadline.check().is_ok());
        deadline.arm();
        assert!(deadline.remaining().unwrap() <= Duration::from_millis(5));
    }
}
