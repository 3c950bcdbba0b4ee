//! Pluggable, pollable address resolution for non-blocking connects.

use std::{
    net::{SocketAddr, ToSocketAddrs},
    thread,
};

use crossbeam_channel::{Receiver, TryRecvError};

use crate::error::HttpError;

pub(crate) const DEFAULT_ADDR_RESOLVER_PROVIDER: ThreadedAddrResolverProvider =
    ThreadedAddrResolverProvider;

/// Provides instances of [`AddrResolver`] for a given `host:port` string
pub trait AddrResolverProvider: Send + Sync {
    fn start(&self, s: String) -> Box<dyn AddrResolver>;
}

/// Polls a [`AddrResolutionOutcome`] to completion.
pub trait AddrResolver: Send + Sync {
    fn poll(&mut self) -> Result<AddrResolutionOutcome, HttpError>;
}

/// [`AddrResolver`] outcome that can be polled to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrResolutionOutcome {
    Idle,
    Active,
    Resolved(Vec<SocketAddr>),
}

fn resolve(s: &str) -> Result<Vec<SocketAddr>, HttpError> {
    let addrs: Vec<SocketAddr> = s.to_socket_addrs()?.collect();
    if addrs.is_empty() {
        return Err(HttpError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses for {s}"),
        )));
    }
    Ok(addrs)
}

/// Provides instances of [`StdAddrResolver`]
pub struct StdAddrResolverProvider;
impl AddrResolverProvider for StdAddrResolverProvider {
    fn start(&self, s: String) -> Box<dyn AddrResolver> {
        Box::new(StdAddrResolver { s: Some(s) })
    }
}

/// Uses [`ToSocketAddrs`] on the polling thread, which may block
pub struct StdAddrResolver {
    s: Option<String>,
}
impl AddrResolver for StdAddrResolver {
    fn poll(&mut self) -> Result<AddrResolutionOutcome, HttpError> {
        match self.s.take() {
            Some(x) => resolve(&x).map(AddrResolutionOutcome::Resolved),
            None => Err(HttpError::protocol("address already resolved")),
        }
    }
}

/// Provides instances of [`ThreadedAddrResolver`]
pub struct ThreadedAddrResolverProvider;
impl AddrResolverProvider for ThreadedAddrResolverProvider {
    fn start(&self, s: String) -> Box<dyn AddrResolver> {
        // literal addresses never need a lookup
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Box::new(ThreadedAddrResolver::Ready(Some(addr)));
        }
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let spawned = thread::Builder::new()
            .name("nbhttp-dns".to_owned())
            .spawn(move || {
                let _ = sender.send(resolve(&s));
            });
        match spawned {
            Ok(_) => Box::new(ThreadedAddrResolver::Pending(receiver)),
            Err(err) => Box::new(ThreadedAddrResolver::Failed(Some(HttpError::Io(err)))),
        }
    }
}

/// Resolves on a short-lived background thread, so polling never blocks.
pub enum ThreadedAddrResolver {
    Ready(Option<SocketAddr>),
    Pending(Receiver<Result<Vec<SocketAddr>, HttpError>>),
    Failed(Option<HttpError>),
}
impl AddrResolver for ThreadedAddrResolver {
    fn poll(&mut self) -> Result<AddrResolutionOutcome, HttpError> {
        match self {
            Self::Ready(addr) => match addr.take() {
                Some(x) => Ok(AddrResolutionOutcome::Resolved(vec![x])),
                None => Err(HttpError::protocol("address already resolved")),
            },
            Self::Pending(receiver) => match receiver.try_recv() {
                Ok(result) => result.map(AddrResolutionOutcome::Resolved),
                Err(TryRecvError::Empty) => Ok(AddrResolutionOutcome::Idle),
                Err(TryRecvError::Disconnected) => {
                    Err(HttpError::protocol("address resolver thread exited"))
                }
            },
            Self::Failed(err) => Err(err
                .take()
                .unwrap_or_else(|| HttpError::protocol("address resolution failed"))),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::{AddrResolutionOutcome, AddrResolverProvider, ThreadedAddrResolverProvider};

    #[test]
    fn test_literal_resolves_immediately() {
        let mut resolver = ThreadedAddrResolverProvider.start("127.0.0.1:8080".to_owned());
        match resolver.poll().unwrap() {
            AddrResolutionOutcome::Resolved(addrs) => {
                assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()])
            }
            x => panic!("unexpected {x:?}"),
        }
    }

    #[test]
    fn test_localhost_resolves_in_background() {
        let mut resolver = ThreadedAddrResolverProvider.start("localhost:80".to_owned());
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match resolver.poll().unwrap() {
                AddrResolutionOutcome::Resolved(addrs) => {
                    assert!(addrs.iter().all(|x| x.port() == 80));
                    break;
                }
                _ => {
                    assert!(Instant::now() < deadline);
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}
