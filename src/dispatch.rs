//! I/O dispatch threads and worker pools.
//!
//! A [`Dispatcher`] owns a set of [`Task`]s, usually connections, and drives them on a single
//! thread. It spins while any task reports work and backs off with a short `recv_timeout` on its
//! command channel otherwise. A [`WorkerPool`] runs callbacks that are allowed to block.

use std::{
    cell::Cell,
    fmt::Debug,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::{
    error::HttpError,
    log::{debug, error},
    DriveOutcome,
};

const IDLE_BACKOFF: Duration = Duration::from_millis(1);

thread_local! {
    static DISPATCH_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Fail if the current thread is an I/O dispatch thread, where blocking would stall every connection it owns.
pub(crate) fn assert_blocking_allowed() -> Result<(), HttpError> {
    if Dispatcher::is_dispatch_thread() {
        Err(HttpError::protocol(
            "blocking call made from an I/O dispatch thread",
        ))
    } else {
        Ok(())
    }
}

/// Returned by [`Task::drive`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Active,
    Idle,
    /// The task is finished and will be dropped
    Done,
}
impl From<DriveOutcome> for TaskOutcome {
    fn from(value: DriveOutcome) -> Self {
        match value {
            DriveOutcome::Active => TaskOutcome::Active,
            DriveOutcome::Idle => TaskOutcome::Idle,
        }
    }
}

/// Work owned and driven by a [`Dispatcher`].
pub trait Task: Send + 'static {
    fn drive(&mut self) -> TaskOutcome;

    /// Called once when the dispatcher shuts down while the task is still running.
    fn abort(&mut self) {}
}

enum Command {
    Spawn(Box<dyn Task>),
    Shutdown,
}

/// A single I/O thread driving [`Task`]s.
pub struct Dispatcher {
    name: String,
    sender: Sender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}
impl Dispatcher {
    /// Start a named dispatch thread.
    pub fn start(name: &str) -> Result<Self, HttpError> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(receiver))?;
        debug!("started dispatcher {name}");
        Ok(Self {
            name: name.to_owned(),
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand a task to the dispatch thread.
    pub fn spawn<T: Task>(&self, task: T) -> Result<(), HttpError> {
        self.sender
            .send(Command::Spawn(Box::new(task)))
            .map_err(|_| HttpError::ClosedChannel)
    }

    /// Stop the dispatch thread, aborting every task it still owns.
    ///
    /// Joins the thread unless called from the dispatch thread itself.
    pub fn shutdown(&self) {
        let _ = self.sender.send(Command::Shutdown);
        if Self::is_dispatch_thread() {
            return;
        }
        let handle = match self.handle.lock() {
            Ok(mut x) => x.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("dispatcher {} panicked", self.name);
            }
        }
    }

    /// True when called from any dispatcher's I/O thread.
    pub fn is_dispatch_thread() -> bool {
        DISPATCH_THREAD.with(|x| x.get())
    }
}
impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
impl Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name)
            .finish()
    }
}

fn run(receiver: Receiver<Command>) {
    DISPATCH_THREAD.with(|x| x.set(true));
    let mut tasks: Vec<Box<dyn Task>> = Vec::new();
    loop {
        loop {
            match receiver.try_recv() {
                Ok(Command::Spawn(task)) => tasks.push(task),
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => {
                    return abort_all(tasks);
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        let mut active = false;
        tasks.retain_mut(|task| {
            match catch_unwind(AssertUnwindSafe(|| task.drive())) {
                Ok(TaskOutcome::Active) => {
                    active = true;
                    true
                }
                Ok(TaskOutcome::Idle) => true,
                Ok(TaskOutcome::Done) => false,
                Err(_) => {
                    error!("dispatch task panicked, dropping it");
                    false
                }
            }
        });

        if !active {
            match receiver.recv_timeout(IDLE_BACKOFF) {
                Ok(Command::Spawn(task)) => tasks.push(task),
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    return abort_all(tasks);
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

fn abort_all(tasks: Vec<Box<dyn Task>>) {
    debug!("dispatcher stopping with {} tasks", tasks.len());
    for mut task in tasks {
        task.abort();
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct WorkerInner {
    sender: Sender<Job>,
    size: usize,
}

/// Fixed pool of threads for callbacks that may block.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<WorkerInner>,
}
impl WorkerPool {
    pub fn new(size: usize, name: &str) -> Result<Self, HttpError> {
        let size = size.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        for i in 0..size {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    // exits when every pool handle has been dropped
                    while let Ok(job) = receiver.recv() {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            error!("worker job panicked");
                        }
                    }
                })?;
        }
        Ok(Self {
            inner: Arc::new(WorkerInner { sender, size }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn execute<F>(&self, job: F) -> Result<(), HttpError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .sender
            .send(Box::new(job))
            .map_err(|_| HttpError::ClosedChannel)
    }

    /// Run on a worker, or on the current thread if the pool is gone.
    pub(crate) fn execute_or_inline(&self, job: Job) {
        if let Err(err) = self.inner.sender.send(job) {
            (err.0)();
        }
    }
}
impl Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.inner.size)
            .finish()
    }
}
