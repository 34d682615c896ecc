//! Deferred Task Scheduling
//!
//! [`Scheduler`] is a time-ordered queue of one-shot jobs. Jobs either run
//! on a dedicated runner thread ([`Scheduler::spawn`]) or are pumped by the
//! owner of an event loop through [`Scheduler::run_pending`].
//!
//! Jobs run one at a time from a loop, never from inside each other, so a
//! job that defers another job does not grow the stack. Jobs due at the same
//! instant run in the order they were scheduled.
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//! use bacnet_netstack::task::Scheduler;
//!
//! let scheduler = Scheduler::new();
//! let log = Arc::new(Mutex::new(Vec::new()));
//!
//! let l = log.clone();
//! scheduler.defer(move || l.lock().unwrap().push("first"));
//! let l = log.clone();
//! let later = scheduler.schedule(Duration::from_secs(60), move || l.lock().unwrap().push("later"));
//!
//! assert_eq!(scheduler.run_pending(), 1);
//! assert!(scheduler.cancel(later));
//! assert_eq!(*log.lock().unwrap(), vec!["first"]);
//! ```

use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a scheduled job so it can be cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    id: u64,
    deadline: Instant,
}

impl TaskHandle {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.id)
    }
}

#[derive(Default)]
struct State {
    jobs: BTreeMap<(Instant, u64), Job>,
    stopped: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    wake: Condvar,
    next_id: AtomicU64,
}

/// Shared handle to a task queue. Clones refer to the same queue.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_job(job: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        error!("scheduled task panicked: {}", panic_message(payload));
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `job` as soon as possible, after anything already due.
    pub fn defer<F>(&self, job: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now(), job)
    }

    /// Run `job` once `delay` has passed.
    pub fn schedule<F>(&self, delay: Duration, job: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, job)
    }

    pub fn schedule_at<F>(&self, deadline: Instant, job: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().jobs.insert((deadline, id), Box::new(job));
        self.inner.wake.notify_all();
        TaskHandle { id, deadline }
    }

    /// Drop a job that has not run yet. Returns false if it already ran or
    /// was cancelled.
    pub fn cancel(&self, handle: TaskHandle) -> bool {
        let removed = self
            .lock()
            .jobs
            .remove(&(handle.deadline, handle.id))
            .is_some();
        if removed {
            self.inner.wake.notify_all();
        }
        removed
    }

    /// Number of jobs waiting to run
    pub fn pending(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().jobs.keys().next().map(|(deadline, _)| *deadline)
    }

    fn pop_due(&self) -> Option<Job> {
        let mut state = self.lock();
        let key = *state.jobs.keys().next()?;
        if key.0 > Instant::now() {
            return None;
        }
        state.jobs.remove(&key)
    }

    /// Run every job that is due, including jobs those jobs defer.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = self.pop_due() {
            run_job(job);
            ran += 1;
        }
        ran
    }

    /// Start a thread that runs jobs as they fall due, until [`stop`].
    ///
    /// [`stop`]: Scheduler::stop
    pub fn spawn(&self) -> thread::JoinHandle<()> {
        {
            self.lock().stopped = false;
        }
        let scheduler = self.clone();
        thread::spawn(move || {
            debug!("scheduler thread started");
            scheduler.run_loop();
            debug!("scheduler thread stopped");
        })
    }

    fn run_loop(&self) {
        let mut state = self.lock();
        loop {
            if state.stopped {
                return;
            }

            let now = Instant::now();
            let next = state.jobs.keys().next().copied();
            match next {
                Some(key) if key.0 <= now => {
                    let job = state.jobs.remove(&key);
                    drop(state);
                    if let Some(job) = job {
                        run_job(job);
                    }
                    state = self.lock();
                }
                Some((deadline, _)) => {
                    state = self
                        .inner
                        .wake
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    state = self
                        .inner
                        .wake
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Ask the runner thread to exit. Queued jobs stay queued.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.inner.wake.notify_all();
    }
}
