//! Asynchronous IO Control Blocks
//!
//! An [`Iocb`] tracks one outstanding request: its arguments, its state, and
//! eventually its response or error. Whoever submits a request keeps an
//! [`IocbRef`] and either waits on it or registers callbacks.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --request--> Pending --active--> Active --+--> Completed
//!                      |                          +--> Aborted
//!                      +---------- abort ------------> Aborted
//! ```
//!
//! Completion is signalled exactly once. Callbacks run in registration
//! order; a callback added after completion runs immediately.
//!
//! # Building blocks
//!
//! - [`IoQueue`]: priority-ordered queue of pending requests
//! - [`IoController`] / [`IoQController`]: dispatch requests to an
//!   [`IoProcessor`], the latter one at a time
//! - [`IoChain`] / [`IoGroup`]: composition
//! - [`IoProxy`]: concurrency limit in front of a named controller
//! - [`IoServer`] / [`IoProxyServer`]: the same over a datagram transport
//!
//! # Example
//!
//! ```
//! use bacnet_netstack::iocb::{
//!     IoArgs, IoControl, IoController, IoError, IoValue, Iocb, IocbRef, IocbState,
//! };
//!
//! let echo = IoController::new(Some("echo"), |iocb: &IocbRef| -> Result<(), IoError> {
//!     let first = iocb.args().args.first().cloned().unwrap_or_default();
//!     iocb.complete(first);
//!     Ok(())
//! });
//!
//! let iocb = Iocb::new(IoArgs::new().arg(42));
//! echo.request_io(&iocb).unwrap();
//! assert_eq!(iocb.state(), IocbState::Completed);
//! assert_eq!(iocb.response(), Some(IoValue::Int(42)));
//! ```

use std::{
    collections::BTreeMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use log::{debug, error};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::task::{panic_message, Scheduler, TaskHandle};

mod chain;
mod controller;
mod group;
mod proxy;
mod queue;
mod registry;
#[cfg(feature = "serde")]
mod remote;

pub use chain::{ChainCodec, IoChain};
pub use controller::{IoControl, IoController, IoProcessor, IoQController};
pub use group::IoGroup;
pub use proxy::IoProxy;
pub use queue::IoQueue;
pub use registry::IoRegistry;
#[cfg(feature = "serde")]
pub use remote::{IoProxyServer, IoServer, RemoteMessage};

/// Error carried by an aborted IOCB
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IoError {
    #[error("timeout")]
    Timeout,
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("invalid state transition: {0}")]
    StateTransition(String),
    #[error("no such controller: {0}")]
    NoSuchController(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("processing failed: {0}")]
    Processing(String),
    #[error("remote error: {0}")]
    Remote(String),
}

/// IOCB lifecycle state. Ordered, so `state < Completed` means "not done".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IocbState {
    Idle,
    Pending,
    Active,
    Completed,
    Aborted,
}

impl IocbState {
    pub fn is_terminal(self) -> bool {
        self >= IocbState::Completed
    }
}

impl fmt::Display for IocbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IocbState::Idle => "idle",
            IocbState::Pending => "pending",
            IocbState::Active => "active",
            IocbState::Completed => "completed",
            IocbState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Request arguments and responses
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum IoValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<IoValue>),
    Map(BTreeMap<String, IoValue>),
}

impl From<bool> for IoValue {
    fn from(value: bool) -> Self {
        IoValue::Bool(value)
    }
}

impl From<i64> for IoValue {
    fn from(value: i64) -> Self {
        IoValue::Int(value)
    }
}

impl From<i32> for IoValue {
    fn from(value: i32) -> Self {
        IoValue::Int(value.into())
    }
}

impl From<f64> for IoValue {
    fn from(value: f64) -> Self {
        IoValue::Float(value)
    }
}

impl From<&str> for IoValue {
    fn from(value: &str) -> Self {
        IoValue::Str(value.to_string())
    }
}

impl From<String> for IoValue {
    fn from(value: String) -> Self {
        IoValue::Str(value)
    }
}

impl From<Vec<u8>> for IoValue {
    fn from(value: Vec<u8>) -> Self {
        IoValue::Bytes(value)
    }
}

/// Positional and keyword arguments of a request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IoArgs {
    pub args: Vec<IoValue>,
    pub kwargs: BTreeMap<String, IoValue>,
}

impl IoArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<IoValue>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: &str, value: impl Into<IoValue>) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&IoValue> {
        self.kwargs.get(key)
    }
}

/// IO layer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoConfig {
    /// Timeout installed on remote requests that have none
    pub default_response_timeout: Duration,
    /// Default in-flight limit for proxies; `None` is unlimited
    pub default_request_limit: Option<usize>,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            default_response_timeout: Duration::from_secs(10),
            default_request_limit: None,
        }
    }
}

pub type IocbRef = Arc<Iocb>;

type Callback = Box<dyn FnOnce(&IocbRef) + Send + 'static>;

static NEXT_IOCB_ID: AtomicU64 = AtomicU64::new(1);

struct IocbInner {
    state: IocbState,
    response: Option<IoValue>,
    error: Option<IoError>,
    priority: i32,
    controller: Option<Weak<dyn IoControl>>,
    queue: Option<Weak<IoQueue>>,
    callbacks: Vec<Callback>,
    done: bool,
    timeout: Option<(Scheduler, TaskHandle)>,
}

/// IO control block
pub struct Iocb {
    id: u64,
    args: IoArgs,
    inner: Mutex<IocbInner>,
    signal: Condvar,
    #[cfg(feature = "async")]
    watch: tokio::sync::watch::Sender<bool>,
}

impl fmt::Debug for Iocb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Iocb")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("priority", &inner.priority)
            .field("response", &inner.response)
            .field("error", &inner.error)
            .finish()
    }
}

fn run_callback(callback: Callback, iocb: &IocbRef) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(iocb))) {
        error!(
            "callback for IOCB {} panicked: {}",
            iocb.id,
            panic_message(payload)
        );
    }
}

impl Iocb {
    pub fn new(args: IoArgs) -> IocbRef {
        Arc::new(Self {
            id: NEXT_IOCB_ID.fetch_add(1, Ordering::Relaxed),
            args,
            inner: Mutex::new(IocbInner {
                state: IocbState::Idle,
                response: None,
                error: None,
                priority: 0,
                controller: None,
                queue: None,
                callbacks: Vec::new(),
                done: false,
                timeout: None,
            }),
            signal: Condvar::new(),
            #[cfg(feature = "async")]
            watch: tokio::sync::watch::channel(false).0,
        })
    }

    fn lock(&self) -> MutexGuard<'_, IocbInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process-unique identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn args(&self) -> &IoArgs {
        &self.args
    }

    pub fn state(&self) -> IocbState {
        self.lock().state
    }

    pub fn response(&self) -> Option<IoValue> {
        self.lock().response.clone()
    }

    pub fn error(&self) -> Option<IoError> {
        self.lock().error.clone()
    }

    pub fn priority(&self) -> i32 {
        self.lock().priority
    }

    /// Higher values are served first. Only affects later queueing.
    pub fn set_priority(&self, priority: i32) {
        self.lock().priority = priority;
    }

    /// True once the completion signal is set
    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Controller the IOCB was submitted to, while it is alive
    pub fn controller(&self) -> Option<Arc<dyn IoControl>> {
        self.lock().controller.as_ref().and_then(Weak::upgrade)
    }

    pub fn has_timeout(&self) -> bool {
        self.lock().timeout.is_some()
    }

    pub(crate) fn set_state(&self, state: IocbState) {
        self.lock().state = state;
    }

    /// Idle to Pending under `controller`.
    pub(crate) fn bind(&self, controller: Weak<dyn IoControl>) -> Result<(), IoError> {
        let mut inner = self.lock();
        if inner.state != IocbState::Idle {
            return Err(IoError::StateTransition(format!(
                "IOCB {} submitted while {}",
                self.id, inner.state
            )));
        }
        inner.state = IocbState::Pending;
        inner.controller = Some(controller);
        Ok(())
    }

    /// Idle or Pending to Active.
    pub(crate) fn activate(&self) -> Result<(), IoError> {
        let mut inner = self.lock();
        match inner.state {
            IocbState::Idle | IocbState::Pending => {
                inner.state = IocbState::Active;
                Ok(())
            }
            state => Err(IoError::StateTransition(format!(
                "IOCB {} activated while {}",
                self.id, state
            ))),
        }
    }

    /// Record a terminal outcome. Returns false, changing nothing, if the
    /// IOCB is already terminal.
    pub(crate) fn finish(&self, outcome: Result<IoValue, IoError>) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        match outcome {
            Ok(response) => {
                inner.state = IocbState::Completed;
                inner.response = Some(response);
            }
            Err(err) => {
                inner.state = IocbState::Aborted;
                inner.error = Some(err);
            }
        }
        true
    }

    pub(crate) fn set_error(&self, err: IoError) {
        self.lock().error = Some(err);
    }

    pub(crate) fn set_queue(&self, queue: Weak<IoQueue>) {
        self.lock().queue = Some(queue);
    }

    pub(crate) fn clear_queue(&self) {
        self.lock().queue = None;
    }

    /// Mark as done without running callbacks; used for a fresh group.
    pub(crate) fn set_done(&self) {
        self.lock().done = true;
        self.signal.notify_all();
        #[cfg(feature = "async")]
        self.watch.send_replace(true);
    }

    pub(crate) fn clear_done(&self) {
        self.lock().done = false;
        #[cfg(feature = "async")]
        self.watch.send_replace(false);
    }

    /// Run `callback` on completion, or right away if already complete.
    pub fn add_callback<F>(self: &Arc<Self>, callback: F)
    where
        F: FnOnce(&IocbRef) + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.done {
            drop(inner);
            run_callback(Box::new(callback), self);
        } else {
            inner.callbacks.push(Box::new(callback));
        }
    }

    /// Signal completion: leave any queue, cancel the timeout, wake waiters
    /// and run the callbacks. Callbacks run once however often this is called.
    pub fn trigger(self: &Arc<Self>) {
        let (queue, timeout, callbacks) = {
            let mut inner = self.lock();
            inner.done = true;
            (
                inner.queue.take(),
                inner.timeout.take(),
                std::mem::take(&mut inner.callbacks),
            )
        };

        if let Some(queue) = queue.and_then(|queue| queue.upgrade()) {
            queue.remove(self);
        }
        if let Some((scheduler, handle)) = timeout {
            scheduler.cancel(handle);
        }

        self.signal.notify_all();
        #[cfg(feature = "async")]
        self.watch.send_replace(true);

        for callback in callbacks {
            run_callback(callback, self);
        }
    }

    /// Complete with `response`, through the controller if there is one.
    pub fn complete(self: &Arc<Self>, response: IoValue) {
        if let Some(controller) = self.controller() {
            controller.complete_io(self, response);
        } else if self.finish(Ok(response)) {
            self.trigger();
        }
    }

    /// Abort with `err`, through the controller if there is one.
    pub fn abort(self: &Arc<Self>, err: IoError) {
        if let Some(controller) = self.controller() {
            controller.abort_io(self, err);
        } else if self.finish(Err(err)) {
            self.trigger();
        }
    }

    /// Abort with `err` unless done within `delay`. Replaces any earlier
    /// timeout.
    pub fn set_timeout(self: &Arc<Self>, scheduler: &Scheduler, delay: Duration, err: IoError) {
        if self.is_done() {
            return;
        }

        let iocb = Arc::downgrade(self);
        let handle = scheduler.schedule(delay, move || {
            if let Some(iocb) = iocb.upgrade() {
                debug!("IOCB {} timed out", iocb.id);
                iocb.abort(err);
            }
        });

        let previous = self.lock().timeout.replace((scheduler.clone(), handle));
        if let Some((scheduler, handle)) = previous {
            scheduler.cancel(handle);
        }
    }

    /// Block until done or until `timeout` passes. Returns whether done.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let inner = self.lock();
        match timeout {
            None => {
                self.signal
                    .wait_while(inner, |inner| !inner.done)
                    .unwrap_or_else(PoisonError::into_inner)
                    .done
            }
            Some(timeout) => {
                self.signal
                    .wait_timeout_while(inner, timeout, |inner| !inner.done)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
                    .done
            }
        }
    }

    /// Wait for completion without blocking a thread.
    #[cfg(feature = "async")]
    pub async fn wait_async(&self) {
        let mut done = self.watch.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = done.wait_for(|done| *done).await;
    }
}
