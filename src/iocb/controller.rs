//! Controllers: where IOCBs get processed

use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use log::{debug, warn};

use super::{IoError, IoQueue, IoValue, IocbRef, IocbState};
use crate::task::{panic_message, Scheduler};

/// A controller IOCBs are submitted to.
///
/// Once submitted, an IOCB's own `complete` and `abort` route back here.
pub trait IoControl: Send + Sync {
    fn name(&self) -> Option<&str>;

    /// Take ownership of an idle IOCB. Fails only if it is not idle;
    /// processing failures abort the IOCB instead.
    fn request_io(&self, iocb: &IocbRef) -> Result<(), IoError>;

    /// Mark an idle or pending IOCB as being worked on.
    fn active_io(&self, iocb: &IocbRef) -> Result<(), IoError>;

    fn complete_io(&self, iocb: &IocbRef, response: IoValue);

    fn abort_io(&self, iocb: &IocbRef, err: IoError);

    /// Abort everything waiting on this controller.
    fn abort(&self, err: IoError);
}

/// The work a controller does with an IOCB.
///
/// It may complete the IOCB right away or keep it and complete it later.
/// An `Err` aborts the IOCB.
pub trait IoProcessor: Send + Sync + 'static {
    fn process_io(&self, iocb: &IocbRef) -> Result<(), IoError>;
}

impl<F> IoProcessor for F
where
    F: Fn(&IocbRef) -> Result<(), IoError> + Send + Sync + 'static,
{
    fn process_io(&self, iocb: &IocbRef) -> Result<(), IoError> {
        self(iocb)
    }
}

fn process<P: IoProcessor>(processor: &P, iocb: &IocbRef) -> Result<(), IoError> {
    match catch_unwind(AssertUnwindSafe(|| processor.process_io(iocb))) {
        Ok(result) => result,
        Err(payload) => Err(IoError::Processing(panic_message(payload))),
    }
}

/// Processes every request as soon as it arrives
pub struct IoController<P> {
    name: Option<String>,
    processor: P,
    this: Weak<Self>,
}

impl<P> fmt::Debug for IoController<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoController")
            .field("name", &self.name)
            .finish()
    }
}

impl<P: IoProcessor> IoController<P> {
    pub fn new(name: Option<&str>, processor: P) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.map(str::to_string),
            processor,
            this: this.clone(),
        })
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }
}

impl<P: IoProcessor> IoControl for IoController<P> {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn request_io(&self, iocb: &IocbRef) -> Result<(), IoError> {
        let this: Weak<dyn IoControl> = self.this.clone();
        iocb.bind(this)?;

        if let Err(err) = process(&self.processor, iocb) {
            debug!("IOCB {} failed in processing: {}", iocb.id(), err);
            self.abort_io(iocb, err);
        }
        Ok(())
    }

    fn active_io(&self, iocb: &IocbRef) -> Result<(), IoError> {
        iocb.activate()
    }

    fn complete_io(&self, iocb: &IocbRef, response: IoValue) {
        if iocb.finish(Ok(response)) {
            iocb.trigger();
        }
    }

    fn abort_io(&self, iocb: &IocbRef, err: IoError) {
        if iocb.finish(Err(err)) {
            iocb.trigger();
        }
    }

    fn abort(&self, _err: IoError) {}
}

/// Processes one request at a time, queueing the rest by priority.
///
/// When the active request finishes, the next one is started from a task
/// on the scheduler rather than from inside the completion, so a run of
/// requests that complete immediately does not nest.
pub struct IoQController<P> {
    name: Option<String>,
    processor: P,
    scheduler: Scheduler,
    queue: Arc<IoQueue>,
    active: Mutex<Option<IocbRef>>,
    this: Weak<Self>,
}

impl<P> fmt::Debug for IoQController<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoQController")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .finish()
    }
}

impl<P: IoProcessor> IoQController<P> {
    pub fn new(name: Option<&str>, scheduler: &Scheduler, processor: P) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.map(str::to_string),
            processor,
            scheduler: scheduler.clone(),
            queue: IoQueue::new(name),
            active: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<IocbRef>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_busy(&self) -> bool {
        self.lock_active().is_some()
    }

    /// The request being processed
    pub fn active(&self) -> Option<IocbRef> {
        self.lock_active().clone()
    }

    /// Requests waiting behind the active one
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn start(&self, iocb: &IocbRef) {
        if let Err(err) = process(&self.processor, iocb) {
            debug!("IOCB {} failed in processing: {}", iocb.id(), err);
            self.abort_io(iocb, err);
        }
    }

    /// Clear the active slot if `iocb` holds it and look for more work later.
    fn release(&self, iocb: &IocbRef) {
        let released = {
            let mut active = self.lock_active();
            match active.as_ref() {
                Some(current) if Arc::ptr_eq(current, iocb) => {
                    *active = None;
                    true
                }
                _ => false,
            }
        };

        if released {
            let this = self.this.clone();
            self.scheduler.defer(move || {
                if let Some(controller) = this.upgrade() {
                    controller.drain();
                }
            });
        }
    }

    fn drain(&self) {
        let next = {
            let mut active = self.lock_active();
            if active.is_some() {
                return;
            }
            match self.queue.get(false, None) {
                Some(iocb) => {
                    *active = Some(iocb.clone());
                    iocb
                }
                None => return,
            }
        };

        if next.state().is_terminal() {
            warn!("IOCB {} finished while queued", next.id());
            self.release(&next);
            return;
        }
        self.start(&next);
    }
}

impl<P: IoProcessor> IoControl for IoQController<P> {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn request_io(&self, iocb: &IocbRef) -> Result<(), IoError> {
        let this: Weak<dyn IoControl> = self.this.clone();
        iocb.bind(this)?;

        {
            let mut active = self.lock_active();
            if active.is_some() {
                // queue under the active lock so a drain in flight sees it
                return self.queue.put(iocb);
            }
            *active = Some(iocb.clone());
        }

        self.start(iocb);
        Ok(())
    }

    fn active_io(&self, iocb: &IocbRef) -> Result<(), IoError> {
        iocb.activate()
    }

    fn complete_io(&self, iocb: &IocbRef, response: IoValue) {
        if iocb.finish(Ok(response)) {
            self.release(iocb);
            iocb.trigger();
        }
    }

    fn abort_io(&self, iocb: &IocbRef, err: IoError) {
        if iocb.finish(Err(err)) {
            self.release(iocb);
            iocb.trigger();
        }
    }

    /// Abort the queued requests. The active one is left alone.
    fn abort(&self, err: IoError) {
        self.queue.abort(err);
    }
}
