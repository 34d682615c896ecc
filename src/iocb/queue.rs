//! Priority queue of pending IOCBs

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use log::debug;

use super::{IoError, IocbRef, IocbState};

/// Pending IOCBs, highest priority first and FIFO within a priority.
///
/// Queued IOCBs point back at the queue, so completing or aborting one
/// removes it.
pub struct IoQueue {
    name: Option<String>,
    entries: Mutex<VecDeque<(i32, IocbRef)>>,
    not_empty: Condvar,
    this: Weak<IoQueue>,
}

impl fmt::Debug for IoQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

impl IoQueue {
    pub fn new(name: Option<&str>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.map(str::to_string),
            entries: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<(i32, IocbRef)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queue a pending IOCB behind everything of equal or higher priority.
    pub fn put(&self, iocb: &IocbRef) -> Result<(), IoError> {
        let state = iocb.state();
        if state != IocbState::Pending {
            return Err(IoError::StateTransition(format!(
                "IOCB {} queued while {}",
                iocb.id(),
                state
            )));
        }

        iocb.set_queue(self.this.clone());
        let priority = iocb.priority();

        let mut entries = self.lock();
        let index = entries
            .iter()
            .position(|(p, _)| *p < priority)
            .unwrap_or(entries.len());
        entries.insert(index, (priority, iocb.clone()));
        drop(entries);

        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the next IOCB. With `block`, wait for one to arrive, for at most
    /// `timeout` if given.
    pub fn get(&self, block: bool, timeout: Option<Duration>) -> Option<IocbRef> {
        let mut entries = self.lock();
        if block {
            entries = match timeout {
                None => self
                    .not_empty
                    .wait_while(entries, |entries| entries.is_empty())
                    .unwrap_or_else(PoisonError::into_inner),
                Some(timeout) => {
                    self.not_empty
                        .wait_timeout_while(entries, timeout, |entries| entries.is_empty())
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }

        let (_, iocb) = entries.pop_front()?;
        drop(entries);

        iocb.clear_queue();
        Some(iocb)
    }

    /// Drop `iocb` from the queue if it is there.
    pub fn remove(&self, iocb: &IocbRef) {
        let mut entries = self.lock();
        if let Some(index) = entries.iter().position(|(_, e)| Arc::ptr_eq(e, iocb)) {
            entries.remove(index);
        }
    }

    /// Empty the queue, aborting everything that was in it.
    pub fn abort(&self, err: IoError) {
        let drained: Vec<IocbRef> = self.lock().drain(..).map(|(_, iocb)| iocb).collect();
        if !drained.is_empty() {
            debug!("aborting {} queued IOCBs: {}", drained.len(), err);
        }
        for iocb in drained {
            iocb.clear_queue();
            iocb.abort(err.clone());
        }
    }
}
