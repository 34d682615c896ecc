//! Request limiting in front of a named controller

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak},
};

use log::debug;

use super::{IoControl, IoError, IoRegistry, IocbRef};
use crate::address::Address;

#[derive(Default)]
struct Limiter {
    admitted: Vec<IocbRef>,
    overflow: VecDeque<IocbRef>,
    promoting: bool,
}

/// Sends requests to a controller found by name, either in the local
/// registry or, with a server address, on a remote [`IoServer`].
///
/// With a request limit, at most that many requests are outstanding at
/// once; the rest wait in arrival order. Urgent requests skip the limit.
///
/// [`IoServer`]: super::IoServer
pub struct IoProxy {
    registry: Arc<IoRegistry>,
    controller_name: String,
    server: Option<Address>,
    controller: OnceLock<Arc<dyn IoControl>>,
    request_limit: Option<usize>,
    limiter: Mutex<Limiter>,
    this: Weak<Self>,
}

impl fmt::Debug for IoProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoProxy")
            .field("controller", &self.controller_name)
            .field("server", &self.server)
            .field("request_limit", &self.request_limit)
            .finish()
    }
}

impl IoProxy {
    pub fn new(
        registry: &Arc<IoRegistry>,
        controller: &str,
        server: Option<Address>,
        request_limit: Option<usize>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry: registry.clone(),
            controller_name: controller.to_string(),
            server,
            controller: OnceLock::new(),
            request_limit,
            limiter: Mutex::new(Limiter::default()),
            this: this.clone(),
        })
    }

    pub fn controller_name(&self) -> &str {
        &self.controller_name
    }

    pub fn server(&self) -> Option<&Address> {
        self.server.as_ref()
    }

    pub fn request_limit(&self) -> Option<usize> {
        self.request_limit
    }

    fn lock(&self) -> MutexGuard<'_, Limiter> {
        self.limiter.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests admitted and not yet done
    pub fn in_flight(&self) -> usize {
        self.lock().admitted.len()
    }

    /// Requests waiting for a free slot
    pub fn waiting(&self) -> usize {
        self.lock().overflow.len()
    }

    pub fn request_io(&self, iocb: &IocbRef, urgent: bool) -> Result<(), IoError> {
        let limit = match self.request_limit {
            Some(limit) if !urgent => limit,
            _ => return self.submit(iocb),
        };

        {
            let mut limiter = self.lock();
            // a free slot is not enough while others are still waiting for it
            if limiter.admitted.len() >= limit || !limiter.overflow.is_empty() {
                debug!(
                    "IOCB {} waiting, {} requests in flight",
                    iocb.id(),
                    limiter.admitted.len()
                );
                limiter.overflow.push_back(iocb.clone());
                let stalled = limiter.admitted.len() < limit && !limiter.promoting;
                drop(limiter);
                if stalled {
                    self.promote();
                }
                return Ok(());
            }
            limiter.admitted.push(iocb.clone());
        }

        match self.submit(iocb) {
            Ok(()) => {
                self.watch(iocb);
                Ok(())
            }
            Err(err) => {
                self.release(iocb);
                Err(err)
            }
        }
    }

    fn resolve(&self) -> Result<Arc<dyn IoControl>, IoError> {
        if let Some(controller) = self.controller.get() {
            return Ok(controller.clone());
        }
        let controller = self
            .registry
            .controller(&self.controller_name)
            .ok_or_else(|| IoError::NoSuchController(self.controller_name.clone()))?;
        Ok(self.controller.get_or_init(|| controller).clone())
    }

    #[cfg(feature = "serde")]
    fn submit_remote(&self, server: &Address, iocb: &IocbRef) -> Result<(), IoError> {
        let proxy_server = self
            .registry
            .proxy_server()
            .ok_or_else(|| IoError::Configuration("no proxy server installed".into()))?;
        proxy_server.request_io(server, &self.controller_name, iocb)
    }

    #[cfg(not(feature = "serde"))]
    fn submit_remote(&self, server: &Address, _iocb: &IocbRef) -> Result<(), IoError> {
        Err(IoError::Configuration(format!(
            "remote controller at {} needs the serde feature",
            server
        )))
    }

    fn submit(&self, iocb: &IocbRef) -> Result<(), IoError> {
        match &self.server {
            Some(server) => self.submit_remote(server, iocb),
            None => self.resolve()?.request_io(iocb),
        }
    }

    fn watch(&self, iocb: &IocbRef) {
        let this = self.this.clone();
        iocb.add_callback(move |iocb| {
            if let Some(proxy) = this.upgrade() {
                proxy.release(iocb);
            }
        });
    }

    /// Free the slot held by `iocb` and fill free slots from the overflow.
    fn release(&self, iocb: &IocbRef) {
        self.lock()
            .admitted
            .retain(|admitted| !Arc::ptr_eq(admitted, iocb));
        self.promote();
    }

    /// Move waiting requests into free slots, oldest first.
    ///
    /// Promoted requests that finish at once release their slot from inside
    /// this loop; the `promoting` flag keeps that from recursing.
    fn promote(&self) {
        {
            let mut limiter = self.lock();
            if limiter.promoting {
                return;
            }
            limiter.promoting = true;
        }

        let limit = self.request_limit.unwrap_or(usize::MAX);
        loop {
            let next = {
                let mut limiter = self.lock();
                let next = if limiter.admitted.len() < limit {
                    // requests aborted while waiting are skipped
                    loop {
                        match limiter.overflow.pop_front() {
                            Some(next) if next.is_done() => continue,
                            other => break other,
                        }
                    }
                } else {
                    None
                };
                match next {
                    Some(next) => {
                        limiter.admitted.push(next.clone());
                        next
                    }
                    None => {
                        limiter.promoting = false;
                        return;
                    }
                }
            };

            match self.submit(&next) {
                Ok(()) => self.watch(&next),
                Err(err) => {
                    debug!("waiting IOCB {} failed to submit: {}", next.id(), err);
                    self.lock()
                        .admitted
                        .retain(|admitted| !Arc::ptr_eq(admitted, &next));
                    next.abort(err);
                }
            }
        }
    }
}
