//! Named controllers

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};
#[cfg(feature = "serde")]
use std::sync::OnceLock;

use log::debug;

#[cfg(feature = "serde")]
use super::IoProxyServer;
use super::{IoControl, IoError};

/// Controllers that proxies and servers can find by name.
///
/// Entries are only ever added.
#[derive(Default)]
pub struct IoRegistry {
    controllers: RwLock<BTreeMap<String, Arc<dyn IoControl>>>,
    #[cfg(feature = "serde")]
    proxy_server: OnceLock<Arc<IoProxyServer>>,
}

impl fmt::Debug for IoRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .controllers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("IoRegistry")
            .field("controllers", &names)
            .finish()
    }
}

impl IoRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `controller` reachable under its name.
    pub fn register(&self, controller: Arc<dyn IoControl>) -> Result<(), IoError> {
        let name = controller
            .name()
            .ok_or_else(|| IoError::Configuration("cannot register an unnamed controller".into()))?
            .to_string();

        let mut controllers = self
            .controllers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if controllers.contains_key(&name) {
            return Err(IoError::Configuration(format!(
                "controller {} already registered",
                name
            )));
        }
        debug!("registered controller {}", name);
        controllers.insert(name, controller);
        Ok(())
    }

    pub fn controller(&self, name: &str) -> Option<Arc<dyn IoControl>> {
        self.controllers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.controllers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Install the proxy server used for remote controllers. Only the first
    /// call has any effect; returns whether this one did.
    #[cfg(feature = "serde")]
    pub fn set_proxy_server(&self, server: Arc<IoProxyServer>) -> bool {
        self.proxy_server.set(server).is_ok()
    }

    #[cfg(feature = "serde")]
    pub fn proxy_server(&self) -> Option<Arc<IoProxyServer>> {
        self.proxy_server.get().cloned()
    }

    /// Abort everything waiting on the proxy server and on every registered
    /// controller.
    pub fn abort(&self, err: IoError) {
        #[cfg(feature = "serde")]
        if let Some(server) = self.proxy_server.get() {
            server.abort(err.clone());
        }

        let controllers: Vec<Arc<dyn IoControl>> = self
            .controllers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for controller in controllers {
            controller.abort(err.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iocb::{IoArgs, IoController, IoQController, Iocb, IocbRef, IocbState};
    use crate::task::Scheduler;

    fn hold(_: &IocbRef) -> Result<(), IoError> {
        Ok(())
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = IoRegistry::new();
        registry
            .register(IoController::new(Some("local"), hold))
            .unwrap();

        assert!(registry.controller("local").is_some());
        assert!(registry.controller("missing").is_none());
        assert_eq!(registry.names(), vec!["local".to_string()]);
    }

    #[test]
    fn test_register_rejects_unnamed_and_duplicates() {
        let registry = IoRegistry::new();
        assert!(matches!(
            registry.register(IoController::new(None, hold)),
            Err(IoError::Configuration(_))
        ));

        registry.register(IoController::new(Some("dup"), hold)).unwrap();
        assert!(matches!(
            registry.register(IoController::new(Some("dup"), hold)),
            Err(IoError::Configuration(_))
        ));
    }

    #[test]
    fn test_abort_reaches_queued_requests() {
        let scheduler = Scheduler::new();
        let registry = IoRegistry::new();
        let controller = IoQController::new(Some("serial"), &scheduler, hold);
        registry.register(controller.clone()).unwrap();

        let active = Iocb::new(IoArgs::new());
        let queued = Iocb::new(IoArgs::new());
        controller.request_io(&active).unwrap();
        controller.request_io(&queued).unwrap();

        registry.abort(IoError::Aborted("shutdown".into()));
        assert_eq!(queued.state(), IocbState::Aborted);
        assert_eq!(active.state(), IocbState::Pending);
    }
}
