//! Remote IO over a datagram transport
//!
//! An [`IoProxyServer`] forwards requests to an [`IoServer`] in another
//! process, which runs them on one of its registered controllers and sends
//! back the outcome. Messages are [`RemoteMessage`]s serialized with
//! `bincode` and carried as the payload of a [`Pdu`].

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{IoArgs, IoConfig, IoError, IoRegistry, IoValue, Iocb, IocbRef, IocbState};
use crate::{
    address::Address,
    comm::{Client, Server},
    pdu::Pdu,
    task::Scheduler,
};

/// Wire messages. The variant index is the message tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteMessage {
    NewIocb {
        id: u64,
        controller: String,
        args: Vec<IoValue>,
        kwargs: BTreeMap<String, IoValue>,
    },
    CompleteIocb {
        id: u64,
        response: IoValue,
    },
    AbortIocb {
        id: u64,
        error: IoError,
    },
}

impl RemoteMessage {
    pub fn id(&self) -> u64 {
        match self {
            RemoteMessage::NewIocb { id, .. }
            | RemoteMessage::CompleteIocb { id, .. }
            | RemoteMessage::AbortIocb { id, .. } => *id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, IoError> {
        bincode::serialize(self).map_err(|e| IoError::Remote(format!("encoding: {}", e)))
    }

    pub fn decode(data: &[u8]) -> Result<Self, IoError> {
        bincode::deserialize(data).map_err(|e| IoError::Remote(format!("decoding: {}", e)))
    }

    /// The reply that reports a finished IOCB's outcome under `id`.
    fn outcome(id: u64, iocb: &IocbRef) -> Self {
        match iocb.state() {
            IocbState::Completed => RemoteMessage::CompleteIocb {
                id,
                response: iocb.response().unwrap_or_default(),
            },
            state => RemoteMessage::AbortIocb {
                id,
                error: iocb
                    .error()
                    .unwrap_or_else(|| IoError::StateTransition(format!("finished while {}", state))),
            },
        }
    }
}

type Transport = Mutex<Box<dyn Server + Send>>;

fn send(
    transport: &Transport,
    destination: &Address,
    message: &RemoteMessage,
) -> Result<(), IoError> {
    let pdu = Pdu::with_data(&message.encode()?).with_destination(destination.clone());
    transport
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .indication(pdu)
        .map_err(|e| IoError::Remote(e.to_string()))
}

/// Runs requests from remote proxies on local controllers
pub struct IoServer {
    registry: Arc<IoRegistry>,
    transport: Transport,
    /// local IOCB id to (remote id, reply address)
    pending: Mutex<HashMap<u64, (u64, Address)>>,
    this: Weak<Self>,
}

impl fmt::Debug for IoServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoServer")
            .field("registry", &self.registry)
            .field("pending", &self.pending())
            .finish()
    }
}

impl IoServer {
    pub fn new<S>(registry: &Arc<IoRegistry>, transport: S) -> Arc<Self>
    where
        S: Server + Send + 'static,
    {
        Arc::new_cyclic(|this| Self {
            registry: registry.clone(),
            transport: Mutex::new(Box::new(transport)),
            pending: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, (u64, Address)>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remote requests still being worked on
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn reply(&self, destination: &Address, message: &RemoteMessage) {
        if let Err(err) = send(&self.transport, destination, message) {
            warn!("reply for remote IOCB {} lost: {}", message.id(), err);
        }
    }

    /// Handle a PDU from the transport. Its source is where replies go.
    pub fn receive(&self, pdu: Pdu) {
        let Some(source) = pdu.source.clone() else {
            warn!("remote IO request without a source address dropped");
            return;
        };
        let message = match RemoteMessage::decode(pdu.data()) {
            Ok(message) => message,
            Err(err) => {
                warn!("bad remote IO message from {}: {}", source, err);
                return;
            }
        };

        let (remote_id, controller_name, args, kwargs) = match message {
            RemoteMessage::NewIocb {
                id,
                controller,
                args,
                kwargs,
            } => (id, controller, args, kwargs),
            other => {
                warn!("unexpected {:?} from {}", other, source);
                return;
            }
        };

        let Some(controller) = self.registry.controller(&controller_name) else {
            debug!("remote request {} for unknown controller {}", remote_id, controller_name);
            self.reply(
                &source,
                &RemoteMessage::AbortIocb {
                    id: remote_id,
                    error: IoError::NoSuchController(controller_name),
                },
            );
            return;
        };

        let iocb = Iocb::new(IoArgs { args, kwargs });
        self.lock().insert(iocb.id(), (remote_id, source));

        let this = self.this.clone();
        iocb.add_callback(move |iocb| {
            let Some(server) = this.upgrade() else {
                return;
            };
            let entry = server.lock().remove(&iocb.id());
            if let Some((remote_id, destination)) = entry {
                server.reply(&destination, &RemoteMessage::outcome(remote_id, iocb));
            }
        });

        if let Err(err) = controller.request_io(&iocb) {
            iocb.abort(err);
        }
    }
}

impl Client for Arc<IoServer> {
    fn confirmation(&mut self, pdu: Pdu) {
        self.receive(pdu);
    }
}

/// Sends requests to remote [`IoServer`]s and tracks their replies
pub struct IoProxyServer {
    transport: Transport,
    scheduler: Scheduler,
    config: IoConfig,
    pending: Mutex<HashMap<u64, IocbRef>>,
    this: Weak<Self>,
}

impl fmt::Debug for IoProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoProxyServer")
            .field("config", &self.config)
            .field("pending", &self.pending())
            .finish()
    }
}

impl IoProxyServer {
    pub fn new<S>(transport: S, scheduler: &Scheduler, config: IoConfig) -> Arc<Self>
    where
        S: Server + Send + 'static,
    {
        Arc::new_cyclic(|this| Self {
            transport: Mutex::new(Box::new(transport)),
            scheduler: scheduler.clone(),
            config,
            pending: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, IocbRef>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests waiting for a reply
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Send an idle IOCB to `controller` on `server`. It gets the default
    /// response timeout unless it already has one.
    pub fn request_io(
        &self,
        server: &Address,
        controller: &str,
        iocb: &IocbRef,
    ) -> Result<(), IoError> {
        let state = iocb.state();
        if state != IocbState::Idle {
            return Err(IoError::StateTransition(format!(
                "IOCB {} submitted while {}",
                iocb.id(),
                state
            )));
        }
        iocb.set_state(IocbState::Pending);

        if !iocb.has_timeout() {
            iocb.set_timeout(
                &self.scheduler,
                self.config.default_response_timeout,
                IoError::Timeout,
            );
        }

        self.lock().insert(iocb.id(), iocb.clone());
        let this = self.this.clone();
        iocb.add_callback(move |iocb| {
            if let Some(proxy) = this.upgrade() {
                proxy.lock().remove(&iocb.id());
            }
        });

        let message = RemoteMessage::NewIocb {
            id: iocb.id(),
            controller: controller.to_string(),
            args: iocb.args().args.clone(),
            kwargs: iocb.args().kwargs.clone(),
        };
        if let Err(err) = send(&self.transport, server, &message) {
            debug!("IOCB {} not sent to {}: {}", iocb.id(), server, err);
            iocb.abort(err);
        }
        Ok(())
    }

    /// Handle a reply from a server.
    pub fn receive(&self, pdu: Pdu) {
        let message = match RemoteMessage::decode(pdu.data()) {
            Ok(message) => message,
            Err(err) => {
                warn!("bad remote IO reply: {}", err);
                return;
            }
        };

        let id = message.id();
        let Some(iocb) = self.lock().remove(&id) else {
            // timed out or aborted before the reply arrived
            debug!("reply for unknown IOCB {}", id);
            return;
        };

        match message {
            RemoteMessage::CompleteIocb { response, .. } => iocb.complete(response),
            RemoteMessage::AbortIocb { error, .. } => iocb.abort(error),
            RemoteMessage::NewIocb { .. } => {
                warn!("request received by a proxy server");
                iocb.abort(IoError::Remote("server answered with a request".into()));
            }
        }
    }

    /// Abort every request still waiting for a reply.
    pub fn abort(&self, err: IoError) {
        let pending: Vec<IocbRef> = self.lock().drain().map(|(_, iocb)| iocb).collect();
        for iocb in pending {
            iocb.abort(err.clone());
        }
    }
}

impl Client for Arc<IoProxyServer> {
    fn confirmation(&mut self, pdu: Pdu) {
        self.receive(pdu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Capture;
    use crate::iocb::{IoController, IoProxy};
    use std::time::Duration;

    fn proxy_address() -> Address {
        Address::local_station(vec![1])
    }

    fn server_address() -> Address {
        Address::local_station(vec![2])
    }

    /// Move everything sent on `link` to `deliver`, stamped with `source`.
    fn shuttle(link: &Capture, source: Address, deliver: impl Fn(Pdu)) {
        for mut pdu in link.drain() {
            pdu.source = Some(source.clone());
            deliver(pdu);
        }
    }

    struct Setup {
        scheduler: Scheduler,
        client_registry: Arc<IoRegistry>,
        proxy_server: Arc<IoProxyServer>,
        server: Arc<IoServer>,
        to_server: Capture,
        to_proxy: Capture,
    }

    fn setup() -> Setup {
        let scheduler = Scheduler::new();
        let to_server = Capture::new();
        let to_proxy = Capture::new();

        let server_registry = IoRegistry::new();
        server_registry
            .register(IoController::new(Some("adder"), |iocb: &IocbRef| {
                let mut sum = 0;
                for arg in &iocb.args().args {
                    match arg {
                        IoValue::Int(n) => sum += n,
                        other => return Err(IoError::Processing(format!("cannot add {:?}", other))),
                    }
                }
                iocb.complete(IoValue::Int(sum));
                Ok(())
            }))
            .unwrap();
        let server = IoServer::new(&server_registry, to_proxy.clone());

        let client_registry = IoRegistry::new();
        let proxy_server = IoProxyServer::new(to_server.clone(), &scheduler, IoConfig::default());
        assert!(client_registry.set_proxy_server(proxy_server.clone()));

        Setup {
            scheduler,
            client_registry,
            proxy_server,
            server,
            to_server,
            to_proxy,
        }
    }

    impl Setup {
        fn exchange(&self) {
            shuttle(&self.to_server, proxy_address(), |pdu| self.server.receive(pdu));
            shuttle(&self.to_proxy, server_address(), |pdu| self.proxy_server.receive(pdu));
        }
    }

    #[test]
    fn test_message_tags() {
        let message = RemoteMessage::CompleteIocb {
            id: 9,
            response: IoValue::Null,
        };
        let encoded = message.encode().unwrap();
        assert_eq!(&encoded[..4], &[1, 0, 0, 0]);
        assert_eq!(RemoteMessage::decode(&encoded).unwrap(), message);

        let abort = RemoteMessage::AbortIocb {
            id: 9,
            error: IoError::Timeout,
        };
        assert_eq!(abort.encode().unwrap()[0], 2);
        assert!(RemoteMessage::decode(&[7, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_remote_request_completes() {
        let setup = setup();
        let proxy = IoProxy::new(&setup.client_registry, "adder", Some(server_address()), None);

        let iocb = Iocb::new(IoArgs::new().arg(2).arg(40));
        proxy.request_io(&iocb, false).unwrap();
        assert_eq!(iocb.state(), IocbState::Pending);
        assert!(iocb.has_timeout());
        assert_eq!(setup.proxy_server.pending(), 1);

        setup.exchange();
        assert_eq!(iocb.state(), IocbState::Completed);
        assert_eq!(iocb.response(), Some(IoValue::Int(42)));
        assert_eq!(setup.proxy_server.pending(), 0);
        assert_eq!(setup.server.pending(), 0);
        // the response timeout went with it
        assert_eq!(setup.scheduler.pending(), 0);
    }

    #[test]
    fn test_remote_processing_error() {
        let setup = setup();
        let proxy = IoProxy::new(&setup.client_registry, "adder", Some(server_address()), None);

        let iocb = Iocb::new(IoArgs::new().arg("two"));
        proxy.request_io(&iocb, false).unwrap();
        setup.exchange();
        assert!(matches!(iocb.error(), Some(IoError::Processing(_))));
    }

    #[test]
    fn test_unknown_remote_controller() {
        let setup = setup();
        let proxy = IoProxy::new(&setup.client_registry, "missing", Some(server_address()), None);

        let iocb = Iocb::new(IoArgs::new());
        proxy.request_io(&iocb, false).unwrap();
        setup.exchange();
        assert_eq!(iocb.error(), Some(IoError::NoSuchController("missing".into())));
    }

    #[test]
    fn test_timeout_then_late_reply() {
        let setup = setup();
        let iocb = Iocb::new(IoArgs::new().arg(1));
        iocb.set_timeout(&setup.scheduler, Duration::ZERO, IoError::Timeout);
        setup
            .proxy_server
            .request_io(&server_address(), "adder", &iocb)
            .unwrap();

        setup.scheduler.run_pending();
        assert_eq!(iocb.error(), Some(IoError::Timeout));
        assert_eq!(setup.proxy_server.pending(), 0);

        // the reply still arrives and is ignored
        setup.exchange();
        assert_eq!(iocb.state(), IocbState::Aborted);
    }

    #[test]
    fn test_request_must_be_idle() {
        let setup = setup();
        let iocb = Iocb::new(IoArgs::new());
        iocb.complete(IoValue::Null);
        assert!(matches!(
            setup.proxy_server.request_io(&server_address(), "adder", &iocb),
            Err(IoError::StateTransition(_))
        ));
    }

    #[test]
    fn test_registry_abort_reaches_proxy_server() {
        let setup = setup();
        let iocb = Iocb::new(IoArgs::new());
        setup
            .proxy_server
            .request_io(&server_address(), "adder", &iocb)
            .unwrap();

        setup.client_registry.abort(IoError::Aborted("shutdown".into()));
        assert_eq!(iocb.error(), Some(IoError::Aborted("shutdown".into())));
        assert_eq!(setup.proxy_server.pending(), 0);
    }
}
