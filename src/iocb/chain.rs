//! Chaining one request onto another

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
};

use log::{debug, error};

use super::{IoArgs, IoError, IoValue, Iocb, IocbRef, IocbState};
use crate::task::panic_message;

/// Run a codec hook, turning a panic into an error.
fn guarded<T>(hook: impl FnOnce() -> Result<T, IoError>) -> Result<T, IoError> {
    catch_unwind(AssertUnwindSafe(hook))
        .unwrap_or_else(|payload| Err(IoError::Processing(panic_message(payload))))
}

/// Translates between a parent request and the request that serves it.
pub trait ChainCodec: Send + Sync + 'static {
    /// Build the child's arguments from the parent. An error aborts the
    /// parent.
    fn encode(&self, parent: &IocbRef) -> Result<IoArgs, IoError>;

    /// Map the child's response onto the parent's. An error aborts the
    /// parent instead.
    fn decode_response(&self, _parent: &IocbRef, response: IoValue) -> Result<IoValue, IoError> {
        Ok(response)
    }

    fn decode_error(&self, _parent: &IocbRef, err: IoError) -> IoError {
        err
    }
}

/// A child IOCB whose outcome is carried back to a parent.
///
/// Building the chain marks the parent active and encodes the child's
/// arguments. When the child finishes, the outcome is decoded onto the
/// parent and the link to the parent is dropped.
#[derive(Debug, Clone)]
pub struct IoChain {
    iocb: IocbRef,
    parent: Arc<Mutex<Option<IocbRef>>>,
}

impl IoChain {
    pub fn new<C: ChainCodec>(parent: &IocbRef, codec: C) -> Result<Self, IoError> {
        if parent.state().is_terminal() {
            return Err(IoError::StateTransition(format!(
                "IOCB {} chained while {}",
                parent.id(),
                parent.state()
            )));
        }
        parent.set_state(IocbState::Active);

        let args = match guarded(|| codec.encode(parent)) {
            Ok(args) => args,
            Err(err) => {
                debug!("encoding chain for IOCB {} failed: {}", parent.id(), err);
                parent.abort(err.clone());
                return Err(err);
            }
        };

        let iocb = Iocb::new(args);
        iocb.set_priority(parent.priority());

        let slot = Arc::new(Mutex::new(Some(parent.clone())));
        let link = slot.clone();
        iocb.add_callback(move |child| {
            let parent = link.lock().unwrap_or_else(PoisonError::into_inner).take();
            let Some(parent) = parent else {
                return;
            };

            match child.state() {
                IocbState::Completed => {
                    let response = child.response().unwrap_or_default();
                    match guarded(|| codec.decode_response(&parent, response)) {
                        Ok(response) => parent.complete(response),
                        Err(err) => parent.abort(err),
                    }
                }
                IocbState::Aborted => {
                    let err = child
                        .error()
                        .unwrap_or_else(|| IoError::Aborted("no error recorded".into()));
                    let err = guarded(|| Ok(codec.decode_error(&parent, err)))
                        .unwrap_or_else(|panicked| panicked);
                    parent.abort(err);
                }
                state => {
                    error!("chained IOCB {} signalled while {}", child.id(), state);
                    parent.abort(IoError::StateTransition(format!(
                        "chained IOCB {} signalled while {}",
                        child.id(),
                        state
                    )));
                }
            }
        });

        Ok(Self { iocb, parent: slot })
    }

    /// The IOCB to submit in the parent's place
    pub fn iocb(&self) -> &IocbRef {
        &self.iocb
    }

    /// The parent, until the child's outcome has been passed on
    pub fn parent(&self) -> Option<IocbRef> {
        self.parent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iocb::{IoControl, IoController};

    /// Wraps the parent's first argument in a "read" request
    struct ReadCodec;

    impl ChainCodec for ReadCodec {
        fn encode(&self, parent: &IocbRef) -> Result<IoArgs, IoError> {
            match parent.args().args.first() {
                Some(IoValue::Str(name)) => Ok(IoArgs::new().arg("read").arg(name.as_str())),
                _ => Err(IoError::Configuration("missing point name".into())),
            }
        }

        fn decode_response(&self, _parent: &IocbRef, response: IoValue) -> Result<IoValue, IoError> {
            match response {
                IoValue::Int(raw) => Ok(IoValue::Float(raw as f64 / 10.0)),
                other => Err(IoError::Processing(format!("unexpected response {:?}", other))),
            }
        }

        fn decode_error(&self, _parent: &IocbRef, err: IoError) -> IoError {
            IoError::Remote(err.to_string())
        }
    }

    #[test]
    fn test_chain_completes_parent() {
        let parent = Iocb::new(IoArgs::new().arg("zone-temp"));
        let chain = IoChain::new(&parent, ReadCodec).unwrap();
        assert_eq!(parent.state(), IocbState::Active);
        assert_eq!(
            chain.iocb().args().args,
            vec![IoValue::from("read"), IoValue::from("zone-temp")]
        );

        let device = IoController::new(None, |iocb: &IocbRef| -> Result<(), IoError> {
            iocb.complete(IoValue::Int(215));
            Ok(())
        });
        device.request_io(chain.iocb()).unwrap();

        assert_eq!(parent.state(), IocbState::Completed);
        assert_eq!(parent.response(), Some(IoValue::Float(21.5)));
        assert!(chain.parent().is_none());
    }

    #[test]
    fn test_chain_carries_abort() {
        let parent = Iocb::new(IoArgs::new().arg("zone-temp"));
        let chain = IoChain::new(&parent, ReadCodec).unwrap();
        chain.iocb().abort(IoError::Timeout);

        assert_eq!(parent.state(), IocbState::Aborted);
        assert_eq!(parent.error(), Some(IoError::Remote("timeout".into())));
    }

    #[test]
    fn test_encode_failure_aborts_parent() {
        let parent = Iocb::new(IoArgs::new());
        let err = IoChain::new(&parent, ReadCodec).unwrap_err();
        assert!(matches!(err, IoError::Configuration(_)));
        assert_eq!(parent.state(), IocbState::Aborted);
        assert_eq!(parent.error(), Some(err));
    }

    #[test]
    fn test_bad_decode_aborts_parent() {
        let parent = Iocb::new(IoArgs::new().arg("zone-temp"));
        let chain = IoChain::new(&parent, ReadCodec).unwrap();
        chain.iocb().complete(IoValue::from("garbage"));
        assert_eq!(parent.state(), IocbState::Aborted);
        assert!(matches!(parent.error(), Some(IoError::Processing(_))));
    }

    #[test]
    fn test_chain_inherits_priority() {
        let parent = Iocb::new(IoArgs::new().arg("x"));
        parent.set_priority(7);
        let chain = IoChain::new(&parent, ReadCodec).unwrap();
        assert_eq!(chain.iocb().priority(), 7);
    }

    #[test]
    fn test_terminal_parent_is_rejected() {
        let parent = Iocb::new(IoArgs::new().arg("x"));
        parent.complete(IoValue::Null);
        assert!(matches!(
            IoChain::new(&parent, ReadCodec),
            Err(IoError::StateTransition(_))
        ));
    }

    #[test]
    fn test_trigger_without_outcome_aborts_parent() {
        let parent = Iocb::new(IoArgs::new().arg("x"));
        let chain = IoChain::new(&parent, ReadCodec).unwrap();
        chain.iocb().trigger();
        assert!(matches!(parent.error(), Some(IoError::StateTransition(_))));
    }

    struct PanickyCodec;

    impl ChainCodec for PanickyCodec {
        fn encode(&self, _parent: &IocbRef) -> Result<IoArgs, IoError> {
            Ok(IoArgs::new())
        }

        fn decode_response(&self, _parent: &IocbRef, _response: IoValue) -> Result<IoValue, IoError> {
            panic!("decoder bug")
        }
    }

    #[test]
    fn test_panicking_decode_aborts_parent() {
        let parent = Iocb::new(IoArgs::new());
        let chain = IoChain::new(&parent, PanickyCodec).unwrap();
        chain.iocb().complete(IoValue::Null);
        assert_eq!(
            parent.error(),
            Some(IoError::Processing("decoder bug".into()))
        );
    }
}
