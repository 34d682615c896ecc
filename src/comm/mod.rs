//! Layer Plumbing
//!
//! Layers exchange [`Pdu`]s through two narrow traits. A lower layer is a
//! [`Server`]: it accepts `indication` calls carrying PDUs headed downstream.
//! An upper layer is a [`Client`]: it receives `confirmation` calls carrying
//! PDUs that arrived from below. Link-layer transports (UDP, TCP, virtual
//! LANs) implement `Server`; applications implement `Client`.

#[cfg(feature = "std")]
use std::{error::Error, fmt};

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::string::String;

use crate::pdu::Pdu;

/// Result type for link hand-offs
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, CommError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, CommError>;

/// Errors a downstream layer may report when handed a PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    /// The layer has no peer to pass the PDU to
    Unbound,
    /// The transport refused or failed to send the PDU
    Link(String),
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommError::Unbound => write!(f, "No peer bound"),
            CommError::Link(msg) => write!(f, "Link error: {}", msg),
        }
    }
}

#[cfg(feature = "std")]
impl Error for CommError {}

#[cfg(feature = "std")]
impl From<std::io::Error> for CommError {
    fn from(error: std::io::Error) -> Self {
        CommError::Link(error.to_string())
    }
}

/// Downstream half of a layer binding
pub trait Server {
    /// Accept a PDU travelling down the stack
    fn indication(&mut self, pdu: Pdu) -> Result<()>;
}

/// Upstream half of a layer binding
pub trait Client {
    /// Accept a PDU travelling up the stack
    fn confirmation(&mut self, pdu: Pdu);
}

#[cfg(feature = "std")]
impl<S: Server + ?Sized> Server for std::sync::Arc<std::sync::Mutex<S>> {
    fn indication(&mut self, pdu: Pdu) -> Result<()> {
        let mut server = self
            .lock()
            .map_err(|_| CommError::Link("server lock poisoned".into()))?;
        server.indication(pdu)
    }
}

#[cfg(feature = "std")]
impl<C: Client + ?Sized> Client for std::sync::Arc<std::sync::Mutex<C>> {
    fn confirmation(&mut self, pdu: Pdu) {
        if let Ok(mut client) = self.lock() {
            client.confirmation(pdu);
        }
    }
}

/// A `Server` that records everything it is handed. Used as a loopback
/// segment in tests and demos; outside this crate's own tests it needs the
/// `loopback` feature.
#[cfg(all(feature = "std", any(test, feature = "loopback")))]
#[derive(Debug, Default, Clone)]
pub struct Capture {
    sent: std::sync::Arc<std::sync::Mutex<Vec<Pdu>>>,
}

#[cfg(all(feature = "std", any(test, feature = "loopback")))]
impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything captured so far
    pub fn drain(&self) -> Vec<Pdu> {
        self.sent
            .lock()
            .map(|mut sent| std::mem::take(&mut *sent))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(all(feature = "std", any(test, feature = "loopback")))]
impl Server for Capture {
    fn indication(&mut self, pdu: Pdu) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| CommError::Link("capture lock poisoned".into()))?
            .push(pdu);
        Ok(())
    }
}

#[cfg(all(feature = "std", any(test, feature = "loopback")))]
impl Client for Capture {
    fn confirmation(&mut self, pdu: Pdu) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(pdu);
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn test_capture_shares_between_clones() {
        let capture = Capture::new();
        let mut server = capture.clone();
        server.indication(Pdu::with_data(&[1])).unwrap();
        server.indication(Pdu::with_data(&[2])).unwrap();
        assert_eq!(capture.len(), 2);

        let sent = capture.drain();
        assert_eq!(sent[1].data(), &[2]);
        assert!(capture.is_empty());
    }

    #[test]
    fn test_shared_server_forwards() {
        let capture = Capture::new();
        let mut shared = std::sync::Arc::new(std::sync::Mutex::new(capture.clone()));
        shared.indication(Pdu::new()).unwrap();
        assert_eq!(capture.len(), 1);
    }
}
