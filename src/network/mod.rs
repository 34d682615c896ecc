//! BACnet Network Layer Module
//!
//! This module implements the network layer of ASHRAE 135 clause 6: the NPDU
//! codec, the network layer messages, and a routing service access point that
//! can sit on one segment (a plain device) or several (a router).
//!
//! # Overview
//!
//! The network layer is responsible for:
//! - Framing application data and network messages in NPDU headers
//! - Delivering to local stations, remote stations and broadcasts
//! - Learning routes from source-routed traffic and router advertisements
//! - Forwarding between directly attached segments with hop-count limits
//! - Router discovery (Who-Is-Router-To-Network / I-Am-Router-To-Network)
//!
//! # Network Layer Protocol Data Unit (NPDU)
//!
//! The NPDU header contains:
//! - Protocol version (always 1)
//! - Control octet (network message, DADR/SADR present, expecting reply, priority)
//! - Destination network address (DNET, DLEN, DADR)
//! - Source network address (SNET, SLEN, SADR)
//! - Hop count, present whenever a destination is
//! - Message type and, for proprietary messages, a vendor identifier
//!
//! # Example
//!
//! ```
//! use bacnet_netstack::address::Address;
//! use bacnet_netstack::network::{NetworkMessage, Npdu};
//!
//! let mut npdu = NetworkMessage::WhoIsRouterToNetwork(Some(5)).to_npdu().unwrap();
//! npdu.pdu_destination = Some(Address::LocalBroadcast);
//!
//! let pdu = npdu.encode().unwrap();
//! assert_eq!(pdu.data(), &[0x01, 0x80, 0x00, 0x00, 0x05]);
//!
//! let decoded = Npdu::decode(pdu).unwrap();
//! assert_eq!(decoded, npdu);
//! ```

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::string::{String, ToString};

use crate::{comm::CommError, pdu::DecodingError};

mod element;
mod message;
mod npdu;
mod service;

pub use element::{NetworkMessageHandler, NetworkServiceElement};
pub use message::{
    reject_reason, MessageDecoder, NetworkMessage, NetworkMessageRegistry, NetworkMessageType,
    NetworkMessageTypeCode, RoutingTableEntry,
};
pub use npdu::{NetworkPriority, Npdu, NpduControl};
pub use service::{
    AdapterId, NetworkAdapter, NetworkReference, NetworkServiceAccessPoint, NetworkStatus,
    RouterReference, ServiceConfig, UnknownRoutePolicy,
};

/// Result type for network operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, NetworkError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, NetworkError>;

/// Errors that can occur in network operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid NPDU format
    InvalidNpdu(String),
    /// Address of the wrong shape for where it was used
    InvalidAddress(String),
    /// A field too large for its length octet
    InvalidValue(String),
    /// The service access point is not set up to do what was asked
    Configuration(String),
    /// The link layer refused the PDU
    Link(CommError),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::InvalidNpdu(msg) => write!(f, "Invalid NPDU: {}", msg),
            NetworkError::InvalidAddress(msg) => write!(f, "Invalid network address: {}", msg),
            NetworkError::InvalidValue(msg) => write!(f, "Invalid value: {}", msg),
            NetworkError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            NetworkError::Link(e) => write!(f, "Link error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl Error for NetworkError {}

impl From<DecodingError> for NetworkError {
    fn from(error: DecodingError) -> Self {
        NetworkError::InvalidNpdu(error.to_string())
    }
}

impl From<CommError> for NetworkError {
    fn from(error: CommError) -> Self {
        NetworkError::Link(error)
    }
}

/// Network layer constants
pub mod constants {
    /// The only NPDU version defined
    pub const NPDU_VERSION: u8 = 1;

    /// Hop count given to every NPDU this layer originates
    pub const MAX_HOP_COUNT: u8 = 255;

    /// DNET value addressing every network
    pub const GLOBAL_BROADCAST_NETWORK: u16 = 0xFFFF;

    /// First message type of the vendor block; these carry a vendor id
    pub const PROPRIETARY_MESSAGE_START: u8 = 0x80;
}
