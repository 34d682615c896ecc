#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

pub mod address;
pub mod comm;
pub mod network;
pub mod pdu;
pub mod util;

#[cfg(feature = "std")]
pub mod iocb;
#[cfg(feature = "std")]
pub mod task;

// Re-export main types without glob imports to avoid conflicts
pub use address::Address;
pub use comm::{Client, CommError, Server};
pub use network::{NetworkError, NetworkServiceAccessPoint, NetworkServiceElement, Npdu};
pub use pdu::{DecodingError, Pdu};

#[cfg(feature = "std")]
pub use iocb::{IoError, Iocb, IocbRef, IocbState};
#[cfg(feature = "std")]
pub use task::Scheduler;

#[cfg(feature = "std")]
extern crate std;

#[cfg(not(feature = "std"))]
extern crate alloc;

pub const BACNET_PROTOCOL_VERSION: u8 = 1;
pub const BACNET_MAX_APDU: usize = 1476;
