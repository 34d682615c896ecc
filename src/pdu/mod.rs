//! Protocol Data Units
//!
//! A [`Pdu`] is the unit handed between layers: a byte payload plus the
//! protocol control information (PCI) every layer may need, namely the
//! source and destination addresses, the expecting-reply flag and the
//! network priority.
//!
//! The payload works as a cursor. `put*` calls append at the back and `get*`
//! calls consume from the front, with multi-octet fields in network (big
//! endian) byte order.
//!
//! # Example
//!
//! ```
//! use bacnet_netstack::pdu::Pdu;
//!
//! let mut pdu = Pdu::new();
//! pdu.put(0x01);
//! pdu.put_short(0xBAC0);
//! assert_eq!(pdu.get().unwrap(), 0x01);
//! assert_eq!(pdu.get_short().unwrap(), 0xBAC0);
//! assert!(pdu.get().is_err());
//! ```

#[cfg(feature = "std")]
use std::{error::Error, fmt};

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use bytes::{Buf, BufMut, BytesMut};

use crate::address::Address;

/// Result type for PDU cursor operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, DecodingError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, DecodingError>;

/// Raised when a read runs past the end of the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodingError {
    pub needed: usize,
    pub remaining: usize,
}

impl fmt::Display for DecodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PDU underflow: needed {} octets, {} remaining",
            self.needed, self.remaining
        )
    }
}

#[cfg(feature = "std")]
impl Error for DecodingError {}

/// Protocol data unit: payload cursor plus control information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pdu {
    pub source: Option<Address>,
    pub destination: Option<Address>,
    pub expecting_reply: bool,
    /// Network priority (0-3)
    pub network_priority: u8,
    data: BytesMut,
}

impl Pdu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: &[u8]) -> Self {
        Self {
            data: BytesMut::from(data),
            ..Self::default()
        }
    }

    /// Builder-style destination setter
    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Builder-style source setter
    pub fn with_source(mut self, source: Address) -> Self {
        self.source = Some(source);
        self
    }

    /// Copy the control information (addresses, reply flag, priority) of
    /// another PDU, leaving the payload alone.
    pub fn update_pci(&mut self, other: &Pdu) {
        self.source = other.source.clone();
        self.destination = other.destination.clone();
        self.expecting_reply = other.expecting_reply;
        self.network_priority = other.network_priority;
    }

    /// Unread payload
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Take the unread payload, leaving the cursor empty
    pub fn take_data(&mut self) -> Vec<u8> {
        self.data.split().to_vec()
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.data.remaining() < needed {
            return Err(DecodingError {
                needed,
                remaining: self.data.remaining(),
            });
        }
        Ok(())
    }

    pub fn get(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    pub fn get_short(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.data.get_u16())
    }

    pub fn get_long(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.data.get_u32())
    }

    pub fn get_data(&mut self, len: usize) -> Result<Vec<u8>> {
        self.ensure(len)?;
        Ok(self.data.split_to(len).to_vec())
    }

    pub fn put(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    pub fn put_short(&mut self, value: u16) {
        self.data.put_u16(value);
    }

    pub fn put_long(&mut self, value: u32) {
        self.data.put_u32(value);
    }

    pub fn put_data(&mut self, data: &[u8]) {
        self.data.put_slice(data);
    }
}
