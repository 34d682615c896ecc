//! BACnet Addressing Module
//!
//! Every PDU that moves through the stack carries link-level and network-level
//! addresses. This module provides the one value type used for both.
//!
//! # Address forms
//!
//! | Variant | Text form | Meaning |
//! |---|---|---|
//! | `Null` | `Null` | no address |
//! | `LocalBroadcast` | `*` | every station on the directly attached segment |
//! | `LocalStation` | `12`, `0x0a0b`, `192.168.0.10:47809` | one station on the segment |
//! | `RemoteBroadcast` | `5:*` | every station on network 5 |
//! | `RemoteStation` | `5:12` | one station on network 5 |
//! | `GlobalBroadcast` | `*:*` | every station on every network |
//!
//! Station addresses are opaque octet strings. MS/TP uses a single octet and
//! BACnet/IP uses six (four address octets followed by the UDP port).
//!
//! # Example
//!
//! ```
//! use bacnet_netstack::address::Address;
//!
//! let addr: Address = "2:192.168.1.20".parse().unwrap();
//! assert_eq!(addr.net(), Some(2));
//! assert_eq!(addr.addr(), Some(&[192, 168, 1, 20, 0xBA, 0xC0][..]));
//! assert_eq!(addr.to_string(), "2:192.168.1.20");
//! ```

#[cfg(feature = "std")]
use std::{error::Error, fmt, str::FromStr};

#[cfg(not(feature = "std"))]
use core::{fmt, str::FromStr};

#[cfg(not(feature = "std"))]
use alloc::{format, string::String, vec, vec::Vec};

use core::net::Ipv4Addr;

/// Default BACnet/IP UDP port (0xBAC0)
pub const BACNET_IP_PORT: u16 = 47808;

/// Error produced when an address string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressError(pub String);

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid address: {}", self.0)
    }
}

#[cfg(feature = "std")]
impl Error for AddressError {}

/// A BACnet address.
///
/// Equality compares the variant, the network number and the station octets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    #[default]
    Null,
    LocalBroadcast,
    LocalStation(Vec<u8>),
    RemoteBroadcast(u16),
    RemoteStation(u16, Vec<u8>),
    GlobalBroadcast,
}

impl Address {
    /// Station on the directly attached segment
    pub fn local_station(addr: impl Into<Vec<u8>>) -> Self {
        Address::LocalStation(addr.into())
    }

    /// Station on a remote network
    pub fn remote_station(net: u16, addr: impl Into<Vec<u8>>) -> Self {
        Address::RemoteStation(net, addr.into())
    }

    /// BACnet/IP station: four address octets followed by the port.
    pub fn ip_station(ip: Ipv4Addr, port: u16) -> Self {
        Address::LocalStation(ip_octets(ip, port))
    }

    /// Network number, only meaningful for the remote variants
    pub fn net(&self) -> Option<u16> {
        match self {
            Address::RemoteBroadcast(net) | Address::RemoteStation(net, _) => Some(*net),
            _ => None,
        }
    }

    /// Station octets, if this is a station address
    pub fn addr(&self) -> Option<&[u8]> {
        match self {
            Address::LocalStation(addr) | Address::RemoteStation(_, addr) => Some(addr),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Address::Null)
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            Address::LocalBroadcast | Address::RemoteBroadcast(_) | Address::GlobalBroadcast
        )
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Address::RemoteBroadcast(_) | Address::RemoteStation(..))
    }

    /// Interpret a six-octet station address as an IPv4 endpoint.
    pub fn ip_endpoint(&self) -> Option<(Ipv4Addr, u16)> {
        match self.addr() {
            Some([a, b, c, d, hi, lo]) => Some((
                Ipv4Addr::new(*a, *b, *c, *d),
                u16::from_be_bytes([*hi, *lo]),
            )),
            _ => None,
        }
    }

    #[cfg(feature = "std")]
    pub fn from_socket_addr(addr: std::net::SocketAddrV4) -> Self {
        Address::ip_station(*addr.ip(), addr.port())
    }

    #[cfg(feature = "std")]
    pub fn to_socket_addr(&self) -> Option<std::net::SocketAddrV4> {
        self.ip_endpoint()
            .map(|(ip, port)| std::net::SocketAddrV4::new(ip, port))
    }
}

fn ip_octets(ip: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut octets = ip.octets().to_vec();
    octets.extend_from_slice(&port.to_be_bytes());
    octets
}

fn parse_station(text: &str) -> Result<Vec<u8>, AddressError> {
    if let Some(digits) = text.strip_prefix("0x") {
        let octets = hex::decode(digits).map_err(|_| AddressError(text.into()))?;
        if octets.is_empty() {
            return Err(AddressError(text.into()));
        }
        return Ok(octets);
    }

    if let Ok(octet) = text.parse::<u8>() {
        return Ok(vec![octet]);
    }

    let (host, port) = match text.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse::<u16>().map_err(|_| AddressError(text.into()))?,
        ),
        None => (text, BACNET_IP_PORT),
    };
    let ip = host
        .parse::<Ipv4Addr>()
        .map_err(|_| AddressError(text.into()))?;
    Ok(ip_octets(ip, port))
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" | "Null" => return Ok(Address::Null),
            "*" => return Ok(Address::LocalBroadcast),
            "*:*" => return Ok(Address::GlobalBroadcast),
            _ => {}
        }

        // a leading network number is only taken when it parses as one,
        // otherwise the colon belongs to an ip:port station
        if let Some((net, station)) = s.split_once(':') {
            if let Ok(net) = net.parse::<u16>() {
                if net == 0xFFFF {
                    return Err(AddressError(format!("{} (network 65535 is reserved)", s)));
                }
                if station == "*" {
                    return Ok(Address::RemoteBroadcast(net));
                }
                return Ok(Address::RemoteStation(net, parse_station(station)?));
            }
        }

        Ok(Address::LocalStation(parse_station(s)?))
    }
}

struct Station<'a>(&'a [u8]);

impl fmt::Display for Station<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            [octet] => write!(f, "{}", octet),
            [a, b, c, d, hi, lo] => {
                write!(f, "{}.{}.{}.{}", a, b, c, d)?;
                let port = u16::from_be_bytes([*hi, *lo]);
                if port != BACNET_IP_PORT {
                    write!(f, ":{}", port)?;
                }
                Ok(())
            }
            octets => write!(f, "0x{}", hex::encode(octets)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Null => f.write_str("Null"),
            Address::LocalBroadcast => f.write_str("*"),
            Address::LocalStation(addr) => write!(f, "{}", Station(addr)),
            Address::RemoteBroadcast(net) => write!(f, "{}:*", net),
            Address::RemoteStation(net, addr) => write!(f, "{}:{}", net, Station(addr)),
            Address::GlobalBroadcast => f.write_str("*:*"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broadcasts() {
        assert_eq!("*".parse::<Address>().unwrap(), Address::LocalBroadcast);
        assert_eq!("*:*".parse::<Address>().unwrap(), Address::GlobalBroadcast);
        assert_eq!("12:*".parse::<Address>().unwrap(), Address::RemoteBroadcast(12));
        assert_eq!("".parse::<Address>().unwrap(), Address::Null);
    }

    #[test]
    fn test_parse_stations() {
        assert_eq!("7".parse::<Address>().unwrap(), Address::local_station(vec![7]));
        assert_eq!(
            "0x0a0b".parse::<Address>().unwrap(),
            Address::local_station(vec![0x0a, 0x0b])
        );
        assert_eq!(
            "3:25".parse::<Address>().unwrap(),
            Address::remote_station(3, vec![25])
        );
        assert_eq!(
            "10.0.0.1:47809".parse::<Address>().unwrap(),
            Address::local_station(vec![10, 0, 0, 1, 0xBA, 0xC1])
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("hello".parse::<Address>().is_err());
        assert!("0x".parse::<Address>().is_err());
        assert!("65535:1".parse::<Address>().is_err());
        assert!("1.2.3.4:notaport".parse::<Address>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for text in ["Null", "*", "*:*", "4:*", "9", "0x0102", "4:10.1.1.1", "10.1.1.1:47000"] {
            let addr: Address = text.parse().unwrap();
            assert_eq!(addr.to_string(), text);
        }
    }

    #[test]
    fn test_net_and_addr_accessors() {
        let remote = Address::remote_station(5, vec![1, 2]);
        assert_eq!(remote.net(), Some(5));
        assert_eq!(remote.addr(), Some(&[1u8, 2][..]));
        assert!(remote.is_remote());
        assert!(!remote.is_broadcast());

        assert_eq!(Address::LocalStation(vec![1]).net(), None);
        assert!(Address::GlobalBroadcast.is_broadcast());
        assert_eq!(Address::RemoteBroadcast(4).addr(), None);
    }

    #[test]
    fn test_socket_addr_conversion() {
        let sock: std::net::SocketAddrV4 = "192.168.0.5:47808".parse().unwrap();
        let addr = Address::from_socket_addr(sock);
        assert_eq!(addr.addr().unwrap().len(), 6);
        assert_eq!(addr.to_socket_addr(), Some(sock));
        assert_eq!(Address::local_station(vec![1]).to_socket_addr(), None);
    }
}
