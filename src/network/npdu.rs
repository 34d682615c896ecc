//! NPDU header codec

#[cfg(not(feature = "std"))]
use alloc::{format, vec::Vec};

use bitflags::bitflags;

use super::{constants, NetworkError, NetworkMessageType, Result};
use crate::{address::Address, pdu::Pdu};

bitflags! {
    /// NPDU control octet
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct NpduControl: u8 {
        /// Network layer message, not application data
        const NETWORK_MESSAGE = 0x80;
        /// DNET, DLEN and DADR present
        const DESTINATION_PRESENT = 0x20;
        /// SNET, SLEN and SADR present
        const SOURCE_PRESENT = 0x08;
        /// Data expecting reply
        const EXPECTING_REPLY = 0x04;
        /// Network priority (two bits)
        const PRIORITY = 0x03;
    }
}

impl NpduControl {
    pub fn priority(self) -> NetworkPriority {
        NetworkPriority::from_bits(self.bits())
    }

    pub fn with_priority(self, priority: NetworkPriority) -> Self {
        (self - NpduControl::PRIORITY) | NpduControl::from_bits_retain(priority.to_bits())
    }
}

/// Network priority levels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum NetworkPriority {
    /// Normal messages (lowest priority)
    #[default]
    Normal = 0,
    /// Urgent messages
    Urgent = 1,
    /// Critical Equipment messages
    CriticalEquipment = 2,
    /// Life Safety messages (highest priority)
    LifeSafety = 3,
}

impl NetworkPriority {
    /// Convert to NPDU priority bits
    pub fn to_bits(self) -> u8 {
        self as u8
    }

    /// Create from NPDU priority bits
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            3 => NetworkPriority::LifeSafety,
            2 => NetworkPriority::CriticalEquipment,
            1 => NetworkPriority::Urgent,
            _ => NetworkPriority::Normal,
        }
    }
}

/// Network Protocol Data Unit (NPDU)
///
/// `destination` and `source` are the network-level DADR/SADR fields, while
/// `pdu_destination` and `pdu_source` are the link-level addresses of the
/// hop the NPDU is travelling on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    /// Protocol version (always 1)
    pub version: u8,
    pub expecting_reply: bool,
    pub priority: NetworkPriority,
    /// DADR: remote station, remote broadcast or global broadcast
    pub destination: Option<Address>,
    /// SADR: always a remote station
    pub source: Option<Address>,
    /// Hop count (only on the wire if a destination is present)
    pub hop_count: Option<u8>,
    /// Set for network layer messages
    pub message_type: Option<NetworkMessageType>,
    /// Set for proprietary network layer messages
    pub vendor_id: Option<u16>,
    /// APDU, or the body of a network layer message
    pub data: Vec<u8>,
    pub pdu_source: Option<Address>,
    pub pdu_destination: Option<Address>,
}

impl Default for Npdu {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_address_field(pdu: &mut Pdu, net: u16, addr: &[u8]) -> Result<()> {
    let len = u8::try_from(addr.len())
        .map_err(|_| NetworkError::InvalidAddress(format!("{} octet station address", addr.len())))?;
    pdu.put_short(net);
    pdu.put(len);
    pdu.put_data(addr);
    Ok(())
}

impl Npdu {
    /// Create a new NPDU with default values
    pub fn new() -> Self {
        Self {
            version: constants::NPDU_VERSION,
            expecting_reply: false,
            priority: NetworkPriority::Normal,
            destination: None,
            source: None,
            hop_count: None,
            message_type: None,
            vendor_id: None,
            data: Vec::new(),
            pdu_source: None,
            pdu_destination: None,
        }
    }

    /// Wrap application data, taking over its control information.
    pub fn from_apdu(mut pdu: Pdu) -> Self {
        Self {
            expecting_reply: pdu.expecting_reply,
            priority: NetworkPriority::from_bits(pdu.network_priority),
            pdu_source: pdu.source.take(),
            pdu_destination: pdu.destination.take(),
            data: pdu.take_data(),
            ..Self::new()
        }
    }

    /// Check if this is a network layer message
    pub fn is_network_message(&self) -> bool {
        self.message_type.is_some()
    }

    /// Control octet as it would be written
    pub fn control(&self) -> NpduControl {
        let mut control = NpduControl::empty().with_priority(self.priority);
        control.set(NpduControl::NETWORK_MESSAGE, self.message_type.is_some());
        control.set(NpduControl::DESTINATION_PRESENT, self.destination.is_some());
        control.set(NpduControl::SOURCE_PRESENT, self.source.is_some());
        control.set(NpduControl::EXPECTING_REPLY, self.expecting_reply);
        control
    }

    /// Encode into a PDU addressed with the link-level addresses.
    pub fn encode(&self) -> Result<Pdu> {
        let mut pdu = Pdu::new();
        pdu.source = self.pdu_source.clone();
        pdu.destination = self.pdu_destination.clone();
        pdu.expecting_reply = self.expecting_reply;
        pdu.network_priority = self.priority.to_bits();

        pdu.put(self.version);
        pdu.put(self.control().bits());

        if let Some(ref dest) = self.destination {
            match dest {
                Address::RemoteStation(net, addr)
                    if !addr.is_empty() && *net != constants::GLOBAL_BROADCAST_NETWORK =>
                {
                    encode_address_field(&mut pdu, *net, addr)?
                }
                Address::RemoteBroadcast(net) if *net != constants::GLOBAL_BROADCAST_NETWORK => {
                    encode_address_field(&mut pdu, *net, &[])?
                }
                Address::GlobalBroadcast => {
                    encode_address_field(&mut pdu, constants::GLOBAL_BROADCAST_NETWORK, &[])?
                }
                other => {
                    return Err(NetworkError::InvalidAddress(format!(
                        "{} cannot be a DADR",
                        other
                    )))
                }
            }
        }

        if let Some(ref src) = self.source {
            match src {
                Address::RemoteStation(net, addr)
                    if !addr.is_empty() && *net != constants::GLOBAL_BROADCAST_NETWORK =>
                {
                    encode_address_field(&mut pdu, *net, addr)?
                }
                other => {
                    return Err(NetworkError::InvalidAddress(format!(
                        "{} cannot be a SADR",
                        other
                    )))
                }
            }
        }

        if self.destination.is_some() {
            pdu.put(self.hop_count.unwrap_or(constants::MAX_HOP_COUNT));
        }

        if let Some(message_type) = self.message_type {
            let code = u8::from(message_type);
            pdu.put(code);
            if code >= constants::PROPRIETARY_MESSAGE_START {
                pdu.put_short(self.vendor_id.unwrap_or(0));
            }
        }

        pdu.put_data(&self.data);
        Ok(pdu)
    }

    /// Decode an NPDU, keeping the PDU's link-level addresses.
    pub fn decode(mut pdu: Pdu) -> Result<Self> {
        if pdu.len() < 2 {
            return Err(NetworkError::InvalidNpdu("NPDU too short".into()));
        }

        let version = pdu.get()?;
        if version != constants::NPDU_VERSION {
            return Err(NetworkError::InvalidNpdu(format!(
                "Invalid NPDU version: {}",
                version
            )));
        }

        let control = NpduControl::from_bits_retain(pdu.get()?);

        let destination = if control.contains(NpduControl::DESTINATION_PRESENT) {
            let net = pdu.get_short()?;
            let len = pdu.get()? as usize;
            let addr = pdu.get_data(len)?;
            Some(if net == constants::GLOBAL_BROADCAST_NETWORK {
                Address::GlobalBroadcast
            } else if addr.is_empty() {
                Address::RemoteBroadcast(net)
            } else {
                Address::RemoteStation(net, addr)
            })
        } else {
            None
        };

        let source = if control.contains(NpduControl::SOURCE_PRESENT) {
            let net = pdu.get_short()?;
            let len = pdu.get()? as usize;
            let addr = pdu.get_data(len)?;
            if net == constants::GLOBAL_BROADCAST_NETWORK {
                return Err(NetworkError::InvalidNpdu(
                    "SADR can't be a global broadcast".into(),
                ));
            }
            if addr.is_empty() {
                return Err(NetworkError::InvalidNpdu(
                    "SADR can't be a remote broadcast".into(),
                ));
            }
            Some(Address::RemoteStation(net, addr))
        } else {
            None
        };

        let hop_count = if destination.is_some() {
            Some(pdu.get()?)
        } else {
            None
        };

        let (message_type, vendor_id) = if control.contains(NpduControl::NETWORK_MESSAGE) {
            let code = pdu.get()?;
            let vendor_id = if code >= constants::PROPRIETARY_MESSAGE_START {
                Some(pdu.get_short()?)
            } else {
                None
            };
            (Some(NetworkMessageType::from(code)), vendor_id)
        } else {
            (None, None)
        };

        Ok(Npdu {
            version,
            expecting_reply: control.contains(NpduControl::EXPECTING_REPLY),
            priority: control.priority(),
            destination,
            source,
            hop_count,
            message_type,
            vendor_id,
            data: pdu.take_data(),
            pdu_source: pdu.source.take(),
            pdu_destination: pdu.destination.take(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_npdu_control() {
        let control = NpduControl::NETWORK_MESSAGE
            | NpduControl::SOURCE_PRESENT
            | NpduControl::empty().with_priority(NetworkPriority::CriticalEquipment);

        assert_eq!(control.bits(), 0x8A);
        let decoded = NpduControl::from_bits_retain(control.bits());
        assert_eq!(decoded.priority(), NetworkPriority::CriticalEquipment);
        assert!(decoded.contains(NpduControl::NETWORK_MESSAGE));
        assert!(!decoded.contains(NpduControl::DESTINATION_PRESENT));

        let bumped = decoded.with_priority(NetworkPriority::Urgent);
        assert_eq!(bumped.priority(), NetworkPriority::Urgent);
    }

    #[test]
    fn test_npdu_encode_decode_basic() {
        let npdu = Npdu::new();
        let pdu = npdu.encode().unwrap();
        assert_eq!(pdu.data(), &[0x01, 0x00]);

        let decoded = Npdu::decode(pdu).unwrap();
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.destination, None);
        assert_eq!(decoded.source, None);
        assert_eq!(decoded.hop_count, None);
    }

    #[test]
    fn test_npdu_with_destination() {
        let mut npdu = Npdu::new();
        npdu.destination = Some(Address::remote_station(100, vec![192, 168, 1, 1]));
        npdu.hop_count = Some(5);
        npdu.data = vec![0x10, 0x08];

        let pdu = npdu.encode().unwrap();
        assert_eq!(
            pdu.data(),
            &[0x01, 0x20, 0x00, 0x64, 0x04, 192, 168, 1, 1, 0x05, 0x10, 0x08]
        );
        assert_eq!(Npdu::decode(pdu).unwrap(), npdu);
    }

    #[test]
    fn test_broadcast_destinations_on_the_wire() {
        let mut npdu = Npdu::new();
        npdu.destination = Some(Address::GlobalBroadcast);
        let pdu = npdu.encode().unwrap();
        // missing hop count is written as the maximum
        assert_eq!(pdu.data(), &[0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF]);

        npdu.destination = Some(Address::RemoteBroadcast(7));
        npdu.hop_count = Some(3);
        let pdu = npdu.encode().unwrap();
        assert_eq!(pdu.data(), &[0x01, 0x20, 0x00, 0x07, 0x00, 0x03]);
        assert_eq!(
            Npdu::decode(pdu).unwrap().destination,
            Some(Address::RemoteBroadcast(7))
        );
    }

    #[test]
    fn test_proprietary_message_carries_vendor_id() {
        let mut npdu = Npdu::new();
        npdu.message_type = Some(NetworkMessageType::from(0x85u8));
        npdu.vendor_id = Some(260);
        npdu.data = vec![0xAB];

        let pdu = npdu.encode().unwrap();
        assert_eq!(pdu.data(), &[0x01, 0x80, 0x85, 0x01, 0x04, 0xAB]);
        let decoded = Npdu::decode(pdu).unwrap();
        assert!(decoded.message_type.unwrap().is_proprietary());
        assert_eq!(decoded.vendor_id, Some(260));
    }

    #[test]
    fn test_encode_rejects_bad_address_shapes() {
        let mut npdu = Npdu::new();
        npdu.destination = Some(Address::LocalStation(vec![1]));
        assert!(matches!(npdu.encode(), Err(NetworkError::InvalidAddress(_))));

        let mut npdu = Npdu::new();
        npdu.source = Some(Address::RemoteBroadcast(4));
        assert!(matches!(npdu.encode(), Err(NetworkError::InvalidAddress(_))));
    }

    #[test]
    fn test_encode_refuses_global_network_in_remote_addresses() {
        // 0xFFFF on the wire means global broadcast, so these would not
        // decode back to what was sent
        for dest in [
            Address::remote_station(0xFFFF, vec![5]),
            Address::RemoteBroadcast(0xFFFF),
        ] {
            let mut npdu = Npdu::new();
            npdu.destination = Some(dest);
            assert!(matches!(npdu.encode(), Err(NetworkError::InvalidAddress(_))));
        }

        let mut npdu = Npdu::new();
        npdu.source = Some(Address::remote_station(0xFFFF, vec![5]));
        assert!(matches!(npdu.encode(), Err(NetworkError::InvalidAddress(_))));

        let mut npdu = Npdu::new();
        npdu.destination = Some(Address::remote_station(0xFFFE, vec![5]));
        let decoded = Npdu::decode(npdu.encode().unwrap()).unwrap();
        assert_eq!(decoded.destination, Some(Address::remote_station(0xFFFE, vec![5])));
    }

    #[test]
    fn test_decode_rejects_short_and_bad_version() {
        assert!(Npdu::decode(Pdu::with_data(&[0x01])).is_err());
        assert!(Npdu::decode(Pdu::new()).is_err());
        assert!(Npdu::decode(Pdu::with_data(&[0x02, 0x00])).is_err());
    }

    #[test]
    fn test_decode_rejects_broadcast_sources() {
        // SADR global broadcast
        let data = [0x01, 0x08, 0xFF, 0xFF, 0x01, 0x05];
        assert!(Npdu::decode(Pdu::with_data(&data)).is_err());
        // SADR remote broadcast
        let data = [0x01, 0x08, 0x00, 0x05, 0x00];
        assert!(Npdu::decode(Pdu::with_data(&data)).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated_fields() {
        // DADR length runs past the end
        let data = [0x01, 0x20, 0x00, 0x05, 0x06, 0x01];
        assert!(Npdu::decode(Pdu::with_data(&data)).is_err());
        // hop count missing
        let data = [0x01, 0x20, 0x00, 0x05, 0x01, 0x01];
        assert!(Npdu::decode(Pdu::with_data(&data)).is_err());
    }

    #[test]
    fn test_decode_keeps_link_addresses() {
        let pdu = Pdu::with_data(&[0x01, 0x04, 0xAA])
            .with_source(Address::local_station(vec![3]))
            .with_destination(Address::LocalBroadcast);
        let npdu = Npdu::decode(pdu).unwrap();
        assert!(npdu.expecting_reply);
        assert_eq!(npdu.pdu_source, Some(Address::local_station(vec![3])));
        assert_eq!(npdu.pdu_destination, Some(Address::LocalBroadcast));
        assert_eq!(npdu.data, vec![0xAA]);
    }

    fn station() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 1..8)
    }

    fn destination() -> impl Strategy<Value = Option<Address>> {
        prop_oneof![
            Just(None),
            Just(Some(Address::GlobalBroadcast)),
            (0u16..0xFFFF).prop_map(|net| Some(Address::RemoteBroadcast(net))),
            (0u16..0xFFFF, station()).prop_map(|(net, addr)| Some(Address::RemoteStation(net, addr))),
        ]
    }

    fn source() -> impl Strategy<Value = Option<Address>> {
        prop_oneof![
            Just(None),
            (0u16..0xFFFF, station()).prop_map(|(net, addr)| Some(Address::RemoteStation(net, addr))),
        ]
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(
            destination in destination(),
            source in source(),
            hop in any::<u8>(),
            expecting_reply in any::<bool>(),
            priority in 0u8..4,
            message in prop::option::of(any::<u8>()),
            vendor in any::<u16>(),
            data in prop::collection::vec(any::<u8>(), 0..16),
        ) {
            let mut npdu = Npdu::new();
            npdu.hop_count = destination.as_ref().map(|_| hop);
            npdu.destination = destination;
            npdu.source = source;
            npdu.expecting_reply = expecting_reply;
            npdu.priority = NetworkPriority::from_bits(priority);
            npdu.message_type = message.map(NetworkMessageType::from);
            npdu.vendor_id = message.filter(|m| *m >= 0x80).map(|_| vendor);
            npdu.data = data;

            let decoded = Npdu::decode(npdu.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, npdu);
        }
    }
}
