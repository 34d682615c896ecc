//! Network layer messages
//!
//! Each message kind is a variant of [`NetworkMessage`]. Decoding goes through
//! a [`NetworkMessageRegistry`], which maps a message type code to a decoder
//! function so vendors can plug in their own proprietary messages.

#[cfg(not(feature = "std"))]
use alloc::{collections::BTreeMap, format, vec::Vec};

#[cfg(feature = "std")]
use std::collections::BTreeMap;

use super::{constants, NetworkError, Npdu, Result};
use crate::{generate_vendor_enum, pdu::Pdu};

generate_vendor_enum! {
    /// Network layer message types (ASHRAE 135 clause 6.2.4)
    NetworkMessageType {
        WhoIsRouterToNetwork = 0x00,
        IAmRouterToNetwork = 0x01,
        ICouldBeRouterToNetwork = 0x02,
        RejectMessageToNetwork = 0x03,
        RouterBusyToNetwork = 0x04,
        RouterAvailableToNetwork = 0x05,
        InitializeRoutingTable = 0x06,
        InitializeRoutingTableAck = 0x07,
        EstablishConnectionToNetwork = 0x08,
        DisconnectConnectionToNetwork = 0x09,
        WhatIsNetworkNumber = 0x12,
        NetworkNumberIs = 0x13,
    },
    u8,
    constants::PROPRIETARY_MESSAGE_START..=0xFF
}

/// Reject-Message-To-Network reason codes
pub mod reject_reason {
    pub const OTHER: u8 = 0;
    pub const NOT_DIRECTLY_CONNECTED: u8 = 1;
    pub const ROUTER_BUSY: u8 = 2;
    pub const UNKNOWN_MESSAGE_TYPE: u8 = 3;
    pub const MESSAGE_TOO_LONG: u8 = 4;
    pub const SECURITY_ERROR: u8 = 5;
    pub const ADDRESSING_ERROR: u8 = 6;
}

/// One row of an Initialize-Routing-Table message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTableEntry {
    pub network: u16,
    pub port_id: u8,
    pub port_info: Vec<u8>,
}

/// A decoded network layer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    /// `None` asks every router to list what it can reach
    WhoIsRouterToNetwork(Option<u16>),
    IAmRouterToNetwork(Vec<u16>),
    ICouldBeRouterToNetwork {
        network: u16,
        performance_index: u8,
    },
    RejectMessageToNetwork {
        reason: u8,
        network: u16,
    },
    RouterBusyToNetwork(Vec<u16>),
    RouterAvailableToNetwork(Vec<u16>),
    InitializeRoutingTable(Vec<RoutingTableEntry>),
    InitializeRoutingTableAck(Vec<RoutingTableEntry>),
    EstablishConnectionToNetwork {
        network: u16,
        termination_time: u8,
    },
    DisconnectConnectionToNetwork(u16),
    WhatIsNetworkNumber,
    NetworkNumberIs {
        network: u16,
        configured: bool,
    },
    /// Anything in the vendor block without a registered decoder
    Proprietary {
        message_type: u8,
        vendor_id: u16,
        data: Vec<u8>,
    },
}

fn put_networks(pdu: &mut Pdu, networks: &[u16]) {
    for net in networks {
        pdu.put_short(*net);
    }
}

fn length_octet(len: usize, what: &str) -> Result<u8> {
    u8::try_from(len)
        .map_err(|_| NetworkError::InvalidValue(format!("{} {} do not fit a length octet", len, what)))
}

fn put_routing_table(pdu: &mut Pdu, entries: &[RoutingTableEntry]) -> Result<()> {
    pdu.put(length_octet(entries.len(), "routing table entries")?);
    for entry in entries {
        pdu.put_short(entry.network);
        pdu.put(entry.port_id);
        pdu.put(length_octet(entry.port_info.len(), "port info octets")?);
        pdu.put_data(&entry.port_info);
    }
    Ok(())
}

impl NetworkMessage {
    pub fn message_type(&self) -> NetworkMessageType {
        match self {
            NetworkMessage::WhoIsRouterToNetwork(_) => NetworkMessageType::WhoIsRouterToNetwork,
            NetworkMessage::IAmRouterToNetwork(_) => NetworkMessageType::IAmRouterToNetwork,
            NetworkMessage::ICouldBeRouterToNetwork { .. } => {
                NetworkMessageType::ICouldBeRouterToNetwork
            }
            NetworkMessage::RejectMessageToNetwork { .. } => {
                NetworkMessageType::RejectMessageToNetwork
            }
            NetworkMessage::RouterBusyToNetwork(_) => NetworkMessageType::RouterBusyToNetwork,
            NetworkMessage::RouterAvailableToNetwork(_) => {
                NetworkMessageType::RouterAvailableToNetwork
            }
            NetworkMessage::InitializeRoutingTable(_) => NetworkMessageType::InitializeRoutingTable,
            NetworkMessage::InitializeRoutingTableAck(_) => {
                NetworkMessageType::InitializeRoutingTableAck
            }
            NetworkMessage::EstablishConnectionToNetwork { .. } => {
                NetworkMessageType::EstablishConnectionToNetwork
            }
            NetworkMessage::DisconnectConnectionToNetwork(_) => {
                NetworkMessageType::DisconnectConnectionToNetwork
            }
            NetworkMessage::WhatIsNetworkNumber => NetworkMessageType::WhatIsNetworkNumber,
            NetworkMessage::NetworkNumberIs { .. } => NetworkMessageType::NetworkNumberIs,
            NetworkMessage::Proprietary { message_type, .. } => {
                NetworkMessageType::from(*message_type)
            }
        }
    }

    /// Write the message body (everything after the message type).
    pub fn encode_body(&self, pdu: &mut Pdu) -> Result<()> {
        match self {
            NetworkMessage::WhoIsRouterToNetwork(net) => {
                if let Some(net) = net {
                    pdu.put_short(*net);
                }
            }
            NetworkMessage::IAmRouterToNetwork(nets)
            | NetworkMessage::RouterBusyToNetwork(nets)
            | NetworkMessage::RouterAvailableToNetwork(nets) => put_networks(pdu, nets),
            NetworkMessage::ICouldBeRouterToNetwork {
                network,
                performance_index,
            } => {
                pdu.put_short(*network);
                pdu.put(*performance_index);
            }
            NetworkMessage::RejectMessageToNetwork { reason, network } => {
                pdu.put(*reason);
                pdu.put_short(*network);
            }
            NetworkMessage::InitializeRoutingTable(entries)
            | NetworkMessage::InitializeRoutingTableAck(entries) => {
                put_routing_table(pdu, entries)?
            }
            NetworkMessage::EstablishConnectionToNetwork {
                network,
                termination_time,
            } => {
                pdu.put_short(*network);
                pdu.put(*termination_time);
            }
            NetworkMessage::DisconnectConnectionToNetwork(network) => pdu.put_short(*network),
            NetworkMessage::WhatIsNetworkNumber => {}
            NetworkMessage::NetworkNumberIs {
                network,
                configured,
            } => {
                pdu.put_short(*network);
                pdu.put(u8::from(*configured));
            }
            NetworkMessage::Proprietary { data, .. } => pdu.put_data(data),
        }
        Ok(())
    }

    /// Build an NPDU carrying this message. Addressing is left to the caller.
    pub fn to_npdu(&self) -> Result<Npdu> {
        let mut body = Pdu::new();
        self.encode_body(&mut body)?;

        let mut npdu = Npdu::new();
        npdu.message_type = Some(self.message_type());
        if let NetworkMessage::Proprietary { vendor_id, .. } = self {
            npdu.vendor_id = Some(*vendor_id);
        }
        npdu.data = body.take_data();
        Ok(npdu)
    }
}

/// Decoder for one message type. Gets the message body and the vendor id.
pub type MessageDecoder = fn(&mut Pdu, Option<u16>) -> Result<NetworkMessage>;

fn get_networks(pdu: &mut Pdu) -> Result<Vec<u16>> {
    let mut nets = Vec::with_capacity(pdu.len() / 2);
    while !pdu.is_empty() {
        nets.push(pdu.get_short()?);
    }
    Ok(nets)
}

fn get_routing_table(pdu: &mut Pdu) -> Result<Vec<RoutingTableEntry>> {
    let count = pdu.get()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let network = pdu.get_short()?;
        let port_id = pdu.get()?;
        let info_len = pdu.get()? as usize;
        entries.push(RoutingTableEntry {
            network,
            port_id,
            port_info: pdu.get_data(info_len)?,
        });
    }
    Ok(entries)
}

fn decode_who_is(pdu: &mut Pdu, _: Option<u16>) -> Result<NetworkMessage> {
    let net = if pdu.is_empty() {
        None
    } else {
        Some(pdu.get_short()?)
    };
    Ok(NetworkMessage::WhoIsRouterToNetwork(net))
}

fn decode_i_am(pdu: &mut Pdu, _: Option<u16>) -> Result<NetworkMessage> {
    Ok(NetworkMessage::IAmRouterToNetwork(get_networks(pdu)?))
}

fn decode_i_could_be(pdu: &mut Pdu, _: Option<u16>) -> Result<NetworkMessage> {
    Ok(NetworkMessage::ICouldBeRouterToNetwork {
        network: pdu.get_short()?,
        performance_index: pdu.get()?,
    })
}

fn decode_reject(pdu: &mut Pdu, _: Option<u16>) -> Result<NetworkMessage> {
    Ok(NetworkMessage::RejectMessageToNetwork {
        reason: pdu.get()?,
        network: pdu.get_short()?,
    })
}

fn decode_busy(pdu: &mut Pdu, _: Option<u16>) -> Result<NetworkMessage> {
    Ok(NetworkMessage::RouterBusyToNetwork(get_networks(pdu)?))
}

fn decode_available(pdu: &mut Pdu, _: Option<u16>) -> Result<NetworkMessage> {
    Ok(NetworkMessage::RouterAvailableToNetwork(get_networks(pdu)?))
}

fn decode_init_table(pdu: &mut Pdu, _: Option<u16>) -> Result<NetworkMessage> {
    Ok(NetworkMessage::InitializeRoutingTable(get_routing_table(pdu)?))
}

fn decode_init_table_ack(pdu: &mut Pdu, _: Option<u16>) -> Result<NetworkMessage> {
    Ok(NetworkMessage::InitializeRoutingTableAck(get_routing_table(pdu)?))
}

fn decode_establish(pdu: &mut Pdu, _: Option<u16>) -> Result<NetworkMessage> {
    Ok(NetworkMessage::EstablishConnectionToNetwork {
        network: pdu.get_short()?,
        termination_time: pdu.get()?,
    })
}

fn decode_disconnect(pdu: &mut Pdu, _: Option<u16>) -> Result<NetworkMessage> {
    Ok(NetworkMessage::DisconnectConnectionToNetwork(pdu.get_short()?))
}

fn decode_what_is_network_number(_: &mut Pdu, _: Option<u16>) -> Result<NetworkMessage> {
    Ok(NetworkMessage::WhatIsNetworkNumber)
}

fn decode_network_number_is(pdu: &mut Pdu, _: Option<u16>) -> Result<NetworkMessage> {
    Ok(NetworkMessage::NetworkNumberIs {
        network: pdu.get_short()?,
        configured: pdu.get()? != 0,
    })
}

/// Message type code to decoder lookup
#[derive(Debug, Clone)]
pub struct NetworkMessageRegistry {
    decoders: BTreeMap<u8, MessageDecoder>,
}

impl Default for NetworkMessageRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl NetworkMessageRegistry {
    /// Registry with no decoders at all
    pub fn empty() -> Self {
        Self {
            decoders: BTreeMap::new(),
        }
    }

    /// Registry with a decoder for every standard message type
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        let standard: [(NetworkMessageType, MessageDecoder); 12] = [
            (NetworkMessageType::WhoIsRouterToNetwork, decode_who_is),
            (NetworkMessageType::IAmRouterToNetwork, decode_i_am),
            (NetworkMessageType::ICouldBeRouterToNetwork, decode_i_could_be),
            (NetworkMessageType::RejectMessageToNetwork, decode_reject),
            (NetworkMessageType::RouterBusyToNetwork, decode_busy),
            (NetworkMessageType::RouterAvailableToNetwork, decode_available),
            (NetworkMessageType::InitializeRoutingTable, decode_init_table),
            (NetworkMessageType::InitializeRoutingTableAck, decode_init_table_ack),
            (NetworkMessageType::EstablishConnectionToNetwork, decode_establish),
            (NetworkMessageType::DisconnectConnectionToNetwork, decode_disconnect),
            (NetworkMessageType::WhatIsNetworkNumber, decode_what_is_network_number),
            (NetworkMessageType::NetworkNumberIs, decode_network_number_is),
        ];
        for (message_type, decoder) in standard {
            registry.register(message_type, decoder);
        }
        registry
    }

    /// Install a decoder, returning the one it replaces.
    pub fn register(
        &mut self,
        message_type: NetworkMessageType,
        decoder: MessageDecoder,
    ) -> Option<MessageDecoder> {
        self.decoders.insert(u8::from(message_type), decoder)
    }

    pub fn contains(&self, message_type: NetworkMessageType) -> bool {
        self.decoders.contains_key(&u8::from(message_type))
    }

    /// Decode the message carried by a network layer NPDU.
    ///
    /// Unregistered vendor messages come back as
    /// [`NetworkMessage::Proprietary`] with the raw body.
    pub fn decode(&self, npdu: &Npdu) -> Result<NetworkMessage> {
        let message_type = npdu
            .message_type
            .ok_or_else(|| NetworkError::InvalidNpdu("not a network layer message".into()))?;
        let code = u8::from(message_type);

        match self.decoders.get(&code) {
            Some(decoder) => {
                let mut body = Pdu::with_data(&npdu.data);
                let message = decoder(&mut body, npdu.vendor_id)?;
                if !body.is_empty() {
                    return Err(NetworkError::InvalidNpdu(format!(
                        "{} trailing octets after {}",
                        body.len(),
                        message_type
                    )));
                }
                Ok(message)
            }
            None if message_type.is_proprietary() => Ok(NetworkMessage::Proprietary {
                message_type: code,
                vendor_id: npdu.vendor_id.unwrap_or(0),
                data: npdu.data.clone(),
            }),
            None => Err(NetworkError::InvalidNpdu(format!(
                "unknown network message type {}",
                message_type
            ))),
        }
    }
}
