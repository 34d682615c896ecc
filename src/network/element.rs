//! Network service element: router discovery
//!
//! [`NetworkMessageHandler`] has one method per message kind, each with a
//! default that logs and does nothing. [`NetworkServiceElement`] overrides
//! the two that drive route discovery.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};

use log::{debug, warn};

use super::{
    AdapterId, NetworkMessage, NetworkServiceAccessPoint, Npdu, Result, RoutingTableEntry,
};
use crate::address::Address;

/// Receives network layer messages addressed to this node.
///
/// `npdu` is the carrying NPDU, for its source and link addresses.
#[allow(unused_variables)]
pub trait NetworkMessageHandler {
    fn who_is_router_to_network(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        network: Option<u16>,
    ) -> Result<()> {
        debug!("who-is-router-to-network {:?} ignored", network);
        Ok(())
    }

    fn i_am_router_to_network(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        networks: &[u16],
    ) -> Result<()> {
        debug!("i-am-router-to-network {:?} ignored", networks);
        Ok(())
    }

    fn i_could_be_router_to_network(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        network: u16,
        performance_index: u8,
    ) -> Result<()> {
        debug!("i-could-be-router-to-network {} ignored", network);
        Ok(())
    }

    fn reject_message_to_network(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        reason: u8,
        network: u16,
    ) -> Result<()> {
        debug!("reject-message-to-network {} (reason {}) ignored", network, reason);
        Ok(())
    }

    fn router_busy_to_network(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        networks: &[u16],
    ) -> Result<()> {
        debug!("router-busy-to-network {:?} ignored", networks);
        Ok(())
    }

    fn router_available_to_network(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        networks: &[u16],
    ) -> Result<()> {
        debug!("router-available-to-network {:?} ignored", networks);
        Ok(())
    }

    fn initialize_routing_table(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        entries: &[RoutingTableEntry],
    ) -> Result<()> {
        debug!("initialize-routing-table ({} entries) ignored", entries.len());
        Ok(())
    }

    fn initialize_routing_table_ack(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        entries: &[RoutingTableEntry],
    ) -> Result<()> {
        debug!("initialize-routing-table-ack ({} entries) ignored", entries.len());
        Ok(())
    }

    fn establish_connection_to_network(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        network: u16,
        termination_time: u8,
    ) -> Result<()> {
        debug!("establish-connection-to-network {} ignored", network);
        Ok(())
    }

    fn disconnect_connection_to_network(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        network: u16,
    ) -> Result<()> {
        debug!("disconnect-connection-to-network {} ignored", network);
        Ok(())
    }

    fn what_is_network_number(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
    ) -> Result<()> {
        debug!("what-is-network-number ignored");
        Ok(())
    }

    fn network_number_is(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        network: u16,
        configured: bool,
    ) -> Result<()> {
        debug!("network-number-is {} ignored", network);
        Ok(())
    }

    fn proprietary(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        message_type: u8,
        vendor_id: u16,
        data: &[u8],
    ) -> Result<()> {
        debug!(
            "proprietary message {:#04x} from vendor {} ignored",
            message_type, vendor_id
        );
        Ok(())
    }

    /// Route a decoded message to its handler method.
    fn dispatch(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        message: NetworkMessage,
    ) -> Result<()> {
        match message {
            NetworkMessage::WhoIsRouterToNetwork(network) => {
                self.who_is_router_to_network(sap, adapter, npdu, network)
            }
            NetworkMessage::IAmRouterToNetwork(networks) => {
                self.i_am_router_to_network(sap, adapter, npdu, &networks)
            }
            NetworkMessage::ICouldBeRouterToNetwork {
                network,
                performance_index,
            } => self.i_could_be_router_to_network(sap, adapter, npdu, network, performance_index),
            NetworkMessage::RejectMessageToNetwork { reason, network } => {
                self.reject_message_to_network(sap, adapter, npdu, reason, network)
            }
            NetworkMessage::RouterBusyToNetwork(networks) => {
                self.router_busy_to_network(sap, adapter, npdu, &networks)
            }
            NetworkMessage::RouterAvailableToNetwork(networks) => {
                self.router_available_to_network(sap, adapter, npdu, &networks)
            }
            NetworkMessage::InitializeRoutingTable(entries) => {
                self.initialize_routing_table(sap, adapter, npdu, &entries)
            }
            NetworkMessage::InitializeRoutingTableAck(entries) => {
                self.initialize_routing_table_ack(sap, adapter, npdu, &entries)
            }
            NetworkMessage::EstablishConnectionToNetwork {
                network,
                termination_time,
            } => self.establish_connection_to_network(sap, adapter, npdu, network, termination_time),
            NetworkMessage::DisconnectConnectionToNetwork(network) => {
                self.disconnect_connection_to_network(sap, adapter, npdu, network)
            }
            NetworkMessage::WhatIsNetworkNumber => self.what_is_network_number(sap, adapter, npdu),
            NetworkMessage::NetworkNumberIs {
                network,
                configured,
            } => self.network_number_is(sap, adapter, npdu, network, configured),
            NetworkMessage::Proprietary {
                message_type,
                vendor_id,
                data,
            } => self.proprietary(sap, adapter, npdu, message_type, vendor_id, &data),
        }
    }
}

/// Answers and propagates router discovery
#[derive(Debug, Default, Clone)]
pub struct NetworkServiceElement;

/// Answers go back to the station that asked, or to the whole segment
/// when the link layer gave no source.
fn reply_address(request: &Npdu) -> Address {
    request
        .pdu_source
        .clone()
        .unwrap_or(Address::LocalBroadcast)
}

impl NetworkServiceElement {
    pub fn new() -> Self {
        Self
    }
}

impl NetworkMessageHandler for NetworkServiceElement {
    fn who_is_router_to_network(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        network: Option<u16>,
    ) -> Result<()> {
        if sap.adapters().len() < 2 {
            return Ok(());
        }

        let Some(dnet) = network else {
            let mut networks: Vec<u16> = sap
                .adapters()
                .iter()
                .filter(|a| a.id() != adapter)
                .filter_map(|a| a.network())
                .collect();
            networks.extend(
                sap.networks()
                    .filter(|route| route.adapter != adapter)
                    .map(|route| route.network),
            );
            if networks.is_empty() {
                return Ok(());
            }
            debug!("adapter {} can reach {:?}", adapter.index(), networks);
            return sap.send_network_message(
                adapter,
                &NetworkMessage::IAmRouterToNetwork(networks),
                reply_address(npdu),
                None,
            );
        };

        let reachable = match sap.adapter_for_network(dnet) {
            Some(direct) => direct != adapter,
            None => match sap.route_to(dnet) {
                Some(route) => route.adapter != adapter,
                None => {
                    // ask the other segments, keeping the original source so
                    // an answer can find its way back
                    let origin = npdu.source.clone().or_else(|| {
                        let net = sap.adapter(adapter)?.network()?;
                        let addr = npdu.pdu_source.as_ref()?.addr()?;
                        Some(Address::RemoteStation(net, addr.to_vec()))
                    });
                    let others: Vec<AdapterId> = sap
                        .adapters()
                        .iter()
                        .map(|a| a.id())
                        .filter(|id| *id != adapter)
                        .collect();
                    for other in others {
                        sap.send_network_message(
                            other,
                            &NetworkMessage::WhoIsRouterToNetwork(Some(dnet)),
                            Address::LocalBroadcast,
                            origin.clone(),
                        )?;
                    }
                    return Ok(());
                }
            },
        };

        if reachable {
            sap.send_network_message(
                adapter,
                &NetworkMessage::IAmRouterToNetwork(vec![dnet]),
                reply_address(npdu),
                None,
            )
        } else {
            Ok(())
        }
    }

    fn i_am_router_to_network(
        &mut self,
        sap: &mut NetworkServiceAccessPoint,
        adapter: AdapterId,
        npdu: &Npdu,
        networks: &[u16],
    ) -> Result<()> {
        let Some(router) = &npdu.pdu_source else {
            warn!("i-am-router-to-network without a link source");
            return Ok(());
        };
        sap.add_router_references(adapter, router, networks);
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::{comm::Capture, network::NetworkMessageRegistry, pdu::Pdu};

    fn station(octet: u8) -> Address {
        Address::local_station(vec![octet])
    }

    fn router(nets: &[u16]) -> (NetworkServiceAccessPoint, Vec<Capture>) {
        let mut sap = NetworkServiceAccessPoint::new();
        let mut links = Vec::new();
        for (i, net) in nets.iter().enumerate() {
            let link = Capture::new();
            let address = (i == 0).then(|| station(100));
            sap.bind(Box::new(link.clone()), Some(*net), address).unwrap();
            links.push(link);
        }
        sap.bind_element(Box::new(NetworkServiceElement::new()));
        (sap, links)
    }

    fn receive(sap: &mut NetworkServiceAccessPoint, adapter: usize, message: NetworkMessage, from: u8) {
        let mut pdu = message.to_npdu().unwrap().encode().unwrap();
        pdu.source = Some(station(from));
        pdu.destination = Some(Address::LocalBroadcast);
        let id = sap.adapters()[adapter].id();
        sap.confirmation(id, pdu).unwrap();
    }

    fn messages(link: &Capture) -> Vec<(Npdu, NetworkMessage)> {
        let registry = NetworkMessageRegistry::standard();
        link.drain()
            .into_iter()
            .map(|pdu: Pdu| {
                let npdu = Npdu::decode(pdu).unwrap();
                let message = registry.decode(&npdu).unwrap();
                (npdu, message)
            })
            .collect()
    }

    #[test]
    fn test_who_is_for_directly_attached_network() {
        let (mut sap, links) = router(&[1, 2]);
        receive(&mut sap, 0, NetworkMessage::WhoIsRouterToNetwork(Some(2)), 20);

        let sent = messages(&links[0]);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, NetworkMessage::IAmRouterToNetwork(vec![2]));
        assert_eq!(sent[0].0.pdu_destination, Some(station(20)));
        assert!(links[1].is_empty());
    }

    #[test]
    fn test_who_is_wildcard_skips_requesting_side() {
        let (mut sap, links) = router(&[1, 2]);
        sap.add_router_references(sap.adapters()[1].id(), &station(50), &[7]);
        sap.add_router_references(sap.adapters()[0].id(), &station(51), &[8]);

        receive(&mut sap, 0, NetworkMessage::WhoIsRouterToNetwork(None), 20);

        let sent = messages(&links[0]);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, NetworkMessage::IAmRouterToNetwork(vec![2, 7]));
        assert_eq!(sent[0].0.pdu_destination, Some(station(20)));
    }

    #[test]
    fn test_who_is_known_via_same_adapter_is_silent() {
        let (mut sap, links) = router(&[1, 2]);
        sap.add_router_references(sap.adapters()[0].id(), &station(51), &[8]);

        receive(&mut sap, 0, NetworkMessage::WhoIsRouterToNetwork(Some(8)), 20);
        receive(&mut sap, 0, NetworkMessage::WhoIsRouterToNetwork(Some(1)), 20);

        assert!(links[0].is_empty());
        assert!(links[1].is_empty());
    }

    #[test]
    fn test_who_is_known_via_other_adapter_answers() {
        let (mut sap, links) = router(&[1, 2]);
        sap.add_router_references(sap.adapters()[1].id(), &station(50), &[9]);

        receive(&mut sap, 0, NetworkMessage::WhoIsRouterToNetwork(Some(9)), 20);

        let sent = messages(&links[0]);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, NetworkMessage::IAmRouterToNetwork(vec![9]));
    }

    #[test]
    fn test_who_is_unknown_network_is_propagated() {
        let (mut sap, links) = router(&[1, 2, 3]);
        receive(&mut sap, 0, NetworkMessage::WhoIsRouterToNetwork(Some(44)), 20);

        assert!(links[0].is_empty());
        for link in &links[1..] {
            let sent = messages(link);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].1, NetworkMessage::WhoIsRouterToNetwork(Some(44)));
            assert_eq!(sent[0].0.source, Some(Address::remote_station(1, vec![20])));
        }
    }

    #[test]
    fn test_single_adapter_ignores_who_is() {
        let (mut sap, links) = router(&[1]);
        receive(&mut sap, 0, NetworkMessage::WhoIsRouterToNetwork(None), 20);
        assert!(links[0].is_empty());
    }

    #[test]
    fn test_i_am_learns_routes() {
        let (mut sap, _) = router(&[1, 2]);
        receive(&mut sap, 1, NetworkMessage::IAmRouterToNetwork(vec![5, 6, 1]), 60);

        let route = sap.route_to(5).unwrap();
        assert_eq!(route.adapter, sap.adapters()[1].id());
        assert_eq!(route.router, station(60));
        assert!(sap.route_to(6).is_some());
        // directly attached, never learned
        assert!(sap.route_to(1).is_none());

        // a later advertisement from another router wins
        receive(&mut sap, 0, NetworkMessage::IAmRouterToNetwork(vec![6]), 61);
        assert_eq!(sap.route_to(6).unwrap().router, station(61));
        assert_eq!(sap.route_to(5).unwrap().router, station(60));
    }

    #[test]
    fn test_stub_handlers_accept_other_messages() {
        let (mut sap, links) = router(&[1, 2]);
        receive(
            &mut sap,
            0,
            NetworkMessage::RouterBusyToNetwork(vec![3]),
            20,
        );
        receive(&mut sap, 0, NetworkMessage::WhatIsNetworkNumber, 20);
        assert!(links[0].is_empty());
        assert!(links[1].is_empty());
    }
}
