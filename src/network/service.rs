//! Network service access point
//!
//! The SAP sits between the application and one or more link layers. With a
//! single adapter it is a plain device's network layer; with several it is a
//! router that learns routes and forwards traffic between its segments.

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, collections::BTreeMap, format, vec::Vec};

#[cfg(feature = "std")]
use std::collections::BTreeMap;

use log::{debug, warn};

use super::{
    constants, NetworkError, NetworkMessage, NetworkMessageHandler, NetworkMessageRegistry, Npdu,
    Result,
};
use crate::{
    address::Address,
    comm::{Client, Server},
    pdu::Pdu,
    util::octet_trace,
};

/// Index of an adapter within its service access point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterId(usize);

impl AdapterId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Reachability of a network or router
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkStatus {
    #[default]
    Available,
    Busy,
    Disconnected,
    Unreachable,
}

/// What to do with traffic for a network with no known route
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownRoutePolicy {
    /// Broadcast on every adapter and let a router pick it up
    #[default]
    Flood,
    /// Flood, and also ask every segment who routes to the network
    Discover,
}

/// Service access point configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Hop count stamped on originated NPDUs
    pub initial_hop_count: u8,
    pub unknown_route: UnknownRoutePolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            initial_hop_count: constants::MAX_HOP_COUNT,
            unknown_route: UnknownRoutePolicy::Flood,
        }
    }
}

/// One directly attached segment
pub struct NetworkAdapter {
    id: AdapterId,
    network: Option<u16>,
    status: NetworkStatus,
    link: Box<dyn Server + Send>,
}

impl core::fmt::Debug for NetworkAdapter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetworkAdapter")
            .field("id", &self.id)
            .field("network", &self.network)
            .field("status", &self.status)
            .finish()
    }
}

impl NetworkAdapter {
    pub fn id(&self) -> AdapterId {
        self.id
    }

    /// Network number of the segment; `None` when it is unnumbered
    pub fn network(&self) -> Option<u16> {
        self.network
    }

    pub fn status(&self) -> NetworkStatus {
        self.status
    }

    fn send(&mut self, npdu: &Npdu) -> Result<()> {
        let pdu = npdu.encode()?;
        debug!(
            "adapter {} sending {} octets to {:?}",
            self.id.0,
            pdu.len(),
            pdu.destination
        );
        self.link.indication(pdu)?;
        Ok(())
    }
}

/// A router on a directly attached segment and the networks behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterReference {
    pub adapter: AdapterId,
    pub address: Address,
    pub networks: Vec<u16>,
    pub status: NetworkStatus,
}

/// The route to one remote network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkReference {
    pub network: u16,
    /// Adapter the router is reached through
    pub adapter: AdapterId,
    /// Link address of the router
    pub router: Address,
    pub status: NetworkStatus,
}

/// Routing network layer
pub struct NetworkServiceAccessPoint {
    config: ServiceConfig,
    adapters: Vec<NetworkAdapter>,
    local_adapter: Option<AdapterId>,
    local_address: Option<Address>,
    routers: BTreeMap<(AdapterId, Address), RouterReference>,
    networks: BTreeMap<u16, NetworkReference>,
    registry: NetworkMessageRegistry,
    application: Option<Box<dyn Client + Send>>,
    element: Option<Box<dyn NetworkMessageHandler + Send>>,
}

impl Default for NetworkServiceAccessPoint {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkServiceAccessPoint {
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default())
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        Self {
            config,
            adapters: Vec::new(),
            local_adapter: None,
            local_address: None,
            routers: BTreeMap::new(),
            networks: BTreeMap::new(),
            registry: NetworkMessageRegistry::standard(),
            application: None,
            element: None,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Attach a link layer. Giving `address` makes this the local adapter,
    /// the one the application's own traffic uses.
    pub fn bind(
        &mut self,
        link: Box<dyn Server + Send>,
        network: Option<u16>,
        address: Option<Address>,
    ) -> Result<AdapterId> {
        if let Some(net) = network {
            if self.adapter_for_network(net).is_some() {
                return Err(NetworkError::Configuration(format!(
                    "network {} already bound",
                    net
                )));
            }
            if self.networks.contains_key(&net) {
                self.remove_network(net);
            }
        }

        if address.is_some() && self.local_adapter.is_some() {
            return Err(NetworkError::Configuration(
                "local adapter already designated".into(),
            ));
        }

        let id = AdapterId(self.adapters.len());
        self.adapters.push(NetworkAdapter {
            id,
            network,
            status: NetworkStatus::Available,
            link,
        });

        if let Some(address) = address {
            self.local_adapter = Some(id);
            self.local_address = Some(address);
        }

        debug!("bound adapter {} to network {:?}", id.0, network);
        Ok(id)
    }

    /// Upper layer that receives application data
    pub fn bind_application(&mut self, application: Box<dyn Client + Send>) {
        self.application = Some(application);
    }

    /// Handler for network layer messages addressed to this node
    pub fn bind_element(&mut self, element: Box<dyn NetworkMessageHandler + Send>) {
        self.element = Some(element);
    }

    pub fn registry_mut(&mut self) -> &mut NetworkMessageRegistry {
        &mut self.registry
    }

    pub fn adapters(&self) -> &[NetworkAdapter] {
        &self.adapters
    }

    pub fn adapter(&self, id: AdapterId) -> Option<&NetworkAdapter> {
        self.adapters.get(id.0)
    }

    pub fn set_adapter_status(&mut self, id: AdapterId, status: NetworkStatus) -> Result<()> {
        self.adapter_mut(id)?.status = status;
        Ok(())
    }

    /// Adapter directly attached to `net`
    pub fn adapter_for_network(&self, net: u16) -> Option<AdapterId> {
        self.adapters
            .iter()
            .find(|adapter| adapter.network == Some(net))
            .map(|adapter| adapter.id)
    }

    pub fn local_address(&self) -> Option<&Address> {
        self.local_address.as_ref()
    }

    /// The designated local adapter, or the only one if just one is bound
    pub fn local_adapter(&self) -> Option<AdapterId> {
        match self.local_adapter {
            Some(id) => Some(id),
            None if self.adapters.len() == 1 => Some(AdapterId(0)),
            None => None,
        }
    }

    pub fn routers(&self) -> impl Iterator<Item = &RouterReference> {
        self.routers.values()
    }

    pub fn networks(&self) -> impl Iterator<Item = &NetworkReference> {
        self.networks.values()
    }

    /// Learned route to a remote network
    pub fn route_to(&self, net: u16) -> Option<&NetworkReference> {
        self.networks.get(&net)
    }

    /// Record that `networks` are reachable through the router at `address`
    /// on `adapter`. A network learned from a different router replaces the
    /// old route; directly attached networks are never learned.
    pub fn add_router_references(&mut self, adapter: AdapterId, address: &Address, networks: &[u16]) {
        for &net in networks {
            if self.adapter_for_network(net).is_some() {
                warn!(
                    "router {} claims directly attached network {}, ignored",
                    address, net
                );
                continue;
            }

            if let Some(existing) = self.networks.get(&net) {
                if existing.adapter == adapter && existing.router == *address {
                    continue;
                }
                debug!(
                    "network {} moved from {} to {}",
                    net, existing.router, address
                );
                self.remove_network(net);
            }

            self.routers
                .entry((adapter, address.clone()))
                .or_insert_with(|| RouterReference {
                    adapter,
                    address: address.clone(),
                    networks: Vec::new(),
                    status: NetworkStatus::Available,
                })
                .networks
                .push(net);
            self.networks.insert(
                net,
                NetworkReference {
                    network: net,
                    adapter,
                    router: address.clone(),
                    status: NetworkStatus::Available,
                },
            );
        }
    }

    /// Forget routers on `adapter`: just the one at `address`, or all of them.
    pub fn delete_router_references(&mut self, adapter: AdapterId, address: Option<&Address>) {
        let doomed: Vec<(AdapterId, Address)> = self
            .routers
            .keys()
            .filter(|(id, addr)| *id == adapter && address.map_or(true, |a| a == addr))
            .cloned()
            .collect();

        for key in doomed {
            if let Some(router) = self.routers.remove(&key) {
                for net in router.networks {
                    self.networks.remove(&net);
                }
            }
        }
    }

    /// Update the status of a learned network, e.g. from Router-Busy
    pub fn set_network_status(&mut self, net: u16, status: NetworkStatus) {
        if let Some(reference) = self.networks.get_mut(&net) {
            reference.status = status;
        }
    }

    fn remove_network(&mut self, net: u16) {
        if let Some(reference) = self.networks.remove(&net) {
            let key = (reference.adapter, reference.router);
            let empty = match self.routers.get_mut(&key) {
                Some(router) => {
                    router.networks.retain(|n| *n != net);
                    router.networks.is_empty()
                }
                None => false,
            };
            if empty {
                self.routers.remove(&key);
            }
        }
    }

    fn adapter_mut(&mut self, id: AdapterId) -> Result<&mut NetworkAdapter> {
        self.adapters
            .get_mut(id.0)
            .ok_or_else(|| NetworkError::Configuration(format!("no adapter {}", id.0)))
    }

    fn send_npdu(&mut self, adapter: AdapterId, npdu: &Npdu) -> Result<()> {
        self.adapter_mut(adapter)?.send(npdu)
    }

    /// Send on every adapter except `skip`. Every adapter gets its copy even
    /// if an earlier one fails; the first failure is returned.
    fn send_all(&mut self, npdu: &Npdu, skip: Option<AdapterId>) -> Result<()> {
        let mut outcome = Ok(());
        for adapter in self.adapters.iter_mut().filter(|a| Some(a.id) != skip) {
            if let Err(e) = adapter.send(npdu) {
                warn!("adapter {} send failed: {}", adapter.id.0, e);
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }

    /// Send a network layer message out one adapter.
    pub fn send_network_message(
        &mut self,
        adapter: AdapterId,
        message: &NetworkMessage,
        destination: Address,
        source: Option<Address>,
    ) -> Result<()> {
        let mut npdu = message.to_npdu()?;
        npdu.pdu_destination = Some(destination);
        npdu.source = source;
        self.send_npdu(adapter, &npdu)
    }

    /// Outbound application data.
    pub fn indication(&mut self, pdu: Pdu) -> Result<()> {
        if self.adapters.is_empty() {
            return Err(NetworkError::Configuration("no adapters".into()));
        }
        let local = self.local_adapter().ok_or_else(|| {
            NetworkError::Configuration("local adapter must be set with multiple adapters".into())
        })?;

        let mut npdu = Npdu::from_apdu(pdu);
        npdu.hop_count = Some(self.config.initial_hop_count);
        let destination = npdu
            .pdu_destination
            .take()
            .ok_or_else(|| NetworkError::InvalidAddress("no destination".into()))?;

        match destination {
            Address::LocalStation(_) | Address::LocalBroadcast => {
                npdu.pdu_destination = Some(destination);
                self.send_npdu(local, &npdu)
            }
            Address::GlobalBroadcast => {
                npdu.pdu_destination = Some(Address::LocalBroadcast);
                npdu.destination = Some(Address::GlobalBroadcast);
                self.send_all(&npdu, None)
            }
            Address::RemoteBroadcast(net) | Address::RemoteStation(net, _) => {
                if self.adapters[local.0].network == Some(net) {
                    return Err(NetworkError::InvalidAddress(format!(
                        "{} is on the local network",
                        destination
                    )));
                }

                // another directly attached segment, no routing header needed
                if let Some(adapter) = self.adapter_for_network(net) {
                    npdu.pdu_destination = Some(match &destination {
                        Address::RemoteStation(_, addr) => Address::LocalStation(addr.clone()),
                        _ => Address::LocalBroadcast,
                    });
                    return self.send_npdu(adapter, &npdu);
                }

                npdu.destination = Some(destination);
                if let Some(route) = self.networks.get(&net) {
                    let adapter = route.adapter;
                    npdu.pdu_destination = Some(route.router.clone());
                    return self.send_npdu(adapter, &npdu);
                }

                debug!("no route to network {}, flooding", net);
                npdu.pdu_destination = Some(Address::LocalBroadcast);
                let flooded = self.send_all(&npdu, None);
                if self.config.unknown_route == UnknownRoutePolicy::Discover {
                    let mut query = NetworkMessage::WhoIsRouterToNetwork(Some(net)).to_npdu()?;
                    query.pdu_destination = Some(Address::LocalBroadcast);
                    self.send_all(&query, None)?;
                }
                flooded
            }
            Address::Null => Err(NetworkError::InvalidAddress("null destination".into())),
        }
    }

    /// Raw PDU from an adapter's link layer. Malformed NPDUs are dropped
    /// and the decode error returned.
    pub fn confirmation(&mut self, adapter: AdapterId, pdu: Pdu) -> Result<()> {
        let raw = pdu.data().to_vec();
        match Npdu::decode(pdu) {
            Ok(npdu) => self.process_npdu(adapter, npdu),
            Err(e) => {
                warn!("adapter {} dropped NPDU: {}", adapter.0, e);
                debug!("dropped NPDU:\n{}", octet_trace(&raw, "  "));
                Err(e)
            }
        }
    }

    /// Route an inbound NPDU: learn from it, deliver it locally, forward it.
    pub fn process_npdu(&mut self, adapter: AdapterId, npdu: Npdu) -> Result<()> {
        let arrival_net = self
            .adapter(adapter)
            .ok_or_else(|| NetworkError::Configuration(format!("no adapter {}", adapter.0)))?
            .network;

        if let Some(Address::RemoteStation(snet, _)) = &npdu.source {
            let snet = *snet;
            if self.adapter_for_network(snet).is_some() {
                warn!(
                    "path error: source network {} is directly attached, dropped",
                    snet
                );
                return Ok(());
            }
            if let Some(router) = npdu.pdu_source.clone() {
                self.add_router_references(adapter, &router, &[snet]);
            }
        }

        let local = self.local_adapter();
        let (process_locally, forward) = match &npdu.destination {
            None | Some(Address::Null) => (
                self.local_adapter.is_none()
                    || self.local_adapter == Some(adapter)
                    || npdu.is_network_message(),
                false,
            ),
            Some(Address::RemoteBroadcast(dnet)) => {
                if arrival_net == Some(*dnet) {
                    warn!("path error: remote broadcast for arrival network {}", dnet);
                    return Ok(());
                }
                let here = local.map_or(false, |id| self.adapters[id.0].network == Some(*dnet));
                (here, true)
            }
            Some(Address::RemoteStation(dnet, daddr)) => {
                if arrival_net == Some(*dnet) {
                    warn!("path error: remote station on arrival network {}", dnet);
                    return Ok(());
                }
                let here = local.map_or(false, |id| self.adapters[id.0].network == Some(*dnet))
                    && self.local_address.as_ref().and_then(Address::addr) == Some(&daddr[..]);
                (here, !here)
            }
            Some(Address::GlobalBroadcast) => (true, true),
            Some(other) => {
                warn!("invalid DADR {}, dropped", other);
                return Ok(());
            }
        };

        if process_locally {
            if npdu.is_network_message() {
                self.deliver_network_message(adapter, &npdu);
            } else {
                self.deliver_application(adapter, arrival_net, &npdu);
            }
        }

        if forward && self.adapters.len() > 1 {
            self.forward(adapter, arrival_net, npdu)?;
        }
        Ok(())
    }

    fn deliver_network_message(&mut self, adapter: AdapterId, npdu: &Npdu) {
        let message = match self.registry.decode(npdu) {
            Ok(message) => message,
            Err(e) => {
                warn!("adapter {} dropped network message: {}", adapter.0, e);
                return;
            }
        };

        if let Some(mut element) = self.element.take() {
            if let Err(e) = element.dispatch(self, adapter, npdu, message) {
                warn!("network message handler failed: {}", e);
            }
            self.element = Some(element);
        } else {
            debug!("no element bound, {:?} ignored", message.message_type());
        }
    }

    fn deliver_application(&mut self, adapter: AdapterId, arrival_net: Option<u16>, npdu: &Npdu) {
        let Some(application) = self.application.as_mut() else {
            debug!("no application bound, APDU dropped");
            return;
        };

        let mut pdu = Pdu::with_data(&npdu.data);
        pdu.expecting_reply = npdu.expecting_reply;
        pdu.network_priority = npdu.priority.to_bits();

        let routed = self.adapters.len() > 1 && self.local_adapter != Some(adapter);
        if routed {
            // arrived on another segment of a router: the application sees
            // it as coming from a remote station
            pdu.source = npdu.source.clone().or_else(|| {
                match (arrival_net, npdu.pdu_source.as_ref().and_then(Address::addr)) {
                    (Some(net), Some(addr)) => Some(Address::RemoteStation(net, addr.to_vec())),
                    _ => npdu.pdu_source.clone(),
                }
            });
            pdu.destination = match &npdu.destination {
                Some(Address::GlobalBroadcast) => Some(Address::GlobalBroadcast),
                Some(Address::RemoteBroadcast(_)) => Some(Address::LocalBroadcast),
                _ => self
                    .local_address
                    .clone()
                    .or_else(|| npdu.pdu_destination.clone()),
            };
        } else {
            pdu.source = npdu.source.clone().or_else(|| npdu.pdu_source.clone());
            pdu.destination = match &npdu.destination {
                Some(Address::GlobalBroadcast) => Some(Address::GlobalBroadcast),
                _ => npdu.pdu_destination.clone(),
            };
        }

        application.confirmation(pdu);
    }

    fn forward(&mut self, adapter: AdapterId, arrival_net: Option<u16>, npdu: Npdu) -> Result<()> {
        let hop_count = npdu.hop_count.unwrap_or(0);
        if hop_count == 0 {
            warn!("hop count exhausted, not forwarded");
            return Ok(());
        }

        let source = match (&npdu.source, arrival_net, npdu.pdu_source.as_ref()) {
            (Some(source), _, _) => source.clone(),
            (None, Some(net), Some(Address::LocalStation(addr))) => {
                Address::RemoteStation(net, addr.clone())
            }
            _ => {
                warn!("cannot name the origin of an NPDU from adapter {}", adapter.0);
                return Ok(());
            }
        };

        let mut forwarded = npdu;
        forwarded.hop_count = Some(hop_count - 1);
        forwarded.source = Some(source);
        forwarded.pdu_source = None;

        let destination = forwarded.destination.clone();
        match destination {
            Some(Address::GlobalBroadcast) => {
                forwarded.pdu_destination = Some(Address::LocalBroadcast);
                self.send_all(&forwarded, Some(adapter))
            }
            Some(Address::RemoteBroadcast(dnet)) | Some(Address::RemoteStation(dnet, _)) => {
                if let Some(next) = self.adapter_for_network(dnet) {
                    // last hop
                    forwarded.pdu_destination = Some(match &destination {
                        Some(Address::RemoteStation(_, addr)) => Address::LocalStation(addr.clone()),
                        _ => Address::LocalBroadcast,
                    });
                    forwarded.destination = None;
                    return self.send_npdu(next, &forwarded);
                }

                if let Some(route) = self.networks.get(&dnet) {
                    if route.adapter == adapter {
                        warn!("route to network {} leads back, dropped", dnet);
                        return Ok(());
                    }
                    let next = route.adapter;
                    forwarded.pdu_destination = Some(route.router.clone());
                    return self.send_npdu(next, &forwarded);
                }

                debug!("no route to network {}, asking other segments", dnet);
                let mut query = NetworkMessage::WhoIsRouterToNetwork(Some(dnet)).to_npdu()?;
                query.pdu_destination = Some(Address::LocalBroadcast);
                self.send_all(&query, Some(adapter))
            }
            _ => Ok(()),
        }
    }
}
