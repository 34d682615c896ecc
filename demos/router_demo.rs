//! Two in-memory segments joined by a router
//!
//! Run with `RUST_LOG=debug cargo run --features loopback --example router_demo` to see the
//! routing decisions as they are made.

use bacnet_netstack::{
    comm::Capture,
    network::{NetworkMessage, NetworkServiceAccessPoint, NetworkServiceElement, Npdu},
    util::octet_trace,
    Address, Pdu,
};

fn show(segment: &str, link: &Capture) {
    for pdu in link.drain() {
        println!("  {} -> {:?}", segment, pdu.destination);
        print!("{}", octet_trace(pdu.data(), "    "));
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let segment_a = Capture::new();
    let segment_b = Capture::new();
    let application = Capture::new();

    let mut router = NetworkServiceAccessPoint::new();
    let net_a = router.bind(
        Box::new(segment_a.clone()),
        Some(1),
        Some(Address::local_station(vec![0x01])),
    )?;
    let net_b = router.bind(Box::new(segment_b.clone()), Some(2), None)?;
    router.bind_application(Box::new(application.clone()));
    router.bind_element(Box::new(NetworkServiceElement::new()));

    println!("Router between networks 1 and 2");

    // another router on segment B announces network 3
    let mut announce = NetworkMessage::IAmRouterToNetwork(vec![3])
        .to_npdu()?
        .encode()?;
    announce.source = Some(Address::local_station(vec![0x30]));
    router.confirmation(net_b, announce)?;

    for route in router.networks() {
        println!(
            "learned: network {} via {} on adapter {}",
            route.network,
            route.router,
            route.adapter.index()
        );
    }

    println!("application sends to 3:5");
    router.indication(
        Pdu::with_data(&[0x10, 0x08]).with_destination(Address::remote_station(3, vec![0x05])),
    )?;
    show("segment B", &segment_b);

    println!("station 1/0x0A sends to 3:7 through us");
    let mut transit = Npdu {
        destination: Some(Address::remote_station(3, vec![0x07])),
        hop_count: Some(255),
        data: vec![0x10, 0x08],
        ..Npdu::new()
    }
    .encode()?;
    transit.source = Some(Address::local_station(vec![0x0A]));
    router.confirmation(net_a, transit)?;
    show("segment B", &segment_b);

    println!("station 1/0x0A asks who routes to anything");
    let mut who_is = NetworkMessage::WhoIsRouterToNetwork(None).to_npdu()?.encode()?;
    who_is.source = Some(Address::local_station(vec![0x0A]));
    router.confirmation(net_a, who_is)?;
    show("segment A", &segment_a);

    println!("application received {} PDUs", application.drain().len());
    Ok(())
}
