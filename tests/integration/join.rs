//! Cluster formation: first node, admission, rejection, join timeout.

use std::net::IpAddr;
use std::time::Duration;

use ringmesh::{Discovery, DiscoveryConfig, Error, JoinError, NodeOrder, SpiState};

use crate::fixtures::{ClusterRig, assert_until, next_base_port};

#[test]
fn first_node_bootstraps_alone() {
    let rig = ClusterRig::launch(1);
    let a = rig.node(0);

    assert_eq!(a.disc.state(), SpiState::Connected);
    assert_eq!(a.disc.local_node().order, NodeOrder::new(1));
    assert_eq!(a.version(), 1);
    assert_eq!(a.disc.coordinator(), Some(a.id()));
    assert!(a.disc.remote_nodes().is_empty());
}

#[test]
fn two_node_join_agrees_on_topology() {
    let rig = ClusterRig::launch(2);
    let a = rig.node(0);
    let b = rig.node(1);

    // B returns from start() only after its own finish message.
    assert_eq!(b.disc.state(), SpiState::Connected);
    assert_eq!(a.disc.local_node().order, NodeOrder::new(1));
    assert_eq!(b.disc.local_node().order, NodeOrder::new(2));
    assert_eq!(b.version(), 2);

    assert_until(
        Duration::from_secs(5),
        || a.version() == 2 && a.live_ids() == b.live_ids(),
        "both nodes observe {A,B} at version 2",
    );
    assert_eq!(a.disc.coordinator(), Some(a.id()));
    assert_eq!(b.disc.coordinator(), Some(a.id()));

    // Exactly one joined event for B on each side.
    let b_id = b.id();
    assert_until(
        Duration::from_secs(5),
        || a.events.joined(b_id) == 1 && b.events.joined(b_id) == 1,
        "EVT_NODE_JOINED(B) observed once on both nodes",
    );
}

#[test]
fn third_node_joins_through_the_ring() {
    let rig = ClusterRig::launch(3);
    let c = rig.node(2);

    assert_eq!(c.disc.local_node().order, NodeOrder::new(3));
    assert_until(
        Duration::from_secs(5),
        || rig.nodes.iter().all(|n| n.version() == 3),
        "all three nodes converge on version 3",
    );
    let expected = rig.node(0).live_ids();
    assert_eq!(expected.len(), 3);
    for node in &rig.nodes {
        assert_eq!(node.live_ids(), expected);
    }
}

#[test]
fn join_request_is_forwarded_to_the_coordinator() {
    let mut rig = ClusterRig::launch(2);
    // The joiner only knows the non-coordinator, which must forward the
    // request around the ring.
    let via_b = vec![rig.node(1).disc.bind_addr().unwrap().to_string()];
    let c_idx = rig.add_server_via(via_b).unwrap();

    assert_eq!(rig.node(c_idx).disc.local_node().order, NodeOrder::new(3));
    assert_until(
        Duration::from_secs(5),
        || rig.nodes.iter().all(|n| n.version() == 3),
        "all nodes converge after a forwarded join",
    );
    assert_eq!(
        rig.node(c_idx).disc.coordinator(),
        Some(rig.node(0).id())
    );
}

#[test]
fn duplicate_node_id_is_rejected() {
    let mut rig = ClusterRig::launch(1);
    let existing = rig.node(0).id();

    let err = rig
        .add_server_with(|config| config, Some(existing))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Join(JoinError::DuplicateId { id }) if id == existing
    ));

    // The incumbent is untouched.
    let a = rig.node(0);
    assert_eq!(a.version(), 1);
    assert_eq!(a.live_ids(), vec![existing]);
}

#[test]
fn join_times_out_when_no_peer_answers() {
    // A port from a foreign window nobody listens on.
    let dead_port = next_base_port();
    let config = DiscoveryConfig {
        local_address: Some(IpAddr::from([127, 0, 0, 1])),
        local_port: next_base_port(),
        local_port_range: 10,
        join_timeout_ms: 1_500,
        network_timeout_ms: 3_000,
        ..DiscoveryConfig::default()
    };

    let disc = Discovery::builder(config)
        .static_addresses([format!("127.0.0.1:{dead_port}")])
        .build()
        .unwrap();
    let err = disc.start().unwrap_err();
    assert!(matches!(err, Error::Join(JoinError::Timeout { .. })));
    disc.stop();
}

#[test]
fn ping_reaches_live_members() {
    let rig = ClusterRig::launch(2);
    let a = rig.node(0);
    let b = rig.node(1);

    assert!(a.disc.ping(b.id()));
    assert!(b.disc.ping(a.id()));
    assert!(a.disc.ping(a.id()));
    assert!(!a.disc.ping(ringmesh::NodeId::random()));
}

#[test]
fn custom_event_on_single_node_is_delivered_locally() {
    let rig = ClusterRig::launch(1);
    let a = rig.node(0);

    assert_eq!(a.disc.message_worker_queue_size(), 0);
    a.disc
        .send_custom_event(bytes::Bytes::from_static(b"solo"))
        .unwrap();
    assert_until(
        Duration::from_secs(5),
        || a.events.customs() == vec![b"solo".to_vec()],
        "custom event delivered locally on a single-node cluster",
    );
    assert_eq!(a.version(), 2);
}
