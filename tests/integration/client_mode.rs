//! Client attachment, router traffic, and router failover.

use std::time::Duration;

use bytes::Bytes;
use ringmesh::SpiState;

use crate::fixtures::{ClusterRig, assert_until};

#[test]
fn client_attaches_through_a_router() {
    let mut rig = ClusterRig::launch(2);
    let client_idx = rig.add_client(None).unwrap();
    let client = rig.node(client_idx);
    let client_id = client.id();

    assert_eq!(client.disc.state(), SpiState::Connected);
    assert!(client.disc.local_node().client);
    assert_eq!(client.disc.local_node().discovery_port, 0);
    assert_eq!(client.version(), 3);

    assert_until(
        Duration::from_secs(5),
        || rig.nodes.iter().all(|n| n.version() == 3),
        "servers observe the client at version 3",
    );
    assert_until(
        Duration::from_secs(5),
        || {
            rig.node(0).events.joined(client_id) == 1
                && rig.node(1).events.joined(client_id) == 1
        },
        "both servers fire NODE_JOINED for the client",
    );

    // Clients do not occupy a ring position but are full topology members.
    let client = rig.nodes.last().unwrap();
    assert_eq!(client.live_ids(), rig.node(0).live_ids());
}

#[test]
fn client_custom_events_flow_through_the_router() {
    let mut rig = ClusterRig::launch(2);
    rig.add_client(None).unwrap();

    rig.nodes
        .last()
        .unwrap()
        .disc
        .send_custom_event(Bytes::from_static(b"from-client"))
        .unwrap();

    assert_until(
        Duration::from_secs(10),
        || {
            rig.nodes
                .iter()
                .all(|n| n.events.customs() == vec![b"from-client".to_vec()])
        },
        "servers and the client deliver the event once",
    );
}

#[test]
fn client_survives_router_failure() {
    let mut rig = ClusterRig::launch(2);
    rig.add_client(None).unwrap();
    let a_id = rig.node(0).id();
    let b_id = rig.node(1).id();
    let client_id = rig.nodes.last().unwrap().id();

    assert_until(
        Duration::from_secs(5),
        || rig.nodes.iter().all(|n| n.version() == 3),
        "cluster settles at version 3",
    );

    // Kill B. Whichever router the client picked, it must end up attached
    // to A with B excised and no version gaps.
    rig.crash(1);

    assert_until(
        Duration::from_secs(30),
        || {
            let a = rig.node(0);
            let client = rig.nodes.last().unwrap();
            let mut expected = vec![a_id, client_id];
            expected.sort();
            a.version() == 4
                && a.live_ids() == expected
                && client.version() == 4
                && client.live_ids() == expected
        },
        "A and the client converge on {A, client} at version 4",
    );

    let client = rig.nodes.last().unwrap();
    assert_eq!(client.disc.state(), SpiState::Connected);
    assert_until(
        Duration::from_secs(5),
        || client.events.failed(b_id) == 1,
        "the client observes NODE_FAILED(B) exactly once",
    );

    let versions: Vec<u64> = client.events.records().iter().map(|r| r.version).collect();
    for pair in versions.windows(2) {
        assert!(pair[0] <= pair[1], "client saw a version gap: {versions:?}");
    }

    // The healed pair keeps working.
    rig.node(0)
        .disc
        .send_custom_event(Bytes::from_static(b"after"))
        .unwrap();
    assert_until(
        Duration::from_secs(10),
        || {
            rig.nodes
                .last()
                .unwrap()
                .events
                .customs()
                .contains(&b"after".to_vec())
        },
        "the client still receives events after failover",
    );
}

#[test]
fn client_leave_is_graceful() {
    let mut rig = ClusterRig::launch(1);
    rig.add_client(None).unwrap();
    let client = rig.nodes.pop().unwrap();
    let client_id = client.id();

    assert_until(
        Duration::from_secs(5),
        || rig.node(0).version() == 2,
        "server observes the client join",
    );

    client.disc.stop();

    assert_until(
        Duration::from_secs(10),
        || {
            let a = rig.node(0);
            a.version() == 3 && a.live_ids() == vec![a.id()]
        },
        "server excises the departed client at version 3",
    );
    assert_eq!(rig.node(0).events.failed(client_id), 0);
    assert_until(
        Duration::from_secs(5),
        || {
            rig.node(0)
                .events
                .records()
                .iter()
                .any(|r| r.kind == "NODE_LEFT" && r.node == Some(client_id))
        },
        "server fires NODE_LEFT for the client",
    );
}
