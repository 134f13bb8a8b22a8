//! Custom events: total order and version stamping.

use std::time::Duration;

use bytes::Bytes;

use crate::fixtures::{ClusterRig, assert_until};

#[test]
fn custom_events_reach_every_member_once() {
    let rig = ClusterRig::launch(3);

    assert_until(
        Duration::from_secs(5),
        || rig.nodes.iter().all(|n| n.version() == 3),
        "cluster settles at version 3",
    );

    rig.node(0)
        .disc
        .send_custom_event(Bytes::from_static(b"one"))
        .unwrap();

    assert_until(
        Duration::from_secs(10),
        || {
            rig.nodes
                .iter()
                .all(|n| n.events.customs() == vec![b"one".to_vec()])
        },
        "every node delivers the event exactly once",
    );
    assert!(rig.nodes.iter().all(|n| n.version() == 4));
}

#[test]
fn events_from_different_senders_share_one_order() {
    let rig = ClusterRig::launch(3);

    assert_until(
        Duration::from_secs(5),
        || rig.nodes.iter().all(|n| n.version() == 3),
        "cluster settles at version 3",
    );

    // Non-coordinator senders wrap their payloads and the coordinator
    // re-emits; every node must observe the same sequence.
    rig.node(1)
        .disc
        .send_custom_event(Bytes::from_static(b"from-b"))
        .unwrap();
    rig.node(2)
        .disc
        .send_custom_event(Bytes::from_static(b"from-c"))
        .unwrap();
    rig.node(0)
        .disc
        .send_custom_event(Bytes::from_static(b"from-a"))
        .unwrap();

    assert_until(
        Duration::from_secs(10),
        || rig.nodes.iter().all(|n| n.events.customs().len() == 3),
        "every node delivers all three events",
    );

    let reference = rig.node(0).events.customs();
    for node in &rig.nodes[1..] {
        assert_eq!(node.events.customs(), reference);
    }
    // One version per event, strictly increasing at every observer.
    for node in &rig.nodes {
        let versions: Vec<u64> = node
            .events
            .records()
            .iter()
            .filter(|r| r.kind == "CUSTOM")
            .map(|r| r.version)
            .collect();
        let mut sorted = versions.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(versions, sorted);
        assert_eq!(versions.last(), Some(&6));
    }
}

#[test]
fn snapshot_versions_never_regress() {
    let rig = ClusterRig::launch(2);

    for i in 0..5u8 {
        rig.node((i % 2) as usize)
            .disc
            .send_custom_event(Bytes::from(vec![i]))
            .unwrap();
    }

    assert_until(
        Duration::from_secs(10),
        || rig.nodes.iter().all(|n| n.events.customs().len() == 5),
        "all five events arrive everywhere",
    );

    for node in &rig.nodes {
        let versions: Vec<u64> = node.events.records().iter().map(|r| r.version).collect();
        for pair in versions.windows(2) {
            assert!(pair[0] <= pair[1], "version regressed: {versions:?}");
        }
    }
}
