//! Failure detection, coordinator hand-off, and pending-log replay.

use std::time::Duration;

use ringmesh::SpiState;

use crate::fixtures::{ClusterRig, assert_until};

#[test]
fn coordinator_crash_promotes_the_next_node() {
    let rig = ClusterRig::launch(3);
    let a_id = rig.node(0).id();
    let b_id = rig.node(1).id();
    let c_id = rig.node(2).id();

    assert_until(
        Duration::from_secs(5),
        || rig.nodes.iter().all(|n| n.version() == 3),
        "cluster settles at version 3",
    );

    rig.crash(0);

    let survivors = {
        let mut ids = vec![b_id, c_id];
        ids.sort();
        ids
    };
    assert_until(
        Duration::from_secs(15),
        || {
            rig.node(1).version() == 4
                && rig.node(2).version() == 4
                && rig.node(1).live_ids() == survivors
                && rig.node(2).live_ids() == survivors
        },
        "survivors observe {B,C} at version 4",
    );

    // The next-order node discovers its role from the failure message
    // alone.
    assert_eq!(rig.node(1).disc.coordinator(), Some(b_id));
    assert_eq!(rig.node(2).disc.coordinator(), Some(b_id));
    assert_until(
        Duration::from_secs(5),
        || rig.node(1).events.failed(a_id) == 1 && rig.node(2).events.failed(a_id) == 1,
        "EVT_NODE_FAILED(A) fired once on each survivor",
    );
}

#[test]
fn middle_node_crash_keeps_event_order_identical() {
    let rig = ClusterRig::launch(3);
    let a = rig.node(0);
    let c_id = rig.node(2).id();

    assert_until(
        Duration::from_secs(5),
        || rig.nodes.iter().all(|n| n.version() == 3),
        "cluster settles at version 3",
    );

    // An in-flight custom event racing a member death.
    a.disc
        .send_custom_event(bytes::Bytes::from_static(b"race"))
        .unwrap();
    rig.crash(2);

    assert_until(
        Duration::from_secs(15),
        || {
            let a = rig.node(0);
            let b = rig.node(1);
            a.events.failed(c_id) == 1
                && b.events.failed(c_id) == 1
                && a.events.customs().len() == 1
                && b.events.customs().len() == 1
        },
        "survivors deliver the event once and fail C once",
    );

    // Identical (kind, version) order at both survivors from the moment
    // the race began.
    let a_order = rig.node(0).events.ordered_from(4);
    let b_order = rig.node(1).events.ordered_from(4);
    assert_eq!(a_order, b_order);
}

#[test]
fn forced_failure_excises_a_live_node() {
    let rig = ClusterRig::launch(2);
    let a = rig.node(0);
    let b = rig.node(1);
    let b_id = b.id();

    a.disc.fail_node(b_id).unwrap();

    assert_until(
        Duration::from_secs(10),
        || {
            let a = rig.node(0);
            a.version() == 3 && a.live_ids() == vec![a.id()]
        },
        "A excises B at version 3",
    );
    // The excised node is told directly and segments.
    assert_until(
        Duration::from_secs(10),
        || rig.node(1).events.saw("SEGMENTED"),
        "B observes its own segmentation",
    );
}

#[test]
fn forced_neighbor_skip_replays_without_duplicates() {
    let rig = ClusterRig::launch(3);
    let a = rig.node(0);
    let b_id = rig.node(1).id();

    assert_until(
        Duration::from_secs(5),
        || rig.nodes.iter().all(|n| n.version() == 3),
        "cluster settles at version 3",
    );

    // Skip B on the next send: the writer must jump to C and replay its
    // pending log there.
    a.disc.test_hooks().unwrap().force_next_node_failure();
    a.disc
        .send_custom_event(bytes::Bytes::from_static(b"skip"))
        .unwrap();

    assert_until(
        Duration::from_secs(15),
        || {
            let a = rig.node(0);
            let c = rig.node(2);
            a.events.failed(b_id) == 1
                && c.events.failed(b_id) == 1
                && c.events.customs() == vec![b"skip".to_vec()]
        },
        "C receives the event exactly once and B is declared failed",
    );
    let survivors = {
        let mut ids = vec![rig.node(0).id(), rig.node(2).id()];
        ids.sort();
        ids
    };
    assert_eq!(rig.node(0).live_ids(), survivors);
    assert_eq!(rig.node(2).live_ids(), survivors);
}

#[test]
fn broken_ring_connection_recovers_without_failure() {
    let rig = ClusterRig::launch(2);
    let a = rig.node(0);
    let b = rig.node(1);
    let b_id = b.id();

    a.disc.test_hooks().unwrap().break_connection();
    a.disc
        .send_custom_event(bytes::Bytes::from_static(b"again"))
        .unwrap();

    assert_until(
        Duration::from_secs(10),
        || rig.node(1).events.customs() == vec![b"again".to_vec()],
        "B receives the event exactly once after the reconnect",
    );
    // A plain reconnect is not a failure.
    assert_eq!(rig.node(0).events.failed(b_id), 0);
    assert_eq!(rig.node(1).disc.state(), SpiState::Connected);
}

#[test]
fn graceful_stop_is_a_leave_not_a_failure() {
    let mut rig = ClusterRig::launch(2);
    let b = rig.nodes.pop().unwrap();
    let b_id = b.id();
    b.disc.stop();

    assert_until(
        Duration::from_secs(10),
        || {
            let a = rig.node(0);
            a.version() == 3 && a.live_ids() == vec![a.id()]
        },
        "A observes B leaving at version 3",
    );
    let a = rig.node(0);
    assert_until(
        Duration::from_secs(5),
        || {
            a.events
                .records()
                .iter()
                .any(|r| r.kind == "NODE_LEFT" && r.node == Some(b_id))
        },
        "A fires NODE_LEFT(B)",
    );
    assert_eq!(a.events.failed(b_id), 0);
}
