//! End-to-end operations against the in-process daemon.
//!
//! Each test stands up a [`StoreWorld`], attaches a store, and drives the
//! public surface over the shared ring page.

mod common;

use xsring::{MessageKind, PAYLOAD_MAX, PeerErrno, StoreError, WireError};
use xsring_testing::StoreWorld;

#[tokio::test]
async fn write_then_read_round_trips() {
    let world = StoreWorld::new();
    let store = common::attach(&world);

    store
        .write(None, None, "control/shutdown", "suspend")
        .await
        .expect("write should succeed");
    let value = store
        .read(None, None, "control/shutdown")
        .await
        .expect("read should succeed");
    assert_eq!(value.value(), b"suspend");
    assert_eq!(
        world.daemon.value("control/shutdown").as_deref(),
        Some("suspend")
    );

    drop(value);
    store.shutdown().await;
}

#[tokio::test]
async fn prefixed_paths_join_with_a_separator() {
    let world = StoreWorld::new();
    let store = common::attach(&world);

    store
        .write(None, Some("device/vif/0"), "mac", "00:16:3e:00:00:01")
        .await
        .expect("write should succeed");
    assert_eq!(
        world.daemon.value("device/vif/0/mac").as_deref(),
        Some("00:16:3e:00:00:01")
    );

    let value = store
        .read(None, Some("device/vif/0"), "mac")
        .await
        .expect("prefixed read should succeed");
    assert_eq!(value.value(), b"00:16:3e:00:00:01");
}

#[tokio::test]
async fn formatted_writes_render_before_submission() {
    let world = StoreWorld::new();
    let store = common::attach(&world);

    let channel = 4u32;
    store
        .write_fmt(
            None,
            Some("device/vif/0"),
            "event-channel",
            format_args!("{channel}"),
        )
        .await
        .expect("formatted write should succeed");
    assert_eq!(
        world.daemon.value("device/vif/0/event-channel").as_deref(),
        Some("4")
    );
}

#[tokio::test]
async fn missing_nodes_report_the_peer_errno() {
    let world = StoreWorld::new();
    let store = common::attach(&world);

    let outcome = store.read(None, None, "no/such/node").await;
    assert!(matches!(
        outcome,
        Err(StoreError::Peer(PeerErrno::Noent))
    ));
}

#[tokio::test]
async fn remove_deletes_the_subtree() {
    let world = StoreWorld::new();
    let store = common::attach(&world);
    world.daemon.seed("device/vif/0/mac", "aa");
    world.daemon.seed("device/vif/0/state", "1");

    store
        .remove(None, None, "device/vif/0")
        .await
        .expect("remove should succeed");
    assert_eq!(world.daemon.value("device/vif/0/mac"), None);
    assert_eq!(world.daemon.value("device/vif/0/state"), None);

    let outcome = store.remove(None, None, "device/vif/0").await;
    assert!(matches!(
        outcome,
        Err(StoreError::Peer(PeerErrno::Noent))
    ));
}

#[tokio::test]
async fn directory_lists_each_child_once() {
    let world = StoreWorld::new();
    let store = common::attach(&world);
    world.daemon.seed("device/vif/0", "");
    world.daemon.seed("device/vif/1", "");
    world.daemon.seed("device/vbd/51712", "");

    let listing = store
        .directory(None, None, "device")
        .await
        .expect("directory should succeed");
    let children: Vec<&[u8]> = listing.entries().collect();
    assert_eq!(children, [b"vbd".as_slice(), b"vif".as_slice()]);
}

#[tokio::test]
async fn values_larger_than_the_ring_round_trip() {
    let world = StoreWorld::new();
    let store = common::attach(&world);

    let value = "x".repeat(2000);
    store
        .write(None, None, "data/blob", &value)
        .await
        .expect("large write should succeed");
    let back = store
        .read(None, None, "data/blob")
        .await
        .expect("large read should succeed");
    assert_eq!(back.value(), value.as_bytes());
}

#[tokio::test]
async fn oversized_payloads_never_reach_the_ring() {
    let world = StoreWorld::new();
    let store = common::attach(&world);

    let value = "y".repeat(PAYLOAD_MAX);
    let outcome = store.write(None, None, "data/too-big", &value).await;
    assert!(matches!(
        outcome,
        Err(StoreError::Wire(WireError::OversizedPayload { .. }))
    ));
    // Rejected at preparation: the daemon never saw a frame.
    assert!(world.daemon.kinds_seen().is_empty());
}

#[tokio::test]
async fn diagnostics_attribute_buffers_to_their_call_sites() {
    let world = StoreWorld::new();
    let store = common::attach(&world);
    world.daemon.seed("control/platform-feature", "1");

    let kept = store
        .read(None, None, "control/platform-feature")
        .await
        .expect("read should succeed");

    let report = store.diagnostics().await;
    assert_eq!(report.suspend_cycles, 0);
    assert_eq!(report.buffers.len(), 1);
    assert!(report.buffers[0].origin.file().ends_with("store_ops.rs"));
    let rendered = report.to_string();
    assert!(rendered.contains("frame"));
    assert!(rendered.contains("store_ops.rs"));

    drop(kept);
    assert!(store.diagnostics().await.buffers.is_empty());
}

#[tokio::test]
#[should_panic(expected = "unreleased records")]
async fn leaked_buffers_fail_the_teardown_audit() {
    let world = StoreWorld::new();
    let store = common::attach(&world);
    world.daemon.seed("control/feature-balloon", "1");

    let _kept = store
        .read(None, None, "control/feature-balloon")
        .await
        .expect("read should succeed");

    // Held across teardown: the audit must name the leak and panic.
    store.shutdown().await;
}

#[tokio::test]
async fn acknowledged_kinds_echo_the_request() {
    let world = StoreWorld::new();
    let store = common::attach(&world);

    store
        .write(None, None, "control", "go")
        .await
        .expect("write should succeed");
    store.remove(None, None, "control").await.expect("remove");
    assert_eq!(
        world.daemon.kinds_seen(),
        [MessageKind::Write, MessageKind::Rm]
    );
}
