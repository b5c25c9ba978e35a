//! Response correlation under concurrency and adversarial peers.
//!
//! These tests pin the demultiplexing contract: every submitter gets the
//! reply bearing its own id, watch events reach their notifier even while
//! a reply is parked, and frames nobody asked for are absorbed without
//! harming the channel. Framing damage, by contrast, must poison it.

mod common;

use std::{sync::Arc, time::Duration};

use rstest::{fixture, rstest};
use serial_test::serial;
use tokio::{runtime::Runtime, sync::Notify, time::timeout};
use xsring::{MessageKind, StoreError, WireError};
use xsring_testing::{LoggerHandle, StoreWorld, logger};

/// Builds a single-thread [`Runtime`] for log-asserting tests.
#[fixture]
fn rt() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build test runtime")
}

#[tokio::test]
async fn concurrent_submitters_each_get_their_own_reply() {
    let world = StoreWorld::new();
    for lane in 0..8 {
        world
            .daemon
            .seed(&format!("device/vif/{lane}/mac"), &format!("00:16:3e:00:00:{lane:02}"));
    }
    let store = Arc::new(common::attach(&world));

    let mut submitters = Vec::new();
    for lane in 0..8 {
        let store = Arc::clone(&store);
        submitters.push(tokio::spawn(async move {
            let value = store
                .read(None, Some(&format!("device/vif/{lane}")), "mac")
                .await
                .expect("read should succeed");
            assert_eq!(value.value(), format!("00:16:3e:00:00:{lane:02}").as_bytes());
        }));
    }
    for submitter in submitters {
        timeout(Duration::from_secs(5), submitter)
            .await
            .expect("submitter should finish")
            .expect("submitter should not panic");
    }

    Arc::into_inner(store)
        .expect("all submitters released the store")
        .shutdown()
        .await;
}

#[tokio::test]
async fn watch_events_bypass_a_held_reply() {
    let world = StoreWorld::new();
    world.daemon.seed("device/vbd/51712/state", "4");
    let store = Arc::new(common::attach(&world));
    let notifier = Arc::new(Notify::new());
    let handle = common::watch_settled(&store, "control/shutdown", &notifier).await;

    world.daemon.hold_replies();
    let reader = tokio::spawn({
        let store = Arc::clone(&store);
        async move { store.read(None, None, "device/vbd/51712/state").await }
    });
    // Let the reader put its request on the wire and start waiting.
    tokio::time::sleep(Duration::from_millis(20)).await;

    world.daemon.write_external("control/shutdown", "poweroff");
    timeout(Duration::from_secs(5), notifier.notified())
        .await
        .expect("event should reach the notifier while the reply is parked");

    world.daemon.release_replies();
    let value = timeout(Duration::from_secs(5), reader)
        .await
        .expect("reader should finish")
        .expect("reader should not panic")
        .expect("read should succeed");
    assert_eq!(value.value(), b"4");

    drop(value);
    store.unwatch(&handle).await.expect("unwatch should succeed");
    assert_eq!(world.daemon.watch_count(), 0);
    Arc::into_inner(store)
        .expect("reader task released the store")
        .shutdown()
        .await;
}

#[rstest]
#[serial(logging)]
fn spurious_replies_are_absorbed_and_logged(rt: Runtime, mut logger: LoggerHandle) {
    rt.block_on(async {
        while logger.pop().is_some() {}
        let world = StoreWorld::new();
        world.daemon.seed("control/feature", "balloon");
        let store = common::attach(&world);

        // A reply nobody asked for, queued ahead of any real traffic.
        world
            .daemon
            .inject_frame(MessageKind::Read.wire(), 0xbeef, 0, b"stale\0");

        // The real read completes only after the injected frame went past
        // the demultiplexer, so the absorption already happened.
        let value = store
            .read(None, None, "control/feature")
            .await
            .expect("read should succeed despite the spurious frame");
        assert_eq!(value.value(), b"balloon");

        let mut found = false;
        while let Some(record) = logger.pop() {
            if record.level() == log::Level::Warn && record.args().contains("spurious response") {
                found = true;
            }
        }
        assert!(found, "spurious reply should be logged at warn");

        drop(value);
        store.shutdown().await;
    });
}

#[rstest]
#[serial(logging)]
fn unknown_kinds_poison_the_channel(rt: Runtime, mut logger: LoggerHandle) {
    rt.block_on(async {
        while logger.pop().is_some() {}
        let world = StoreWorld::new();
        world.daemon.seed("control", "up");
        let store = common::attach(&world);

        world.daemon.inject_frame(99, 0, 0, b"");

        // Whichever drain meets the bad header first, the submission path
        // must observe the fault.
        let outcome = store.read(None, None, "control").await;
        assert!(matches!(
            outcome,
            Err(StoreError::Wire(WireError::UnknownKind { kind: 99 }))
        ));

        // The fault is terminal: later submissions fail without touching
        // the wire.
        let outcome = store.write(None, None, "control", "down").await;
        assert!(matches!(outcome, Err(StoreError::Wire(_))));
        assert!(!world.daemon.kinds_seen().contains(&MessageKind::Write));

        let mut found = false;
        while let Some(record) = logger.pop() {
            if record.level() == log::Level::Warn && record.args().contains("store channel failed")
            {
                found = true;
            }
        }
        assert!(found, "channel fault should be logged at warn");
    });
}
