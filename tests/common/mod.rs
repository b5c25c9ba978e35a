//! Shared utilities for integration tests.

// Items in this shared module may not be used by all test binaries that import it.
#![allow(
    dead_code,
    reason = "shared test utilities are not used by all test binaries"
)]

use std::{sync::Arc, time::Duration};

use tokio::sync::Notify;
use xsring::{Store, WatchHandle};
use xsring_testing::StoreWorld;

/// Attach a store to `world`, panicking on failure.
pub fn attach(world: &StoreWorld) -> Store {
    Store::attach(world.platform.clone()).expect("attach should succeed")
}

/// Register a watch and consume the immediate confirmation event, leaving
/// the notifier quiet until a real change lands.
pub async fn watch_settled(store: &Store, path: &str, notifier: &Arc<Notify>) -> WatchHandle {
    let handle = store
        .watch(None, path, Arc::clone(notifier))
        .await
        .expect("watch should register");
    tokio::time::timeout(Duration::from_secs(5), notifier.notified())
        .await
        .expect("registration fires one immediate event");
    handle
}
