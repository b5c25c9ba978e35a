//! One-call harness bundling page, doorbell line, daemon, and platform.

use std::sync::Arc;

use xsring::DoorbellPort;

use crate::{
    daemon::FakeXenstored,
    loopback::{DoorbellLine, leak_page},
    platform::TestPlatform,
};

/// A complete store world: shared page, loopback doorbell line, fake
/// daemon, and the platform a [`Store`](xsring::Store) attaches through.
pub struct StoreWorld {
    /// Platform handed to `Store::attach`.
    pub platform: Arc<TestPlatform>,
    /// The daemon pumping the peer side of the page.
    pub daemon: FakeXenstored,
}

impl StoreWorld {
    /// Stand up a fresh world.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let handle = leak_page(0x0090_b1f2);
        let line = DoorbellLine::new();
        let daemon = FakeXenstored::spawn(handle, Arc::clone(&line));
        let platform = Arc::new(TestPlatform::new(handle, DoorbellPort::new(7), line));
        Self { platform, daemon }
    }
}

impl Default for StoreWorld {
    fn default() -> Self { Self::new() }
}
