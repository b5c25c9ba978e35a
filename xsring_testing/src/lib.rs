//! Utilities for driving an [`xsring::Store`](xsring::Store) against an
//! in-process store daemon during tests.
//!
//! The harness allocates a ring page shared by the store under test and
//! [`FakeXenstored`], connects the two through a loopback doorbell line,
//! and exposes toggles for reply ordering and fault injection.
//!
//! ```rust,no_run
//! use xsring::Store;
//! use xsring_testing::StoreWorld;
//!
//! # async fn example() -> xsring::Result<()> {
//! let world = StoreWorld::new();
//! let store = Store::attach(world.platform.clone())?;
//! store.write(None, None, "control/shutdown", "suspend").await?;
//! # Ok(())
//! # }
//! ```

pub mod daemon;
pub mod logging;
pub mod loopback;
pub mod platform;
pub mod world;

pub use daemon::FakeXenstored;
pub use logging::{LoggerHandle, logger};
pub use loopback::{DoorbellLine, LoopbackDoorbell, leak_page};
pub use platform::TestPlatform;
pub use world::StoreWorld;
