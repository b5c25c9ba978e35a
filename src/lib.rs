#![doc(html_root_url = "https://docs.rs/xsring/latest")]
//! Public API for the `xsring` library.
//!
//! This crate provides a guest-side client for the shared-ring store
//! protocol, including request correlation, watches, transactions, and
//! suspend/resume recovery over a single shared page and doorbell.

pub mod buffer;
pub mod codec;
pub mod doorbell;
pub mod error;
/// Result type alias re-exported for convenience when working with the
/// store surface.
pub use error::Result;
pub mod metrics;
pub mod platform;
mod request;
mod response;
pub mod ring;
pub mod store;
mod suspend;
pub mod transaction;
pub mod watch;

pub use buffer::{BufferSnapshot, StoreBuffer};
pub use codec::{HEADER_SIZE, MessageHeader, MessageKind, PAYLOAD_MAX, WireError};
pub use doorbell::{Doorbell, DoorbellPort};
pub use error::{PeerErrno, StoreError};
pub use metrics::{
    BUFFERS_LIVE,
    REQUESTS_SUBMITTED,
    RESPONSES_DISCARDED,
    RESPONSES_MATCHED,
    SUSPEND_CYCLES,
    WATCH_EVENTS,
};
pub use platform::Platform;
pub use ring::{PageHandle, RING_SIZE, RingCursors, StoreRingPage};
pub use store::{Diagnostics, Store};
pub use transaction::{EndStatus, Transaction, TransactionSnapshot};
pub use watch::{WatchHandle, WatchSnapshot};
