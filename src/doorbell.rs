//! Doorbell signalling.
//!
//! The doorbell is the channel's only wakeup mechanism: the guest rings it
//! after producing request bytes or consuming response bytes, and the peer
//! rings it in the other direction. Signals carry no data and coalesce, so
//! a wakeup only means "look at the cursors again".

use std::io;

use async_trait::async_trait;

/// Identity of the doorbell connection, as the platform reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DoorbellPort(u32);

impl DoorbellPort {
    /// Wrap a raw port number.
    #[must_use]
    pub const fn new(port: u32) -> Self { Self(port) }

    /// Raw port number.
    #[must_use]
    pub const fn as_u32(&self) -> u32 { self.0 }
}

impl std::fmt::Display for DoorbellPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port {}", self.0)
    }
}

/// A connected doorbell.
///
/// Implementations close their underlying binding on drop. Signals are
/// fire-and-forget and edge-triggered; both directions tolerate spurious
/// wakeups because the drain loop re-reads the cursors each pass.
#[async_trait]
pub trait Doorbell: Send + Sync {
    /// Ring the peer's side. Never blocks.
    fn signal(&self);

    /// Wait for the peer to ring ours, consuming every pending signal.
    ///
    /// # Errors
    ///
    /// Fails when the doorbell binding is gone, which ends the drain task.
    async fn wait(&self) -> io::Result<()>;

    /// Re-enable inbound delivery after the connection was masked, reporting
    /// whether a signal arrived while masked. A pending signal means ring
    /// state changed unobserved and a drain pass must run.
    fn unmask(&self) -> bool;
}
