//! Discovery of channel resources.
//!
//! The toolstack fixes the shared page and the doorbell identity before the
//! guest boots; the platform seam answers where they are. Both accessors
//! are re-queried during suspend recovery: the page identity must come back
//! unchanged (asserted), while the doorbell is closed and reopened from the
//! freshly reported port.

use std::{io, sync::Arc};

use crate::{
    doorbell::{Doorbell, DoorbellPort},
    ring::PageHandle,
};

/// Source of the shared page and doorbell plumbing.
pub trait Platform: Send + Sync {
    /// The shared ring page.
    fn store_page(&self) -> PageHandle;

    /// The doorbell identity.
    fn store_port(&self) -> DoorbellPort;

    /// Bind the doorbell at `port`. The binding closes when the returned
    /// handle is dropped.
    ///
    /// # Errors
    ///
    /// Fails when the port cannot be bound, which aborts channel attach or
    /// suspend recovery.
    fn open_doorbell(&self, port: DoorbellPort) -> io::Result<Arc<dyn Doorbell>>;
}
