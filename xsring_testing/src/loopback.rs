//! Loopback doorbell plumbing and page allocation.
//!
//! A [`DoorbellLine`] stands in for the event channel between the guest and
//! the store service: each side rings the other through a pair of
//! [`Notify`] handles, with mask and sever states to model delivery
//! suppression and a lost binding.

use std::{
    io,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::Notify;
use xsring::{Doorbell, PageHandle, StoreRingPage};

/// Allocate a ring page that lives for the rest of the process.
///
/// Tests are short-lived processes; leaking keeps every [`PageHandle`]
/// valid without tying the page's lifetime to harness drop order.
#[must_use]
pub fn leak_page(frame: u64) -> PageHandle {
    let page: &'static StoreRingPage = Box::leak(Box::new(StoreRingPage::new()));
    // SAFETY: the page is leaked, so it outlives every copy of the handle,
    // and only the channel under test and the fake daemon touch it.
    unsafe { PageHandle::new(NonNull::from(page), frame) }
}

/// Shared wire between the guest-side doorbell and the daemon pump.
pub struct DoorbellLine {
    to_daemon: Notify,
    to_guest: Notify,
    masked: AtomicBool,
    pending: AtomicBool,
    severed: AtomicBool,
}

impl DoorbellLine {
    /// A fresh line. Guest-bound delivery starts masked, as a real binding
    /// does before the channel unmasks it.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            to_daemon: Notify::new(),
            to_guest: Notify::new(),
            masked: AtomicBool::new(true),
            pending: AtomicBool::new(false),
            severed: AtomicBool::new(false),
        })
    }

    /// Daemon-side kick: wake the guest, or latch the edge while masked.
    pub fn ring_guest(&self) {
        if self.masked.load(Ordering::Acquire) {
            self.pending.store(true, Ordering::Release);
        } else {
            self.to_guest.notify_one();
        }
    }

    /// Guest-side kick: wake the daemon pump.
    pub fn ring_daemon(&self) { self.to_daemon.notify_one(); }

    /// Park the daemon pump until the next guest-side kick.
    pub async fn daemon_notified(&self) { self.to_daemon.notified().await; }

    /// Drop the binding: current and future guest waits fail until the
    /// line is [`restore`](Self::restore)d.
    pub fn sever(&self) {
        self.severed.store(true, Ordering::Release);
        self.to_guest.notify_waiters();
    }

    /// Undo [`sever`](Self::sever) so a reopened doorbell works again.
    pub fn restore(&self) { self.severed.store(false, Ordering::Release); }
}

/// Guest-side doorbell bound to a [`DoorbellLine`].
pub struct LoopbackDoorbell {
    line: Arc<DoorbellLine>,
}

impl LoopbackDoorbell {
    /// Bind a doorbell to `line`.
    #[must_use]
    pub fn new(line: Arc<DoorbellLine>) -> Self { Self { line } }
}

#[async_trait]
impl Doorbell for LoopbackDoorbell {
    fn signal(&self) { self.line.ring_daemon(); }

    async fn wait(&self) -> io::Result<()> {
        if self.line.severed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.line.to_guest.notified().await;
        if self.line.severed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        Ok(())
    }

    fn unmask(&self) -> bool {
        self.line.masked.store(false, Ordering::Release);
        self.line.pending.swap(false, Ordering::AcqRel)
    }
}
