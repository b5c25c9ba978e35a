//! In-process [`Platform`] implementation.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use xsring::{Doorbell, DoorbellPort, PageHandle, Platform};

use crate::loopback::{DoorbellLine, LoopbackDoorbell};

/// Platform handing out one leaked page and doorbells on one shared line.
///
/// Every [`open_doorbell`](Platform::open_doorbell) call returns a fresh
/// binding on the same line, so a channel that closes and reopens its
/// doorbell across suspend keeps talking to the same daemon.
pub struct TestPlatform {
    handle: PageHandle,
    port: DoorbellPort,
    line: Arc<DoorbellLine>,
    fail_next_open: AtomicBool,
}

impl TestPlatform {
    /// Wire a platform to an existing page and line.
    #[must_use]
    pub fn new(handle: PageHandle, port: DoorbellPort, line: Arc<DoorbellLine>) -> Self {
        Self {
            handle,
            port,
            line,
            fail_next_open: AtomicBool::new(false),
        }
    }

    /// Make the next [`open_doorbell`](Platform::open_doorbell) call fail,
    /// for attach and recovery failure tests.
    pub fn fail_next_open(&self) { self.fail_next_open.store(true, Ordering::Release); }

    /// The shared line, for daemon wiring and fault injection.
    #[must_use]
    pub fn line(&self) -> Arc<DoorbellLine> { Arc::clone(&self.line) }
}

impl Platform for TestPlatform {
    fn store_page(&self) -> PageHandle { self.handle }

    fn store_port(&self) -> DoorbellPort { self.port }

    fn open_doorbell(&self, _port: DoorbellPort) -> io::Result<Arc<dyn Doorbell>> {
        if self.fail_next_open.swap(false, Ordering::AcqRel) {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        Ok(Arc::new(LoopbackDoorbell::new(Arc::clone(&self.line))))
    }
}
