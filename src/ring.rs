//! Shared-page ring endpoints.
//!
//! The store peer is reached through a single page holding two
//! unidirectional byte rings (requests outbound, responses inbound) and two
//! cursor pairs. Cursors are free-running: they increase monotonically for
//! the lifetime of the channel and are reduced to a ring position by masking,
//! so the full capacity is usable and an empty ring is simply
//! `producer == consumer`.

use std::{
    cell::UnsafeCell,
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, Ordering},
};

/// Capacity in bytes of each ring. The peer uses the same constant; the mask
/// arithmetic requires it to be a power of two.
pub const RING_SIZE: usize = 1024;

const RING_MASK: u32 = RING_SIZE as u32 - 1;

/// The shared page as the peer lays it out: both rings first, then the four
/// cursors. Byte-for-byte layout is the wire contract, hence `repr(C)` and
/// the compile-time size and offset checks below.
#[repr(C)]
pub struct StoreRingPage {
    req: UnsafeCell<[u8; RING_SIZE]>,
    rsp: UnsafeCell<[u8; RING_SIZE]>,
    req_cons: AtomicU32,
    req_prod: AtomicU32,
    rsp_cons: AtomicU32,
    rsp_prod: AtomicU32,
}

const _: () = assert!(size_of::<StoreRingPage>() <= 4096);
const _: () = assert!(std::mem::offset_of!(StoreRingPage, rsp) == RING_SIZE);
const _: () = assert!(std::mem::offset_of!(StoreRingPage, req_cons) == 2 * RING_SIZE);

// SAFETY: the bytes of each ring are partitioned between producer and
// consumer by the cursor protocol; the cursors themselves are atomics. No
// two parties ever access the same byte region without an intervening
// release/acquire edge on a cursor.
unsafe impl Sync for StoreRingPage {}

impl StoreRingPage {
    /// Create a zeroed page, as the toolstack presents it before first use.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            req: UnsafeCell::new([0; RING_SIZE]),
            rsp: UnsafeCell::new([0; RING_SIZE]),
            req_cons: AtomicU32::new(0),
            req_prod: AtomicU32::new(0),
            rsp_cons: AtomicU32::new(0),
            rsp_prod: AtomicU32::new(0),
        }
    }

    fn half(&self, ring: RingDirection) -> RingHalf<'_> {
        match ring {
            RingDirection::Request => RingHalf {
                data: self.req.get().cast(),
                cons: &self.req_cons,
                prod: &self.req_prod,
            },
            RingDirection::Response => RingHalf {
                data: self.rsp.get().cast(),
                cons: &self.rsp_cons,
                prod: &self.rsp_prod,
            },
        }
    }
}

impl Default for StoreRingPage {
    fn default() -> Self { Self::new() }
}

/// Which of the two rings an endpoint operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingDirection {
    /// Guest to peer.
    Request,
    /// Peer to guest.
    Response,
}

struct RingHalf<'a> {
    data: *mut u8,
    cons: &'a AtomicU32,
    prod: &'a AtomicU32,
}

/// Borrowable view of a shared ring page plus its machine identity.
///
/// The handle is a plain copyable pointer: the party that mapped the page
/// keeps it alive for as long as any handle is in use.
#[derive(Clone, Copy, Debug)]
pub struct PageHandle {
    page: NonNull<StoreRingPage>,
    frame: u64,
}

// SAFETY: `StoreRingPage` is `Sync`; the handle adds only an immutable
// pointer and the frame number.
unsafe impl Send for PageHandle {}
// SAFETY: as above.
unsafe impl Sync for PageHandle {}

impl PageHandle {
    /// Wrap a mapped ring page.
    ///
    /// # Safety
    ///
    /// `page` must point to a live [`StoreRingPage`] that outlives every
    /// copy of the returned handle, and no party other than the guest-side
    /// channel and the store peer may touch it.
    #[must_use]
    pub const unsafe fn new(page: NonNull<StoreRingPage>, frame: u64) -> Self {
        Self { page, frame }
    }

    /// Machine frame number backing the page. Identity is asserted stable
    /// across suspend/resume.
    #[must_use]
    pub const fn frame(&self) -> u64 { self.frame }

    fn page(&self) -> &StoreRingPage {
        // SAFETY: liveness guaranteed by the `new` contract.
        unsafe { self.page.as_ref() }
    }

    /// Guest-side producer endpoint for the request ring.
    #[must_use]
    pub const fn request_writer(self) -> RingWriter {
        RingWriter { page: self, ring: RingDirection::Request }
    }

    /// Guest-side consumer endpoint for the response ring.
    #[must_use]
    pub const fn response_reader(self) -> RingReader {
        RingReader { page: self, ring: RingDirection::Response }
    }

    /// Peer-side consumer endpoint for the request ring. Used by in-process
    /// store daemons (simulators and test harnesses).
    #[must_use]
    pub const fn request_reader(self) -> RingReader {
        RingReader { page: self, ring: RingDirection::Request }
    }

    /// Peer-side producer endpoint for the response ring. Used by in-process
    /// store daemons (simulators and test harnesses).
    #[must_use]
    pub const fn response_writer(self) -> RingWriter {
        RingWriter { page: self, ring: RingDirection::Response }
    }

    /// Snapshot of all four cursors, for diagnostics.
    #[must_use]
    pub fn cursors(&self) -> RingCursors {
        let page = self.page();
        RingCursors {
            req_cons: page.req_cons.load(Ordering::Relaxed),
            req_prod: page.req_prod.load(Ordering::Relaxed),
            rsp_cons: page.rsp_cons.load(Ordering::Relaxed),
            rsp_prod: page.rsp_prod.load(Ordering::Relaxed),
        }
    }
}

/// Free-running cursor values captured at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingCursors {
    /// Request ring consumer (advanced by the peer).
    pub req_cons: u32,
    /// Request ring producer (advanced by the guest).
    pub req_prod: u32,
    /// Response ring consumer (advanced by the guest).
    pub rsp_cons: u32,
    /// Response ring producer (advanced by the peer).
    pub rsp_prod: u32,
}

impl std::fmt::Display for RingCursors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "req cons {:08x} prod {:08x}, rsp cons {:08x} prod {:08x}",
            self.req_cons, self.req_prod, self.rsp_cons, self.rsp_prod
        )
    }
}

/// Producer endpoint of one ring.
#[derive(Clone, Copy)]
pub struct RingWriter {
    page: PageHandle,
    ring: RingDirection,
}

impl RingWriter {
    /// Copy as much of `buf` as currently fits, returning the count copied.
    ///
    /// Never blocks. A short count means the ring filled; the caller retries
    /// the remainder after the consumer signals progress. A wrapping write is
    /// split at the physical end of the buffer into at most two copies.
    pub fn write(&self, buf: &[u8]) -> usize {
        let half = self.page.page().half(self.ring);
        // Pairs with the consumer's release store: its reads of any bytes we
        // are about to overwrite happened before this load.
        let cons = half.cons.load(Ordering::Acquire);
        let mut prod = half.prod.load(Ordering::Relaxed);
        let mut copied = 0;
        while copied < buf.len() {
            let available = RING_SIZE as u32 - prod.wrapping_sub(cons);
            if available == 0 {
                break;
            }
            let index = (prod & RING_MASK) as usize;
            let chunk = (buf.len() - copied)
                .min(available as usize)
                .min(RING_SIZE - index);
            // SAFETY: `[index, index + chunk)` is within the ring and owned
            // by the producer while `prod` has not been published past it.
            unsafe {
                ptr::copy_nonoverlapping(buf.as_ptr().add(copied), half.data.add(index), chunk);
            }
            prod = prod.wrapping_add(chunk as u32);
            copied += chunk;
        }
        // Publish the bytes before the new cursor value.
        half.prod.store(prod, Ordering::Release);
        copied
    }

    /// Bytes currently free in the ring.
    #[must_use]
    pub fn space(&self) -> usize {
        let half = self.page.page().half(self.ring);
        let cons = half.cons.load(Ordering::Acquire);
        let prod = half.prod.load(Ordering::Relaxed);
        RING_SIZE - prod.wrapping_sub(cons) as usize
    }
}

/// Consumer endpoint of one ring.
#[derive(Clone, Copy)]
pub struct RingReader {
    page: PageHandle,
    ring: RingDirection,
}

impl RingReader {
    /// Copy up to `buf.len()` available bytes out, returning the count read.
    ///
    /// Never blocks; zero means the ring is empty. A wrapping read is split
    /// at the physical end of the buffer into at most two copies.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let half = self.page.page().half(self.ring);
        // Pairs with the producer's release store: the bytes behind `prod`
        // are visible once this load observes it.
        let prod = half.prod.load(Ordering::Acquire);
        let mut cons = half.cons.load(Ordering::Relaxed);
        let mut copied = 0;
        while copied < buf.len() {
            let available = prod.wrapping_sub(cons);
            if available == 0 {
                break;
            }
            let index = (cons & RING_MASK) as usize;
            let chunk = (buf.len() - copied)
                .min(available as usize)
                .min(RING_SIZE - index);
            // SAFETY: `[index, index + chunk)` holds published bytes owned
            // by the consumer until `cons` is advanced past them.
            unsafe {
                ptr::copy_nonoverlapping(half.data.add(index), buf.as_mut_ptr().add(copied), chunk);
            }
            cons = cons.wrapping_add(chunk as u32);
            copied += chunk;
        }
        // Release the region for reuse by the producer.
        half.cons.store(cons, Ordering::Release);
        copied
    }

    /// Bytes currently queued in the ring.
    #[must_use]
    pub fn pending(&self) -> usize {
        let half = self.page.page().half(self.ring);
        let prod = half.prod.load(Ordering::Acquire);
        let cons = half.cons.load(Ordering::Relaxed);
        prod.wrapping_sub(cons) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_write_reports_partial_count() {
        let page = Box::new(StoreRingPage::new());
        // SAFETY: the page outlives the handles; only this test touches it.
        let handle = unsafe { PageHandle::new(NonNull::from(page.as_ref()), 0) };
        let writer = handle.request_writer();
        let reader = handle.request_reader();

        let payload = vec![0xa5u8; RING_SIZE + 100];
        assert_eq!(writer.write(&payload), RING_SIZE);
        assert_eq!(writer.write(&payload[RING_SIZE..]), 0);

        let mut out = vec![0u8; RING_SIZE];
        assert_eq!(reader.read(&mut out), RING_SIZE);
        assert_eq!(out, payload[..RING_SIZE]);
        assert_eq!(writer.write(&payload[RING_SIZE..]), 100);
    }

    #[test]
    fn wraparound_write_straddles_boundary() {
        let page = Box::new(StoreRingPage::new());
        // SAFETY: as above.
        let handle = unsafe { PageHandle::new(NonNull::from(page.as_ref()), 0) };
        let writer = handle.request_writer();
        let reader = handle.request_reader();

        // Park the cursors near the end of the physical buffer.
        let mut sink = [0u8; RING_SIZE - 8];
        assert_eq!(writer.write(&[0u8; RING_SIZE - 8]), RING_SIZE - 8);
        assert_eq!(reader.read(&mut sink), RING_SIZE - 8);

        let payload: Vec<u8> = (0u8..32).collect();
        assert_eq!(writer.write(&payload), 32);
        let mut out = vec![0u8; 32];
        assert_eq!(reader.read(&mut out), 32);
        assert_eq!(out, payload);
    }

    #[test]
    fn cursors_run_free_past_u32_boundaries() {
        let page = Box::new(StoreRingPage::new());
        page.req_cons.store(u32::MAX - 3, Ordering::Relaxed);
        page.req_prod.store(u32::MAX - 3, Ordering::Relaxed);
        // SAFETY: as above.
        let handle = unsafe { PageHandle::new(NonNull::from(page.as_ref()), 0) };
        let writer = handle.request_writer();
        let reader = handle.request_reader();

        let payload: Vec<u8> = (0u8..16).collect();
        assert_eq!(writer.write(&payload), 16);
        let mut out = vec![0u8; 16];
        assert_eq!(reader.read(&mut out), 16);
        assert_eq!(out, payload);
        assert_eq!(handle.cursors().req_prod, 12);
    }
}
