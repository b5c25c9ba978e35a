//! Tracked payload buffers.
//!
//! Response payloads are copied out of the shared page into buffers owned
//! by the caller. Each allocation carries two trailing NUL bytes so string
//! and list payloads can be walked to a guaranteed double-NUL sentinel, and
//! each is tracked in a diagnostic index until released. Release happens on
//! drop; anything still tracked when the channel is torn down is a caller
//! bug and `shutdown` treats it as fatal.

use std::{
    panic::Location,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use tracing::warn;

struct BufferRecord {
    len: usize,
    origin: &'static Location<'static>,
}

struct ArenaInner {
    entries: DashMap<u64, BufferRecord>,
    next_id: AtomicU64,
}

/// Index of live payload buffers.
pub(crate) struct BufferArena {
    inner: Arc<ArenaInner>,
}

impl BufferArena {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ArenaInner {
                entries: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Copy `payload` into a fresh tracked buffer attributed to `origin`.
    pub(crate) fn copy_out(&self, payload: &[u8], origin: &'static Location<'static>) -> StoreBuffer {
        let mut data = Vec::with_capacity(payload.len() + 2);
        data.extend_from_slice(payload);
        // Double-NUL sentinel: list payloads end at an empty entry even if
        // the peer omitted the final terminator.
        data.extend_from_slice(b"\0\0");
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.entries.insert(id, BufferRecord { len: payload.len(), origin });
        crate::metrics::buffer_tracked();
        StoreBuffer {
            data: data.into_boxed_slice(),
            payload_len: payload.len(),
            id,
            arena: Arc::clone(&self.inner),
        }
    }

    /// Number of buffers not yet released.
    pub(crate) fn outstanding(&self) -> usize { self.inner.entries.len() }

    /// Snapshot of every live buffer, for diagnostics and teardown audits.
    pub(crate) fn snapshot(&self) -> Vec<BufferSnapshot> {
        let mut entries: Vec<BufferSnapshot> = self
            .inner
            .entries
            .iter()
            .map(|entry| BufferSnapshot {
                id: *entry.key(),
                len: entry.value().len,
                origin: entry.value().origin,
            })
            .collect();
        entries.sort_by_key(|snapshot| snapshot.id);
        entries
    }
}

/// Diagnostic view of one live buffer.
#[derive(Clone, Copy, Debug)]
pub struct BufferSnapshot {
    /// Arena id, unique for the lifetime of the channel.
    pub id: u64,
    /// Payload length, excluding the sentinel bytes.
    pub len: usize,
    /// Call site the owning operation was invoked from.
    pub origin: &'static Location<'static>,
}

impl std::fmt::Display for BufferSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer {} ({} bytes) from {}", self.id, self.len, self.origin)
    }
}

/// An owned response payload.
///
/// The buffer releases its tracking record when dropped.
pub struct StoreBuffer {
    data: Box<[u8]>,
    payload_len: usize,
    id: u64,
    arena: Arc<ArenaInner>,
}

impl StoreBuffer {
    /// The payload exactly as the peer sent it, without the sentinel.
    #[must_use]
    pub fn payload(&self) -> &[u8] { &self.data[..self.payload_len] }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize { self.payload_len }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.payload_len == 0 }

    /// The payload up to its first NUL: the whole value for single-string
    /// responses.
    #[must_use]
    pub fn value(&self) -> &[u8] {
        let end = self
            .data
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(self.payload_len);
        &self.data[..end]
    }

    /// Walk a NUL-separated list payload, ending at the empty entry the
    /// sentinel guarantees.
    pub fn entries(&self) -> impl Iterator<Item = &[u8]> {
        self.data
            .split(|&byte| byte == 0)
            .take_while(|entry| !entry.is_empty())
    }
}

impl std::fmt::Debug for StoreBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBuffer")
            .field("id", &self.id)
            .field("len", &self.payload_len)
            .finish_non_exhaustive()
    }
}

impl Drop for StoreBuffer {
    fn drop(&mut self) {
        crate::metrics::buffer_released();
        if self.arena.entries.remove(&self.id).is_none() {
            // Unreachable unless the index was corrupted; never panic in drop.
            warn!(id = self.id, "released buffer had no tracking record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_detach_their_records_on_drop() {
        let arena = BufferArena::new();
        let buffer = arena.copy_out(b"suspend", Location::caller());
        assert_eq!(arena.outstanding(), 1);
        assert_eq!(buffer.payload(), b"suspend");
        assert_eq!(buffer.value(), b"suspend");
        drop(buffer);
        assert_eq!(arena.outstanding(), 0);
    }

    #[test]
    fn list_walk_ends_at_sentinel() {
        let arena = BufferArena::new();
        let buffer = arena.copy_out(b"vif\0vbd\0", Location::caller());
        let entries: Vec<&[u8]> = buffer.entries().collect();
        assert_eq!(entries, [b"vif".as_slice(), b"vbd".as_slice()]);
    }

    #[test]
    fn sentinel_terminates_even_without_peer_terminator() {
        let arena = BufferArena::new();
        let buffer = arena.copy_out(b"vif\0vbd", Location::caller());
        let entries: Vec<&[u8]> = buffer.entries().collect();
        assert_eq!(entries, [b"vif".as_slice(), b"vbd".as_slice()]);
    }

    #[test]
    fn snapshot_reports_origin_call_sites() {
        let arena = BufferArena::new();
        let _keep = arena.copy_out(b"backend", Location::caller());
        let snapshot = arena.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].len, 7);
        assert!(snapshot[0].origin.file().ends_with("buffer.rs"));
    }

    #[test]
    fn value_of_empty_payload_is_empty() {
        let arena = BufferArena::new();
        let buffer = arena.copy_out(b"", Location::caller());
        assert!(buffer.is_empty());
        assert_eq!(buffer.value(), b"");
        assert_eq!(buffer.entries().count(), 0);
    }
}
