//! Wire codec for store messages.
//!
//! Every message is a fixed 16-byte header followed by an opaque payload of
//! up to [`PAYLOAD_MAX`] bytes. The header is four little-endian 32-bit
//! fields with no padding: kind, request id, transaction id, payload length.
//! Outbound payloads are assembled from a short list of [`Segment`]s so the
//! path, separator, and value bytes need never be concatenated before they
//! hit the ring.

use bytes::Bytes;
use thiserror::Error;

/// Size in bytes of the fixed message header.
pub const HEADER_SIZE: usize = 16;

/// Upper bound on a message payload. The peer rejects a payload of this size
/// or larger, so preparation applies the same bound before any ring traffic.
pub const PAYLOAD_MAX: usize = 4096;

/// Upper bound on the number of payload segments in one request.
pub const MAX_SEGMENTS: usize = 8;

/// Wire-integrity failures.
///
/// These are not retryable: the affected request or response is failed
/// immediately and no ring cursor state is consumed on the decode path.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum WireError {
    /// Header kind field holds a value outside the protocol set.
    #[error("unknown message kind: {kind}")]
    UnknownKind {
        /// Raw kind value found in the header.
        kind: u32,
    },

    /// Payload length at or beyond the protocol maximum.
    #[error("payload too large: {size} bytes (limit {max})")]
    OversizedPayload {
        /// Payload size requested or advertised.
        size: usize,
        /// Exclusive upper bound.
        max: usize,
    },

    /// More payload segments than one request may carry.
    #[error("too many payload segments: {count} (limit {max})")]
    SegmentOverflow {
        /// Segments supplied.
        count: usize,
        /// Inclusive upper bound.
        max: usize,
    },
}

/// Message kinds understood by the store protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    /// Daemon debug/control channel.
    Debug = 0,
    /// List the children of a node.
    Directory = 1,
    /// Read the value of a node.
    Read = 2,
    /// Read node permissions.
    GetPerms = 3,
    /// Register a watch.
    Watch = 4,
    /// Remove a watch.
    Unwatch = 5,
    /// Open a transaction.
    TransactionStart = 6,
    /// Commit or abort a transaction.
    TransactionEnd = 7,
    /// Introduce a domain to the store.
    Introduce = 8,
    /// Release a domain.
    Release = 9,
    /// Query a domain's store path.
    GetDomainPath = 10,
    /// Write the value of a node.
    Write = 11,
    /// Create a node.
    Mkdir = 12,
    /// Delete a node and its children.
    Rm = 13,
    /// Set node permissions.
    SetPerms = 14,
    /// Unsolicited notification that a watched path changed.
    WatchEvent = 15,
    /// Failure response; payload names an errno.
    Error = 16,
    /// Query whether a domain has been introduced.
    IsDomainIntroduced = 17,
    /// Resume a domain's store connection.
    Resume = 18,
    /// Set a domain's target.
    SetTarget = 19,
    /// Restrict the connection's privileges.
    Restrict = 20,
}

impl MessageKind {
    /// Decode a raw header kind field.
    #[must_use]
    pub const fn from_wire(kind: u32) -> Option<Self> {
        Some(match kind {
            0 => Self::Debug,
            1 => Self::Directory,
            2 => Self::Read,
            3 => Self::GetPerms,
            4 => Self::Watch,
            5 => Self::Unwatch,
            6 => Self::TransactionStart,
            7 => Self::TransactionEnd,
            8 => Self::Introduce,
            9 => Self::Release,
            10 => Self::GetDomainPath,
            11 => Self::Write,
            12 => Self::Mkdir,
            13 => Self::Rm,
            14 => Self::SetPerms,
            15 => Self::WatchEvent,
            16 => Self::Error,
            17 => Self::IsDomainIntroduced,
            18 => Self::Resume,
            19 => Self::SetTarget,
            20 => Self::Restrict,
            _ => return None,
        })
    }

    /// Raw value carried in the header kind field.
    #[must_use]
    pub const fn wire(self) -> u32 { self as u32 }

    /// Administrative kinds this client never issues. A response carrying
    /// one correlates with nothing and is dropped after logging.
    #[must_use]
    pub const fn is_ignorable(self) -> bool {
        matches!(
            self,
            Self::Debug
                | Self::GetPerms
                | Self::Introduce
                | Self::Release
                | Self::GetDomainPath
                | Self::Mkdir
                | Self::SetPerms
                | Self::IsDomainIntroduced
                | Self::Resume
                | Self::SetTarget
                | Self::Restrict
        )
    }
}

/// Fixed message header shared by requests and responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    /// Operation or response kind.
    pub kind: MessageKind,
    /// Caller-chosen correlation id; zero in unsolicited watch events.
    pub request_id: u32,
    /// Transaction scope, or zero for none.
    pub transaction_id: u32,
    /// Payload byte count following the header.
    pub payload_length: u32,
}

impl MessageHeader {
    /// Serialise to the 16-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.kind.wire().to_le_bytes());
        out[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.transaction_id.to_le_bytes());
        out[12..].copy_from_slice(&self.payload_length.to_le_bytes());
        out
    }

    /// Parse and validate a 16-byte wire header.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnknownKind`] for a kind outside the protocol
    /// set and [`WireError::OversizedPayload`] for a payload length at or
    /// beyond [`PAYLOAD_MAX`].
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Result<Self, WireError> {
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let kind = word(0);
        let payload_length = word(12);
        let kind = MessageKind::from_wire(kind).ok_or(WireError::UnknownKind { kind })?;
        if payload_length as usize >= PAYLOAD_MAX {
            return Err(WireError::OversizedPayload {
                size: payload_length as usize,
                max: PAYLOAD_MAX,
            });
        }
        Ok(Self {
            kind,
            request_id: word(4),
            transaction_id: word(8),
            payload_length,
        })
    }
}

/// One piece of an outbound payload, with a resume offset so a partially
/// written segment continues exactly where the ring filled up.
#[derive(Clone, Debug)]
pub struct Segment {
    data: Bytes,
    offset: usize,
}

impl Segment {
    /// Wrap a payload piece.
    #[must_use]
    pub const fn new(data: Bytes) -> Self { Self { data, offset: 0 } }

    /// A single NUL separator/terminator byte.
    #[must_use]
    pub const fn nul() -> Self { Self::new(Bytes::from_static(b"\0")) }

    /// Total length of the piece, independent of write progress.
    #[must_use]
    pub fn len(&self) -> usize { self.data.len() }

    /// Whether the piece is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// Bytes still to be written.
    #[must_use]
    pub fn remaining(&self) -> &[u8] { &self.data[self.offset..] }

    /// Record that `count` bytes reached the ring.
    pub fn advance(&mut self, count: usize) {
        debug_assert!(self.offset + count <= self.data.len());
        self.offset += count;
    }

    /// Whether every byte of the piece has been written.
    #[must_use]
    pub fn is_done(&self) -> bool { self.offset == self.data.len() }
}

impl From<Bytes> for Segment {
    fn from(data: Bytes) -> Self { Self::new(data) }
}

/// Validate a segment list against the protocol limits and return the total
/// payload length for the header.
///
/// # Errors
///
/// Returns [`WireError::SegmentOverflow`] when more than [`MAX_SEGMENTS`]
/// pieces are supplied and [`WireError::OversizedPayload`] when the combined
/// length reaches [`PAYLOAD_MAX`]. Nothing has touched the ring at this
/// point, so a failed validation consumes no channel state.
pub fn validate_payload(segments: &[Segment]) -> Result<u32, WireError> {
    if segments.len() > MAX_SEGMENTS {
        return Err(WireError::SegmentOverflow {
            count: segments.len(),
            max: MAX_SEGMENTS,
        });
    }
    let total: usize = segments.iter().map(Segment::len).sum();
    if total >= PAYLOAD_MAX {
        return Err(WireError::OversizedPayload { size: total, max: PAYLOAD_MAX });
    }
    Ok(total as u32)
}
