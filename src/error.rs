//! Error types for store operations.
//!
//! Failures fall into distinct categories with different handling: wire
//! integrity problems fail the affected message immediately; peer-reported
//! errors arrive as an `Error` response naming an errno and surface as
//! typed variants; spurious traffic never reaches callers (it is logged and
//! absorbed by the demultiplexer); leaked records at teardown are fatal.

use std::io;

use thiserror::Error;

use crate::codec::WireError;

/// Errno names the peer may report, as the protocol's fixed table defines
/// them. The wire form is the textual name, matched exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PeerErrno {
    /// Invalid argument.
    Inval,
    /// Permission denied.
    Acces,
    /// Node already exists.
    Exist,
    /// Node is a directory.
    Isdir,
    /// No such node.
    Noent,
    /// Out of memory.
    Nomem,
    /// No space for the node or value.
    Nospc,
    /// Input/output error.
    Io,
    /// Directory not empty.
    Notempty,
    /// Operation not implemented.
    Nosys,
    /// Store is read-only.
    Rofs,
    /// Node is busy.
    Busy,
    /// Transaction conflicted; retry from the start.
    Again,
    /// Connection already established.
    Isconn,
}

impl PeerErrno {
    /// Parse the textual errno name from an `Error` response payload.
    #[must_use]
    pub fn from_wire_name(name: &str) -> Option<Self> {
        Some(match name {
            "EINVAL" => Self::Inval,
            "EACCES" => Self::Acces,
            "EEXIST" => Self::Exist,
            "EISDIR" => Self::Isdir,
            "ENOENT" => Self::Noent,
            "ENOMEM" => Self::Nomem,
            "ENOSPC" => Self::Nospc,
            "EIO" => Self::Io,
            "ENOTEMPTY" => Self::Notempty,
            "ENOSYS" => Self::Nosys,
            "EROFS" => Self::Rofs,
            "EBUSY" => Self::Busy,
            "EAGAIN" => Self::Again,
            "EISCONN" => Self::Isconn,
            _ => return None,
        })
    }

    /// Wire spelling of the errno name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inval => "EINVAL",
            Self::Acces => "EACCES",
            Self::Exist => "EEXIST",
            Self::Isdir => "EISDIR",
            Self::Noent => "ENOENT",
            Self::Nomem => "ENOMEM",
            Self::Nospc => "ENOSPC",
            Self::Io => "EIO",
            Self::Notempty => "ENOTEMPTY",
            Self::Nosys => "ENOSYS",
            Self::Rofs => "EROFS",
            Self::Busy => "EBUSY",
            Self::Again => "EAGAIN",
            Self::Isconn => "EISCONN",
        }
    }
}

impl std::fmt::Display for PeerErrno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error type for store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Wire-integrity failure while preparing a request or decoding a
    /// response header.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The peer rejected the request with an errno from the protocol table.
    #[error("peer reported {0}")]
    Peer(PeerErrno),

    /// The peer rejected the request with an errno name outside the
    /// protocol table.
    #[error("peer reported unrecognised error {name:?}")]
    UnknownPeerError {
        /// Name as it appeared in the response payload.
        name: String,
    },

    /// A response payload did not have the shape the operation requires.
    #[error("malformed {context} response payload")]
    MalformedPayload {
        /// Operation whose reply was unusable.
        context: &'static str,
    },

    /// The supplied transaction was invalidated by a suspend/resume cycle
    /// before the request was prepared.
    #[error("transaction is no longer active")]
    TransactionInactive,

    /// The supplied handle does not name a live registration. Returned by a
    /// repeated unsubscribe, which is rejected rather than double-freeing.
    #[error("handle does not name a live registration")]
    BadHandle,

    /// The watch id space is exhausted; every id is held by a live
    /// registration.
    #[error("watch table is full")]
    WatchTableFull,

    /// The channel is shutting down and accepts no further requests.
    #[error("store channel is shut down")]
    ChannelClosed,

    /// Doorbell or page plumbing failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Whether this failure is the peer's transaction-conflict signal, which
    /// callers resolve by retrying the whole transaction.
    #[must_use]
    pub const fn is_retry(&self) -> bool { matches!(self, Self::Peer(PeerErrno::Again)) }
}

/// Result alias used throughout the store surface.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_table_round_trips_names() {
        for errno in [
            PeerErrno::Inval,
            PeerErrno::Acces,
            PeerErrno::Exist,
            PeerErrno::Isdir,
            PeerErrno::Noent,
            PeerErrno::Nomem,
            PeerErrno::Nospc,
            PeerErrno::Io,
            PeerErrno::Notempty,
            PeerErrno::Nosys,
            PeerErrno::Rofs,
            PeerErrno::Busy,
            PeerErrno::Again,
            PeerErrno::Isconn,
        ] {
            assert_eq!(PeerErrno::from_wire_name(errno.as_str()), Some(errno));
        }
        assert_eq!(PeerErrno::from_wire_name("EWOULDBLOCK"), None);
    }

    #[test]
    fn retry_signal_is_eagain_only() {
        assert!(StoreError::Peer(PeerErrno::Again).is_retry());
        assert!(!StoreError::Peer(PeerErrno::Busy).is_retry());
        assert!(!StoreError::TransactionInactive.is_retry());
    }
}
