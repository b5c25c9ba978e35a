//! In-flight request records.
//!
//! A request is prepared off-ring (id assignment, header encoding, payload
//! validation), queued, then pushed onto the ring incrementally: the drain
//! loop may stop mid-segment whenever the ring fills and resumes from the
//! recorded offset on the next pass.

use std::panic::Location;

use bytes::Bytes;

use crate::{
    buffer::StoreBuffer,
    codec::{self, MessageHeader, MessageKind, Segment, WireError},
    ring::RingWriter,
};

/// Lifecycle of a request record.
///
/// Records move strictly forwards: `Prepared` until enqueued, `Submitted`
/// while any byte remains to be written, `Pending` once fully on the ring,
/// `Completed` when a response has been attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestState {
    /// Built and validated; not yet on any queue.
    Prepared,
    /// Queued; zero or more bytes written to the ring.
    Submitted,
    /// Fully written; awaiting the peer's response.
    Pending,
    /// Response attached; waiting for the submitter to collect it.
    Completed,
}

/// One queued request and, eventually, its outcome.
pub(crate) struct StoreRequest {
    state: RequestState,
    header: MessageHeader,
    segments: Vec<Segment>,
    index: usize,
    origin: &'static Location<'static>,
    outcome: Option<crate::error::Result<StoreBuffer>>,
}

impl StoreRequest {
    /// Build a record with the header as segment zero, ready to enqueue.
    ///
    /// # Errors
    ///
    /// Fails on payload validation (segment count, combined length) before
    /// any channel state is touched.
    pub(crate) fn prepare(
        kind: MessageKind,
        request_id: u32,
        transaction_id: u32,
        payload: Vec<Segment>,
        origin: &'static Location<'static>,
    ) -> Result<Self, WireError> {
        let payload_length = codec::validate_payload(&payload)?;
        let header = MessageHeader { kind, request_id, transaction_id, payload_length };
        let mut segments = Vec::with_capacity(payload.len() + 1);
        segments.push(Segment::new(Bytes::copy_from_slice(&header.encode())));
        segments.extend(payload);
        Ok(Self {
            state: RequestState::Prepared,
            header,
            segments,
            index: 0,
            origin,
            outcome: None,
        })
    }

    pub(crate) fn state(&self) -> RequestState { self.state }

    pub(crate) fn request_id(&self) -> u32 { self.header.request_id }

    pub(crate) fn kind(&self) -> MessageKind { self.header.kind }

    pub(crate) fn origin(&self) -> &'static Location<'static> { self.origin }

    /// Flip a prepared record to `Submitted` as it joins the send queue.
    pub(crate) fn mark_submitted(&mut self) {
        debug_assert_eq!(self.state, RequestState::Prepared);
        self.state = RequestState::Submitted;
    }

    /// Push queued bytes at the ring until it fills or the record is fully
    /// written, returning the byte count that reached the ring. When the
    /// final segment completes, the record advances to `Pending`.
    pub(crate) fn send(&mut self, writer: &RingWriter) -> usize {
        debug_assert_eq!(self.state, RequestState::Submitted);
        let mut written = 0;
        while self.index < self.segments.len() {
            let segment = &mut self.segments[self.index];
            let count = writer.write(segment.remaining());
            segment.advance(count);
            written += count;
            if !segment.is_done() {
                return written;
            }
            self.index += 1;
        }
        self.state = RequestState::Pending;
        written
    }

    /// Attach the outcome and flip to `Completed`.
    pub(crate) fn complete(&mut self, outcome: crate::error::Result<StoreBuffer>) {
        debug_assert_eq!(self.state, RequestState::Pending);
        self.state = RequestState::Completed;
        self.outcome = Some(outcome);
    }

    /// Complete with an error from any queued state. Used when a channel
    /// fault fails everything in flight at once.
    pub(crate) fn fail(&mut self, error: crate::error::StoreError) {
        debug_assert_ne!(self.state, RequestState::Prepared);
        self.state = RequestState::Completed;
        self.outcome = Some(Err(error));
    }

    /// Collect the outcome of a completed record.
    pub(crate) fn into_outcome(self) -> crate::error::Result<StoreBuffer> {
        debug_assert_eq!(self.state, RequestState::Completed);
        self.outcome
            .unwrap_or(Err(crate::error::StoreError::ChannelClosed))
    }
}

impl std::fmt::Debug for StoreRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreRequest")
            .field("state", &self.state)
            .field("kind", &self.header.kind)
            .field("request_id", &self.header.request_id)
            .field("origin", &format_args!("{}", self.origin))
            .finish_non_exhaustive()
    }
}
