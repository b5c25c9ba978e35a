//! Inbound response accumulation.
//!
//! Responses arrive on the ring in arbitrarily small pieces. A single
//! reusable slot accumulates the header and then the payload, with resume
//! offsets so each drain pass continues exactly where the previous one
//! stopped. At most one response is in flight at a time; the slot is reset
//! after every delivery and across suspend/resume.

use crate::{
    codec::{HEADER_SIZE, MessageHeader, PAYLOAD_MAX, WireError},
    ring::RingReader,
};

/// Accumulation phase of the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReceivePhase {
    Header,
    Payload,
}

/// Byte count and completion signal for one receive pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ReceiveOutcome {
    /// Bytes consumed from the ring in this pass.
    pub read: usize,
    /// Header of the now fully buffered message, if one completed.
    pub message: Option<MessageHeader>,
}

/// Reusable accumulator for the single in-flight response.
pub(crate) struct ResponseSlot {
    phase: ReceivePhase,
    raw_header: [u8; HEADER_SIZE],
    filled: usize,
    expected: usize,
    header: Option<MessageHeader>,
    payload: Box<[u8; PAYLOAD_MAX]>,
}

impl ResponseSlot {
    pub(crate) fn new() -> Self {
        Self {
            phase: ReceivePhase::Header,
            raw_header: [0; HEADER_SIZE],
            filled: 0,
            expected: 0,
            header: None,
            payload: Box::new([0; PAYLOAD_MAX]),
        }
    }

    /// Pull whatever the ring holds into the slot.
    ///
    /// # Errors
    ///
    /// A header that fails validation poisons the byte stream: the caller
    /// cannot know where the next message starts, so this is unrecoverable
    /// for the channel.
    pub(crate) fn receive(&mut self, reader: &RingReader) -> Result<ReceiveOutcome, WireError> {
        let mut outcome = ReceiveOutcome::default();
        loop {
            match self.phase {
                ReceivePhase::Header => {
                    let count = reader.read(&mut self.raw_header[self.filled..]);
                    outcome.read += count;
                    self.filled += count;
                    if self.filled < HEADER_SIZE {
                        return Ok(outcome);
                    }
                    let header = MessageHeader::decode(&self.raw_header)?;
                    self.expected = header.payload_length as usize;
                    self.header = Some(header);
                    self.filled = 0;
                    self.phase = ReceivePhase::Payload;
                }
                ReceivePhase::Payload => {
                    let count = reader.read(&mut self.payload[self.filled..self.expected]);
                    outcome.read += count;
                    self.filled += count;
                    if self.filled == self.expected {
                        outcome.message = self.header;
                    }
                    return Ok(outcome);
                }
            }
        }
    }

    /// Payload of the buffered message, valid once a pass has reported a
    /// completed header.
    pub(crate) fn payload(&self) -> &[u8] { &self.payload[..self.filled.min(self.expected)] }

    /// Make the slot ready for the next message. Also used by the late
    /// suspend-recovery phase: a response interrupted by suspend is gone
    /// and must not leave half-filled state behind.
    pub(crate) fn reset(&mut self) {
        self.phase = ReceivePhase::Header;
        self.filled = 0;
        self.expected = 0;
        self.header = None;
    }
}
