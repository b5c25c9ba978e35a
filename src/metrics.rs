//! Metric helpers for `xsring`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate.

use metrics::{counter, gauge};

/// Name of the counter tracking submitted requests.
pub const REQUESTS_SUBMITTED: &str = "xsring_requests_submitted_total";
/// Name of the counter tracking responses matched to a waiting request.
pub const RESPONSES_MATCHED: &str = "xsring_responses_matched_total";
/// Name of the counter tracking discarded responses.
pub const RESPONSES_DISCARDED: &str = "xsring_responses_discarded_total";
/// Name of the counter tracking delivered watch events.
pub const WATCH_EVENTS: &str = "xsring_watch_events_total";
/// Name of the counter tracking suspend/resume cycles.
pub const SUSPEND_CYCLES: &str = "xsring_suspend_cycles_total";
/// Name of the gauge tracking live response buffers.
pub const BUFFERS_LIVE: &str = "xsring_buffers_live";

/// Why a response was dropped instead of completing a request.
#[derive(Clone, Copy)]
pub enum DiscardReason {
    /// An ignorable kind the channel never requests.
    Unsolicited,
    /// A request id no waiting request claims.
    Spurious,
    /// A payload without the shape its kind requires.
    Malformed,
}

impl DiscardReason {
    fn as_str(self) -> &'static str {
        match self {
            DiscardReason::Unsolicited => "unsolicited",
            DiscardReason::Spurious => "spurious",
            DiscardReason::Malformed => "malformed",
        }
    }
}

/// Record a request handed to the channel.
pub fn request_submitted() { counter!(REQUESTS_SUBMITTED).increment(1); }

/// Record a response matched to its request.
pub fn response_matched() { counter!(RESPONSES_MATCHED).increment(1); }

/// Record a discarded response for the given reason.
pub fn response_discarded(reason: DiscardReason) {
    counter!(RESPONSES_DISCARDED, "reason" => reason.as_str()).increment(1);
}

/// Record a watch event routed to its notifier.
pub fn watch_event() { counter!(WATCH_EVENTS).increment(1); }

/// Record a completed suspend/resume cycle.
pub fn suspend_cycle() { counter!(SUSPEND_CYCLES).increment(1); }

/// Increment the live buffers gauge.
pub fn buffer_tracked() { gauge!(BUFFERS_LIVE).increment(1.0); }

/// Decrement the live buffers gauge.
pub fn buffer_released() { gauge!(BUFFERS_LIVE).decrement(1.0); }
