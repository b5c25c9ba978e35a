//! Tests for `xsring` metrics helpers.
//!
//! These tests verify that counters and gauges update as expected using
//! `metrics_util::debugging::DebuggingRecorder`.
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use rstest::rstest;
use xsring::metrics::DiscardReason;

/// Creates a debugging recorder and snapshotter for metrics testing.
fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

#[test]
fn request_metric_increments() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        xsring::metrics::request_submitted();
    });

    assert_counter_eq(&snapshotter, xsring::metrics::REQUESTS_SUBMITTED, 1);
}

#[test]
fn matched_response_metric_increments() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        xsring::metrics::response_matched();
    });

    assert_counter_eq(&snapshotter, xsring::metrics::RESPONSES_MATCHED, 1);
}

#[rstest]
#[case::unsolicited(DiscardReason::Unsolicited, "unsolicited")]
#[case::spurious(DiscardReason::Spurious, "spurious")]
#[case::malformed(DiscardReason::Malformed, "malformed")]
fn discard_metric_carries_its_reason(#[case] reason: DiscardReason, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        xsring::metrics::response_discarded(reason);
    });

    let metrics = snapshotter.snapshot().into_vec();
    let found = metrics.iter().any(|(k, _, _, v)| {
        k.key().name() == xsring::metrics::RESPONSES_DISCARDED
            && k.key()
                .labels()
                .any(|l| l.key() == "reason" && l.value() == label)
            && matches!(v, DebugValue::Counter(c) if *c > 0)
    });
    assert!(found, "discard metric with reason {label} not recorded");
}

#[test]
fn watch_event_metric_increments() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        xsring::metrics::watch_event();
    });

    assert_counter_eq(&snapshotter, xsring::metrics::WATCH_EVENTS, 1);
}

#[rstest]
#[case(1)]
#[case(2)]
fn suspend_cycle_metric_counts(#[case] expected: u64) {
    // Arrange
    let (snapshotter, recorder) = debugging_recorder_setup();

    // Act
    metrics::with_local_recorder(&recorder, || {
        (0..expected).for_each(|_| xsring::metrics::suspend_cycle());
    });

    // Assert
    assert_counter_eq(&snapshotter, xsring::metrics::SUSPEND_CYCLES, expected);
}

#[test]
fn buffer_gauge_tracks_live_buffers() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        xsring::metrics::buffer_tracked();
        xsring::metrics::buffer_tracked();
        xsring::metrics::buffer_released();
    });

    let metrics = snapshotter.snapshot().into_vec();
    let found = metrics.iter().any(|(k, _, _, v)| {
        k.key().name() == xsring::metrics::BUFFERS_LIVE
            && matches!(v, DebugValue::Gauge(g) if (g.0 - 1.0).abs() < f64::EPSILON)
    });
    assert!(found, "buffers gauge should settle at one live buffer");
}

fn assert_counter_eq(snapshotter: &Snapshotter, name: &str, expected: u64) {
    let metrics = snapshotter.snapshot().into_vec();
    assert!(
        metrics.iter().any(|(key, _, _, value)| {
            key.key().name() == name && matches!(value, DebugValue::Counter(c) if *c == expected)
        }),
        "expected {name} == {expected}, got {metrics:#?}"
    );
}
