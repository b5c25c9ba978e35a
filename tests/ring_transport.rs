//! Byte-ring properties exercised through the public endpoints.
//!
//! A producer/consumer pair on one leaked page runs randomised write and
//! read schedules against a position-indexed byte pattern: every byte must
//! come back exactly once, in order, and the ring must accept and yield
//! exactly the counts its occupancy allows. Deterministic boundary
//! schedules pin the wraparound cases by hand.

use proptest::prelude::*;
use rstest::rstest;
use xsring::RING_SIZE;
use xsring_testing::leak_page;

#[derive(Debug, Clone, Copy)]
enum Action {
    Write(usize),
    Read(usize),
}

/// Byte expected at absolute stream position `position`. The modulus is
/// prime and not a divisor of the ring size, so misaligned copies show up
/// as mismatches rather than coincidental repeats.
fn pattern_byte(position: u64) -> u8 {
    u8::try_from(position % 251).expect("modulus fits a byte")
}

fn run_schedule(actions: &[Action]) -> Result<(), TestCaseError> {
    let handle = leak_page(0x51de);
    let writer = handle.request_writer();
    let reader = handle.request_reader();
    let mut produced: u64 = 0;
    let mut consumed: u64 = 0;

    for action in actions {
        match *action {
            Action::Write(len) => {
                let chunk: Vec<u8> = (0..len)
                    .map(|at| pattern_byte(produced + at as u64))
                    .collect();
                let written = writer.write(&chunk);
                let space = RING_SIZE as u64 - (produced - consumed);
                prop_assert_eq!(written as u64, (len as u64).min(space));
                produced += written as u64;
            }
            Action::Read(len) => {
                let mut chunk = vec![0u8; len];
                let read = reader.read(&mut chunk);
                prop_assert_eq!(read as u64, (len as u64).min(produced - consumed));
                for (at, &byte) in chunk[..read].iter().enumerate() {
                    prop_assert_eq!(byte, pattern_byte(consumed + at as u64));
                }
                consumed += read as u64;
            }
        }
        prop_assert!(reader.pending() as u64 == produced - consumed);
    }

    // Drain whatever the schedule left behind.
    let mut tail = [0u8; 64];
    loop {
        let read = reader.read(&mut tail);
        if read == 0 {
            break;
        }
        for (at, &byte) in tail[..read].iter().enumerate() {
            prop_assert_eq!(byte, pattern_byte(consumed + at as u64));
        }
        consumed += read as u64;
    }
    prop_assert_eq!(consumed, produced);
    Ok(())
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (1usize..=200).prop_map(Action::Write),
        (1usize..=200).prop_map(Action::Read),
    ]
}

proptest! {
    #[test]
    fn interleaved_traffic_preserves_order(
        actions in proptest::collection::vec(action_strategy(), 1..80)
    ) {
        run_schedule(&actions)?;
    }
}

#[rstest]
#[case::exact_fill(vec![Action::Write(RING_SIZE), Action::Read(RING_SIZE)])]
#[case::overfill_truncates(vec![Action::Write(RING_SIZE + 100), Action::Read(RING_SIZE + 100)])]
#[case::straddles_the_boundary(vec![
    // Park both cursors five bytes short of the physical end, then push a
    // chunk that must split across the wrap.
    Action::Write(RING_SIZE - 5),
    Action::Read(RING_SIZE - 5),
    Action::Write(32),
    Action::Read(32),
])]
#[case::byte_at_a_time_across_the_seam(vec![
    Action::Write(RING_SIZE - 1),
    Action::Read(RING_SIZE - 1),
    Action::Write(1),
    Action::Write(1),
    Action::Read(1),
    Action::Read(1),
])]
fn boundary_schedules_hold(#[case] actions: Vec<Action>) {
    run_schedule(&actions).expect("boundary schedule should hold");
}
