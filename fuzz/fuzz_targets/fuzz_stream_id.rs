//! Fuzz target for stream ID handling.
//!
//! Comparison, timestamp extraction and lag calculation must never panic,
//! and comparison must stay antisymmetric.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;
use typing_sync_engine::stream::{calculate_lag_ms, compare_stream_ids, parse_stream_id_timestamp};

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let ab = compare_stream_ids(a, b);
    let ba = compare_stream_ids(b, a);
    match ab {
        Ordering::Less => assert!(ba == Ordering::Greater || ba == Ordering::Equal),
        Ordering::Greater => assert!(ba == Ordering::Less || ba == Ordering::Equal),
        Ordering::Equal => {}
    }

    let _ = parse_stream_id_timestamp(a);
    let _ = calculate_lag_ms(a, b);
});
