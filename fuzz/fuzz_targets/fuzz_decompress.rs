//! Fuzz target for change-stream payload decoding.
//!
//! `maybe_decompress` and `Record::from_slice` must never panic on
//! arbitrary bytes pulled from a stream entry.

#![no_main]

use libfuzzer_sys::fuzz_target;
use typing_sync_engine::stream::maybe_decompress;
use typing_sync_engine::Record;

fuzz_target!(|data: &[u8]| {
    if let Ok(bytes) = maybe_decompress(data) {
        let _ = Record::from_slice(&bytes);
    }
});
