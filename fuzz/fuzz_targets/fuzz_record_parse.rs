//! Fuzz target for submitted-record parsing.
//!
//! Any JSON the producer sends either converts into a valid `Record` or is
//! rejected with an error; conversion never panics.

#![no_main]

use chrono::Utc;
use libfuzzer_sys::fuzz_target;
use typing_sync_engine::SubmitRecord;

fuzz_target!(|data: &[u8]| {
    let Ok(submit) = serde_json::from_slice::<SubmitRecord>(data) else {
        return;
    };
    if let Ok(record) = submit.into_record(Utc::now()) {
        assert!(record.typing_time.is_finite());
        let _ = record.content_hash();
    }
});
