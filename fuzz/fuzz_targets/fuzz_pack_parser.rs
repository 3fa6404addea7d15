//! Fuzz target for pack decoding and delta application.
//!
//! Arbitrary input must be rejected with an error, never a panic, and a
//! rejected pack must leave the store empty.

#![no_main]

use cairn_git::{apply_delta, PackParser};
use cairn_storage::{MemoryStore, ObjectStore};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let store = MemoryStore::new();
    if PackParser::new(data).parse(&store).is_err() {
        assert_eq!(store.len().unwrap(), 0);
    }

    // First byte picks the split between base and delta.
    if let Some((&split, rest)) = data.split_first() {
        let at = (split as usize).min(rest.len());
        let (base, delta) = rest.split_at(at);
        let _ = apply_delta(base, delta);
    }
});
