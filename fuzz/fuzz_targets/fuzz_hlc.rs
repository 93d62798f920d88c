//! Fuzz target for HLC revision decoding.
//!
//! Decoding must never panic, re-encoding a decoded value must give it
//! back, and the `(len, bytes)` order of encodings must match the numeric
//! order.

#![no_main]

use follower_sync::RevisionId;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (&str, u64, u64)| {
    let (raw, a, b) = data;

    if let Some(rev) = RevisionId::from_hlc(raw) {
        assert_eq!(RevisionId::from_hlc(&rev.to_hlc()), Some(rev));
    }

    let (ea, eb) = (RevisionId::new(a).to_hlc(), RevisionId::new(b).to_hlc());
    assert_eq!(RevisionId::from_hlc(&ea), Some(RevisionId::new(a)));
    assert_eq!((ea.len(), ea.as_bytes()).cmp(&(eb.len(), eb.as_bytes())), a.cmp(&b));
});
