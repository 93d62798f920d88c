//! Fuzz target for WAL marker decoding.
//!
//! Arbitrary JSON lines must either decode or fail cleanly; transaction
//! ids of decoded markers are never empty or "0".

#![no_main]

use follower_sync::WalMarker;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for line in data.split(|b| *b == b'\n') {
        if let Ok(marker) = serde_json::from_slice::<WalMarker>(line) {
            if let Some(tid) = marker.transaction_id() {
                assert!(!tid.is_empty() && tid != "0");
            }
            let _ = marker.kind.is_data();
        }
    }
});
