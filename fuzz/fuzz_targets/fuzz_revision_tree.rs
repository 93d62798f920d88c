//! Fuzz target for revision tree parsing.
//!
//! Leader-supplied trees are untrusted: parsing arbitrary bytes must return
//! an error rather than panic, and any tree that parses must diff cleanly
//! against itself.

#![no_main]

use follower_sync::RevisionTree;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(tree) = RevisionTree::from_json_slice(data) {
        assert!(tree.diff(&tree).is_empty());
        let _ = tree.count();
        let _ = tree.to_serialized(true);
    }
});
