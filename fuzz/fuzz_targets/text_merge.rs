#![no_main]

use libfuzzer_sys::fuzz_target;
use storysync_core::sync::text::merge_lines;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let mut parts = text.splitn(3, '\u{0}');
    let base = parts.next().unwrap_or_default();
    let local = parts.next().unwrap_or_default();
    let remote = parts.next().unwrap_or_default();

    if let Ok(merged) = merge_lines(base, local, remote) {
        // One-sided edits must come through unchanged.
        if base == remote {
            assert_eq!(merged, local);
        }
        if base == local {
            assert_eq!(merged, remote);
        }
    }
});
