#![no_main]

use libfuzzer_sys::fuzz_target;
use storysync_core::adapter::{DocumentParser, JsonDocumentParser};
use storysync_core::fingerprint;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(epics) = JsonDocumentParser.parse_epics(text) else {
        return;
    };
    for epic in &epics {
        for entity in &epic.stories {
            let hash = fingerprint::hash(entity);
            assert_eq!(hash, fingerprint::hash(&entity.clone()));
        }
    }
    let json = serde_json::to_string(&serde_json::json!({ "epics": epics })).unwrap_or_default();
    let _ = JsonDocumentParser.parse_epics(&json);
});
