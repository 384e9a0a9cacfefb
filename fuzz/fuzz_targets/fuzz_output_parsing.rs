//! Fuzz target for everything that parses agent output or hook payloads.
//!
//! Terminal output and hook payloads come from arbitrary programs; none of
//! these paths may panic.

#![no_main]

use agentdeck::hook::parse_payload;
use agentdeck::metrics::MetricsExtractor;
use agentdeck::server::Utf8Decoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Split the input at every 7th byte to exercise partial sequences
    let mut decoder = Utf8Decoder::default();
    let mut text = String::new();
    for chunk in data.chunks(7) {
        text.push_str(&decoder.decode(chunk));
    }

    let extractor = MetricsExtractor::new("AGENT_STATUS");
    let first = extractor.extract(&text);
    // A failed scan keeps the previous snapshot
    let refreshed = extractor.refresh(first.clone(), &text);
    assert_eq!(refreshed, first.clone().or(refreshed.clone()));

    let _ = parse_payload(&text, "fuzz-session");
});
