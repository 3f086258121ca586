//! Golden-test normalisation.
//!
//! Rendered artefacts are deterministic except for explicitly volatile
//! metadata: the generation timestamp and the per-artefact UUID. The golden
//! harness replaces those with `<TS>` and `<UUID>` before comparing against a
//! stored golden.

use std::sync::OnceLock;

use regex::Regex;

fn timestamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})")
            .expect("timestamp pattern compiles")
    })
}

fn uuid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
            .expect("uuid pattern compiles")
    })
}

/// Replaces volatile metadata with stable markers.
#[must_use]
pub fn normalize_volatile(text: &str) -> String {
    let text = timestamp_pattern().replace_all(text, "<TS>");
    uuid_pattern().replace_all(&text, "<UUID>").into_owned()
}
