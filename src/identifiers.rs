//! Structured-token detection shared by `GraphBuilder` (extraction hints),
//! `HybridRetriever` (identifier-boost routing), and `Reasoner` (synthesis
//! follow-up identifier scan). One regex family, one place to keep it in
//! sync, following the `LazyLock<Regex>` module-static idiom used throughout
//! `rag::query_decomposer`.

use regex::Regex;
use std::sync::LazyLock;

static STANDARD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(ISO|EN|IEC|MIL-STD|ASTM|IEEE|NIST|AS|BS|UNE|NTP|ANSI|DIN|JIS|NF)[\s-]?\d{2,6}(?:[-./]\d{1,4})?\b",
    )
    .unwrap()
});

static PART_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:P/?N:?\s*)?[A-Z]{1,3}-?\d{3,6}\b").unwrap());

static REVISION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bRev\.?\s*[A-Z0-9]{1,5}\b").unwrap());

static IPV4_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());

static MODEL_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z]{2,4}-[A-Z]{1,4}\b").unwrap());

static VOLTAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b\d+(?:\.\d+)?\s*V(?:AC|DC)?\b").unwrap());

static MEASUREMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b\d+(?:\.\d+)?\s*(?:PSIG|dB|mm|kPa|MPa|Hz|kHz|MHz|GHz|°C|°F)\b").unwrap()
});

const PATTERNS: &[&LazyLock<Regex>] = &[
    &STANDARD_RE,
    &PART_NUMBER_RE,
    &REVISION_RE,
    &IPV4_RE,
    &MODEL_NUMBER_RE,
    &VOLTAGE_RE,
    &MEASUREMENT_RE,
];

/// All identifier-shaped substrings found in `text`, in order of appearance,
/// deduplicated by exact match.
pub fn extract(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for pattern in PATTERNS {
        for m in pattern.find_iter(text) {
            let s = m.as_str().to_string();
            if seen.insert(s.clone()) {
                out.push(s);
            }
        }
    }
    out
}

/// True if `text` contains at least one identifier-shaped substring.
/// Used for the retriever's identifier-boost routing decision.
pub fn contains_identifier(text: &str) -> bool {
    PATTERNS.iter().any(|p| p.is_match(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_standard_with_part() {
        let hits = extract("The AV-FM damper complies with EN 1366-2. Part number E1375.");
        assert!(hits.iter().any(|h| h.to_uppercase().contains("EN")));
    }

    #[test]
    fn detects_ipv4() {
        assert!(contains_identifier("connect to 192.168.1.1 for diagnostics"));
    }

    #[test]
    fn no_false_positive_on_plain_prose() {
        assert!(!contains_identifier("the quick brown fox jumps over the lazy dog"));
    }

    #[test]
    fn dedups_repeated_hits() {
        let hits = extract("ISO 9001 requires ISO 9001 compliance");
        assert_eq!(hits.iter().filter(|h| h.to_uppercase().contains("9001")).count(), 1);
    }
}
