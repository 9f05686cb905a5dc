//! Citation extraction and matching. Generalized from
//! `rag::citation_validator::CitationValidator`'s regex-and-match idiom: that
//! module matches `path/to/file.ext:line` shapes against a code repository;
//! here the six shapes are filenames, `Section`/`Article`/`Clause X(.Y)*`,
//! `Page N`, and `[Source N]`, matched against retrieved document chunks
//! instead of source files.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::{ChunkId, MatchedCitation, Source};

static FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b[\w\-. ]+\.(pdf|docx?|xlsx?|pptx?|txt|md|csv)\b").unwrap());
static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bSection\s+\d+(?:\.\d+)*\b").unwrap());
static ARTICLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bArticle\s+\d+(?:\.\d+)*\b").unwrap());
static CLAUSE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bClause\s+\d+(?:\.\d+)*\b").unwrap());
static PAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bPage\s+(\d+)\b").unwrap());
static SOURCE_REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\[Source\s+(\d+)\]").unwrap());

/// Extracts every citation-shaped substring from `text`, in order of
/// appearance. Matching to a source is attempted but not required to survive.
pub fn extract_and_match(text: &str, sources: &[Source]) -> Vec<MatchedCitation> {
    let mut out = Vec::new();

    for m in FILENAME_RE.find_iter(text) {
        out.push(MatchedCitation { raw: m.as_str().to_string(), chunk_id: match_by_filename(m.as_str(), sources) });
    }
    for m in SECTION_RE.find_iter(text) {
        out.push(MatchedCitation { raw: m.as_str().to_string(), chunk_id: match_by_heading(m.as_str(), sources) });
    }
    for m in ARTICLE_RE.find_iter(text) {
        out.push(MatchedCitation { raw: m.as_str().to_string(), chunk_id: match_by_heading(m.as_str(), sources) });
    }
    for m in CLAUSE_RE.find_iter(text) {
        out.push(MatchedCitation { raw: m.as_str().to_string(), chunk_id: match_by_heading(m.as_str(), sources) });
    }
    for cap in PAGE_RE.captures_iter(text) {
        let page: Option<u32> = cap[1].parse().ok();
        out.push(MatchedCitation { raw: cap[0].to_string(), chunk_id: page.and_then(|p| match_by_page(p, sources)) });
    }
    for cap in SOURCE_REF_RE.captures_iter(text) {
        let ordinal: Option<usize> = cap[1].parse().ok();
        out.push(MatchedCitation { raw: cap[0].to_string(), chunk_id: ordinal.and_then(|n| match_by_ordinal(n, sources)) });
    }

    out
}

fn match_by_filename(needle: &str, sources: &[Source]) -> Option<ChunkId> {
    let lower = needle.to_lowercase();
    sources.iter().find(|s| lower.contains(&s.filename.to_lowercase()) || s.filename.to_lowercase().contains(&lower)).map(|s| s.chunk_id)
}

fn match_by_heading(needle: &str, sources: &[Source]) -> Option<ChunkId> {
    let lower = needle.to_lowercase();
    sources
        .iter()
        .find(|s| s.heading.as_ref().is_some_and(|h| h.to_lowercase().contains(&lower) || lower.contains(&h.to_lowercase())))
        .map(|s| s.chunk_id)
}

fn match_by_page(page: u32, sources: &[Source]) -> Option<ChunkId> {
    sources.iter().find(|s| s.page_number == Some(page)).map(|s| s.chunk_id)
}

/// `ordinal` is 1-based over the source list, as written in `[Source N]`.
fn match_by_ordinal(ordinal: usize, sources: &[Source]) -> Option<ChunkId> {
    ordinal.checked_sub(1).and_then(|i| sources.get(i)).map(|s| s.chunk_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(chunk_id: ChunkId, filename: &str, heading: Option<&str>, page: Option<u32>) -> Source {
        Source {
            chunk_id,
            document_id: 1,
            filename: filename.to_string(),
            content: String::new(),
            heading: heading.map(|h| h.to_string()),
            page_number: page,
            score: 1.0,
        }
    }

    #[test]
    fn matches_filename_citation() {
        let sources = vec![source(1, "standards.pdf", None, None)];
        let matches = extract_and_match("See standards.pdf for details.", &sources);
        assert!(matches.iter().any(|m| m.chunk_id == Some(1)));
    }

    #[test]
    fn matches_source_ordinal() {
        let sources = vec![source(10, "a.pdf", None, None), source(20, "b.pdf", None, None)];
        let matches = extract_and_match("as shown in [Source 2]", &sources);
        assert_eq!(matches[0].chunk_id, Some(20));
    }

    #[test]
    fn matches_page_reference() {
        let sources = vec![source(5, "a.pdf", None, Some(12))];
        let matches = extract_and_match("per Page 12 of the manual", &sources);
        assert_eq!(matches[0].chunk_id, Some(5));
    }

    #[test]
    fn unmatched_citation_is_recorded_not_fatal() {
        let sources = vec![source(5, "a.pdf", None, Some(12))];
        let matches = extract_and_match("per Page 99", &sources);
        assert_eq!(matches[0].chunk_id, None);
    }
}
