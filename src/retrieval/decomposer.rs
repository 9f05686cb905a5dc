//! Query decomposition: splits a multi-part question into independent
//! sub-queries so each can run the full retrieval pipeline on its own intent
//! before results are merged. Grounded on `rag::query_decomposer`'s strategy
//! ladder (enumerated > multi-question > comparative > conjunction) and its
//! round-robin `merge_results`.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static CONJUNCTION_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:and also|and then|and|also|additionally|plus|as well as)\b").unwrap()
});

static QUESTION_MARK_SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\?\s+").unwrap());

static ENUMERATED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:\d+[.)]\s*|[-•]\s+)(.+)$").unwrap());

static COMPARATIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:compare|difference between|versus|vs\.?|differ from)\b").unwrap());

static BETWEEN_ENTITIES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)between\s+(.+?)\s+and\s+(.+?)(?:\s|$|\?)").unwrap());

const NON_SPLIT_PHRASES: &[&str] = &[
    "pros and cons",
    "advantages and disadvantages",
    "strengths and weaknesses",
    "terms and conditions",
    "rules and regulations",
    "search and replace",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecompositionStrategy {
    Single,
    Conjunction,
    MultiQuestion,
    Enumerated,
    Comparative,
}

#[derive(Debug, Clone)]
pub struct DecomposedQuery {
    pub sub_queries: Vec<String>,
    pub strategy: DecompositionStrategy,
}

/// Splits `query` into independent sub-queries when it carries more than one
/// intent. Queries under 5 words are never decomposed.
pub fn decompose_query(query: &str) -> DecomposedQuery {
    let query = query.trim();
    if query.split_whitespace().count() < 5 {
        return single(query);
    }

    let enumerated = extract_enumerated(query);
    if enumerated.len() >= 2 {
        return DecomposedQuery { sub_queries: enumerated, strategy: DecompositionStrategy::Enumerated };
    }

    let questions = split_on_question_marks(query);
    if questions.len() >= 2 {
        return DecomposedQuery { sub_queries: questions, strategy: DecompositionStrategy::MultiQuestion };
    }

    if let Some(comparative) = try_comparative_split(query) {
        return comparative;
    }

    if let Some(conjunction) = try_conjunction_split(query) {
        return conjunction;
    }

    single(query)
}

fn single(query: &str) -> DecomposedQuery {
    DecomposedQuery { sub_queries: vec![query.to_string()], strategy: DecompositionStrategy::Single }
}

fn extract_enumerated(query: &str) -> Vec<String> {
    ENUMERATED_RE
        .captures_iter(query)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| s.split_whitespace().count() >= 2)
        .collect()
}

fn split_on_question_marks(query: &str) -> Vec<String> {
    QUESTION_MARK_SPLIT_RE
        .split(query)
        .map(|s| {
            let s = s.trim();
            if s.is_empty() {
                String::new()
            } else if s.ends_with('?') {
                s.to_string()
            } else {
                format!("{s}?")
            }
        })
        .filter(|s| s.split_whitespace().count() >= 2)
        .collect()
}

fn try_comparative_split(query: &str) -> Option<DecomposedQuery> {
    if !COMPARATIVE_RE.is_match(query) {
        return None;
    }
    let cap = BETWEEN_ENTITIES_RE.captures(query)?;
    let entity_a = cap.get(1)?.as_str().trim().to_string();
    let entity_b = cap.get(2)?.as_str().trim().to_string();
    if entity_a.split_whitespace().count() > 5 || entity_b.split_whitespace().count() > 5 {
        return None;
    }
    Some(DecomposedQuery {
        sub_queries: vec![format!("what is {entity_a}"), format!("what is {entity_b}"), query.to_string()],
        strategy: DecompositionStrategy::Comparative,
    })
}

fn try_conjunction_split(query: &str) -> Option<DecomposedQuery> {
    let lower = query.to_lowercase();
    if NON_SPLIT_PHRASES.iter().any(|p| lower.contains(p)) {
        return None;
    }
    let parts: Vec<String> = CONJUNCTION_SPLIT_RE
        .split(query)
        .map(|p| p.trim().to_string())
        .filter(|p| p.split_whitespace().count() >= 3)
        .collect();
    if parts.len() >= 2 {
        Some(DecomposedQuery { sub_queries: parts, strategy: DecompositionStrategy::Conjunction })
    } else {
        None
    }
}

/// Round-robin interleave of per-sub-query result lists, deduplicated by
/// `id_of`; the first sub-query to surface a given id keeps it, later
/// occurrences from other sub-queries are dropped rather than re-scored.
pub fn merge_round_robin<T>(result_sets: Vec<Vec<T>>, limit: usize, id_of: impl Fn(&T) -> i64) -> Vec<T> {
    if result_sets.len() == 1 {
        let mut single = result_sets.into_iter().next().unwrap_or_default();
        single.truncate(limit);
        return single;
    }

    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    let mut iterators: Vec<std::vec::IntoIter<T>> = result_sets.into_iter().map(|v| v.into_iter()).collect();

    loop {
        let mut any_produced = false;
        for iter in iterators.iter_mut() {
            if let Some(item) = iter.next() {
                any_produced = true;
                if seen.insert(id_of(&item)) {
                    merged.push(item);
                    if merged.len() >= limit {
                        return merged;
                    }
                }
            }
        }
        if !any_produced {
            break;
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_query_not_decomposed() {
        let result = decompose_query("ISO 9001");
        assert_eq!(result.strategy, DecompositionStrategy::Single);
    }

    #[test]
    fn multi_question_splits() {
        let result = decompose_query("What does ISO 9001 require? What does EN 1366 require?");
        assert_eq!(result.strategy, DecompositionStrategy::MultiQuestion);
        assert_eq!(result.sub_queries.len(), 2);
    }

    #[test]
    fn conjunction_splits_two_independent_questions() {
        let result = decompose_query("what does section 4.2 require and what does section 5.1 require");
        assert_eq!(result.strategy, DecompositionStrategy::Conjunction);
        assert_eq!(result.sub_queries.len(), 2);
    }

    #[test]
    fn pros_and_cons_is_not_split() {
        let result = decompose_query("what are the pros and cons of this fire damper design");
        assert_eq!(result.strategy, DecompositionStrategy::Single);
    }

    #[test]
    fn comparative_between_two_entities() {
        let result = decompose_query("compare the difference between the AV-FM damper and the AV-SM damper");
        assert_eq!(result.strategy, DecompositionStrategy::Comparative);
        assert!(result.sub_queries.len() >= 2);
    }

    #[test]
    fn enumerated_items_split() {
        let result = decompose_query(
            "1. what is the rated voltage 2. what is the operating temperature 3. what is the duty cycle",
        );
        assert_eq!(result.strategy, DecompositionStrategy::Enumerated);
        assert_eq!(result.sub_queries.len(), 3);
    }

    #[test]
    fn round_robin_merge_dedups_and_interleaves() {
        let a = vec![1, 2, 3];
        let b = vec![2, 4, 5];
        let merged = merge_round_robin(vec![a, b], 10, |x| *x);
        assert_eq!(merged, vec![1, 2, 4, 3, 5]);
    }

    #[test]
    fn round_robin_merge_respects_limit() {
        let a = vec![1, 2, 3];
        let b = vec![4, 5, 6];
        let merged = merge_round_robin(vec![a, b], 3, |x| *x);
        assert_eq!(merged, vec![1, 4, 2]);
    }
}
