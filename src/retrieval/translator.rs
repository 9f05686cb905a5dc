//! Cross-language term expansion cache. Process-wide, guarded by a
//! reader-writer lock per the corpus-language translator design; a term is
//! translated into a given target language at most once per engine lifetime.
//! Grounded on the `parking_lot::RwLock`-guarded cache idiom used for the
//! teacher's model-registry singletons.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::llm::{ChatModel, ChatRequest};

pub struct Translator {
    chat: Option<Arc<dyn ChatModel>>,
    cache: RwLock<HashMap<(String, String), Vec<String>>>,
}

impl Translator {
    pub fn new(chat: Option<Arc<dyn ChatModel>>) -> Self {
        Self { chat, cache: RwLock::new(HashMap::new()) }
    }

    /// Expanded forms (singular, plural, common synonyms) of `term` in
    /// `language`. Returns an empty vec if no chat model is configured or the
    /// model's response could not be parsed — translation is best-effort and
    /// never fails the caller.
    pub async fn expand(&self, term: &str, language: &str) -> Vec<String> {
        if language.eq_ignore_ascii_case("english") {
            return Vec::new();
        }

        let key = (term.to_lowercase(), language.to_lowercase());
        if let Some(cached) = self.cache.read().get(&key) {
            return cached.clone();
        }

        let Some(chat) = &self.chat else {
            return Vec::new();
        };

        let expansions = match request_expansion(chat.as_ref(), term, language).await {
            Some(v) => v,
            None => {
                debug!(term, language, "translation unavailable or unparseable, skipping");
                Vec::new()
            }
        };

        self.cache.write().insert(key, expansions.clone());
        expansions
    }

    /// Expands `term` across every non-English language in the corpus,
    /// deduplicated.
    pub async fn expand_all(&self, term: &str, languages: &[String]) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for language in languages {
            for expansion in self.expand(term, language).await {
                if seen.insert(expansion.clone()) {
                    out.push(expansion);
                }
            }
        }
        out
    }
}

async fn request_expansion(chat: &dyn ChatModel, term: &str, language: &str) -> Option<Vec<String>> {
    let system = "Translate the given English term into the target language. Respond with a single JSON object \
                  {\"forms\": [string, ...]} listing the singular form, plural form, and common synonyms in the \
                  target language. Respond with JSON only.";
    let user = format!("Term: {term}\nTarget language: {language}");
    let req = ChatRequest::new(system, &user, 0.0).json_mode();

    let resp = chat.chat(&req).await.ok()?;
    let content = resp.content.trim();
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }

    #[derive(serde::Deserialize)]
    struct Forms {
        forms: Vec<String>,
    }
    let parsed: Forms = serde_json::from_str(&content[start..=end]).ok()?;
    Some(parsed.forms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_is_never_expanded_without_a_call() {
        let translator = Translator::new(None);
        let result = tokio_test_block_on(translator.expand("standard", "english"));
        assert!(result.is_empty());
    }

    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
    }
}
