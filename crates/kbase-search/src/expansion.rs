use async_trait::async_trait;
use kbase_core::KbaseResult;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use crate::config::{ExpansionConfig, ExpansionProviderKind};

/// Rewrites a query into additional related terms.
#[async_trait]
pub trait QueryExpander: Send + Sync {
    /// Returns `[query, ...additional_terms]`.
    async fn expand(&self, query: &str) -> KbaseResult<Vec<String>>;
}

/// A text-completion model, used by [`LlmQueryExpander`].
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> KbaseResult<String>;
}

/// Keep the query first, then unique terms that differ from it.
fn assemble(query: &str, candidates: impl IntoIterator<Item = String>, max_terms: usize) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(query.trim().to_lowercase());
    let mut out = vec![query.to_string()];
    for term in candidates {
        let term = term.trim();
        if term.is_empty() || !seen.insert(term.to_lowercase()) {
            continue;
        }
        out.push(term.to_string());
        if out.len() > max_terms {
            break;
        }
    }
    out
}

/// Expands words through a fixed synonym table.
pub struct RuleBasedExpander {
    synonyms: HashMap<String, Vec<String>>,
    max_terms: usize,
}

impl RuleBasedExpander {
    /// An expander with no rules.
    pub fn empty(max_terms: usize) -> Self {
        Self {
            synonyms: HashMap::new(),
            max_terms,
        }
    }

    /// Add related terms for a word. Matching is case-insensitive.
    pub fn with_synonyms<I, S>(mut self, word: &str, related: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.synonyms
            .entry(word.to_lowercase())
            .or_default()
            .extend(related.into_iter().map(Into::into));
        self
    }
}

impl Default for RuleBasedExpander {
    fn default() -> Self {
        Self::empty(5)
            .with_synonyms("bug", ["defect", "error", "issue"])
            .with_synonyms("error", ["failure", "exception"])
            .with_synonyms("config", ["configuration", "settings"])
            .with_synonyms("auth", ["authentication", "login"])
            .with_synonyms("db", ["database"])
            .with_synonyms("docs", ["documentation"])
            .with_synonyms("perf", ["performance", "latency"])
            .with_synonyms("deploy", ["release", "rollout"])
    }
}

#[async_trait]
impl QueryExpander for RuleBasedExpander {
    async fn expand(&self, query: &str) -> KbaseResult<Vec<String>> {
        let words: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        let candidates = words
            .iter()
            .filter_map(|w| self.synonyms.get(w))
            .flatten()
            .filter(|t| !words.contains(&t.to_lowercase()))
            .cloned();
        Ok(assemble(query, candidates, self.max_terms))
    }
}

/// Asks a language model for related search terms.
pub struct LlmQueryExpander {
    model: Arc<dyn LanguageModel>,
    max_terms: usize,
}

impl LlmQueryExpander {
    /// Keep at most `max_terms` of the model's suggestions.
    pub fn new(model: Arc<dyn LanguageModel>, max_terms: usize) -> Self {
        Self { model, max_terms }
    }

    fn prompt(&self, query: &str) -> String {
        format!(
            "Suggest up to {} alternative search terms or short phrases for the \
             knowledge-base query below. Answer with one term per line and nothing else.\n\n\
             Query: {query}",
            self.max_terms
        )
    }
}

fn list_marker() -> Option<&'static Regex> {
    static MARKER: OnceLock<Option<Regex>> = OnceLock::new();
    MARKER
        .get_or_init(|| Regex::new(r"^\s*(?:[-*•]+|\d+[.)])\s*").ok())
        .as_ref()
}

/// Strip list bullets, numbering and surrounding quotes from model output.
fn parse_terms(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| match list_marker() {
            Some(re) => re.replace(line, "").into_owned(),
            None => line.to_string(),
        })
        .map(|line| line.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

#[async_trait]
impl QueryExpander for LlmQueryExpander {
    async fn expand(&self, query: &str) -> KbaseResult<Vec<String>> {
        let output = self.model.complete(&self.prompt(query)).await?;
        Ok(assemble(query, parse_terms(&output), self.max_terms))
    }
}

/// Resolve the configured expander once, at startup.
pub fn expander_from_config(
    config: &ExpansionConfig,
) -> KbaseResult<Option<Arc<dyn QueryExpander>>> {
    match config.provider {
        ExpansionProviderKind::None => Ok(None),
        ExpansionProviderKind::Rules => {
            let mut rules = RuleBasedExpander::default();
            rules.max_terms = config.max_terms;
            Ok(Some(Arc::new(rules)))
        }
        #[cfg(feature = "http")]
        ExpansionProviderKind::Http => {
            let model = crate::http::HttpLanguageModel::from_config(config)?;
            Ok(Some(Arc::new(LlmQueryExpander::new(
                Arc::new(model),
                config.max_terms,
            ))))
        }
        #[cfg(not(feature = "http"))]
        ExpansionProviderKind::Http => Err(kbase_core::KbaseError::Config(
            "expansion provider 'http' requires the `http` feature".to_string(),
        )),
    }
}
