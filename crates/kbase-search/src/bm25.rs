use async_trait::async_trait;
use kbase_core::{EntryKey, EntryMeta, EntryText, KbaseResult};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::fulltext::{snippet_around, FullTextIndex, KeywordHit, KeywordPage};
use crate::types::SearchFilters;

/// BM25 parameters.
const K1: f64 = 1.2;
const B: f64 = 0.75;

/// Tokenize text into lowercase words, filtering tokens with length <= 1.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 1)
        .collect()
}

/// Parsed form of the index query grammar.
///
/// Bare words are OR-ed terms, `"..."` is a phrase, a leading `-` or a
/// preceding `NOT` excludes the next clause, `AND`/`OR` are ignored.
#[derive(Debug, Default, PartialEq)]
struct ParsedQuery {
    terms: Vec<String>,
    phrases: Vec<Vec<String>>,
    excluded_terms: Vec<String>,
    excluded_phrases: Vec<Vec<String>>,
}

impl ParsedQuery {
    fn parse(query: &str) -> Self {
        let mut parsed = ParsedQuery::default();
        let chars: Vec<char> = query.chars().collect();
        let mut i = 0;
        let mut negate_next = false;

        while i < chars.len() {
            if chars[i].is_whitespace() {
                i += 1;
                continue;
            }

            let mut negated = std::mem::take(&mut negate_next);
            if chars[i] == '-' && i + 1 < chars.len() && !chars[i + 1].is_whitespace() {
                negated = true;
                i += 1;
            }

            if chars[i] == '"' {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != '"' {
                    end += 1;
                }
                let body: String = chars[start..end].iter().collect();
                i = end + 1;
                let tokens = tokenize(&body);
                if tokens.is_empty() {
                    continue;
                }
                if negated {
                    parsed.excluded_phrases.push(tokens);
                } else {
                    parsed.phrases.push(tokens);
                }
                continue;
            }

            let start = i;
            while i < chars.len() && !chars[i].is_whitespace() {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            match word.as_str() {
                "NOT" if !negated => {
                    negate_next = true;
                    continue;
                }
                "AND" | "OR" if !negated => continue,
                _ => {}
            }
            let tokens = tokenize(&word);
            if negated {
                parsed.excluded_terms.extend(tokens);
            } else {
                parsed.terms.extend(tokens);
            }
        }
        parsed
    }

    fn has_positive_clause(&self) -> bool {
        !self.terms.is_empty() || !self.phrases.is_empty()
    }

    /// Terms used to place the snippet window.
    fn highlight_terms(&self) -> Vec<&str> {
        self.phrases
            .iter()
            .flatten()
            .chain(self.terms.iter())
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone)]
struct IndexedDoc {
    text: EntryText,
    meta: EntryMeta,
    length: f64,
    terms: HashSet<String>,
}

/// A BM25 inverted index for keyword-based document retrieval.
///
/// Maintains positional postings (for phrase matching), document length
/// statistics for the BM25 formula, and the title/summary/body-prefix and
/// filter attributes needed to return filtered rows with snippets.
#[derive(Debug, Clone, Default)]
pub struct Bm25Index {
    /// term -> (entry -> positions)
    inverted_index: HashMap<String, HashMap<EntryKey, Vec<u32>>>,
    docs: HashMap<EntryKey, IndexedDoc>,
    /// Sum of all document lengths, for the average.
    total_length: f64,
}

impl Bm25Index {
    /// Create a new, empty BM25 index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a document.
    ///
    /// Title, summary and body prefix are indexed as one token stream with a
    /// one-position gap between fields so phrases never span two fields.
    pub fn add_document(&mut self, key: EntryKey, text: EntryText, meta: EntryMeta) {
        self.remove_document(&key);

        let mut positions: HashMap<String, Vec<u32>> = HashMap::new();
        let mut pos: u32 = 0;
        for field in [&text.title, &text.summary, &text.body_prefix] {
            for token in tokenize(field) {
                positions.entry(token).or_default().push(pos);
                pos += 1;
            }
            pos += 1;
        }
        let length = positions.values().map(Vec::len).sum::<usize>() as f64;

        let terms: HashSet<String> = positions.keys().cloned().collect();
        for (term, term_positions) in positions {
            self.inverted_index
                .entry(term)
                .or_default()
                .insert(key.clone(), term_positions);
        }

        self.total_length += length;
        self.docs.insert(
            key,
            IndexedDoc {
                text,
                meta,
                length,
                terms,
            },
        );
    }

    /// Remove a document. Returns whether it was present.
    pub fn remove_document(&mut self, key: &EntryKey) -> bool {
        let Some(doc) = self.docs.remove(key) else {
            return false;
        };
        self.total_length -= doc.length;

        for term in &doc.terms {
            if let Some(postings) = self.inverted_index.get_mut(term) {
                postings.remove(key);
                if postings.is_empty() {
                    self.inverted_index.remove(term);
                }
            }
        }
        true
    }

    /// Drop every document.
    pub fn clear(&mut self) {
        self.inverted_index.clear();
        self.docs.clear();
        self.total_length = 0.0;
    }

    /// Search the index, returning up to `top_k` filtered hits sorted by
    /// descending BM25 score (ties by key) and the total number of matches.
    ///
    /// ```text
    /// score = sum over query clauses of:
    ///   IDF(t) * (tf * (k1 + 1)) / (tf + k1 * (1 - b + b * dl / avgdl))
    /// ```
    /// where `IDF(t) = ln((N - df + 0.5) / (df + 0.5) + 1.0)`. A phrase
    /// contributes the sum over its tokens with `tf` = phrase occurrences.
    pub fn search(&self, query: &str, filters: &SearchFilters, top_k: usize) -> KeywordPage {
        if self.docs.is_empty() {
            return KeywordPage::default();
        }
        let parsed = ParsedQuery::parse(query);
        if !parsed.has_positive_clause() {
            return KeywordPage::default();
        }

        let mut scores: HashMap<&EntryKey, f64> = HashMap::new();

        for term in &parsed.terms {
            if let Some(postings) = self.inverted_index.get(term) {
                let idf = self.idf(postings.len());
                for (key, positions) in postings {
                    let tf = positions.len() as f64;
                    *scores.entry(key).or_insert(0.0) += idf * self.saturate(tf, key);
                }
            }
        }

        for phrase in &parsed.phrases {
            for (key, occurrences) in self.phrase_occurrences(phrase) {
                let tf = occurrences as f64;
                let weight: f64 = phrase
                    .iter()
                    .map(|t| self.idf(self.inverted_index.get(t).map_or(0, HashMap::len)))
                    .sum();
                *scores.entry(key).or_insert(0.0) += weight * self.saturate(tf, key);
            }
        }

        let excluded = self.excluded_keys(&parsed);

        let mut ranked: Vec<(&EntryKey, f64)> = scores
            .into_iter()
            .filter(|(key, score)| *score > 0.0 && !excluded.contains(*key))
            .filter(|(key, _)| {
                self.docs
                    .get(*key)
                    .is_some_and(|doc| filters.matches(key, &doc.meta))
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });

        let total = ranked.len();
        let highlight = parsed.highlight_terms();
        let hits = ranked
            .into_iter()
            .take(top_k)
            .filter_map(|(key, score)| {
                self.docs.get(key).map(|doc| KeywordHit {
                    key: key.clone(),
                    title: doc.text.title.clone(),
                    snippet: snippet_around(&doc.text, &highlight),
                    score,
                })
            })
            .collect();

        KeywordPage { hits, total }
    }

    /// Return the number of documents currently in the index.
    pub fn document_count(&self) -> usize {
        self.docs.len()
    }

    fn avg_doc_length(&self) -> f64 {
        if self.docs.is_empty() || self.total_length <= 0.0 {
            1.0
        } else {
            self.total_length / self.docs.len() as f64
        }
    }

    /// IDF with Robertson's formula (always non-negative).
    fn idf(&self, df: usize) -> f64 {
        let n = self.docs.len() as f64;
        let df = df as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn saturate(&self, tf: f64, key: &EntryKey) -> f64 {
        let dl = self.docs.get(key).map_or(0.0, |d| d.length);
        let numerator = tf * (K1 + 1.0);
        let denominator = tf + K1 * (1.0 - B + B * dl / self.avg_doc_length());
        numerator / denominator
    }

    /// Count, per document, how often the tokens occur at consecutive positions.
    fn phrase_occurrences(&self, phrase: &[String]) -> Vec<(&EntryKey, usize)> {
        let Some(first) = phrase.first().and_then(|t| self.inverted_index.get(t)) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        'docs: for (key, starts) in first {
            let mut rest: Vec<&Vec<u32>> = Vec::with_capacity(phrase.len() - 1);
            for token in &phrase[1..] {
                match self.inverted_index.get(token).and_then(|p| p.get(key)) {
                    Some(positions) => rest.push(positions),
                    None => continue 'docs,
                }
            }
            let count = starts
                .iter()
                .filter(|&&start| {
                    rest.iter()
                        .zip(1u32..)
                        .all(|(positions, offset)| positions.binary_search(&(start + offset)).is_ok())
                })
                .count();
            if count > 0 {
                out.push((key, count));
            }
        }
        out
    }

    fn excluded_keys(&self, parsed: &ParsedQuery) -> HashSet<&EntryKey> {
        let mut excluded: HashSet<&EntryKey> = HashSet::new();
        for term in &parsed.excluded_terms {
            if let Some(postings) = self.inverted_index.get(term) {
                excluded.extend(postings.keys());
            }
        }
        for phrase in &parsed.excluded_phrases {
            excluded.extend(self.phrase_occurrences(phrase).into_iter().map(|(k, _)| k));
        }
        excluded
    }
}

/// [`FullTextIndex`] backed by an in-process [`Bm25Index`].
pub struct InMemoryFullTextIndex {
    inner: RwLock<Bm25Index>,
}

impl InMemoryFullTextIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Bm25Index::new()),
        }
    }
}

impl Default for InMemoryFullTextIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FullTextIndex for InMemoryFullTextIndex {
    async fn upsert(&self, key: EntryKey, text: EntryText, meta: EntryMeta) -> KbaseResult<()> {
        let mut index = self.inner.write().await;
        index.add_document(key, text, meta);
        Ok(())
    }

    async fn remove(&self, key: &EntryKey) -> KbaseResult<bool> {
        let mut index = self.inner.write().await;
        Ok(index.remove_document(key))
    }

    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> KbaseResult<KeywordPage> {
        let index = self.inner.read().await;
        Ok(index.search(query, filters, limit))
    }

    async fn clear(&self) -> KbaseResult<()> {
        self.inner.write().await.clear();
        Ok(())
    }

    async fn count(&self) -> KbaseResult<usize> {
        Ok(self.inner.read().await.document_count())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::fulltext::{sanitize_query, SNIPPET_CHARS};
    use chrono::Utc;

    fn key(id: &str) -> EntryKey {
        EntryKey::new(id, "docs")
    }

    fn text(title: &str, body: &str) -> EntryText {
        EntryText {
            title: title.to_string(),
            summary: String::new(),
            body_prefix: body.to_string(),
        }
    }

    fn meta() -> EntryMeta {
        EntryMeta {
            entry_type: "note".to_string(),
            tags: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    fn index_of(docs: &[(&str, &str, &str)]) -> Bm25Index {
        let mut index = Bm25Index::new();
        for (id, title, body) in docs {
            index.add_document(key(id), text(title, body), meta());
        }
        index
    }

    fn ids(page: &KeywordPage) -> Vec<String> {
        page.hits.iter().map(|h| h.key.entry_id.clone()).collect()
    }

    #[test]
    fn test_add_document_and_search_finds_it() {
        let index = index_of(&[("a", "Fox", "the quick brown fox jumps over the lazy dog")]);
        let page = index.search("quick brown fox", &SearchFilters::default(), 10);
        assert_eq!(ids(&page), vec!["a"]);
        assert!(page.hits[0].score > 0.0, "score should be positive");
        assert_eq!(page.total, 1);
    }

    #[test]
    fn test_multiple_documents_ranked_correctly() {
        let index = index_of(&[
            ("rust", "Rust", "rust is a systems programming language rust is fast rust is safe"),
            ("python", "Python", "python is a scripting programming language used for data science"),
            ("cooking", "Dinner", "cooking recipes for a delicious dinner meal"),
        ]);
        let page = index.search("rust programming", &SearchFilters::default(), 10);
        assert_eq!(ids(&page), vec!["rust", "python"]);
        assert!(page.hits[0].score > page.hits[1].score);
    }

    #[test]
    fn test_upsert_replaces_previous_version() {
        let mut index = index_of(&[("a", "Old", "legacy mainframe")]);
        index.add_document(key("a"), text("New", "modern cluster"), meta());
        assert_eq!(index.document_count(), 1);
        assert!(index.search("mainframe", &SearchFilters::default(), 10).hits.is_empty());
        assert_eq!(ids(&index.search("cluster", &SearchFilters::default(), 10)), vec!["a"]);
    }

    #[test]
    fn test_remove_document_removes_from_results() {
        let mut index = index_of(&[("a", "A", "rust programming"), ("b", "B", "python programming")]);
        assert!(index.remove_document(&key("a")));
        assert!(!index.remove_document(&key("a")));
        let page = index.search("rust programming", &SearchFilters::default(), 10);
        assert_eq!(ids(&page), vec!["b"]);
    }

    #[test]
    fn test_phrase_requires_adjacency() {
        let index = index_of(&[
            ("joined", "Team", "she was the co-founder of the company"),
            ("apart", "Team", "the founder asked a co worker"),
        ]);
        let page = index.search(&sanitize_query("co-founder"), &SearchFilters::default(), 10);
        assert_eq!(ids(&page), vec!["joined"]);
    }

    #[test]
    fn test_unsanitized_hyphen_is_exclusion() {
        let index = index_of(&[
            ("a", "Notes", "meeting notes draft"),
            ("b", "Notes", "meeting notes final"),
        ]);
        let raw = index.search("notes -draft", &SearchFilters::default(), 10);
        assert_eq!(ids(&raw), vec!["b"]);

        let safe = index.search(&sanitize_query("notes -draft"), &SearchFilters::default(), 10);
        assert_eq!(safe.total, 2, "sanitized hyphen must not exclude");
    }

    #[test]
    fn test_not_operator_and_connectives() {
        let index = index_of(&[("a", "A", "alpha beta"), ("b", "B", "alpha gamma")]);
        assert_eq!(
            ids(&index.search("alpha AND NOT beta", &SearchFilters::default(), 10)),
            vec!["b"]
        );
        assert_eq!(index.search("alpha OR beta", &SearchFilters::default(), 10).total, 2);
    }

    #[test]
    fn test_phrase_does_not_span_fields() {
        let index = index_of(&[("a", "database", "migration plan")]);
        let page = index.search("\"database migration\"", &SearchFilters::default(), 10);
        assert!(page.hits.is_empty());
    }

    #[test]
    fn test_filters_and_total() {
        let mut index = Bm25Index::new();
        for i in 0..5 {
            let collection = if i % 2 == 0 { "even" } else { "odd" };
            index.add_document(
                EntryKey::new(format!("e{i}"), collection),
                text("Doc", "shared keyword"),
                meta(),
            );
        }
        let page = index.search("keyword", &SearchFilters::default().with_collection("even"), 2);
        assert_eq!(page.total, 3);
        assert_eq!(page.hits.len(), 2);
        assert!(page.hits.iter().all(|h| h.key.collection == "even"));
    }

    #[test]
    fn test_equal_scores_break_ties_by_key() {
        let index = index_of(&[("c", "T", "same words"), ("a", "T", "same words"), ("b", "T", "same words")]);
        let page = index.search("same", &SearchFilters::default(), 10);
        assert_eq!(ids(&page), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_snippet_centres_on_match_and_omits_body_beyond_prefix() {
        let filler = "lorem ipsum ".repeat(30);
        let body = format!("{filler}the needle sits here {filler}");
        let index = index_of(&[("a", "Title", &body)]);
        let hit = &index.search("needle", &SearchFilters::default(), 1).hits[0];
        assert!(hit.snippet.contains("needle"), "{}", hit.snippet);
        assert!(hit.snippet.starts_with('…') && hit.snippet.ends_with('…'));
        assert!(hit.snippet.chars().count() <= SNIPPET_CHARS + 2);
    }

    #[test]
    fn test_empty_index_and_empty_query() {
        let index = Bm25Index::new();
        assert!(index.search("anything", &SearchFilters::default(), 10).hits.is_empty());
        let index = index_of(&[("a", "A", "text")]);
        assert!(index.search("", &SearchFilters::default(), 10).hits.is_empty());
        assert!(index.search("-text", &SearchFilters::default(), 10).hits.is_empty());
    }

    #[test]
    fn test_tokenize_basic() {
        let tokens = tokenize("Hello, World! This is a TEST.");
        assert!(tokens.contains(&"hello".to_string()));
        assert!(tokens.contains(&"test".to_string()));
        assert!(!tokens.contains(&"a".to_string()));
    }

    #[test]
    fn test_parse_grammar() {
        let parsed = ParsedQuery::parse("alpha \"beta gamma\" -delta -\"eps zeta\" NOT eta AND");
        assert_eq!(parsed.terms, vec!["alpha"]);
        assert_eq!(parsed.phrases, vec![vec!["beta".to_string(), "gamma".to_string()]]);
        assert_eq!(parsed.excluded_terms, vec!["delta", "eta"]);
        assert_eq!(
            parsed.excluded_phrases,
            vec![vec!["eps".to_string(), "zeta".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_in_memory_adapter_roundtrip() {
        let index = InMemoryFullTextIndex::new();
        index.upsert(key("a"), text("Alpha", "first"), meta()).await.unwrap();
        index.upsert(key("b"), text("Beta", "second"), meta()).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 2);

        let page = index.search("alpha", &SearchFilters::default(), 5).await.unwrap();
        assert_eq!(page.hits[0].title, "Alpha");

        assert!(index.remove(&key("a")).await.unwrap());
        index.clear().await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
    }
}
