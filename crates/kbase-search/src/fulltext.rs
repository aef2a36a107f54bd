use async_trait::async_trait;
use kbase_core::{EntryKey, EntryMeta, EntryText, KbaseResult};

use crate::types::SearchFilters;

/// Upper bound on terms kept from a raw query.
const MAX_QUERY_TERMS: usize = 64;

/// Characters the index grammar treats as syntax.
const RESERVED: &[char] = &['"', '(', ')', '*', '^', ':', '~', '+', '{', '}', '[', ']', '\\'];

/// Boolean operators of the index grammar.
const OPERATORS: &[&str] = &["AND", "OR", "NOT"];

/// Snippet window, in characters.
pub(crate) const SNIPPET_CHARS: usize = 160;
/// Characters of context kept before the first matched term.
const SNIPPET_LEAD: usize = 60;

/// A ranked keyword match. Carries no body text.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordHit {
    pub key: EntryKey,
    pub title: String,
    pub snippet: String,
    /// Native BM25 score, higher is better.
    pub score: f64,
}

/// The top of a keyword ranking plus the number of matches behind it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeywordPage {
    /// Best first.
    pub hits: Vec<KeywordHit>,
    /// Matches after filtering, including those beyond `hits`.
    pub total: usize,
}

/// A ranked full-text index keyed by entry identity.
///
/// Implementations parse the grammar produced by [`sanitize_query`] (bare
/// terms and double-quoted phrases) and apply [`SearchFilters`] natively.
#[async_trait]
pub trait FullTextIndex: Send + Sync {
    /// Index or re-index an entry.
    async fn upsert(&self, key: EntryKey, text: EntryText, meta: EntryMeta) -> KbaseResult<()>;

    /// Drop an entry. Returns whether it was indexed.
    async fn remove(&self, key: &EntryKey) -> KbaseResult<bool>;

    /// Return up to `limit` hits in descending relevance.
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        limit: usize,
    ) -> KbaseResult<KeywordPage>;

    /// Drop everything (full rebuild).
    async fn clear(&self) -> KbaseResult<()>;

    async fn count(&self) -> KbaseResult<usize>;
}

/// Neutralize index grammar in user input.
///
/// Reserved characters are removed, upper-case boolean operators become
/// plain lower-case terms, and any token carrying a hyphen is quoted so
/// `co-founder` is searched as a phrase instead of parsed as an exclusion.
/// The function is idempotent.
pub fn sanitize_query(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    spaced
        .split_whitespace()
        .filter_map(sanitize_token)
        .take(MAX_QUERY_TERMS)
        .collect::<Vec<_>>()
        .join(" ")
}

fn sanitize_token(token: &str) -> Option<String> {
    let stripped: String = token.chars().filter(|c| !RESERVED.contains(c)).collect();
    if !stripped.chars().any(char::is_alphanumeric) {
        return None;
    }
    if OPERATORS.contains(&stripped.as_str()) {
        return Some(stripped.to_lowercase());
    }
    if stripped.contains('-') {
        return Some(format!("\"{stripped}\""));
    }
    Some(stripped)
}

/// Join the original query with expansion terms into one OR query.
///
/// Each part is sanitized on its own so a hyphenated expansion term stays
/// one phrase.
pub(crate) fn combine_terms(query: &str, extra_terms: &[String]) -> String {
    std::iter::once(query)
        .chain(extra_terms.iter().map(String::as_str))
        .map(sanitize_query)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cut a window of the summary and body prefix around the first matched term.
///
/// With no matching term the window starts at the beginning of the text.
pub(crate) fn snippet_around(text: &EntryText, terms: &[&str]) -> String {
    let source = [text.summary.as_str(), text.body_prefix.as_str()]
        .iter()
        .flat_map(|s| s.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ");
    let chars: Vec<char> = source.chars().collect();
    if chars.len() <= SNIPPET_CHARS {
        return source;
    }

    let hit_at = first_match_char_index(&chars, terms).unwrap_or(0);
    let start = hit_at.saturating_sub(SNIPPET_LEAD);
    let end = (start + SNIPPET_CHARS).min(chars.len());
    let start = end.saturating_sub(SNIPPET_CHARS);

    let mut snippet = String::new();
    if start > 0 {
        snippet.push('…');
    }
    snippet.extend(&chars[start..end]);
    if end < chars.len() {
        snippet.push('…');
    }
    snippet
}

fn first_match_char_index(chars: &[char], terms: &[&str]) -> Option<usize> {
    if terms.is_empty() {
        return None;
    }
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_alphanumeric() {
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && chars[i].is_alphanumeric() {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect::<String>().to_lowercase();
        if terms.contains(&word.as_str()) {
            return Some(start);
        }
    }
    None
}
