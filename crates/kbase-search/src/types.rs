use chrono::{DateTime, Utc};
use kbase_core::{EntryKey, EntryMeta, KbaseError, KbaseResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Which ranking strategy a search uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Full-text (BM25) ranking only.
    Keyword,
    /// Vector similarity only.
    Semantic,
    /// Both legs fused with Reciprocal Rank Fusion.
    #[default]
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = KbaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(Self::Keyword),
            "semantic" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(KbaseError::invalid(format!(
                "unknown search mode '{other}' (expected keyword, semantic or hybrid)"
            ))),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Keyword => "keyword",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

/// One ranked list feeding fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    /// BM25 over the full-text index.
    Keyword,
    /// k-NN over entry embeddings.
    Semantic,
}

/// Restrictions applied to both legs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Exact collection name.
    #[serde(default)]
    pub collection: Option<String>,
    /// Exact entry type.
    #[serde(default)]
    pub entry_type: Option<String>,
    /// Every listed tag must be present on the entry.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Inclusive lower bound on `updated_at`.
    #[serde(default)]
    pub date_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `updated_at`.
    #[serde(default)]
    pub date_to: Option<DateTime<Utc>>,
}

impl SearchFilters {
    /// No filter set at all.
    pub fn is_empty(&self) -> bool {
        self.collection.is_none()
            && self.entry_type.is_none()
            && self.tags.is_empty()
            && self.date_from.is_none()
            && self.date_to.is_none()
    }

    /// Restrict to one collection. Chainable builder method.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Restrict to one entry type. Chainable builder method.
    pub fn with_type(mut self, entry_type: impl Into<String>) -> Self {
        self.entry_type = Some(entry_type.into());
        self
    }

    /// Require a tag. Chainable builder method.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub(crate) fn validate(&self) -> KbaseResult<()> {
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(KbaseError::invalid(format!(
                    "date_from ({from}) is after date_to ({to})"
                )));
            }
        }
        Ok(())
    }

    /// Whether an entry passes every filter. Tags compare case-insensitively.
    pub fn matches(&self, key: &EntryKey, meta: &EntryMeta) -> bool {
        if let Some(collection) = &self.collection {
            if &key.collection != collection {
                return false;
            }
        }
        if let Some(entry_type) = &self.entry_type {
            if &meta.entry_type != entry_type {
                return false;
            }
        }
        let tags_ok = self
            .tags
            .iter()
            .all(|wanted| meta.tags.iter().any(|t| t.eq_ignore_ascii_case(wanted)));
        if !tags_ok {
            return false;
        }
        if let Some(from) = self.date_from {
            if meta.updated_at < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if meta.updated_at > to {
                return false;
            }
        }
        true
    }
}

/// A search request as accepted by [`crate::SearchService::search`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Raw user query; sanitized before it reaches the keyword index.
    pub query: String,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default)]
    pub filters: SearchFilters,
    /// Page size, clamped to `max_limit`.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Rows of the ranking to skip.
    #[serde(default)]
    pub offset: usize,
    /// Ask the configured expander for additional terms.
    #[serde(default)]
    pub expand: bool,
}

fn default_limit() -> usize {
    20
}

impl SearchRequest {
    /// A first-page request with the default limit.
    pub fn new(query: impl Into<String>, mode: SearchMode) -> Self {
        Self {
            query: query.into(),
            mode,
            filters: SearchFilters::default(),
            limit: default_limit(),
            offset: 0,
            expand: false,
        }
    }

    /// Build a request from untyped front-end input.
    ///
    /// Rejects unknown modes, non-positive limits and negative offsets.
    pub fn from_parts(
        query: impl Into<String>,
        mode: &str,
        filters: SearchFilters,
        limit: i64,
        offset: i64,
        expand: bool,
    ) -> KbaseResult<Self> {
        let mode = mode.parse::<SearchMode>()?;
        if limit <= 0 {
            return Err(KbaseError::invalid(format!("limit must be > 0, got {limit}")));
        }
        if offset < 0 {
            return Err(KbaseError::invalid(format!(
                "offset must be >= 0, got {offset}"
            )));
        }
        Ok(Self {
            query: query.into(),
            mode,
            filters,
            limit: usize::try_from(limit).unwrap_or(usize::MAX),
            offset: usize::try_from(offset).unwrap_or(usize::MAX),
            expand,
        })
    }

    /// Set the page size.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Set how many ranked rows to skip.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Restrict both legs.
    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Request query expansion.
    pub fn with_expand(mut self, expand: bool) -> Self {
        self.expand = expand;
        self
    }
}

/// A ranked row from a single leg, before fusion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchCandidate {
    pub key: EntryKey,
    pub title: String,
    /// Excerpt around the first matched term, or the start of the text.
    pub snippet: String,
    /// Leg-native relevance, higher is better. Never compared across legs.
    pub raw_score: f64,
    /// 1-based position within the leg.
    pub rank: usize,
}

/// A row of the final result page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedResult {
    #[serde(flatten)]
    pub key: EntryKey,
    pub title: String,
    pub snippet: String,
    /// RRF score in hybrid mode, the leg's raw score otherwise.
    pub score: f64,
    /// Legs that ranked this entry.
    pub source_legs: BTreeSet<Leg>,
}

impl FusedResult {
    pub(crate) fn from_candidate(candidate: SearchCandidate, leg: Leg) -> Self {
        Self {
            key: candidate.key,
            title: candidate.title,
            snippet: candidate.snippet,
            score: candidate.raw_score,
            source_legs: BTreeSet::from([leg]),
        }
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultPage {
    /// At most `limit` rows, best first.
    pub results: Vec<FusedResult>,
    /// More matches exist beyond this page.
    pub has_more: bool,
    /// A data source (usually the semantic leg) did not contribute.
    pub degraded: bool,
    /// Additional terms contributed by query expansion.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expanded_terms: Vec<String>,
}
