use kbase_core::{Entry, EntryKey, KbaseError, KbaseResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SearchConfig;
use crate::embedding::EmbeddingProvider;
use crate::entry_source::EntrySource;
use crate::expansion::QueryExpander;
use crate::fulltext::{combine_terms, sanitize_query, snippet_around, FullTextIndex};
use crate::fusion::rrf_fuse;
use crate::queue::{EmbeddingQueue, EnqueueOutcome, QueueStatus};
use crate::types::{
    FusedResult, Leg, ResultPage, SearchCandidate, SearchFilters, SearchMode, SearchRequest,
};
use crate::vector::VectorIndex;
use crate::worker::{EmbedOutcome, EntryEmbedder};

/// One leg's ranked candidates and whether it holds more matches than it returned.
#[derive(Debug, Default)]
struct LegResult {
    candidates: Vec<SearchCandidate>,
    has_more: bool,
    /// Matches the leg's index reported, at least `candidates.len()`.
    matched: usize,
}

/// Query router plus the write hooks that keep the derived indexes current.
///
/// Holds no locks of its own; every component is shared behind an `Arc`.
pub struct SearchService {
    config: SearchConfig,
    entries: Arc<dyn EntrySource>,
    fulltext: Arc<dyn FullTextIndex>,
    vectors: Arc<dyn VectorIndex>,
    queue: Arc<dyn EmbeddingQueue>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    expander: Option<Arc<dyn QueryExpander>>,
}

impl SearchService {
    /// Keyword-only service; add a model with [`Self::with_provider`].
    pub fn new(
        config: SearchConfig,
        entries: Arc<dyn EntrySource>,
        fulltext: Arc<dyn FullTextIndex>,
        vectors: Arc<dyn VectorIndex>,
        queue: Arc<dyn EmbeddingQueue>,
    ) -> Self {
        Self {
            config,
            entries,
            fulltext,
            vectors,
            queue,
            provider: None,
            expander: None,
        }
    }

    /// Enable semantic search. `None` leaves it disabled.
    pub fn with_provider(mut self, provider: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        self.provider = provider;
        self
    }

    /// Enable query expansion. `None` leaves it disabled.
    pub fn with_expander(mut self, expander: Option<Arc<dyn QueryExpander>>) -> Self {
        self.expander = expander;
        self
    }

    /// Active ranking and paging settings.
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// The embed-one-entry routine over this service's components.
    pub fn embedder(&self) -> EntryEmbedder {
        EntryEmbedder::new(
            Arc::clone(&self.entries),
            self.provider.clone(),
            Arc::clone(&self.vectors),
        )
    }

    /// The embedding queue fed by [`Self::entry_upserted`].
    pub fn queue(&self) -> Arc<dyn EmbeddingQueue> {
        Arc::clone(&self.queue)
    }

    // --- Read path ---

    /// Run a search and return one page of results.
    pub async fn search(&self, request: SearchRequest) -> KbaseResult<ResultPage> {
        if request.limit == 0 {
            return Err(KbaseError::invalid("limit must be > 0"));
        }
        request.filters.validate()?;
        let limit = request.limit.min(self.config.max_limit);
        let offset = request.offset;
        let page_end = offset.saturating_add(limit);

        let query = sanitize_query(&request.query);
        if query.is_empty() {
            debug!(raw = %request.query, "Query empty after sanitization");
            return Ok(ResultPage::default());
        }

        let expanded_terms = if request.expand && request.mode != SearchMode::Semantic {
            self.expand_terms(&request.query).await
        } else {
            Vec::new()
        };

        let mut page = match request.mode {
            SearchMode::Keyword => {
                let keyword_query = combine_terms(&query, &expanded_terms);
                let leg = self
                    .keyword_leg(&keyword_query, &request.filters, page_end)
                    .await?;
                single_leg_page(leg, Leg::Keyword, offset, limit)
            }
            SearchMode::Semantic => match self
                .semantic_leg(request.query.trim(), &request.filters, page_end)
                .await
            {
                Ok(leg) => single_leg_page(leg, Leg::Semantic, offset, limit),
                Err(KbaseError::ModelUnavailable) => {
                    warn!("Semantic search requested but no embedding model is configured");
                    ResultPage {
                        degraded: true,
                        ..ResultPage::default()
                    }
                }
                Err(e) => return Err(e),
            },
            SearchMode::Hybrid => {
                let keyword_query = combine_terms(&query, &expanded_terms);
                self.hybrid_page(
                    &keyword_query,
                    request.query.trim(),
                    &request.filters,
                    offset,
                    limit,
                )
                .await?
            }
        };

        page.expanded_terms = expanded_terms;
        debug!(
            mode = %request.mode,
            returned = page.results.len(),
            has_more = page.has_more,
            degraded = page.degraded,
            "Search completed"
        );
        Ok(page)
    }

    /// Fuse both legs and cut out one page.
    ///
    /// Each leg is ranked over all of its matches, so RRF scores and the fused
    /// order are the same whichever page is requested.
    async fn hybrid_page(
        &self,
        keyword_query: &str,
        semantic_query: &str,
        filters: &SearchFilters,
        offset: usize,
        limit: usize,
    ) -> KbaseResult<ResultPage> {
        let page_end = offset.saturating_add(limit);
        let first_fetch = limit.saturating_mul(2).max(page_end);

        let (keyword, semantic) = tokio::join!(
            self.complete_keyword_leg(keyword_query, filters, first_fetch),
            self.semantic_leg(semantic_query, filters, usize::MAX),
        );
        let keyword = keyword?;

        let (semantic, degraded) = match semantic {
            Ok(leg) => (leg, false),
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Semantic leg unavailable, returning keyword results only");
                (LegResult::default(), true)
            }
            Err(e) => return Err(e),
        };

        let fused = rrf_fuse(&keyword.candidates, &semantic.candidates, self.config.rrf_k);
        let has_more = fused.len() > page_end || keyword.has_more || semantic.has_more;
        let results: Vec<FusedResult> = fused.into_iter().skip(offset).take(limit).collect();

        Ok(ResultPage {
            results,
            has_more,
            degraded,
            expanded_terms: Vec::new(),
        })
    }

    async fn keyword_leg(
        &self,
        query: &str,
        filters: &SearchFilters,
        depth: usize,
    ) -> KbaseResult<LegResult> {
        let page = self.fulltext.search(query, filters, depth).await?;
        let returned = page.hits.len();

        if returned < depth && page.total > returned {
            warn!(
                leg = "keyword",
                requested = depth,
                returned,
                total = page.total,
                "Keyword index returned fewer rows than it matched"
            );
        } else {
            debug!(leg = "keyword", requested = depth, returned, total = page.total);
        }

        let candidates = page
            .hits
            .into_iter()
            .enumerate()
            .map(|(i, hit)| SearchCandidate {
                key: hit.key,
                title: hit.title,
                snippet: hit.snippet,
                raw_score: hit.score,
                rank: i + 1,
            })
            .collect();

        Ok(LegResult {
            candidates,
            has_more: page.total > returned,
            matched: page.total,
        })
    }

    /// Keyword leg holding every match: one fetch at `first_fetch`, and a
    /// second at the reported total when the first was cut short.
    async fn complete_keyword_leg(
        &self,
        query: &str,
        filters: &SearchFilters,
        first_fetch: usize,
    ) -> KbaseResult<LegResult> {
        let leg = self.keyword_leg(query, filters, first_fetch).await?;
        if !leg.has_more {
            return Ok(leg);
        }
        debug!(leg = "keyword", matched = leg.matched, "Fetching remaining keyword matches");
        self.keyword_leg(query, filters, leg.matched).await
    }

    /// k-NN over the vector index, filtered and resolved through the entry source.
    ///
    /// The index cannot filter or offset, so it is over-fetched and re-queried
    /// at doubled depth until `needed + 1` candidates survive, the distance
    /// cutoff is reached or the index is exhausted. `usize::MAX` asks for
    /// every candidate within the cutoff.
    async fn semantic_leg(
        &self,
        query: &str,
        filters: &SearchFilters,
        needed: usize,
    ) -> KbaseResult<LegResult> {
        let provider = self.provider.as_ref().ok_or(KbaseError::ModelUnavailable)?;
        let embedding = provider.embed(query).await?;

        let index_size = self.vectors.count().await?;
        let multiplier = if filters.is_empty() {
            self.config.overfetch_multiplier
        } else {
            self.config.filtered_overfetch_multiplier
        };
        let mut depth = needed
            .saturating_mul(multiplier)
            .max(needed.saturating_add(1))
            .min(index_size.max(1));

        loop {
            let hits = self.vectors.knn(&embedding, depth).await?;
            let index_exhausted = hits.len() < depth || depth >= index_size;

            let mut candidates: Vec<SearchCandidate> = Vec::new();
            let mut beyond_cutoff = false;
            let mut stale = 0usize;
            for hit in hits {
                if hit.distance > self.config.distance_cutoff {
                    beyond_cutoff = true;
                    break;
                }
                let Some(meta) = self.entries.get_entry_meta(&hit.key).await? else {
                    stale += 1;
                    continue;
                };
                if !filters.matches(&hit.key, &meta) {
                    continue;
                }
                let Some(text) = self.entries.get_entry_text(&hit.key).await? else {
                    stale += 1;
                    continue;
                };
                candidates.push(SearchCandidate {
                    title: text.title.clone(),
                    snippet: snippet_around(&text, &[]),
                    raw_score: 1.0 - f64::from(hit.distance) / 2.0,
                    rank: candidates.len() + 1,
                    key: hit.key,
                });
            }

            if candidates.len() > needed || beyond_cutoff || index_exhausted {
                let has_more = candidates.len() > needed;
                candidates.truncate(needed);
                if stale > 0 {
                    debug!(stale, "Dropped vectors whose entries no longer exist");
                }
                debug!(
                    leg = "semantic",
                    requested = needed,
                    fetched = depth,
                    returned = candidates.len(),
                    has_more
                );
                let matched = candidates.len();
                return Ok(LegResult {
                    candidates,
                    has_more,
                    matched,
                });
            }

            debug!(depth, survivors = candidates.len(), "Widening semantic over-fetch");
            depth = depth
                .saturating_mul(2)
                .min(index_size.max(depth.saturating_add(1)));
        }
    }

    /// Additional terms from the expander, or none on absence, failure or timeout.
    async fn expand_terms(&self, raw_query: &str) -> Vec<String> {
        let Some(expander) = &self.expander else {
            return Vec::new();
        };
        let timeout = Duration::from_millis(self.config.expansion_timeout_ms);
        match tokio::time::timeout(timeout, expander.expand(raw_query)).await {
            Ok(Ok(terms)) => {
                let original = raw_query.trim().to_lowercase();
                terms
                    .into_iter()
                    .skip(1)
                    .filter(|t| t.trim().to_lowercase() != original)
                    .collect()
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Query expansion failed, searching unexpanded");
                Vec::new()
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.expansion_timeout_ms,
                    "Query expansion timed out, searching unexpanded"
                );
                Vec::new()
            }
        }
    }

    // --- Write hooks ---

    /// Index an entry for keyword search and queue it for embedding.
    pub async fn entry_upserted(&self, entry: &Entry) -> KbaseResult<EnqueueOutcome> {
        let key = entry.key();
        self.fulltext
            .upsert(
                key.clone(),
                entry.text(self.config.body_prefix_chars),
                entry.meta(),
            )
            .await?;
        let outcome = self.queue.enqueue(&key).await?;
        debug!(
            collection = %key.collection,
            entry_id = %key.entry_id,
            ?outcome,
            "Entry indexed"
        );
        Ok(outcome)
    }

    /// Drop every derived row for an entry.
    pub async fn entry_deleted(&self, key: &EntryKey) -> KbaseResult<()> {
        self.fulltext.remove(key).await?;
        self.vectors.remove(key).await?;
        self.queue.remove(key).await?;
        debug!(collection = %key.collection, entry_id = %key.entry_id, "Entry unindexed");
        Ok(())
    }

    // --- Operations ---

    /// Counts per queue status plus the most recent error.
    pub async fn queue_status(&self) -> KbaseResult<QueueStatus> {
        self.queue.status_summary().await
    }

    /// Queue an entry for embedding again, resetting a failed item.
    pub async fn reembed(&self, key: &EntryKey) -> KbaseResult<EnqueueOutcome> {
        if self.entries.get_entry_meta(key).await?.is_none() {
            return Err(KbaseError::invalid(format!("unknown entry {key}")));
        }
        self.queue.enqueue(key).await
    }

    /// Embed one entry inline, bypassing the queue.
    pub async fn embed_now(&self, key: &EntryKey) -> KbaseResult<EmbedOutcome> {
        self.embedder().embed_entry(key).await
    }

    /// Clear both derived indexes and the queue, then re-index every entry.
    /// Returns the number of entries re-indexed.
    pub async fn rebuild(&self) -> KbaseResult<usize> {
        self.vectors.clear().await?;
        self.queue.clear().await?;
        self.fulltext.clear().await?;

        let mut count = 0;
        for key in self.entries.list_keys().await? {
            let (Some(text), Some(meta)) = (
                self.entries.get_entry_text(&key).await?,
                self.entries.get_entry_meta(&key).await?,
            ) else {
                continue;
            };
            self.fulltext.upsert(key.clone(), text, meta).await?;
            self.queue.enqueue(&key).await?;
            count += 1;
        }
        info!(entries = count, "Search indexes rebuilt");
        Ok(count)
    }
}

fn single_leg_page(leg: LegResult, source: Leg, offset: usize, limit: usize) -> ResultPage {
    let total = leg.candidates.len();
    let results = leg
        .candidates
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|c| FusedResult::from_candidate(c, source))
        .collect();
    ResultPage {
        results,
        has_more: leg.has_more || total > offset.saturating_add(limit),
        degraded: false,
        expanded_terms: Vec::new(),
    }
}
