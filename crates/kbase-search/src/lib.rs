//! Unified keyword, semantic and hybrid search over knowledge-base entries.
//!
//! Entries live in an [`EntrySource`]. Two derived indexes are kept in sync
//! with it: a BM25 full-text index and a vector index fed by a durable
//! embedding queue. [`SearchService`] routes a request to one or both legs
//! and fuses them with Reciprocal Rank Fusion.
//!
//! # Main types
//!
//! - [`SearchService`] — Query router plus the write hooks that keep indexes current.
//! - [`FullTextIndex`] / [`InMemoryFullTextIndex`] — Keyword leg.
//! - [`VectorIndex`] / [`FileVectorIndex`] — Semantic leg storage.
//! - [`EmbeddingQueue`] / [`SqliteEmbeddingQueue`] — Durable embedding work queue.
//! - [`EmbeddingWorker`] — Background consumer of the queue.
//! - [`QueryExpander`] — Optional query rewriting for keyword recall.

/// BM25 inverted index for keyword-based retrieval.
pub mod bm25;
/// Search, queue, embedding and expansion settings.
pub mod config;
/// Embedding provider trait and local implementation.
pub mod embedding;
/// Read access to the authoritative entry store.
pub mod entry_source;
/// Query expansion for improved keyword recall.
pub mod expansion;
/// Full-text index trait, query sanitization and snippets.
pub mod fulltext;
/// Reciprocal Rank Fusion of the keyword and semantic legs.
pub mod fusion;
/// OpenAI-compatible HTTP embedding and completion clients.
#[cfg(feature = "http")]
pub mod http;
/// Embedding queue trait and in-memory implementation.
pub mod queue;
/// The search service: query routing and index maintenance.
pub mod service;
/// SQLite-backed embedding queue.
pub mod sqlite_queue;
/// Request, filter and result types.
pub mod types;
/// Vector index trait, in-memory and file-backed implementations.
pub mod vector;
/// Background embedding worker.
pub mod worker;

pub use bm25::{Bm25Index, InMemoryFullTextIndex};
pub use config::{
    EmbeddingConfig, EmbeddingProviderKind, ExpansionConfig, ExpansionProviderKind, QueueConfig,
    SearchConfig,
};
pub use embedding::{provider_from_config, EmbeddingProvider, LocalEmbedding};
pub use entry_source::{EntrySource, InMemoryEntryStore};
pub use expansion::{
    expander_from_config, LanguageModel, LlmQueryExpander, QueryExpander, RuleBasedExpander,
};
pub use fulltext::{sanitize_query, FullTextIndex, KeywordHit, KeywordPage};
pub use fusion::rrf_fuse;
#[cfg(feature = "http")]
pub use http::{HttpEmbedding, HttpLanguageModel};
pub use queue::{
    EmbeddingQueue, EnqueueOutcome, InMemoryEmbeddingQueue, ItemStatus, QueueItem, QueuePolicy,
    QueueStatus, RetryOutcome,
};
pub use service::SearchService;
pub use sqlite_queue::SqliteEmbeddingQueue;
pub use types::{
    FusedResult, Leg, ResultPage, SearchCandidate, SearchFilters, SearchMode, SearchRequest,
};
pub use vector::{
    cosine_distance, EmbeddingVector, FileVectorIndex, InMemoryVectorIndex, VectorHit, VectorIndex,
};
pub use worker::{EmbedOutcome, EmbeddingWorker, EntryEmbedder, WorkerHandle, WorkerStats};
