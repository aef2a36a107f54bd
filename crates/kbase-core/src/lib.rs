//! Core types and error definitions for the kbase search engine.
//!
//! This crate provides the foundational types shared across kbase crates:
//! the error taxonomy and the identity of knowledge-base entries as seen by
//! the search and vectorization pipeline.
//!
//! # Main types
//!
//! - [`KbaseError`] — Unified error enum for all kbase subsystems.
//! - [`KbaseResult`] — Convenience alias for `Result<T, KbaseError>`.
//! - [`EntryKey`] — `(entry_id, collection)` join key for derived state.
//! - [`Entry`] — The entry record provided by the entry collaborator.
//! - [`EntryText`] / [`EntryMeta`] — The rankable text and filterable attributes of an entry.

/// Entry identity and the fields the search engine consumes.
pub mod entry;
/// Error taxonomy.
pub mod error;

pub use entry::{Entry, EntryKey, EntryMeta, EntryText};
pub use error::{KbaseError, KbaseResult};
