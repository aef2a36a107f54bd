use kbase_core::{EntryKey, KbaseError, KbaseResult};
use serde::Serialize;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::embedding::EmbeddingProvider;
use crate::entry_source::EntrySource;
use crate::queue::{EmbeddingQueue, QueueItem, RetryOutcome};
use crate::vector::{EmbeddingVector, VectorIndex};

/// Result of embedding a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedOutcome {
    /// A fresh vector was stored.
    Embedded,
    /// The entry no longer exists; any stale vector was removed.
    EntryMissing,
}

/// Fetches an entry's text, embeds it and stores the vector.
///
/// Shared by the background worker and the synchronous `embed_now` path.
#[derive(Clone)]
pub struct EntryEmbedder {
    entries: Arc<dyn EntrySource>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    vectors: Arc<dyn VectorIndex>,
}

impl EntryEmbedder {
    /// `provider` is `None` when no embedding model is configured.
    pub fn new(
        entries: Arc<dyn EntrySource>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        vectors: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            entries,
            provider,
            vectors,
        }
    }

    /// Whether an embedding model is configured at all.
    pub fn has_model(&self) -> bool {
        self.provider.is_some()
    }

    /// Embed the current text of `key`, or drop its vector if the entry is gone.
    pub async fn embed_entry(&self, key: &EntryKey) -> KbaseResult<EmbedOutcome> {
        let provider = self.provider.as_ref().ok_or(KbaseError::ModelUnavailable)?;

        let Some(text) = self.entries.get_entry_text(key).await? else {
            let removed = self.vectors.remove(key).await?;
            debug!(
                collection = %key.collection,
                entry_id = %key.entry_id,
                removed_vector = removed,
                "Entry gone before embedding"
            );
            return Ok(EmbedOutcome::EntryMissing);
        };

        let vector = provider.embed(&text.embedding_input()).await?;
        self.vectors
            .upsert(EmbeddingVector::new(
                key.clone(),
                vector,
                provider.model_version(),
            ))
            .await?;
        Ok(EmbedOutcome::Embedded)
    }
}

/// Counters for one or more processed batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Non-empty batches claimed.
    pub batches: usize,
    /// Vectors written.
    pub embedded: usize,
    /// Attempts that failed and were requeued.
    pub retried: usize,
    /// Items that ran out of attempts.
    pub failed: usize,
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.batches += other.batches;
        self.embedded += other.embedded;
        self.retried += other.retried;
        self.failed += other.failed;
    }
}

/// Drains the embedding queue into the vector index.
pub struct EmbeddingWorker {
    queue: Arc<dyn EmbeddingQueue>,
    embedder: EntryEmbedder,
    config: QueueConfig,
}

impl EmbeddingWorker {
    /// Worker that claims `config.batch_size` items at a time.
    pub fn new(queue: Arc<dyn EmbeddingQueue>, embedder: EntryEmbedder, config: QueueConfig) -> Self {
        Self {
            queue,
            embedder,
            config,
        }
    }

    /// Process batches until the queue has nothing claimable.
    ///
    /// Without an embedding model nothing is claimed, so pending items keep
    /// their attempts until a model is configured.
    pub async fn drain_once(&self) -> KbaseResult<WorkerStats> {
        let mut totals = WorkerStats::default();
        if !self.embedder.has_model() {
            warn!("No embedding model configured, leaving queue untouched");
            return Ok(totals);
        }
        loop {
            let batch = self.queue.claim_batch(self.config.batch_size.max(1)).await?;
            if batch.is_empty() {
                return Ok(totals);
            }
            totals += self.process_batch(batch, None).await;
        }
    }

    /// Run in the background until [`WorkerHandle::shutdown`] is called.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });
        WorkerHandle { shutdown_tx, join }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) -> KbaseResult<WorkerStats> {
        if !self.embedder.has_model() {
            warn!("No embedding model configured, embedding worker idle until shutdown");
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
            return Ok(WorkerStats::default());
        }

        let recovered = self.queue.recover_stale().await?;
        info!(
            recovered,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            claim_timeout_ms = self.config.claim_timeout_ms,
            "Embedding worker started"
        );

        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let mut totals = WorkerStats::default();

        while !*shutdown.borrow() {
            let batch = match self.queue.claim_batch(self.config.batch_size.max(1)).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "Failed to claim embedding batch");
                    Vec::new()
                }
            };

            if batch.is_empty() {
                // Pick up claims abandoned by a worker that died mid-batch.
                match self.queue.recover_stale().await {
                    Ok(0) => {}
                    Ok(recovered) => debug!(recovered, "Recovered expired claims while idle"),
                    Err(e) => warn!(error = %e, "Failed to recover expired claims"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            totals += self.process_batch(batch, Some(&shutdown)).await;
        }

        info!(
            batches = totals.batches,
            embedded = totals.embedded,
            retried = totals.retried,
            failed = totals.failed,
            "Embedding worker stopped"
        );
        Ok(totals)
    }

    async fn process_batch(
        &self,
        batch: Vec<QueueItem>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> WorkerStats {
        let mut stats = WorkerStats {
            batches: 1,
            ..WorkerStats::default()
        };
        let size = batch.len();
        let mut items = batch.into_iter();

        while let Some(item) = items.next() {
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                let mut released = 0;
                for unstarted in std::iter::once(item).chain(items.by_ref()) {
                    match self.queue.release(&unstarted.key).await {
                        Ok(()) => released += 1,
                        Err(e) => warn!(key = %unstarted.key, error = %e, "Failed to release item"),
                    }
                }
                info!(released, "Shutdown requested, released unstarted items");
                break;
            }
            self.process_item(&item, &mut stats).await;
        }

        info!(
            size,
            embedded = stats.embedded,
            retried = stats.retried,
            failed = stats.failed,
            "Embedding batch processed"
        );
        stats
    }

    async fn process_item(&self, item: &QueueItem, stats: &mut WorkerStats) {
        let key = &item.key;
        match self.embedder.embed_entry(key).await {
            Ok(outcome) => {
                if outcome == EmbedOutcome::Embedded {
                    stats.embedded += 1;
                }
                if let Err(e) = self.queue.mark_done(key).await {
                    error!(key = %key, error = %e, "Failed to mark item done");
                }
            }
            Err(KbaseError::ModelUnavailable) => {
                if let Err(e) = self.queue.release(key).await {
                    error!(key = %key, error = %e, "Failed to release item");
                }
            }
            Err(e) => match self.queue.mark_retry(key, &e.to_string()).await {
                Ok(RetryOutcome::Requeued { attempts }) => {
                    stats.retried += 1;
                    warn!(
                        collection = %key.collection,
                        entry_id = %key.entry_id,
                        attempts,
                        error = %e,
                        "Embedding failed, will retry"
                    );
                }
                Ok(RetryOutcome::Failed { attempts }) => {
                    stats.failed += 1;
                    error!(
                        collection = %key.collection,
                        entry_id = %key.entry_id,
                        attempts,
                        error = %e,
                        "Embedding failed permanently"
                    );
                }
                Ok(RetryOutcome::Missing) => {
                    debug!(key = %key, "Item removed while embedding");
                }
                Err(queue_err) => {
                    error!(key = %key, error = %queue_err, "Failed to record embedding failure");
                }
            },
        }
    }
}

/// Control handle for a spawned [`EmbeddingWorker`].
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<KbaseResult<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop after the current item, releasing any unstarted claimed items.
    pub async fn shutdown(self) -> KbaseResult<WorkerStats> {
        let _ = self.shutdown_tx.send(true);
        self.join
            .await
            .map_err(|e| KbaseError::Storage(format!("Embedding worker panicked: {e}")))?
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::embedding::LocalEmbedding;
    use crate::entry_source::InMemoryEntryStore;
    use crate::queue::{InMemoryEmbeddingQueue, ItemStatus, QueuePolicy};
    use crate::vector::InMemoryVectorIndex;
    use async_trait::async_trait;
    use kbase_core::Entry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every call.
    struct BrokenModel;

    #[async_trait]
    impl EmbeddingProvider for BrokenModel {
        async fn embed(&self, _text: &str) -> KbaseResult<Vec<f32>> {
            Err(KbaseError::TransientIndex("model offline".into()))
        }
        fn dimension(&self) -> usize {
            8
        }
        fn model_version(&self) -> String {
            "broken".into()
        }
    }

    /// Counts calls and sleeps, so shutdown can land mid-batch.
    struct SlowModel {
        calls: AtomicUsize,
        inner: LocalEmbedding,
    }

    #[async_trait]
    impl EmbeddingProvider for SlowModel {
        async fn embed(&self, text: &str) -> KbaseResult<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.embed(text).await
        }
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
        fn model_version(&self) -> String {
            "slow".into()
        }
    }

    struct Fixture {
        entries: Arc<InMemoryEntryStore>,
        vectors: Arc<InMemoryVectorIndex>,
        queue: Arc<InMemoryEmbeddingQueue>,
    }

    /// Failed items become claimable again at once.
    async fn fixture(n: usize) -> Fixture {
        fixture_with_policy(
            n,
            QueuePolicy {
                retry_base_delay: Duration::ZERO,
                ..QueuePolicy::default()
            },
        )
        .await
    }

    async fn fixture_with_policy(n: usize, policy: QueuePolicy) -> Fixture {
        let entries = Arc::new(InMemoryEntryStore::new());
        let queue = Arc::new(InMemoryEmbeddingQueue::new(policy));
        for i in 0..n {
            let entry = Entry::new(format!("e{i}"), "docs", format!("Entry number {i}"))
                .with_body("some body text about rust");
            queue.enqueue(&entry.key()).await.unwrap();
            entries.upsert(entry).await;
        }
        Fixture {
            entries,
            vectors: Arc::new(InMemoryVectorIndex::new(8)),
            queue,
        }
    }

    fn worker(fx: &Fixture, provider: Arc<dyn EmbeddingProvider>, batch_size: usize) -> EmbeddingWorker {
        let embedder = EntryEmbedder::new(fx.entries.clone(), Some(provider), fx.vectors.clone());
        EmbeddingWorker::new(
            fx.queue.clone(),
            embedder,
            QueueConfig {
                batch_size,
                poll_interval_ms: 10,
                ..QueueConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_drain_once_embeds_everything() {
        let fx = fixture(25).await;
        let stats = worker(&fx, Arc::new(LocalEmbedding::new(8)), 10)
            .drain_once()
            .await
            .unwrap();
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.embedded, 25);
        assert_eq!(fx.vectors.count().await.unwrap(), 25);
        assert_eq!(fx.queue.status_summary().await.unwrap().done, 25);
    }

    #[tokio::test]
    async fn test_failures_retry_three_times_then_park() {
        let fx = fixture(1).await;
        let stats = worker(&fx, Arc::new(BrokenModel), 10).drain_once().await.unwrap();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);

        let item = fx.queue.get(&EntryKey::new("e0", "docs")).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.attempts, 3);
        assert!(item.last_error.unwrap().contains("model offline"));
    }

    #[tokio::test]
    async fn test_missing_entry_marked_done_and_vector_removed() {
        let fx = fixture(1).await;
        let key = EntryKey::new("e0", "docs");
        fx.vectors
            .upsert(EmbeddingVector::new(key.clone(), vec![1.0; 8], "old"))
            .await
            .unwrap();
        fx.entries.remove(&key).await;

        let stats = worker(&fx, Arc::new(LocalEmbedding::new(8)), 10)
            .drain_once()
            .await
            .unwrap();
        assert_eq!(stats.embedded, 0);
        assert_eq!(fx.vectors.count().await.unwrap(), 0);
        assert_eq!(
            fx.queue.get(&key).await.unwrap().unwrap().status,
            ItemStatus::Done
        );
    }

    #[tokio::test]
    async fn test_failed_attempt_waits_for_backoff() {
        let fx = fixture_with_policy(1, QueuePolicy::default()).await;
        let worker = worker(&fx, Arc::new(BrokenModel), 10);

        let stats = worker.drain_once().await.unwrap();
        assert_eq!((stats.retried, stats.failed), (1, 0));
        assert_eq!(worker.drain_once().await.unwrap(), WorkerStats::default());

        let item = fx.queue.get(&EntryKey::new("e0", "docs")).await.unwrap().unwrap();
        assert_eq!((item.status, item.attempts), (ItemStatus::Pending, 1));
    }

    #[tokio::test]
    async fn test_no_model_leaves_items_pending() {
        let fx = fixture(3).await;
        let embedder = EntryEmbedder::new(fx.entries.clone(), None, fx.vectors.clone());
        assert!(!embedder.has_model());
        let err = embedder.embed_entry(&EntryKey::new("e0", "docs")).await.unwrap_err();
        assert!(matches!(err, KbaseError::ModelUnavailable));

        let worker = EmbeddingWorker::new(fx.queue.clone(), embedder, QueueConfig::default());
        assert_eq!(worker.drain_once().await.unwrap(), WorkerStats::default());
        assert_eq!(worker.drain_once().await.unwrap(), WorkerStats::default());

        let handle = worker.spawn();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(handle.shutdown().await.unwrap(), WorkerStats::default());

        let status = fx.queue.status_summary().await.unwrap();
        assert_eq!((status.pending, status.failed), (3, 0));
        assert_eq!(status.last_error, None);
        for i in 0..3 {
            let item = fx.queue.get(&EntryKey::new(format!("e{i}"), "docs")).await.unwrap().unwrap();
            assert_eq!(item.attempts, 0);
        }
    }

    #[tokio::test]
    async fn test_spawned_worker_drains_and_stops() {
        let fx = fixture(5).await;
        let handle = worker(&fx, Arc::new(LocalEmbedding::new(8)), 2).spawn();

        for _ in 0..100 {
            if fx.queue.status_summary().await.unwrap().done == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.embedded, 5);
    }

    #[tokio::test]
    async fn test_shutdown_releases_unstarted_items() {
        let fx = fixture(10).await;
        let model = Arc::new(SlowModel {
            calls: AtomicUsize::new(0),
            inner: LocalEmbedding::new(8),
        });
        let handle = worker(&fx, model.clone(), 10).spawn();

        while model.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = handle.shutdown().await.unwrap();

        let status = fx.queue.status_summary().await.unwrap();
        assert_eq!(status.processing, 0, "nothing may stay claimed");
        assert_eq!(status.done, stats.embedded);
        assert_eq!(status.pending, 10 - stats.embedded);
        assert!(stats.embedded < 10);
    }

    #[tokio::test]
    async fn test_worker_recovers_expired_claims_on_start() {
        let fx = fixture_with_policy(
            3,
            QueuePolicy {
                claim_timeout: Duration::ZERO,
                ..QueuePolicy::default()
            },
        )
        .await;
        fx.queue.claim_batch(3).await.unwrap();
        let handle = worker(&fx, Arc::new(LocalEmbedding::new(8)), 10).spawn();
        for _ in 0..100 {
            if fx.queue.status_summary().await.unwrap().done == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await.unwrap();
        assert_eq!(fx.vectors.count().await.unwrap(), 3);
    }
}
