use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kbase_core::{EntryKey, KbaseError, KbaseResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::QueueConfig;

/// Retry delays stop doubling after this many failures.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Lifecycle of a queue item.
///
/// `pending -> processing -> done`, or back to `pending` on a retryable
/// failure until `max_attempts` is reached, then `failed` (terminal until the
/// entry is enqueued again).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Embedded successfully.
    Done,
    /// Out of attempts.
    Failed,
}

impl ItemStatus {
    /// Storage and log representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = KbaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(KbaseError::Storage(format!("unknown queue status '{other}'"))),
        }
    }
}

/// One unit of embedding work. Unique per entry key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub key: EntryKey,
    pub status: ItemStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Orders claims; reset only when a settled item is enqueued again.
    pub queued_at: DateTime<Utc>,
    /// Last transition. While `processing` this is the claim time.
    pub updated_at: DateTime<Utc>,
    /// A retried item is not claimable before this instant.
    pub retry_at: Option<DateTime<Utc>>,
}

/// What `enqueue` did with the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The key was not queued before.
    Inserted,
    /// Already pending or processing; nothing changed.
    Coalesced,
    /// A done or failed item was reset to pending with zero attempts.
    Reset,
}

/// What `mark_retry` did with the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back to pending for another attempt.
    Requeued { attempts: u32 },
    /// Out of attempts; parked as failed.
    Failed { attempts: u32 },
    /// The item was removed while it was being processed.
    Missing,
}

/// Item counts per status plus the most recent error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Includes retried items still waiting out their backoff.
    pub pending: usize,
    /// Claimed and not yet settled.
    pub processing: usize,
    /// Embedded.
    pub done: usize,
    /// Parked after exhausting their attempts.
    pub failed: usize,
    /// Error of the most recently failed attempt.
    pub last_error: Option<String>,
}

/// Attempt limit, claim lease and retry backoff shared by every queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Attempts before an item is parked as `failed`.
    pub max_attempts: u32,
    /// A `processing` claim older than this is presumed abandoned.
    pub claim_timeout: Duration,
    /// Delay after the first failed attempt; doubles with each further failure.
    pub retry_base_delay: Duration,
    /// Ceiling on the retry delay.
    pub max_retry_delay: Duration,
}

impl QueuePolicy {
    /// Resolve the policy from `[queue]` settings.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            claim_timeout: Duration::from_millis(config.claim_timeout_ms),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_retry_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }

    /// Backoff before the next try of an item that has failed `attempts` times.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let factor = 1_u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.retry_base_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }

    pub(crate) fn retry_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        chrono::Duration::from_std(self.retry_delay(attempts))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Claims made at or before the returned instant have expired.
    pub(crate) fn stale_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.claim_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Durable ordered work items for the embedding worker.
///
/// Shared by the write path (enqueue) and the worker (claim and settle);
/// every transition is atomic with respect to concurrent callers.
#[async_trait]
pub trait EmbeddingQueue: Send + Sync {
    /// Queue a key, coalescing with outstanding work.
    async fn enqueue(&self, key: &EntryKey) -> KbaseResult<EnqueueOutcome>;

    /// Atomically move up to `n` oldest claimable pending items to processing.
    /// No item is ever handed to two claimers, and a retried item is skipped
    /// until its `retry_at` has passed.
    async fn claim_batch(&self, n: usize) -> KbaseResult<Vec<QueueItem>>;

    /// `processing -> done`.
    async fn mark_done(&self, key: &EntryKey) -> KbaseResult<()>;

    /// Count a failed attempt and requeue the item behind its backoff, or
    /// park it as failed once attempts are exhausted.
    async fn mark_retry(&self, key: &EntryKey, error: &str) -> KbaseResult<RetryOutcome>;

    /// `processing -> pending` without counting an attempt.
    async fn release(&self, key: &EntryKey) -> KbaseResult<()>;

    /// Return processing items whose claim is older than the claim timeout
    /// to pending. Live claims are left alone. Returns how many moved.
    async fn recover_stale(&self) -> KbaseResult<usize>;

    /// Forget a key entirely. Returns whether it was queued.
    async fn remove(&self, key: &EntryKey) -> KbaseResult<bool>;

    /// Forget every key.
    async fn clear(&self) -> KbaseResult<()>;

    /// Counts per status plus the most recent error.
    async fn status_summary(&self) -> KbaseResult<QueueStatus>;

    /// Look up a single item.
    async fn get(&self, key: &EntryKey) -> KbaseResult<Option<QueueItem>>;
}

struct Slot {
    item: QueueItem,
    /// Insertion sequence, orders items queued within the same instant.
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    slots: HashMap<EntryKey, Slot>,
    next_seq: u64,
}

impl QueueState {
    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Mutex-guarded in-process queue. Not durable across restarts.
pub struct InMemoryEmbeddingQueue {
    state: Mutex<QueueState>,
    policy: QueuePolicy,
}

impl InMemoryEmbeddingQueue {
    /// Empty queue governed by `policy`.
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            policy: QueuePolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
        }
    }
}

impl Default for InMemoryEmbeddingQueue {
    fn default() -> Self {
        Self::new(QueuePolicy::default())
    }
}

#[async_trait]
impl EmbeddingQueue for InMemoryEmbeddingQueue {
    async fn enqueue(&self, key: &EntryKey) -> KbaseResult<EnqueueOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let seq = state.bump_seq();

        if let Some(slot) = state.slots.get_mut(key) {
            return Ok(match slot.item.status {
                ItemStatus::Pending | ItemStatus::Processing => EnqueueOutcome::Coalesced,
                ItemStatus::Done | ItemStatus::Failed => {
                    slot.item.status = ItemStatus::Pending;
                    slot.item.attempts = 0;
                    slot.item.last_error = None;
                    slot.item.queued_at = now;
                    slot.item.updated_at = now;
                    slot.item.retry_at = None;
                    slot.seq = seq;
                    EnqueueOutcome::Reset
                }
            });
        }

        state.slots.insert(
            key.clone(),
            Slot {
                item: QueueItem {
                    key: key.clone(),
                    status: ItemStatus::Pending,
                    attempts: 0,
                    last_error: None,
                    queued_at: now,
                    updated_at: now,
                    retry_at: None,
                },
                seq,
            },
        );
        Ok(EnqueueOutcome::Inserted)
    }

    async fn claim_batch(&self, n: usize) -> KbaseResult<Vec<QueueItem>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let mut state = self.state.lock();

        let mut pending: Vec<(DateTime<Utc>, u64, EntryKey)> = state
            .slots
            .values()
            .filter(|s| {
                s.item.status == ItemStatus::Pending
                    && s.item.retry_at.map_or(true, |at| at <= now)
            })
            .map(|s| (s.item.queued_at, s.seq, s.item.key.clone()))
            .collect();
        pending.sort();
        pending.truncate(n);

        let mut claimed = Vec::with_capacity(pending.len());
        for (_, _, key) in pending {
            if let Some(slot) = state.slots.get_mut(&key) {
                slot.item.status = ItemStatus::Processing;
                slot.item.updated_at = now;
                claimed.push(slot.item.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_done(&self, key: &EntryKey) -> KbaseResult<()> {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(key) {
            if slot.item.status == ItemStatus::Processing {
                slot.item.status = ItemStatus::Done;
                slot.item.last_error = None;
                slot.item.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn mark_retry(&self, key: &EntryKey, error: &str) -> KbaseResult<RetryOutcome> {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(key) else {
            return Ok(RetryOutcome::Missing);
        };
        if slot.item.status != ItemStatus::Processing {
            return Err(KbaseError::Storage(format!(
                "cannot retry {key}: item is {}",
                slot.item.status
            )));
        }

        let now = Utc::now();
        slot.item.attempts += 1;
        slot.item.last_error = Some(error.to_string());
        slot.item.updated_at = now;
        let attempts = slot.item.attempts;
        if attempts < self.policy.max_attempts {
            slot.item.status = ItemStatus::Pending;
            slot.item.retry_at = Some(self.policy.retry_at(now, attempts));
            Ok(RetryOutcome::Requeued { attempts })
        } else {
            slot.item.status = ItemStatus::Failed;
            Ok(RetryOutcome::Failed { attempts })
        }
    }

    async fn release(&self, key: &EntryKey) -> KbaseResult<()> {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(key) {
            if slot.item.status == ItemStatus::Processing {
                slot.item.status = ItemStatus::Pending;
                slot.item.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn recover_stale(&self) -> KbaseResult<usize> {
        let now = Utc::now();
        let cutoff = self.policy.stale_cutoff(now);
        let mut state = self.state.lock();
        let mut recovered = 0;
        for slot in state.slots.values_mut() {
            if slot.item.status == ItemStatus::Processing && slot.item.updated_at <= cutoff {
                slot.item.status = ItemStatus::Pending;
                slot.item.updated_at = now;
                slot.item.retry_at = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn remove(&self, key: &EntryKey) -> KbaseResult<bool> {
        Ok(self.state.lock().slots.remove(key).is_some())
    }

    async fn clear(&self) -> KbaseResult<()> {
        self.state.lock().slots.clear();
        Ok(())
    }

    async fn status_summary(&self) -> KbaseResult<QueueStatus> {
        let state = self.state.lock();
        let mut status = QueueStatus::default();
        let mut latest_error: Option<&QueueItem> = None;
        for slot in state.slots.values() {
            let item = &slot.item;
            match item.status {
                ItemStatus::Pending => status.pending += 1,
                ItemStatus::Processing => status.processing += 1,
                ItemStatus::Done => status.done += 1,
                ItemStatus::Failed => status.failed += 1,
            }
            if item.last_error.is_some()
                && latest_error.map_or(true, |l| item.updated_at > l.updated_at)
            {
                latest_error = Some(item);
            }
        }
        status.last_error = latest_error.and_then(|i| i.last_error.clone());
        Ok(status)
    }

    async fn get(&self, key: &EntryKey) -> KbaseResult<Option<QueueItem>> {
        Ok(self.state.lock().slots.get(key).map(|s| s.item.clone()))
    }
}
