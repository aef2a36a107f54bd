use async_trait::async_trait;
use kbase_core::{Entry, EntryKey, EntryMeta, EntryText, KbaseError, KbaseResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Read access to the entry collaborator.
///
/// The search engine never owns entries; it only reads the rankable text and
/// the filterable attributes, keyed by [`EntryKey`].
#[async_trait]
pub trait EntrySource: Send + Sync {
    /// Title, summary and a bounded body prefix. `None` if the entry is gone.
    async fn get_entry_text(&self, key: &EntryKey) -> KbaseResult<Option<EntryText>>;

    /// Type, tags and update time. `None` if the entry is gone.
    async fn get_entry_meta(&self, key: &EntryKey) -> KbaseResult<Option<EntryMeta>>;

    /// Every key currently known, used by full rebuilds.
    async fn list_keys(&self) -> KbaseResult<Vec<EntryKey>>;
}

/// In-memory entry store, optionally persisted as JSONL.
///
/// Stands in for the CRUD layer in the CLI and in tests.
pub struct InMemoryEntryStore {
    entries: RwLock<BTreeMap<EntryKey, Entry>>,
    body_prefix_chars: usize,
}

impl InMemoryEntryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            body_prefix_chars: 1000,
        }
    }

    /// Set how many body characters [`EntrySource::get_entry_text`] returns.
    pub fn with_body_prefix_chars(mut self, chars: usize) -> Self {
        self.body_prefix_chars = chars;
        self
    }

    /// Insert or replace an entry.
    pub async fn upsert(&self, entry: Entry) {
        let mut entries = self.entries.write().await;
        entries.insert(entry.key(), entry);
    }

    /// Remove an entry. Returns whether it existed.
    pub async fn remove(&self, key: &EntryKey) -> bool {
        let mut entries = self.entries.write().await;
        entries.remove(key).is_some()
    }

    /// Fetch the full entry (the explicit follow-up call for body content).
    pub async fn get(&self, key: &EntryKey) -> Option<Entry> {
        let entries = self.entries.read().await;
        entries.get(key).cloned()
    }

    /// All entries in key order.
    pub async fn all(&self) -> Vec<Entry> {
        let entries = self.entries.read().await;
        entries.values().cloned().collect()
    }

    /// Number of stored entries.
    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Load entries from a JSONL file. A missing file yields an empty store.
    pub async fn load_jsonl(path: &Path) -> KbaseResult<Self> {
        let store = Self::new();
        if !path.exists() {
            return Ok(store);
        }
        for entry in read_entries_jsonl(path).await? {
            store.upsert(entry).await;
        }
        Ok(store)
    }

    /// Write every entry to a JSONL file, replacing its contents.
    pub async fn save_jsonl(&self, path: &Path) -> KbaseResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut data = String::new();
        for entry in self.all().await {
            data.push_str(&serde_json::to_string(&entry)?);
            data.push('\n');
        }
        tokio::fs::write(path, data.as_bytes()).await?;
        Ok(())
    }
}

impl Default for InMemoryEntryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a JSONL file of entries, reporting the offending line on error.
pub async fn read_entries_jsonl(path: &Path) -> KbaseResult<Vec<Entry>> {
    let data = tokio::fs::read_to_string(path).await.map_err(|e| {
        KbaseError::Storage(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let mut entries = Vec::new();
    for (idx, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: Entry = serde_json::from_str(line).map_err(|e| {
            KbaseError::Storage(format!(
                "Invalid entry on line {} of {}: {}",
                idx + 1,
                path.display(),
                e
            ))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Default location of the entry file inside a data directory.
pub fn entries_path(data_dir: &Path) -> PathBuf {
    data_dir.join("entries.jsonl")
}

#[async_trait]
impl EntrySource for InMemoryEntryStore {
    async fn get_entry_text(&self, key: &EntryKey) -> KbaseResult<Option<EntryText>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).map(|e| e.text(self.body_prefix_chars)))
    }

    async fn get_entry_meta(&self, key: &EntryKey) -> KbaseResult<Option<EntryMeta>> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).map(Entry::meta))
    }

    async fn list_keys(&self) -> KbaseResult<Vec<EntryKey>> {
        let entries = self.entries.read().await;
        Ok(entries.keys().cloned().collect())
    }
}
