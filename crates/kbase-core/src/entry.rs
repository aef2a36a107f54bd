use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable join key between derived search state and the entry it came from.
///
/// Ordering is by `entry_id` first, then `collection`; fusion uses it as the
/// last tie-breaker so results are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    /// Identifier of the entry within its collection.
    pub entry_id: String,
    /// Name of the collection the entry belongs to.
    pub collection: String,
}

impl EntryKey {
    /// Creates a key from an entry id and a collection name.
    pub fn new(entry_id: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.entry_id)
    }
}

/// A knowledge-base entry as provided by the entry collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Identifier of the entry within its collection.
    pub id: String,
    /// Name of the collection the entry belongs to.
    pub collection: String,
    /// Schema type of the entry (e.g. `note`, `decision`).
    #[serde(rename = "type", default = "default_entry_type")]
    pub entry_type: String,
    /// Human-readable title.
    pub title: String,
    /// Short summary, may be empty.
    #[serde(default)]
    pub summary: String,
    /// Full body text.
    #[serde(default)]
    pub body: String,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// UTC timestamp of creation.
    pub created_at: DateTime<Utc>,
    /// UTC timestamp of the last update.
    pub updated_at: DateTime<Utc>,
}

fn default_entry_type() -> String {
    "note".to_string()
}

impl Entry {
    /// Creates an entry with the given identity and title, stamped now.
    pub fn new(
        id: impl Into<String>,
        collection: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            collection: collection.into(),
            entry_type: default_entry_type(),
            title: title.into(),
            summary: String::new(),
            body: String::new(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the summary. Chainable builder method.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Sets the body. Chainable builder method.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the entry type. Chainable builder method.
    pub fn with_type(mut self, entry_type: impl Into<String>) -> Self {
        self.entry_type = entry_type.into();
        self
    }

    /// Sets the tags. Chainable builder method.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets `updated_at`. Chainable builder method.
    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    /// The identity of this entry.
    pub fn key(&self) -> EntryKey {
        EntryKey::new(self.id.clone(), self.collection.clone())
    }

    /// The text the search engine ranks on, with the body cut to
    /// `body_prefix_chars` characters.
    pub fn text(&self, body_prefix_chars: usize) -> EntryText {
        EntryText {
            title: self.title.clone(),
            summary: self.summary.clone(),
            body_prefix: self.body.chars().take(body_prefix_chars).collect(),
        }
    }

    /// The filterable attributes of this entry.
    pub fn meta(&self) -> EntryMeta {
        EntryMeta {
            entry_type: self.entry_type.clone(),
            tags: self.tags.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Rankable text of an entry. The body is only ever a bounded prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryText {
    /// Entry title.
    pub title: String,
    /// Entry summary.
    pub summary: String,
    /// First N characters of the body.
    pub body_prefix: String,
}

impl EntryText {
    /// Concatenated text fed to the embedding model.
    pub fn embedding_input(&self) -> String {
        [
            self.title.as_str(),
            self.summary.as_str(),
            self.body_prefix.as_str(),
        ]
        .iter()
        .filter(|s| !s.trim().is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
    }
}

/// Filterable attributes of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    /// Schema type of the entry.
    pub entry_type: String,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// UTC timestamp of the last update.
    pub updated_at: DateTime<Utc>,
}
