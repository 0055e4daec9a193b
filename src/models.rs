//! Core data models used throughout the memory engine.
//!
//! These types represent the documents, segments, sync bookkeeping, and
//! search results that flow between the files on disk, the searchable
//! store, and the dual index mirror.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::Error;

/// Free-form key/value metadata attached to a document.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Closed set of document categories.
///
/// Categories are derived from the containing directory of a document
/// (`projects/` → [`Category::Project`], ...). The configured root
/// document is always [`Category::Main`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Main,
    Project,
    Concept,
    Conversation,
    Preference,
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Main,
        Category::Project,
        Category::Concept,
        Category::Conversation,
        Category::Preference,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Main => "main",
            Category::Project => "project",
            Category::Concept => "concept",
            Category::Conversation => "conversation",
            Category::Preference => "preference",
            Category::Other => "other",
        }
    }

    /// Directory that holds documents of this category, relative to the root.
    pub fn directory(&self) -> Option<&'static str> {
        match self {
            Category::Main => None,
            Category::Project => Some("projects"),
            Category::Concept => Some("concepts"),
            Category::Conversation => Some("conversations"),
            Category::Preference => Some("preferences"),
            Category::Other => Some("others"),
        }
    }

    /// Heading used for this category in the root document's file index.
    pub fn index_heading(&self) -> &'static str {
        match self {
            Category::Main => "Main",
            Category::Project => "Projects",
            Category::Concept => "Concepts",
            Category::Conversation => "Conversations",
            Category::Preference => "Preferences",
            Category::Other => "Other",
        }
    }

    /// Derive the category of a document from its relative path.
    ///
    /// Only the immediate parent directory is consulted; unknown
    /// directories (and nested sub-directories) map to [`Category::Other`].
    pub fn from_path(path: &str, main_file: &str) -> Category {
        if path == main_file {
            return Category::Main;
        }
        let parent = Path::new(path)
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("");
        match parent {
            "projects" => Category::Project,
            "concepts" => Category::Concept,
            "conversations" => Category::Conversation,
            "preferences" => Category::Preference,
            _ => Category::Other,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" => Ok(Category::Main),
            "project" | "projects" => Ok(Category::Project),
            "concept" | "concepts" => Ok(Category::Concept),
            "conversation" | "conversations" => Ok(Category::Conversation),
            "preference" | "preferences" => Ok(Category::Preference),
            "other" | "others" => Ok(Category::Other),
            other => Err(Error::Validation(format!(
                "unknown category '{}'; expected one of main, project, concept, conversation, preference, other",
                other
            ))),
        }
    }
}

/// Document as stored in the searchable store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub path: String,
    pub title: String,
    pub category: Category,
    pub content_hash: String,
    pub word_count: i64,
    pub tags: BTreeSet<String>,
    pub metadata: Metadata,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields written by a document upsert. Identity and creation time are
/// owned by the store.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub path: String,
    pub title: String,
    pub category: Category,
    pub content_hash: String,
    pub word_count: i64,
    pub tags: BTreeSet<String>,
    pub metadata: Metadata,
}

impl From<Document> for NewDocument {
    fn from(doc: Document) -> Self {
        Self {
            path: doc.path,
            title: doc.title,
            category: doc.category,
            content_hash: doc.content_hash,
            word_count: doc.word_count,
            tags: doc.tags,
            metadata: doc.metadata,
        }
    }
}

/// A retrievable unit of a document, as produced by the segmenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Dense position within the document, starting at 0.
    pub ordinal: i64,
    pub content: String,
    /// Enclosing headings, outermost first. Never contains empty entries.
    pub header_path: Vec<String>,
    pub hash: String,
}

impl Segment {
    pub fn depth(&self) -> usize {
        self.header_path.len()
    }
}

/// A segment persisted in the store.
#[derive(Debug, Clone)]
pub struct StoredSegment {
    pub id: i64,
    pub document_id: String,
    pub segment: Segment,
    pub embedding: Option<Vec<f32>>,
}

/// Lifecycle of a document's synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(Error::Inconsistent(format!("unknown sync status '{}'", other))),
        }
    }
}

/// Per-document synchronization bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    pub status: SyncStatus,
    pub last_synced_hash: Option<String>,
    pub last_synced_at: Option<i64>,
    pub error_message: Option<String>,
}

impl SyncRecord {
    pub fn syncing() -> Self {
        Self {
            status: SyncStatus::Syncing,
            last_synced_hash: None,
            last_synced_at: None,
            error_message: None,
        }
    }

    pub fn completed(hash: &str, at: i64) -> Self {
        Self {
            status: SyncStatus::Completed,
            last_synced_hash: Some(hash.to_string()),
            last_synced_at: Some(at),
            error_message: None,
        }
    }

    pub fn failed(message: String, at: i64) -> Self {
        Self {
            status: SyncStatus::Failed,
            last_synced_hash: None,
            last_synced_at: Some(at),
            error_message: Some(message),
        }
    }

    /// True if this record proves `hash` is fully reflected in the store.
    pub fn is_current(&self, hash: &str) -> bool {
        self.status == SyncStatus::Completed && self.last_synced_hash.as_deref() == Some(hash)
    }
}

/// Retrieval strategy for a search request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Vector,
    Fulltext,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Vector => "vector",
            SearchMode::Fulltext => "fulltext",
            SearchMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" | "semantic" => Ok(SearchMode::Vector),
            "fulltext" | "keyword" => Ok(SearchMode::Fulltext),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(Error::Validation(format!(
                "unknown search mode '{}'; expected vector, fulltext, or hybrid",
                other
            ))),
        }
    }
}

/// Filters applied before ranking.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub category: Option<Category>,
    pub path: Option<String>,
    /// A document matches only if it carries every one of these tags.
    pub tags: BTreeSet<String>,
}

impl SearchFilters {
    pub fn matches(&self, path: &str, category: Category, tags: &BTreeSet<String>) -> bool {
        if let Some(c) = self.category {
            if c != category {
                return false;
            }
        }
        if let Some(p) = &self.path {
            if p != path {
                return false;
            }
        }
        self.tags.is_subset(tags)
    }
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub segment_id: i64,
    pub path: String,
    pub title: String,
    pub category: Category,
    pub content: String,
    pub header_path: Vec<String>,
    pub score: f64,
    pub mode: SearchMode,
}

/// A document's entry in the dual index mirror.
///
/// This is also the summary returned by listing operations, whichever
/// index backs them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "file_path")]
    pub path: String,
    pub title: String,
    pub category: Category,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub word_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IndexEntry {
    pub fn from_document(doc: &Document, description: String) -> Self {
        Self {
            path: doc.path.clone(),
            title: doc.title.clone(),
            category: doc.category,
            description,
            tags: doc.tags.clone(),
            metadata: doc.metadata.clone(),
            word_count: doc.word_count,
            created_at: timestamp(doc.created_at),
            updated_at: timestamp(doc.updated_at),
        }
    }
}

/// Caller-supplied document attributes. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct DocumentAttrs {
    pub tags: Option<BTreeSet<String>>,
    pub metadata: Option<Metadata>,
    pub description: Option<String>,
}

/// Convert unix seconds to a UTC timestamp, clamping invalid values to the epoch.
pub fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_path() {
        assert_eq!(Category::from_path("main.md", "main.md"), Category::Main);
        assert_eq!(Category::from_path("projects/x.md", "main.md"), Category::Project);
        assert_eq!(Category::from_path("concepts/x.md", "main.md"), Category::Concept);
        assert_eq!(
            Category::from_path("conversations/x.md", "main.md"),
            Category::Conversation
        );
        assert_eq!(
            Category::from_path("preferences/x.md", "main.md"),
            Category::Preference
        );
        assert_eq!(Category::from_path("misc/x.md", "main.md"), Category::Other);
        assert_eq!(Category::from_path("loose.md", "main.md"), Category::Other);
        assert_eq!(
            Category::from_path("projects/deep/x.md", "main.md"),
            Category::Other
        );
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("Project".parse::<Category>().unwrap(), Category::Project);
        assert_eq!("concepts".parse::<Category>().unwrap(), Category::Concept);
        let err = "recipes".parse::<Category>().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_search_mode_parse() {
        assert_eq!("hybrid".parse::<SearchMode>().unwrap(), SearchMode::Hybrid);
        assert_eq!("FULLTEXT".parse::<SearchMode>().unwrap(), SearchMode::Fulltext);
        assert!("fuzzy".parse::<SearchMode>().is_err());
    }

    #[test]
    fn test_filters_tag_superset() {
        let filters = SearchFilters {
            tags: ["a", "b"].iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let ab: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let a: BTreeSet<String> = ["a"].iter().map(|s| s.to_string()).collect();
        assert!(filters.matches("x.md", Category::Other, &ab));
        assert!(!filters.matches("x.md", Category::Other, &a));
        assert!(SearchFilters::default().matches("x.md", Category::Other, &a));
    }

    #[test]
    fn test_sync_record_currency() {
        let done = SyncRecord::completed("abc", 10);
        assert!(done.is_current("abc"));
        assert!(!done.is_current("def"));
        assert!(!SyncRecord::failed("boom".into(), 10).is_current("abc"));
    }

    #[test]
    fn test_index_entry_json_field_names() {
        let entry = IndexEntry {
            path: "projects/a.md".into(),
            title: "A".into(),
            category: Category::Project,
            description: String::new(),
            tags: BTreeSet::new(),
            metadata: Metadata::new(),
            word_count: 3,
            created_at: timestamp(0),
            updated_at: timestamp(0),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["file_path"], "projects/a.md");
        assert_eq!(json["category"], "project");
    }
}
