//! Storage abstraction for the searchable store.
//!
//! The [`Store`] trait defines every operation the synchronizer and the
//! hybrid engine need, so backends are interchangeable:
//!
//! - [`sqlite::SqliteStore`]: FTS5 keyword index plus BLOB vectors.
//! - [`memory::InMemoryStore`]: `RwLock`-guarded maps, for tests and
//!   embedding the engine without a database.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::Result;
use crate::models::{
    Category, Document, NewDocument, SearchFilters, Segment, StoredSegment, SyncRecord,
};
use crate::query::LexicalQuery;

/// A candidate segment returned from keyword or vector search.
///
/// Carries the owning document's display fields so results can be built
/// without another round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentCandidate {
    pub segment_id: i64,
    pub document_id: String,
    pub path: String,
    pub title: String,
    pub category: Category,
    pub content: String,
    pub header_path: Vec<String>,
    /// Higher is better: negated BM25 / term score, or cosine similarity.
    pub raw_score: f64,
}

/// Abstract searchable store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](Store::upsert_document) | Insert or update a document by path |
/// | [`replace_segments`](Store::replace_segments) | Atomically swap all segments of a document |
/// | [`keyword_search`](Store::keyword_search) | Filtered full-text search |
/// | [`vector_search`](Store::vector_search) | Filtered cosine similarity search |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update the document at `doc.path`.
    ///
    /// Keeps the existing id and `created_at`; bumps `updated_at`.
    async fn upsert_document(&self, doc: &NewDocument) -> Result<Document>;

    async fn get_document(&self, path: &str) -> Result<Option<Document>>;

    /// All documents, optionally restricted to one category, ordered by path.
    async fn list_documents(&self, category: Option<Category>) -> Result<Vec<Document>>;

    /// Delete a document together with its segments and sync record.
    async fn delete_document(&self, path: &str) -> Result<bool>;

    /// Replace the tag set of an existing document.
    async fn set_tags(&self, path: &str, tags: &BTreeSet<String>) -> Result<Document>;

    /// Replace all segments of a document in one transaction.
    ///
    /// `vectors` is parallel to `segments`; `None` stores a null embedding.
    async fn replace_segments(
        &self,
        document_id: &str,
        segments: &[Segment],
        vectors: &[Option<Vec<f32>>],
    ) -> Result<()>;

    /// Segments of a document, by ordinal.
    async fn segments(&self, document_id: &str) -> Result<Vec<StoredSegment>>;

    async fn get_sync_record(&self, document_id: &str) -> Result<Option<SyncRecord>>;

    async fn put_sync_record(&self, document_id: &str, record: &SyncRecord) -> Result<()>;

    /// Full-text search over segments whose document passes `filters`.
    async fn keyword_search(
        &self,
        query: &LexicalQuery,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SegmentCandidate>>;

    /// Nearest segments by cosine similarity among those with embeddings
    /// whose document passes `filters`.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SegmentCandidate>>;

    async fn health_check(&self) -> Result<()>;

    /// Release connections. The store must not be used afterwards.
    async fn close(&self);
}

/// Order candidates best-first, ties by ascending segment id.
pub(crate) fn rank_candidates(candidates: &mut [SegmentCandidate]) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.segment_id.cmp(&b.segment_id))
    });
}

pub(crate) fn validate_vectors(segments: &[Segment], vectors: &[Option<Vec<f32>>]) -> Result<()> {
    if segments.len() != vectors.len() {
        return Err(crate::error::Error::Inconsistent(format!(
            "{} vectors supplied for {} segments",
            vectors.len(),
            segments.len()
        )));
    }
    Ok(())
}
