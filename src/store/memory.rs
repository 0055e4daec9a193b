//! In-memory [`Store`] implementation.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Keyword search
//! evaluates the [`LexicalQuery`] against tokenized segment text; vector
//! search is brute-force cosine similarity.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::{
    Category, Document, NewDocument, SearchFilters, Segment, StoredSegment, SyncRecord,
};
use crate::query::{tokenize, LexicalQuery};

use super::{rank_candidates, validate_vectors, SegmentCandidate, Store};

struct Row {
    id: i64,
    document_id: String,
    segment: Segment,
    tokens: Vec<String>,
    embedding: Option<Vec<f32>>,
}

#[derive(Default)]
struct Inner {
    /// Keyed by path.
    docs: HashMap<String, Document>,
    segments: Vec<Row>,
    sync: HashMap<String, SyncRecord>,
    next_segment_id: i64,
}

impl Inner {
    fn doc_by_id(&self, id: &str) -> Option<&Document> {
        self.docs.values().find(|d| d.id == id)
    }
}

/// In-memory store for tests and database-free embedding of the engine.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Inconsistent("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Inconsistent("in-memory store lock poisoned".into()))
    }

    fn candidates<F>(&self, filters: &SearchFilters, mut score: F) -> Result<Vec<SegmentCandidate>>
    where
        F: FnMut(&Row) -> Option<f64>,
    {
        let inner = self.read()?;
        let mut out = Vec::new();
        for row in &inner.segments {
            let Some(doc) = inner.doc_by_id(&row.document_id) else {
                continue;
            };
            if !filters.matches(&doc.path, doc.category, &doc.tags) {
                continue;
            }
            if let Some(raw_score) = score(row) {
                out.push(SegmentCandidate {
                    segment_id: row.id,
                    document_id: doc.id.clone(),
                    path: doc.path.clone(),
                    title: doc.title.clone(),
                    category: doc.category,
                    content: row.segment.content.clone(),
                    header_path: row.segment.header_path.clone(),
                    raw_score,
                });
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_document(&self, doc: &NewDocument) -> Result<Document> {
        let now = chrono::Utc::now().timestamp();
        let mut inner = self.write()?;
        let stored = match inner.docs.get(&doc.path) {
            Some(existing) => Document {
                id: existing.id.clone(),
                created_at: existing.created_at,
                ..new_document(doc, now)
            },
            None => new_document(doc, now),
        };
        inner.docs.insert(doc.path.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_document(&self, path: &str) -> Result<Option<Document>> {
        Ok(self.read()?.docs.get(path).cloned())
    }

    async fn list_documents(&self, category: Option<Category>) -> Result<Vec<Document>> {
        let inner = self.read()?;
        let mut docs: Vec<Document> = inner
            .docs
            .values()
            .filter(|d| category.map_or(true, |c| d.category == c))
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(docs)
    }

    async fn delete_document(&self, path: &str) -> Result<bool> {
        let mut inner = self.write()?;
        let Some(doc) = inner.docs.remove(path) else {
            return Ok(false);
        };
        inner.segments.retain(|r| r.document_id != doc.id);
        inner.sync.remove(&doc.id);
        Ok(true)
    }

    async fn set_tags(&self, path: &str, tags: &BTreeSet<String>) -> Result<Document> {
        let mut inner = self.write()?;
        let doc = inner
            .docs
            .get_mut(path)
            .ok_or_else(|| Error::NotFound(format!("document '{}'", path)))?;
        doc.tags = tags.clone();
        doc.updated_at = chrono::Utc::now().timestamp();
        Ok(doc.clone())
    }

    async fn replace_segments(
        &self,
        document_id: &str,
        segments: &[Segment],
        vectors: &[Option<Vec<f32>>],
    ) -> Result<()> {
        validate_vectors(segments, vectors)?;
        let mut inner = self.write()?;
        if inner.doc_by_id(document_id).is_none() {
            return Err(Error::NotFound(format!("document id '{}'", document_id)));
        }
        inner.segments.retain(|r| r.document_id != document_id);
        for (segment, vector) in segments.iter().zip(vectors) {
            inner.next_segment_id += 1;
            let id = inner.next_segment_id;
            inner.segments.push(Row {
                id,
                document_id: document_id.to_string(),
                tokens: tokenize(&segment.content),
                segment: segment.clone(),
                embedding: vector.clone(),
            });
        }
        Ok(())
    }

    async fn segments(&self, document_id: &str) -> Result<Vec<StoredSegment>> {
        let inner = self.read()?;
        let mut out: Vec<StoredSegment> = inner
            .segments
            .iter()
            .filter(|r| r.document_id == document_id)
            .map(|r| StoredSegment {
                id: r.id,
                document_id: r.document_id.clone(),
                segment: r.segment.clone(),
                embedding: r.embedding.clone(),
            })
            .collect();
        out.sort_by_key(|s| s.segment.ordinal);
        Ok(out)
    }

    async fn get_sync_record(&self, document_id: &str) -> Result<Option<SyncRecord>> {
        Ok(self.read()?.sync.get(document_id).cloned())
    }

    async fn put_sync_record(&self, document_id: &str, record: &SyncRecord) -> Result<()> {
        self.write()?
            .sync
            .insert(document_id.to_string(), record.clone());
        Ok(())
    }

    async fn keyword_search(
        &self,
        query: &LexicalQuery,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SegmentCandidate>> {
        let mut candidates = self.candidates(filters, |row| query.score(&row.tokens))?;
        rank_candidates(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SegmentCandidate>> {
        let mut candidates = self.candidates(filters, |row| {
            row.embedding
                .as_ref()
                .map(|v| cosine_similarity(query_vec, v) as f64)
        })?;
        rank_candidates(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn health_check(&self) -> Result<()> {
        self.read().map(|_| ())
    }

    async fn close(&self) {}
}

fn new_document(doc: &NewDocument, now: i64) -> Document {
    Document {
        id: uuid::Uuid::new_v4().to_string(),
        path: doc.path.clone(),
        title: doc.title.clone(),
        category: doc.category,
        content_hash: doc.content_hash.clone(),
        word_count: doc.word_count,
        tags: doc.tags.clone(),
        metadata: doc.metadata.clone(),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;
    use crate::segment::segment_text;

    fn new_doc(path: &str, category: Category, tags: &[&str]) -> NewDocument {
        NewDocument {
            path: path.to_string(),
            title: path.to_string(),
            category,
            content_hash: "h".to_string(),
            word_count: 1,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            metadata: Metadata::new(),
        }
    }

    async fn seed(store: &InMemoryStore, path: &str, category: Category, tags: &[&str], text: &str) {
        let doc = store.upsert_document(&new_doc(path, category, tags)).await.unwrap();
        let segments = segment_text(text, 800, 200);
        let vectors = vec![None; segments.len()];
        store.replace_segments(&doc.id, &segments, &vectors).await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_preserves_identity() {
        let store = InMemoryStore::new();
        let first = store.upsert_document(&new_doc("a.md", Category::Other, &[])).await.unwrap();
        let second = store.upsert_document(&new_doc("a.md", Category::Other, &["x"])).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert!(second.tags.contains("x"));
        assert_eq!(store.list_documents(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replace_segments_swaps_all() {
        let store = InMemoryStore::new();
        let doc = store.upsert_document(&new_doc("a.md", Category::Other, &[])).await.unwrap();
        let one = segment_text("# A\n\nfirst\n\n# B\n\nsecond", 800, 200);
        store.replace_segments(&doc.id, &one, &vec![None; one.len()]).await.unwrap();
        assert_eq!(store.segments(&doc.id).await.unwrap().len(), 2);

        let two = segment_text("only", 800, 200);
        store.replace_segments(&doc.id, &two, &[None]).await.unwrap();
        let stored = store.segments(&doc.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].segment.content, "only");
    }

    #[tokio::test]
    async fn test_replace_segments_rejects_mismatched_vectors() {
        let store = InMemoryStore::new();
        let doc = store.upsert_document(&new_doc("a.md", Category::Other, &[])).await.unwrap();
        let segments = segment_text("text", 800, 200);
        let err = store.replace_segments(&doc.id, &segments, &[]).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Inconsistent);
    }

    #[tokio::test]
    async fn test_keyword_search_filters_before_limit() {
        let store = InMemoryStore::new();
        seed(&store, "concepts/a.md", Category::Concept, &[], "deploy deploy deploy").await;
        seed(&store, "projects/b.md", Category::Project, &[], "deploy once").await;

        let filters = SearchFilters {
            category: Some(Category::Project),
            ..Default::default()
        };
        let hits = store
            .keyword_search(&LexicalQuery::parse("deploy"), 1, &filters)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "projects/b.md");
    }

    #[tokio::test]
    async fn test_tag_superset_filter() {
        let store = InMemoryStore::new();
        seed(&store, "a.md", Category::Other, &["a", "b"], "shared term").await;
        seed(&store, "b.md", Category::Other, &["a"], "shared term").await;

        let filters = SearchFilters {
            tags: ["a", "b"].iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        };
        let hits = store
            .keyword_search(&LexicalQuery::parse("shared"), 10, &filters)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "a.md");
    }

    #[tokio::test]
    async fn test_vector_search_skips_null_embeddings() {
        let store = InMemoryStore::new();
        let doc = store.upsert_document(&new_doc("a.md", Category::Other, &[])).await.unwrap();
        let segments = segment_text("# A\n\none\n\n# B\n\ntwo", 800, 200);
        store
            .replace_segments(&doc.id, &segments, &[Some(vec![1.0, 0.0]), None])
            .await
            .unwrap();
        let hits = store
            .vector_search(&[1.0, 0.0], 10, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].raw_score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = InMemoryStore::new();
        seed(&store, "a.md", Category::Other, &[], "text").await;
        let doc = store.get_document("a.md").await.unwrap().unwrap();
        store.put_sync_record(&doc.id, &SyncRecord::completed("h", 1)).await.unwrap();

        assert!(store.delete_document("a.md").await.unwrap());
        assert!(store.segments(&doc.id).await.unwrap().is_empty());
        assert!(store.get_sync_record(&doc.id).await.unwrap().is_none());
        assert!(!store.delete_document("a.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_tags_missing_document() {
        let store = InMemoryStore::new();
        let err = store.set_tags("nope.md", &BTreeSet::new()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
