//! SQLite-backed [`Store`] implementation.
//!
//! Schema (see [`crate::migrate`]): `documents`, `document_tags`,
//! `segments` (with an optional embedding BLOB), `sync_records`, and the
//! FTS5 table `segments_fts`. Filters are compiled into the `WHERE` clause
//! of each search so they restrict the candidate set before `LIMIT`.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteRow, SqliteTransaction};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{BTreeSet, HashMap};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::{
    Category, Document, Metadata, NewDocument, SearchFilters, Segment, StoredSegment, SyncRecord,
};
use crate::query::LexicalQuery;

use super::{rank_candidates, validate_vectors, SegmentCandidate, Store};

const DOCUMENT_COLUMNS: &str =
    "id, path, title, category, content_hash, word_count, metadata_json, created_at, updated_at";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a transaction that takes the write lock up front.
    ///
    /// A deferred transaction that reads before writing cannot wait for the
    /// lock once another connection has written, and fails with
    /// `SQLITE_BUSY` instead.
    async fn begin_write(&self) -> Result<SqliteTransaction<'static>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn tags_for(&self, document_id: &str) -> Result<BTreeSet<String>> {
        let tags: Vec<String> =
            sqlx::query_scalar("SELECT tag FROM document_tags WHERE document_id = ? ORDER BY tag")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(tags.into_iter().collect())
    }
}

fn row_to_document(row: &SqliteRow, tags: BTreeSet<String>) -> Result<Document> {
    let category: String = row.get("category");
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json).unwrap_or_default();

    Ok(Document {
        id: row.get("id"),
        path: row.get("path"),
        title: row.get("title"),
        category: category
            .parse()
            .map_err(|_| Error::Inconsistent(format!("stored category '{}' is invalid", category)))?,
        content_hash: row.get("content_hash"),
        word_count: row.get("word_count"),
        tags,
        metadata,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_candidate(row: &SqliteRow, raw_score: f64) -> Result<SegmentCandidate> {
    let category: String = row.get("category");
    let header_path_json: String = row.get("header_path_json");
    Ok(SegmentCandidate {
        segment_id: row.get("segment_id"),
        document_id: row.get("document_id"),
        path: row.get("path"),
        title: row.get("title"),
        category: category
            .parse()
            .map_err(|_| Error::Inconsistent(format!("stored category '{}' is invalid", category)))?,
        content: row.get("content"),
        header_path: serde_json::from_str(&header_path_json)?,
        raw_score,
    })
}

/// Append filter predicates on the `d` (documents) alias.
fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filters: &SearchFilters) {
    if let Some(category) = filters.category {
        builder.push(" AND d.category = ");
        builder.push_bind(category.as_str().to_string());
    }
    if let Some(path) = &filters.path {
        builder.push(" AND d.path = ");
        builder.push_bind(path.clone());
    }
    if !filters.tags.is_empty() {
        builder.push(
            " AND (SELECT COUNT(DISTINCT t.tag) FROM document_tags t \
             WHERE t.document_id = d.id AND t.tag IN (",
        );
        {
            let mut list = builder.separated(", ");
            for tag in &filters.tags {
                list.push_bind(tag.clone());
            }
        }
        builder.push(")) = ");
        builder.push_bind(filters.tags.len() as i64);
    }
}

async fn replace_tags(
    tx: &mut SqliteTransaction<'_>,
    document_id: &str,
    tags: &BTreeSet<String>,
) -> Result<()> {
    sqlx::query("DELETE FROM document_tags WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;
    for tag in tags {
        sqlx::query("INSERT INTO document_tags (document_id, tag) VALUES (?, ?)")
            .bind(document_id)
            .bind(tag)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_document(&self, doc: &NewDocument) -> Result<Document> {
        let now = chrono::Utc::now().timestamp();
        let metadata_json = serde_json::to_string(&doc.metadata)?;
        let mut tx = self.begin_write().await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, path, title, category, content_hash, word_count,
                                   metadata_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                title = excluded.title,
                category = excluded.category,
                content_hash = excluded.content_hash,
                word_count = excluded.word_count,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&doc.path)
        .bind(&doc.title)
        .bind(doc.category.as_str())
        .bind(&doc.content_hash)
        .bind(doc.word_count)
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE path = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(&doc.path)
        .fetch_one(&mut *tx)
        .await?;
        let id: String = row.get("id");

        replace_tags(&mut tx, &id, &doc.tags).await?;
        tx.commit().await?;

        row_to_document(&row, doc.tags.clone())
    }

    async fn get_document(&self, path: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE path = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let id: String = row.get("id");
                let tags = self.tags_for(&id).await?;
                Ok(Some(row_to_document(&row, tags)?))
            }
            None => Ok(None),
        }
    }

    async fn list_documents(&self, category: Option<Category>) -> Result<Vec<Document>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM documents d WHERE 1 = 1",
            DOCUMENT_COLUMNS
        ));
        if let Some(category) = category {
            builder.push(" AND d.category = ");
            builder.push_bind(category.as_str().to_string());
        }
        builder.push(" ORDER BY d.path ASC");
        let rows = builder.build().fetch_all(&self.pool).await?;

        let tag_rows = sqlx::query("SELECT document_id, tag FROM document_tags")
            .fetch_all(&self.pool)
            .await?;
        let mut tags: HashMap<String, BTreeSet<String>> = HashMap::new();
        for row in &tag_rows {
            tags.entry(row.get("document_id"))
                .or_default()
                .insert(row.get("tag"));
        }

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                row_to_document(row, tags.remove(&id).unwrap_or_default())
            })
            .collect()
    }

    async fn delete_document(&self, path: &str) -> Result<bool> {
        let mut tx = self.begin_write().await?;

        let id: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE path = ?")
            .bind(path)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(id) = id else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM segments_fts WHERE document_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn set_tags(&self, path: &str, tags: &BTreeSet<String>) -> Result<Document> {
        let mut tx = self.begin_write().await?;

        let id: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE path = ?")
            .bind(path)
            .fetch_optional(&mut *tx)
            .await?;
        let id = id.ok_or_else(|| Error::NotFound(format!("document '{}'", path)))?;

        replace_tags(&mut tx, &id, tags).await?;
        sqlx::query("UPDATE documents SET updated_at = ? WHERE id = ?")
            .bind(chrono::Utc::now().timestamp())
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.get_document(path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document '{}'", path)))
    }

    async fn replace_segments(
        &self,
        document_id: &str,
        segments: &[Segment],
        vectors: &[Option<Vec<f32>>],
    ) -> Result<()> {
        validate_vectors(segments, vectors)?;
        let mut tx = self.begin_write().await?;

        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            return Err(Error::NotFound(format!("document id '{}'", document_id)));
        }

        sqlx::query("DELETE FROM segments_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM segments WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for (segment, vector) in segments.iter().zip(vectors) {
            let header_path_json = serde_json::to_string(&segment.header_path)?;
            let blob = vector.as_deref().map(vec_to_blob);

            let segment_id = sqlx::query(
                r#"
                INSERT INTO segments (document_id, ordinal, content, content_hash,
                                      header_path_json, depth, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(document_id)
            .bind(segment.ordinal)
            .bind(&segment.content)
            .bind(&segment.hash)
            .bind(&header_path_json)
            .bind(segment.depth() as i64)
            .bind(blob)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            sqlx::query(
                "INSERT INTO segments_fts (segment_id, document_id, content) VALUES (?, ?, ?)",
            )
            .bind(segment_id)
            .bind(document_id)
            .bind(&segment.content)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn segments(&self, document_id: &str) -> Result<Vec<StoredSegment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, ordinal, content, content_hash, header_path_json, embedding
            FROM segments
            WHERE document_id = ?
            ORDER BY ordinal ASC
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let header_path_json: String = row.get("header_path_json");
                let blob: Option<Vec<u8>> = row.get("embedding");
                Ok(StoredSegment {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    segment: Segment {
                        ordinal: row.get("ordinal"),
                        content: row.get("content"),
                        header_path: serde_json::from_str(&header_path_json)?,
                        hash: row.get("content_hash"),
                    },
                    embedding: blob.map(|b| blob_to_vec(&b)),
                })
            })
            .collect()
    }

    async fn get_sync_record(&self, document_id: &str) -> Result<Option<SyncRecord>> {
        let row = sqlx::query(
            r#"
            SELECT status, last_synced_hash, last_synced_at, error_message
            FROM sync_records WHERE document_id = ?
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let status: String = row.get("status");
                Ok(Some(SyncRecord {
                    status: status.parse()?,
                    last_synced_hash: row.get("last_synced_hash"),
                    last_synced_at: row.get("last_synced_at"),
                    error_message: row.get("error_message"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn put_sync_record(&self, document_id: &str, record: &SyncRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_records (document_id, status, last_synced_hash,
                                      last_synced_at, error_message)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                status = excluded.status,
                last_synced_hash = excluded.last_synced_hash,
                last_synced_at = excluded.last_synced_at,
                error_message = excluded.error_message
            "#,
        )
        .bind(document_id)
        .bind(record.status.as_str())
        .bind(&record.last_synced_hash)
        .bind(record.last_synced_at)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn keyword_search(
        &self,
        query: &LexicalQuery,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SegmentCandidate>> {
        let Some(expr) = query.to_fts5() else {
            return Ok(Vec::new());
        };

        let mut builder = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT s.id AS segment_id, s.document_id, s.content, s.header_path_json,
                   d.path, d.title, d.category, f.rank
            FROM (
                SELECT CAST(segment_id AS INTEGER) AS segment_id, bm25(segments_fts) AS rank
                FROM segments_fts
                WHERE segments_fts MATCH "#,
        );
        builder.push_bind(expr);
        builder.push(
            r#"
            ) f
            JOIN segments s ON s.id = f.segment_id
            JOIN documents d ON d.id = s.document_id
            WHERE 1 = 1"#,
        );
        push_filters(&mut builder, filters);
        builder.push(" ORDER BY f.rank ASC, s.id ASC LIMIT ");
        builder.push_bind(limit as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                row_to_candidate(row, -rank)
            })
            .collect()
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SegmentCandidate>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT s.id AS segment_id, s.document_id, s.content, s.header_path_json,
                   s.embedding, d.path, d.title, d.category
            FROM segments s
            JOIN documents d ON d.id = s.document_id
            WHERE s.embedding IS NOT NULL"#,
        );
        push_filters(&mut builder, filters);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut candidates = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
                row_to_candidate(row, similarity)
            })
            .collect::<Result<Vec<_>>>()?;

        rank_candidates(&mut candidates);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Transient(format!("store health check failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::segment::segment_text;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> SqliteStore {
        let pool = crate::db::connect(&DbConfig {
            path: tmp.path().join("memory.sqlite"),
            max_connections: 2,
        })
        .await
        .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn new_doc(path: &str, category: Category, tags: &[&str]) -> NewDocument {
        NewDocument {
            path: path.to_string(),
            title: path.to_string(),
            category,
            content_hash: "h".to_string(),
            word_count: 2,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            metadata: Metadata::new(),
        }
    }

    async fn seed(store: &SqliteStore, path: &str, category: Category, tags: &[&str], text: &str) {
        let doc = store.upsert_document(&new_doc(path, category, tags)).await.unwrap();
        let segments = segment_text(text, 800, 200);
        let vectors: Vec<Option<Vec<f32>>> =
            segments.iter().map(|_| Some(vec![1.0, 0.0])).collect();
        store.replace_segments(&doc.id, &segments, &vectors).await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;

        let first = store
            .upsert_document(&new_doc("projects/a.md", Category::Project, &["x", "y"]))
            .await
            .unwrap();
        let again = store
            .upsert_document(&new_doc("projects/a.md", Category::Project, &["z"]))
            .await
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(first.created_at, again.created_at);

        let fetched = store.get_document("projects/a.md").await.unwrap().unwrap();
        assert_eq!(fetched.tags.into_iter().collect::<Vec<_>>(), vec!["z"]);
        assert!(store.get_document("missing.md").await.unwrap().is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn test_keyword_search_with_filters() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        seed(&store, "projects/a.md", Category::Project, &["a", "b"], "deployment runbook").await;
        seed(&store, "projects/b.md", Category::Project, &["a"], "deployment checklist").await;
        seed(&store, "concepts/c.md", Category::Concept, &["a", "b"], "deployment theory").await;

        let query = LexicalQuery::parse("deployment");
        let all = store
            .keyword_search(&query, 10, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let tagged = SearchFilters {
            tags: ["a", "b"].iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        };
        let mut paths: Vec<String> = store
            .keyword_search(&query, 10, &tagged)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["concepts/c.md", "projects/a.md"]);

        let project_and_tagged = SearchFilters {
            category: Some(Category::Project),
            ..tagged.clone()
        };
        let hits = store
            .keyword_search(&query, 10, &project_and_tagged)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "projects/a.md");

        let by_path = SearchFilters {
            path: Some("projects/b.md".to_string()),
            ..Default::default()
        };
        let hits = store.vector_search(&[1.0, 0.0], 10, &by_path).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "projects/b.md");
        store.close().await;
    }

    #[tokio::test]
    async fn test_replace_segments_and_delete() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        seed(&store, "a.md", Category::Other, &[], "# One\n\nalpha\n\n# Two\n\nbeta").await;
        let doc = store.get_document("a.md").await.unwrap().unwrap();

        let stored = store.segments(&doc.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].segment.header_path, vec!["Two"]);
        assert_eq!(stored[0].embedding.as_deref(), Some(&[1.0f32, 0.0][..]));

        let replacement = segment_text("gamma", 800, 200);
        store
            .replace_segments(&doc.id, &replacement, &[None])
            .await
            .unwrap();
        let stored = store.segments(&doc.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].embedding.is_none());

        let old = store
            .keyword_search(&LexicalQuery::parse("alpha"), 10, &SearchFilters::default())
            .await
            .unwrap();
        assert!(old.is_empty());

        store
            .put_sync_record(&doc.id, &SyncRecord::completed("h", 1))
            .await
            .unwrap();
        assert!(store.delete_document("a.md").await.unwrap());
        assert!(store.get_sync_record(&doc.id).await.unwrap().is_none());
        let gone = store
            .keyword_search(&LexicalQuery::parse("gamma"), 10, &SearchFilters::default())
            .await
            .unwrap();
        assert!(gone.is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn test_sync_record_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let doc = store
            .upsert_document(&new_doc("a.md", Category::Other, &[]))
            .await
            .unwrap();

        assert!(store.get_sync_record(&doc.id).await.unwrap().is_none());
        store
            .put_sync_record(&doc.id, &SyncRecord::failed("boom".into(), 5))
            .await
            .unwrap();
        let record = store.get_sync_record(&doc.id).await.unwrap().unwrap();
        assert_eq!(record.status, crate::models::SyncStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
        store.close().await;
    }

    #[tokio::test]
    async fn test_set_tags_and_list() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        store
            .upsert_document(&new_doc("projects/a.md", Category::Project, &[]))
            .await
            .unwrap();
        store
            .upsert_document(&new_doc("concepts/b.md", Category::Concept, &[]))
            .await
            .unwrap();

        let tags: BTreeSet<String> = ["rust".to_string()].into_iter().collect();
        let updated = store.set_tags("projects/a.md", &tags).await.unwrap();
        assert_eq!(updated.tags, tags);

        let projects = store.list_documents(Some(Category::Project)).await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].tags, tags);
        assert_eq!(store.list_documents(None).await.unwrap().len(), 2);

        let err = store.set_tags("missing.md", &tags).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
        store.close().await;
    }
}
