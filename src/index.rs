//! Document index strategy.
//!
//! [`DocumentIndex`] is the single interface higher-level code uses to keep
//! document metadata current and to query it. One implementation is chosen
//! at startup:
//!
//! | Implementation | When | Search |
//! |----------------|------|--------|
//! | [`StoreIndex`] | a searchable store is configured | hybrid engine |
//! | [`MirrorIndex`] | no store | unavailable (`Degraded`) |
//!
//! Both keep the [`Mirror`] current, so the JSON index and the root
//! document's File Index are usable whichever strategy is active.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::files::{title_from_path, word_count, DocumentFiles};
use crate::mirror::Mirror;
use crate::models::{Category, Document, DocumentAttrs, IndexEntry, SearchHit};
use crate::search::{HybridEngine, SearchRequest};
use crate::sync::{CancelHandle, SyncOptions, SyncReport, Synchronizer};

#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Bring the index in step with the file at `path`.
    ///
    /// `attrs` overrides tags, metadata, or description; unset fields keep
    /// their indexed values.
    async fn record(&self, path: &str, attrs: DocumentAttrs) -> Result<IndexEntry>;

    /// Drop a document from the index. Returns whether anything was removed.
    async fn forget(&self, path: &str) -> Result<bool>;

    async fn get(&self, path: &str) -> Result<Option<IndexEntry>>;

    /// Indexed documents, optionally in one category, ordered by path.
    async fn list(&self, category: Option<Category>) -> Result<Vec<IndexEntry>>;

    /// Replace the tag set of an indexed document.
    async fn set_tags(&self, path: &str, tags: BTreeSet<String>) -> Result<IndexEntry>;

    async fn search(&self, req: &SearchRequest) -> Result<Vec<SearchHit>>;

    /// Re-index every file under the root and drop entries whose file is gone.
    async fn reconcile(&self, cancel: &CancelHandle) -> Result<SyncReport>;

    /// Whether search is backed by a store.
    fn is_searchable(&self) -> bool;

    async fn close(&self);
}

/// Store-backed index: the store is authoritative, the mirror follows it.
pub struct StoreIndex {
    sync: Synchronizer,
    engine: HybridEngine,
    mirror: Arc<Mirror>,
}

impl StoreIndex {
    pub fn new(sync: Synchronizer, engine: HybridEngine, mirror: Arc<Mirror>) -> Self {
        Self {
            sync,
            engine,
            mirror,
        }
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }

    async fn entry_for(&self, doc: &Document, description: Option<String>) -> Result<IndexEntry> {
        let description = match description {
            Some(d) => d,
            None => self
                .mirror
                .get(&doc.path)
                .await?
                .map(|e| e.description)
                .unwrap_or_default(),
        };
        Ok(IndexEntry::from_document(doc, description))
    }

    async fn mirror_document(&self, doc: &Document, description: Option<String>) -> Result<IndexEntry> {
        let entry = self.entry_for(doc, description).await?;
        self.mirror.record(entry).await
    }
}

#[async_trait]
impl DocumentIndex for StoreIndex {
    async fn record(&self, path: &str, attrs: DocumentAttrs) -> Result<IndexEntry> {
        let description = attrs.description.clone();
        let options = SyncOptions {
            attrs,
            ..Default::default()
        };
        let outcome = self.sync.sync_one_with(path, options).await;
        // The document row is committed even when derivation fails, so the
        // mirror follows it either way.
        let doc = match self.sync.store().get_document(path).await? {
            Some(doc) => doc,
            None => {
                outcome?;
                return Err(Error::NotFound(format!("document '{}'", path)));
            }
        };
        let entry = self.mirror_document(&doc, description).await?;
        outcome?;
        Ok(entry)
    }

    async fn forget(&self, path: &str) -> Result<bool> {
        let removed = self.sync.remove(path).await?;
        let unlinked = self.mirror.forget(path).await?;
        Ok(removed || unlinked)
    }

    async fn get(&self, path: &str) -> Result<Option<IndexEntry>> {
        match self.sync.store().get_document(path).await? {
            Some(doc) => Ok(Some(self.entry_for(&doc, None).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self, category: Option<Category>) -> Result<Vec<IndexEntry>> {
        let docs = self.sync.store().list_documents(category).await?;
        let mut entries = Vec::with_capacity(docs.len());
        for doc in &docs {
            entries.push(self.entry_for(doc, None).await?);
        }
        Ok(entries)
    }

    async fn set_tags(&self, path: &str, tags: BTreeSet<String>) -> Result<IndexEntry> {
        let doc = self.sync.store().set_tags(path, &tags).await?;
        self.mirror_document(&doc, None).await
    }

    async fn search(&self, req: &SearchRequest) -> Result<Vec<SearchHit>> {
        self.engine.search(req).await
    }

    async fn reconcile(&self, cancel: &CancelHandle) -> Result<SyncReport> {
        let report = self.sync.sync_all(cancel).await?;
        for path in &report.orphans {
            info!(path = %path, "removing orphaned document");
            self.forget(path).await?;
        }

        let docs = self.sync.store().list_documents(None).await?;
        let stored: BTreeSet<&str> = docs.iter().map(|d| d.path.as_str()).collect();
        for entry in self.mirror.list_all().await? {
            if !stored.contains(entry.path.as_str()) {
                self.mirror.forget(&entry.path).await?;
            }
        }
        for doc in &docs {
            self.mirror_document(doc, None).await?;
        }
        Ok(report)
    }

    fn is_searchable(&self) -> bool {
        true
    }

    async fn close(&self) {
        self.sync.store().close().await;
    }
}

/// Mirror-only index: metadata lives solely in the JSON index and the root
/// document.
pub struct MirrorIndex {
    files: Arc<DocumentFiles>,
    mirror: Arc<Mirror>,
    main_file: String,
}

impl MirrorIndex {
    pub fn new(files: Arc<DocumentFiles>, mirror: Arc<Mirror>, main_file: impl Into<String>) -> Self {
        Self {
            files,
            mirror,
            main_file: main_file.into(),
        }
    }
}

#[async_trait]
impl DocumentIndex for MirrorIndex {
    async fn record(&self, path: &str, attrs: DocumentAttrs) -> Result<IndexEntry> {
        let text = self.files.read(path).await?;
        let existing = self.mirror.get(path).await?;
        let now = chrono::Utc::now();
        let (tags, metadata, description, created_at) = match existing {
            Some(e) => (e.tags, e.metadata, e.description, e.created_at),
            None => (BTreeSet::new(), Default::default(), String::new(), now),
        };
        let entry = IndexEntry {
            path: path.to_string(),
            title: title_from_path(path),
            category: Category::from_path(path, &self.main_file),
            description: attrs.description.unwrap_or(description),
            tags: attrs.tags.unwrap_or(tags),
            metadata: attrs.metadata.unwrap_or(metadata),
            word_count: word_count(&text) as i64,
            created_at,
            updated_at: now,
        };
        self.mirror.record(entry).await
    }

    async fn forget(&self, path: &str) -> Result<bool> {
        self.mirror.forget(path).await
    }

    async fn get(&self, path: &str) -> Result<Option<IndexEntry>> {
        self.mirror.get(path).await
    }

    async fn list(&self, category: Option<Category>) -> Result<Vec<IndexEntry>> {
        let mut entries = self.mirror.list_all().await?;
        if let Some(category) = category {
            entries.retain(|e| e.category == category);
        }
        Ok(entries)
    }

    async fn set_tags(&self, path: &str, tags: BTreeSet<String>) -> Result<IndexEntry> {
        let mut entry = self
            .mirror
            .get(path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document '{}'", path)))?;
        entry.tags = tags;
        self.mirror.record(entry).await
    }

    async fn search(&self, _req: &SearchRequest) -> Result<Vec<SearchHit>> {
        Err(Error::Degraded(
            "search requires a searchable store".to_string(),
        ))
    }

    async fn reconcile(&self, cancel: &CancelHandle) -> Result<SyncReport> {
        let paths = self.files.list().await?;
        let mut report = SyncReport::default();
        for path in &paths {
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.skipped.push(path.clone());
                continue;
            }
            match self.record(path, DocumentAttrs::default()).await {
                Ok(_) => report.synced.push(path.clone()),
                Err(e) => {
                    warn!(path = %path, error = %e, "could not index document");
                    report.failed.push((path.clone(), e.to_string()));
                }
            }
        }

        let on_disk: BTreeSet<&str> = paths.iter().map(String::as_str).collect();
        for entry in self.mirror.list_all().await? {
            if !on_disk.contains(entry.path.as_str()) {
                self.mirror.forget(&entry.path).await?;
                report.orphans.push(entry.path);
            }
        }
        Ok(report)
    }

    fn is_searchable(&self) -> bool {
        false
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::SearchMode;
    use crate::store::memory::InMemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        files: Arc<DocumentFiles>,
        mirror: Arc<Mirror>,
        config: Config,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let config = Config::for_root(tmp.path());
        let files = Arc::new(DocumentFiles::from_config(&config.storage).unwrap());
        let mirror = Arc::new(Mirror::new(&config.storage));
        mirror
            .initialize(chrono::Local::now().date_naive())
            .await
            .unwrap();
        Fixture {
            _tmp: tmp,
            files,
            mirror,
            config,
        }
    }

    fn store_index(f: &Fixture) -> StoreIndex {
        let store: Arc<dyn crate::store::Store> = Arc::new(InMemoryStore::new());
        let sync = Synchronizer::new(f.files.clone(), store.clone(), None, &f.config);
        let engine = HybridEngine::new(store, None, &f.config.retrieval);
        StoreIndex::new(sync, engine, f.mirror.clone())
    }

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_store_index_mirrors_record() {
        let f = fixture().await;
        let index = store_index(&f);
        f.files
            .write("projects/demo.md", "# Demo\n\ninstall deps")
            .await
            .unwrap();

        let entry = index
            .record(
                "projects/demo.md",
                DocumentAttrs {
                    tags: Some(tags(&["x"])),
                    description: Some("a demo".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(entry.category, Category::Project);
        assert_eq!(entry.description, "a demo");

        let mirrored = f.mirror.get("projects/demo.md").await.unwrap().unwrap();
        assert_eq!(mirrored.tags, tags(&["x"]));
        let linked = f.mirror.read_main().await.unwrap().linked_paths();
        assert_eq!(linked, vec!["projects/demo.md"]);
    }

    #[tokio::test]
    async fn test_store_index_tags_without_resync() {
        let f = fixture().await;
        let index = store_index(&f);
        f.files.write("concepts/a.md", "alpha").await.unwrap();
        index
            .record("concepts/a.md", DocumentAttrs::default())
            .await
            .unwrap();

        let entry = index
            .set_tags("concepts/a.md", tags(&["one", "two"]))
            .await
            .unwrap();
        assert_eq!(entry.tags, tags(&["one", "two"]));
        let mirrored = f.mirror.get("concepts/a.md").await.unwrap().unwrap();
        assert_eq!(mirrored.tags, entry.tags);

        let err = index.set_tags("nope.md", tags(&["x"])).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_store_index_reconcile_removes_orphans() {
        let f = fixture().await;
        let index = store_index(&f);
        f.files.write("projects/a.md", "a").await.unwrap();
        f.files.write("projects/b.md", "b").await.unwrap();
        index.reconcile(&CancelHandle::new()).await.unwrap();

        f.files.delete("projects/b.md").await.unwrap();
        let report = index.reconcile(&CancelHandle::new()).await.unwrap();
        assert_eq!(report.orphans, vec!["projects/b.md".to_string()]);

        let stored: Vec<String> = index
            .list(None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        let mirrored: Vec<String> = f
            .mirror
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(stored, mirrored);
        assert!(!stored.contains(&"projects/b.md".to_string()));
    }

    #[tokio::test]
    async fn test_mirror_index_preserves_attributes() {
        let f = fixture().await;
        let index = MirrorIndex::new(f.files.clone(), f.mirror.clone(), "main.md");
        f.files.write("projects/p.md", "one two three").await.unwrap();
        index
            .record(
                "projects/p.md",
                DocumentAttrs {
                    tags: Some(tags(&["keep"])),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        f.files
            .write("projects/p.md", "one two three four")
            .await
            .unwrap();
        let entry = index
            .record("projects/p.md", DocumentAttrs::default())
            .await
            .unwrap();
        assert_eq!(entry.word_count, 4);
        assert_eq!(entry.tags, tags(&["keep"]));
        assert_eq!(
            index.list(Some(Category::Project)).await.unwrap().len(),
            1
        );
        assert!(index.list(Some(Category::Concept)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mirror_index_search_is_degraded() {
        let f = fixture().await;
        let index = MirrorIndex::new(f.files.clone(), f.mirror.clone(), "main.md");
        let err = index
            .search(&SearchRequest::new("x", SearchMode::Fulltext, 5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Degraded);
        assert!(!index.is_searchable());
    }

    #[tokio::test]
    async fn test_mirror_index_reconcile() {
        let f = fixture().await;
        let index = MirrorIndex::new(f.files.clone(), f.mirror.clone(), "main.md");
        f.files.write("notes/n.md", "n").await.unwrap();
        index
            .record("notes/n.md", DocumentAttrs::default())
            .await
            .unwrap();
        f.files.delete("notes/n.md").await.unwrap();
        f.files.write("concepts/c.md", "c").await.unwrap();

        let report = index.reconcile(&CancelHandle::new()).await.unwrap();
        assert_eq!(report.orphans, vec!["notes/n.md".to_string()]);
        assert!(report.synced.contains(&"concepts/c.md".to_string()));
        assert!(report.synced.contains(&"main.md".to_string()));
    }
}
