//! The memory context: one value wiring files, mirror, and index together.
//!
//! [`Memory`] is built once at startup ([`Memory::open`]) and passed to
//! whatever drives it: the CLI, a server, or tests. Every document-affecting
//! operation writes the file first and then updates the active
//! [`DocumentIndex`], which keeps the store (if any) and the mirror aligned.
//! Operations on the root document go through its structured model and are
//! re-indexed afterwards so it stays searchable.
//!
//! Batch variants process each item independently and collect per-item
//! failures in a [`BatchOutcome`].

use chrono::Local;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{Error, ErrorKind, Result};
use crate::files::{file_name_for_title, DocumentFiles};
use crate::index::{DocumentIndex, MirrorIndex, StoreIndex};
use crate::mirror::main_doc::MainDocument;
use crate::mirror::Mirror;
use crate::models::{Category, DocumentAttrs, IndexEntry, Metadata, SearchHit};
use crate::search::{HybridEngine, SearchRequest};
use crate::store::sqlite::SqliteStore;
use crate::store::Store;
use crate::sync::{CancelHandle, SyncReport, Synchronizer};
use crate::{db, migrate};

/// How [`Memory::update`] combines new content with the existing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    #[default]
    Replace,
    /// New content after the existing text, separated by a blank line.
    Append,
    /// New content before the existing text, separated by a blank line.
    Prepend,
}

impl FromStr for UpdateMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(UpdateMode::Replace),
            "append" => Ok(UpdateMode::Append),
            "prepend" => Ok(UpdateMode::Prepend),
            other => Err(Error::Validation(format!(
                "unknown update mode '{}'; expected replace, append, or prepend",
                other
            ))),
        }
    }
}

/// A document to create.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub title: String,
    pub category: Category,
    pub content: String,
    pub tags: BTreeSet<String>,
    pub metadata: Metadata,
    pub description: Option<String>,
}

impl NewMemory {
    pub fn new(title: impl Into<String>, category: Category, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            category,
            content: content.into(),
            tags: BTreeSet::new(),
            metadata: Metadata::new(),
            description: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A content change for [`Memory::update_many`].
#[derive(Debug, Clone)]
pub struct ContentEdit {
    pub path: String,
    pub content: String,
    pub mode: UpdateMode,
}

/// A tag change for [`Memory::tag_many`]. Removals apply after additions.
#[derive(Debug, Clone, Default)]
pub struct TagEdit {
    pub path: String,
    pub add: BTreeSet<String>,
    pub remove: BTreeSet<String>,
}

/// A document's text together with its index entry.
#[derive(Debug, Clone)]
pub struct MemoryDocument {
    pub path: String,
    pub content: String,
    /// `None` if the file exists but has not been indexed yet.
    pub entry: Option<IndexEntry>,
}

#[derive(Debug, Clone)]
pub struct BatchError {
    /// Position of the item in the request.
    pub index: usize,
    /// Path, title, or query identifying the item.
    pub item: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Per-item results of a batch operation.
#[derive(Debug, Clone)]
pub struct BatchOutcome<T> {
    pub results: Vec<T>,
    pub errors: Vec<BatchError>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> BatchOutcome<T> {
    fn push(&mut self, index: usize, item: &str, result: Result<T>) {
        match result {
            Ok(value) => self.results.push(value),
            Err(e) => {
                warn!(item, error = %e, "batch item failed");
                self.errors.push(BatchError {
                    index,
                    item: item.to_string(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct Memory {
    config: Config,
    files: Arc<DocumentFiles>,
    mirror: Arc<Mirror>,
    index: Arc<dyn DocumentIndex>,
}

impl Memory {
    /// Build the context from configuration.
    ///
    /// With a `[db]` table this connects, migrates, and health-checks the
    /// SQLite store and creates the configured embedding provider. Without
    /// one, the mirror is the only index.
    pub async fn open(config: Config) -> Result<Self> {
        let Some(db_config) = config.db.clone() else {
            info!(root = %config.storage.root.display(), "no store configured, using mirror-only index");
            return Self::mirror_only(config);
        };

        let pool = db::connect(&db_config).await?;
        migrate::run_migrations(&pool).await?;
        let store = SqliteStore::new(pool);
        if let Err(e) = store.health_check().await {
            store.close().await;
            return Err(Error::Inconsistent(format!("store unavailable at startup: {}", e)));
        }
        info!(path = %db_config.path.display(), "store ready");

        let embedder = embedding::create_provider(&config.embedding)?;
        match &embedder {
            Some(provider) => {
                if !provider.health_check().await {
                    warn!(
                        model = provider.model_name(),
                        "embedding provider unhealthy; syncs will record failures until it recovers"
                    );
                }
            }
            None => info!("embeddings disabled, vector search will use fulltext"),
        }

        Self::with_store(config, Arc::new(store), embedder)
    }

    /// Build a store-backed context from existing parts.
    pub fn with_store(
        config: Config,
        store: Arc<dyn Store>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        let files = Arc::new(DocumentFiles::from_config(&config.storage)?);
        let mirror = Arc::new(Mirror::new(&config.storage));
        let sync = Synchronizer::new(files.clone(), store.clone(), embedder.clone(), &config);
        let engine = HybridEngine::new(store, embedder, &config.retrieval);
        let index = Arc::new(StoreIndex::new(sync, engine, mirror.clone()));
        Ok(Self {
            config,
            files,
            mirror,
            index,
        })
    }

    /// Build a context with no searchable store.
    pub fn mirror_only(config: Config) -> Result<Self> {
        let files = Arc::new(DocumentFiles::from_config(&config.storage)?);
        let mirror = Arc::new(Mirror::new(&config.storage));
        let index = Arc::new(MirrorIndex::new(
            files.clone(),
            mirror.clone(),
            config.storage.main_file.clone(),
        ));
        Ok(Self {
            config,
            files,
            mirror,
            index,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn files(&self) -> &DocumentFiles {
        &self.files
    }

    pub fn mirror(&self) -> &Mirror {
        &self.mirror
    }

    pub fn is_searchable(&self) -> bool {
        self.index.is_searchable()
    }

    /// Create the category directories, the root document, and the index.
    ///
    /// Existing files are left alone. Returns `true` if the root document
    /// was created.
    pub async fn initialize(&self) -> Result<bool> {
        for category in Category::ALL {
            if let Some(dir) = category.directory() {
                tokio::fs::create_dir_all(self.files.root().join(dir)).await?;
            }
        }
        let created = self.mirror.initialize(Local::now().date_naive()).await?;
        self.refresh_main().await?;
        info!(root = %self.files.root().display(), created, "memory initialized");
        Ok(created)
    }

    // ----- documents -----

    /// Write a new document under its category directory and index it.
    pub async fn create(&self, new: NewMemory) -> Result<IndexEntry> {
        if new.category == Category::Main {
            return Err(Error::Validation(
                "documents cannot be created in the main category".to_string(),
            ));
        }
        let path = self.path_for(new.category, &new.title)?;
        if self.files.exists(&path).await? {
            return Err(Error::Validation(format!("document '{}' already exists", path)));
        }
        self.files.write(&path, &new.content).await?;
        let entry = self
            .index
            .record(
                &path,
                DocumentAttrs {
                    tags: Some(clean_tags(new.tags)),
                    metadata: Some(new.metadata),
                    description: new.description,
                },
            )
            .await?;
        self.refresh_main().await?;
        info!(path = %path, "document created");
        Ok(entry)
    }

    pub async fn read(&self, path: &str) -> Result<MemoryDocument> {
        let content = self.files.read(path).await?;
        let entry = self.index.get(path).await?;
        Ok(MemoryDocument {
            path: path.to_string(),
            content,
            entry,
        })
    }

    pub async fn update(&self, path: &str, content: &str, mode: UpdateMode) -> Result<IndexEntry> {
        let existing = self.files.read(path).await?;
        let text = match mode {
            UpdateMode::Replace => content.to_string(),
            UpdateMode::Append => join_blocks(&existing, content),
            UpdateMode::Prepend => join_blocks(content, &existing),
        };
        self.files.write(path, &text).await?;
        let entry = self.index.record(path, DocumentAttrs::default()).await?;
        self.refresh_main().await?;
        Ok(entry)
    }

    /// Delete a document's file and every index record of it.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.guard_main(path)?;
        let deleted = self.files.delete(path).await?;
        let forgotten = self.index.forget(path).await?;
        if !deleted && !forgotten {
            return Err(Error::NotFound(format!("document '{}'", path)));
        }
        self.refresh_main().await?;
        info!(path, "document deleted");
        Ok(())
    }

    pub async fn list(&self, category: Option<Category>) -> Result<Vec<IndexEntry>> {
        self.index.list(category).await
    }

    pub async fn get_tags(&self, path: &str) -> Result<BTreeSet<String>> {
        Ok(self.indexed(path).await?.tags)
    }

    pub async fn add_tags(&self, path: &str, tags: BTreeSet<String>) -> Result<IndexEntry> {
        let mut current = self.get_tags(path).await?;
        current.extend(clean_tags(tags));
        let entry = self.index.set_tags(path, current).await?;
        self.refresh_main().await?;
        Ok(entry)
    }

    pub async fn remove_tags(&self, path: &str, tags: BTreeSet<String>) -> Result<IndexEntry> {
        let mut current = self.get_tags(path).await?;
        for tag in clean_tags(tags) {
            current.remove(&tag);
        }
        let entry = self.index.set_tags(path, current).await?;
        self.refresh_main().await?;
        Ok(entry)
    }

    /// Give a document a new title, keeping its directory.
    pub async fn rename(&self, path: &str, new_title: &str) -> Result<IndexEntry> {
        self.guard_main(path)?;
        let file_name = file_name_for_title(new_title)?;
        let target = match path.rsplit_once('/') {
            Some((dir, _)) => format!("{}/{}", dir, file_name),
            None => file_name,
        };
        self.relocate(path, &target).await
    }

    /// Move a document into another category's directory.
    pub async fn move_to(&self, path: &str, category: Category) -> Result<IndexEntry> {
        self.guard_main(path)?;
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let dir = category.directory().ok_or_else(|| {
            Error::Validation("documents cannot be moved into the main category".to_string())
        })?;
        self.relocate(path, &format!("{}/{}", dir, file_name)).await
    }

    /// Duplicate a document under a new title, optionally in another category.
    ///
    /// The copy inherits tags, metadata, and description.
    pub async fn copy(
        &self,
        path: &str,
        new_title: &str,
        category: Option<Category>,
    ) -> Result<IndexEntry> {
        let category =
            category.unwrap_or_else(|| Category::from_path(path, &self.config.storage.main_file));
        if category == Category::Main {
            return Err(Error::Validation(
                "copies need a category other than main".to_string(),
            ));
        }
        let target = self.path_for(category, new_title)?;
        if self.files.exists(&target).await? {
            return Err(Error::Validation(format!("document '{}' already exists", target)));
        }
        let content = self.files.read(path).await?;
        let attrs = self.inherited_attrs(path).await?;
        self.files.write(&target, &content).await?;
        let entry = self.index.record(&target, attrs).await?;
        self.refresh_main().await?;
        info!(from = path, to = %target, "document copied");
        Ok(entry)
    }

    pub async fn search(&self, req: &SearchRequest) -> Result<Vec<SearchHit>> {
        self.index.search(req).await
    }

    /// Re-index one document from its current file contents.
    pub async fn reindex(&self, path: &str) -> Result<IndexEntry> {
        let entry = self.index.record(path, DocumentAttrs::default()).await?;
        self.refresh_main().await?;
        Ok(entry)
    }

    /// Re-index every file and drop records whose file is gone.
    pub async fn reconcile(&self, cancel: &CancelHandle) -> Result<SyncReport> {
        let report = self.index.reconcile(cancel).await?;
        self.refresh_main().await?;
        Ok(report)
    }

    // ----- batches -----

    pub async fn create_many(&self, items: Vec<NewMemory>) -> BatchOutcome<IndexEntry> {
        let mut outcome = BatchOutcome::default();
        for (i, item) in items.into_iter().enumerate() {
            let title = item.title.clone();
            outcome.push(i, &title, self.create(item).await);
        }
        outcome
    }

    pub async fn update_many(&self, edits: Vec<ContentEdit>) -> BatchOutcome<IndexEntry> {
        let mut outcome = BatchOutcome::default();
        for (i, edit) in edits.iter().enumerate() {
            let result = self.update(&edit.path, &edit.content, edit.mode).await;
            outcome.push(i, &edit.path, result);
        }
        outcome
    }

    pub async fn delete_many(&self, paths: Vec<String>) -> BatchOutcome<String> {
        let mut outcome = BatchOutcome::default();
        for (i, path) in paths.iter().enumerate() {
            let result = self.delete(path).await.map(|()| path.clone());
            outcome.push(i, path, result);
        }
        outcome
    }

    pub async fn tag_many(&self, edits: Vec<TagEdit>) -> BatchOutcome<IndexEntry> {
        let mut outcome = BatchOutcome::default();
        for (i, edit) in edits.iter().enumerate() {
            let result = self.apply_tag_edit(edit).await;
            outcome.push(i, &edit.path, result);
        }
        outcome
    }

    pub async fn search_many(&self, requests: Vec<SearchRequest>) -> BatchOutcome<Vec<SearchHit>> {
        let mut outcome = BatchOutcome::default();
        for (i, req) in requests.iter().enumerate() {
            outcome.push(i, &req.query, self.search(req).await);
        }
        outcome
    }

    // ----- root document -----

    pub async fn main_document(&self) -> Result<MainDocument> {
        self.mirror.read_main().await
    }

    pub async fn append_note(&self, section: &str, content: &str) -> Result<()> {
        self.edit_main(|doc, _| doc.append_note(section, content))
            .await
    }

    pub async fn add_goal(&self, goal: &str) -> Result<()> {
        self.edit_main(|doc, _| doc.add_goal(goal)).await
    }

    pub async fn complete_goal(&self, goal: &str) -> Result<()> {
        self.edit_main(|doc, today| doc.complete_goal(goal, today))
            .await
    }

    pub async fn add_task(&self, task: &str) -> Result<()> {
        self.edit_main(|doc, today| doc.add_task(task, today)).await
    }

    pub async fn add_plan(&self, plan: &str) -> Result<()> {
        self.edit_main(|doc, _| doc.add_plan(plan)).await
    }

    pub async fn complete_plan(&self, plan: &str) -> Result<()> {
        self.edit_main(|doc, today| doc.complete_plan(plan, today))
            .await
    }

    pub async fn add_future_plan(&self, plan: &str) -> Result<()> {
        self.edit_main(|doc, _| doc.add_future_plan(plan)).await
    }

    /// Release store connections and provider resources.
    pub async fn shutdown(self) {
        self.index.close().await;
        info!("memory shut down");
    }

    // ----- helpers -----

    async fn edit_main<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut MainDocument, chrono::NaiveDate) -> Result<()>,
    {
        self.mirror.edit_main(edit).await?;
        self.refresh_main().await
    }

    /// Re-index the root document after the mirror rewrote it.
    async fn refresh_main(&self) -> Result<()> {
        let main = &self.config.storage.main_file;
        if self.files.exists(main).await? {
            self.index.record(main, DocumentAttrs::default()).await?;
        }
        Ok(())
    }

    async fn relocate(&self, from: &str, to: &str) -> Result<IndexEntry> {
        if from == to {
            return self.indexed(from).await;
        }
        if self.files.exists(to).await? {
            return Err(Error::Validation(format!("document '{}' already exists", to)));
        }
        let content = self.files.read(from).await?;
        let attrs = self.inherited_attrs(from).await?;

        self.files.write(to, &content).await?;
        let entry = self.index.record(to, attrs).await?;
        self.index.forget(from).await?;
        self.files.delete(from).await?;
        self.refresh_main().await?;
        info!(from, to, "document moved");
        Ok(entry)
    }

    async fn inherited_attrs(&self, path: &str) -> Result<DocumentAttrs> {
        Ok(match self.index.get(path).await? {
            Some(entry) => DocumentAttrs {
                tags: Some(entry.tags),
                metadata: Some(entry.metadata),
                description: Some(entry.description),
            },
            None => DocumentAttrs::default(),
        })
    }

    async fn indexed(&self, path: &str) -> Result<IndexEntry> {
        self.index
            .get(path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("document '{}'", path)))
    }

    async fn apply_tag_edit(&self, edit: &TagEdit) -> Result<IndexEntry> {
        let mut tags = self.get_tags(&edit.path).await?;
        tags.extend(clean_tags(edit.add.clone()));
        for tag in clean_tags(edit.remove.clone()) {
            tags.remove(&tag);
        }
        let entry = self.index.set_tags(&edit.path, tags).await?;
        self.refresh_main().await?;
        Ok(entry)
    }

    fn path_for(&self, category: Category, title: &str) -> Result<String> {
        let dir = category.directory().ok_or_else(|| {
            Error::Validation(format!("category '{}' has no directory", category))
        })?;
        Ok(format!("{}/{}", dir, file_name_for_title(title)?))
    }

    fn guard_main(&self, path: &str) -> Result<()> {
        if path == self.config.storage.main_file {
            return Err(Error::Validation(
                "the root document cannot be deleted, renamed, or moved".to_string(),
            ));
        }
        Ok(())
    }
}

fn clean_tags(tags: BTreeSet<String>) -> BTreeSet<String> {
    tags.into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

fn join_blocks(first: &str, second: &str) -> String {
    let first = first.trim_end();
    let second = second.trim_start();
    match (first.is_empty(), second.is_empty()) {
        (true, _) => second.to_string(),
        (_, true) => first.to_string(),
        _ => format!("{}\n\n{}", first, second),
    }
}
