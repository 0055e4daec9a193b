//! Dual index mirror: the file-backed projection of document metadata.
//!
//! Two views are kept together:
//!
//! - [`json_index::JsonIndex`]: one entry per document in `files_index.json`.
//! - [`main_doc::MainDocument`]: the human-readable root document, whose
//!   File Index lists a link per document.
//!
//! [`Mirror::record`] and [`Mirror::forget`] update both views, so the
//! set of indexed paths and the set of linked paths move together.

pub mod json_index;
pub mod main_doc;

use chrono::{Local, NaiveDate};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::models::{Category, IndexEntry};
use json_index::JsonIndex;
use main_doc::MainDocument;

pub struct Mirror {
    index: JsonIndex,
    main_path: PathBuf,
    main_lock: Mutex<()>,
}

impl Mirror {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            index: JsonIndex::new(storage.root.join(&storage.index_file)),
            main_path: storage.root.join(&storage.main_file),
            main_lock: Mutex::new(()),
        }
    }

    pub fn index(&self) -> &JsonIndex {
        &self.index
    }

    /// Create the root document and an empty index if they do not exist.
    ///
    /// Returns `true` if the root document was written.
    pub async fn initialize(&self, today: NaiveDate) -> Result<bool> {
        self.index.initialize().await?;
        let _guard = self.main_lock.lock().await;
        if tokio::fs::try_exists(&self.main_path).await? {
            return Ok(false);
        }
        self.write_main(&MainDocument::template(today)).await?;
        Ok(true)
    }

    pub async fn read_main(&self) -> Result<MainDocument> {
        let _guard = self.main_lock.lock().await;
        self.load_main().await
    }

    /// Apply `edit` to the root document and write it back with a fresh
    /// `Last Updated:` stamp.
    pub async fn edit_main<T, F>(&self, edit: F) -> Result<T>
    where
        F: FnOnce(&mut MainDocument, NaiveDate) -> Result<T>,
    {
        let today = Local::now().date_naive();
        let _guard = self.main_lock.lock().await;
        let mut doc = self.load_main().await?;
        let value = edit(&mut doc, today)?;
        doc.touch(today);
        self.write_main(&doc).await?;
        Ok(value)
    }

    /// Upsert the index entry and the File Index link for a document.
    ///
    /// The root document itself is never linked, and links are skipped
    /// when there is no root document yet.
    pub async fn record(&self, entry: IndexEntry) -> Result<IndexEntry> {
        let stored = self.index.upsert(entry).await?;
        if stored.category != Category::Main && self.has_main().await? {
            self.edit_main(|doc, _| {
                doc.upsert_link(stored.category, &stored.title, &stored.path, &stored.description)
            })
            .await?;
        }
        debug!(path = %stored.path, "mirror entry recorded");
        Ok(stored)
    }

    /// Remove the index entry and File Index link for a document.
    pub async fn forget(&self, path: &str) -> Result<bool> {
        let removed = self.index.remove(path).await?;
        let unlinked = if self.has_main().await? {
            self.edit_main(|doc, _| Ok(doc.remove_link(path))).await?
        } else {
            false
        };
        debug!(path, removed, unlinked, "mirror entry forgotten");
        Ok(removed || unlinked)
    }

    pub async fn get(&self, path: &str) -> Result<Option<IndexEntry>> {
        self.index.get(path).await
    }

    pub async fn list_all(&self) -> Result<Vec<IndexEntry>> {
        self.index.list_all().await
    }

    /// Drop every entry and every File Index link.
    pub async fn clear_all(&self) -> Result<()> {
        self.index.clear_all().await?;
        if self.has_main().await? {
            self.edit_main(|doc, _| {
                for path in doc.linked_paths() {
                    doc.remove_link(&path);
                }
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    async fn has_main(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.main_path).await?)
    }

    async fn load_main(&self) -> Result<MainDocument> {
        match tokio::fs::read_to_string(&self.main_path).await {
            Ok(text) => Ok(MainDocument::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "root document {}",
                self.main_path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_main(&self, doc: &MainDocument) -> Result<()> {
        if let Some(parent) = self.main_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.main_path.with_extension("md.tmp");
        tokio::fs::write(&tmp, doc.render()).await?;
        tokio::fs::rename(&tmp, &self.main_path).await?;
        debug!(path = %self.main_path.display(), "root document written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn mirror(tmp: &TempDir) -> Mirror {
        Mirror::new(&StorageConfig {
            root: tmp.path().to_path_buf(),
            ..Default::default()
        })
    }

    fn entry(path: &str, category: Category) -> IndexEntry {
        IndexEntry {
            path: path.to_string(),
            title: "Demo".to_string(),
            category,
            description: "demo project".to_string(),
            tags: Default::default(),
            metadata: Default::default(),
            word_count: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_and_forget_keep_views_aligned() {
        let tmp = TempDir::new().unwrap();
        let mirror = mirror(&tmp);
        mirror.initialize(Local::now().date_naive()).await.unwrap();

        mirror
            .record(entry("projects/demo.md", Category::Project))
            .await
            .unwrap();
        let main = mirror.read_main().await.unwrap();
        assert_eq!(main.linked_paths(), vec!["projects/demo.md"]);
        assert!(mirror.get("projects/demo.md").await.unwrap().is_some());

        assert!(mirror.forget("projects/demo.md").await.unwrap());
        assert!(mirror.read_main().await.unwrap().linked_paths().is_empty());
        assert!(mirror.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_without_root_document() {
        let tmp = TempDir::new().unwrap();
        let mirror = mirror(&tmp);
        mirror
            .record(entry("projects/demo.md", Category::Project))
            .await
            .unwrap();
        assert_eq!(mirror.list_all().await.unwrap().len(), 1);
        assert_eq!(
            mirror.read_main().await.unwrap_err().kind(),
            crate::error::ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mirror = mirror(&tmp);
        let today = Local::now().date_naive();
        assert!(mirror.initialize(today).await.unwrap());
        mirror.edit_main(|doc, _| doc.add_goal("keep me")).await.unwrap();
        assert!(!mirror.initialize(today).await.unwrap());
        let main = mirror.read_main().await.unwrap();
        assert_eq!(main.open_items(main_doc::CURRENT_GOALS), vec!["keep me"]);
    }

    #[tokio::test]
    async fn test_failed_edit_leaves_file_untouched() {
        let tmp = TempDir::new().unwrap();
        let mirror = mirror(&tmp);
        mirror.initialize(Local::now().date_naive()).await.unwrap();
        let before = std::fs::read_to_string(tmp.path().join("main.md")).unwrap();
        assert!(mirror
            .edit_main(|doc, today| doc.complete_goal("missing", today))
            .await
            .is_err());
        let after = std::fs::read_to_string(tmp.path().join("main.md")).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_clear_all_unlinks_everything() {
        let tmp = TempDir::new().unwrap();
        let mirror = mirror(&tmp);
        mirror.initialize(Local::now().date_naive()).await.unwrap();
        mirror
            .record(entry("projects/a.md", Category::Project))
            .await
            .unwrap();
        mirror
            .record(entry("concepts/b.md", Category::Concept))
            .await
            .unwrap();
        mirror.clear_all().await.unwrap();
        assert!(mirror.list_all().await.unwrap().is_empty());
        assert!(mirror.read_main().await.unwrap().linked_paths().is_empty());
    }
}
