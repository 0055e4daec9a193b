//! JSON metadata index (`files_index.json`).
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "last_updated": "2026-01-01T00:00:00Z",
//!   "files": [ { "file_path": "projects/demo.md", "title": "Demo", ... } ]
//! }
//! ```
//!
//! A missing or unreadable index reads as empty. Writes go to a sibling
//! temp file first and are renamed into place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::IndexEntry;

pub const INDEX_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: String,
    last_updated: DateTime<Utc>,
    #[serde(default)]
    files: Vec<IndexEntry>,
}

impl IndexFile {
    fn empty() -> Self {
        Self {
            version: INDEX_VERSION.to_string(),
            last_updated: Utc::now(),
            files: Vec::new(),
        }
    }
}

pub struct JsonIndex {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write an empty index if none exists yet.
    pub async fn initialize(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(false);
        }
        self.save(IndexFile::empty()).await?;
        Ok(true)
    }

    /// Insert or replace the entry for `entry.path`.
    ///
    /// An existing entry keeps its `created_at`; `updated_at` is set to now.
    pub async fn upsert(&self, mut entry: IndexEntry) -> Result<IndexEntry> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        entry.updated_at = Utc::now();
        match file.files.iter_mut().find(|e| e.path == entry.path) {
            Some(existing) => {
                entry.created_at = existing.created_at;
                *existing = entry.clone();
            }
            None => file.files.push(entry.clone()),
        }
        self.save(file).await?;
        debug!(path = %entry.path, "index entry upserted");
        Ok(entry)
    }

    pub async fn remove(&self, path: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let before = file.files.len();
        file.files.retain(|e| e.path != path);
        if file.files.len() == before {
            return Ok(false);
        }
        self.save(file).await?;
        debug!(path, "index entry removed");
        Ok(true)
    }

    pub async fn get(&self, path: &str) -> Result<Option<IndexEntry>> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        Ok(file.files.into_iter().find(|e| e.path == path))
    }

    /// Every entry, ordered by path.
    pub async fn list_all(&self) -> Result<Vec<IndexEntry>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.files)
    }

    pub async fn clear_all(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.save(IndexFile::empty()).await
    }

    async fn load(&self) -> Result<IndexFile> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(IndexFile::empty()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&text) {
            Ok(file) => Ok(file),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "index file unreadable, treating as empty");
                Ok(IndexFile::empty())
            }
        }
    }

    async fn save(&self, mut file: IndexFile) -> Result<()> {
        file.version = INDEX_VERSION.to_string();
        file.last_updated = Utc::now();
        file.files.sort_by(|a, b| a.path.cmp(&b.path));

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
