//! Synchronizer: keeps the searchable store in step with the files.
//!
//! # Per-document pipeline
//!
//! ```text
//! read ─▶ hash ─▶ unchanged? ──yes──▶ Unchanged
//!                    │ no
//!                    ▼
//!          upsert document (committed)
//!                    │
//!          segment ─▶ embed in batches ─▶ replace segments (one transaction)
//!                    │
//!          sync record: completed(hash) | failed(message)
//! ```
//!
//! Segments and embeddings are computed before anything derived is
//! written, so a failure leaves the previous segments intact and the
//! sync record marked `failed`. A document is skipped only when both its
//! stored hash and a `completed` sync record match the current content.
//!
//! Syncs of the same path are serialized; different paths run in
//! parallel up to the configured concurrency.

use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::files::{content_hash, title_from_path, word_count, DocumentFiles};
use crate::models::{Category, Document, DocumentAttrs, NewDocument, Segment, SyncRecord};
use crate::segment::Segmenter;
use crate::store::Store;

/// Result of synchronizing one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Content hash matched the last completed sync; nothing was written.
    Unchanged,
    Synced { segments: usize, embedded: usize },
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Re-derive segments even if the content hash is unchanged.
    pub force: bool,
    /// Overrides the configured timeout for this call.
    pub timeout: Option<Duration>,
    pub attrs: DocumentAttrs,
}

impl SyncOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Default::default()
        }
    }
}

/// Summary of a full synchronization pass.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub synced: Vec<String>,
    pub unchanged: Vec<String>,
    /// Path and error message of each document that failed.
    pub failed: Vec<(String, String)>,
    /// Documents not started because the pass was cancelled.
    pub skipped: Vec<String>,
    /// Store documents whose file no longer exists.
    pub orphans: Vec<String>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn total(&self) -> usize {
        self.synced.len() + self.unchanged.len() + self.failed.len() + self.skipped.len()
    }
}

/// Cooperative cancellation for [`Synchronizer::sync_all`].
///
/// Checked between documents; a document already in flight finishes.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One async mutex per document path.
#[derive(Default)]
struct PathLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PathLocks {
    fn get(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Drop entries nobody holds so the map does not grow without bound.
        locks.retain(|p, lock| p == path || Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(path.to_string()).or_default())
    }
}

pub struct Synchronizer {
    files: Arc<DocumentFiles>,
    store: Arc<dyn Store>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    segmenter: Segmenter,
    batch_size: usize,
    concurrency: usize,
    timeout: Option<Duration>,
    main_file: String,
    locks: PathLocks,
}

impl Synchronizer {
    pub fn new(
        files: Arc<DocumentFiles>,
        store: Arc<dyn Store>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        config: &Config,
    ) -> Self {
        Self {
            files,
            store,
            embedder,
            segmenter: Segmenter::new(config.segmenting.max_size, config.segmenting.overlap),
            batch_size: config.embedding.batch_size.max(1),
            concurrency: config.sync.concurrency.max(1),
            timeout: config.sync.timeout(),
            main_file: config.storage.main_file.clone(),
            locks: PathLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn sync_one(&self, path: &str, force: bool) -> Result<SyncOutcome> {
        self.sync_one_with(
            path,
            SyncOptions {
                force,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn sync_one_with(&self, path: &str, options: SyncOptions) -> Result<SyncOutcome> {
        let lock = self.locks.get(path);
        let _guard = lock.lock().await;
        self.sync_locked(path, options)
            .await
            .map_err(|e| e.for_path(path))
    }

    async fn sync_locked(&self, path: &str, options: SyncOptions) -> Result<SyncOutcome> {
        let text = self.files.read(path).await?;
        let hash = content_hash(&text);
        let existing = self.store.get_document(path).await?;

        if !options.force {
            if let Some(doc) = &existing {
                if doc.content_hash == hash {
                    let record = self.store.get_sync_record(&doc.id).await?;
                    if record.is_some_and(|r| r.is_current(&hash)) {
                        if attrs_differ(&options.attrs, doc) {
                            // Attributes only; segments stay as they are.
                            let mut updated = NewDocument::from(doc.clone());
                            if let Some(tags) = options.attrs.tags {
                                updated.tags = tags;
                            }
                            if let Some(metadata) = options.attrs.metadata {
                                updated.metadata = metadata;
                            }
                            self.store.upsert_document(&updated).await?;
                            debug!(path, "content unchanged, attributes updated");
                        } else {
                            debug!(path, "content unchanged, skipping");
                        }
                        return Ok(SyncOutcome::Unchanged);
                    }
                }
            }
        }

        let (tags, metadata) = match existing {
            Some(doc) => (
                options.attrs.tags.unwrap_or(doc.tags),
                options.attrs.metadata.unwrap_or(doc.metadata),
            ),
            None => (
                options.attrs.tags.unwrap_or_else(BTreeSet::new),
                options.attrs.metadata.unwrap_or_default(),
            ),
        };

        let doc = self
            .store
            .upsert_document(&NewDocument {
                path: path.to_string(),
                title: title_from_path(path),
                category: Category::from_path(path, &self.main_file),
                content_hash: hash.clone(),
                word_count: word_count(&text) as i64,
                tags,
                metadata,
            })
            .await?;
        self.store
            .put_sync_record(&doc.id, &SyncRecord::syncing())
            .await?;

        let derived = self.derive_and_store(&doc.id, &text);
        let result = match options.timeout.or(self.timeout) {
            Some(limit) => match tokio::time::timeout(limit, derived).await {
                Ok(result) => result,
                Err(_) => Err(Error::Transient(format!(
                    "segment/embed phase timed out after {:?}",
                    limit
                ))),
            },
            None => derived.await,
        };

        let now = chrono::Utc::now().timestamp();
        match result {
            Ok((segments, embedded)) => {
                self.store
                    .put_sync_record(&doc.id, &SyncRecord::completed(&hash, now))
                    .await?;
                info!(path, segments, embedded, "synced document");
                Ok(SyncOutcome::Synced { segments, embedded })
            }
            Err(e) => {
                warn!(path, error = %e, "sync failed");
                if let Err(record_err) = self
                    .store
                    .put_sync_record(&doc.id, &SyncRecord::failed(e.to_string(), now))
                    .await
                {
                    warn!(path, error = %record_err, "could not record sync failure");
                }
                Err(e)
            }
        }
    }

    /// Segment, embed, and atomically replace the stored segments.
    async fn derive_and_store(&self, document_id: &str, text: &str) -> Result<(usize, usize)> {
        let segments = self.segmenter.segment(text);
        let vectors = self.embed_segments(&segments).await?;
        let embedded = vectors.iter().filter(|v| v.is_some()).count();
        self.store
            .replace_segments(document_id, &segments, &vectors)
            .await?;
        Ok((segments.len(), embedded))
    }

    async fn embed_segments(&self, segments: &[Segment]) -> Result<Vec<Option<Vec<f32>>>> {
        let Some(embedder) = &self.embedder else {
            return Ok(vec![None; segments.len()]);
        };

        let texts: Vec<String> = segments.iter().map(|s| s.content.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            debug!(batch = i, size = batch.len(), "embedding batch");
            let embedded = embedder.embed_batch(batch).await?;
            if embedded.len() != batch.len() {
                return Err(Error::Inconsistent(format!(
                    "embedding provider returned {} vectors for {} segments",
                    embedded.len(),
                    batch.len()
                )));
            }
            if let Some(v) = embedded.iter().find(|v| v.len() != embedder.dims()) {
                return Err(Error::Inconsistent(format!(
                    "embedding provider '{}' returned a {}-dimension vector, expected {}",
                    embedder.model_name(),
                    v.len(),
                    embedder.dims()
                )));
            }
            vectors.extend(embedded.into_iter().map(Some));
        }
        Ok(vectors)
    }

    /// Synchronize every document under the root.
    ///
    /// Per-document failures are recorded in the report and do not stop
    /// the pass. Store documents without a backing file are reported as
    /// orphans but not removed.
    pub async fn sync_all(&self, cancel: &CancelHandle) -> Result<SyncReport> {
        let paths = self.files.list().await?;
        info!(documents = paths.len(), concurrency = self.concurrency, "starting full sync");

        let outcomes: Vec<(String, Option<Result<SyncOutcome>>)> = futures::stream::iter(paths)
            .map(|path| async move {
                if cancel.is_cancelled() {
                    return (path, None);
                }
                let outcome = self.sync_one(&path, false).await;
                (path, Some(outcome))
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = SyncReport {
            cancelled: cancel.is_cancelled(),
            ..Default::default()
        };
        let mut on_disk = BTreeSet::new();
        for (path, outcome) in outcomes {
            on_disk.insert(path.clone());
            match outcome {
                None => report.skipped.push(path),
                Some(Ok(SyncOutcome::Unchanged)) => report.unchanged.push(path),
                Some(Ok(SyncOutcome::Synced { .. })) => report.synced.push(path),
                Some(Err(e)) => report.failed.push((path, e.to_string())),
            }
        }
        report.synced.sort();
        report.unchanged.sort();
        report.failed.sort();
        report.skipped.sort();

        report.orphans = self
            .store
            .list_documents(None)
            .await?
            .into_iter()
            .map(|d| d.path)
            .filter(|p| !on_disk.contains(p))
            .collect();

        info!(
            synced = report.synced.len(),
            unchanged = report.unchanged.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "full sync finished"
        );
        Ok(report)
    }

    /// Remove a document and everything derived from it.
    pub async fn remove(&self, path: &str) -> Result<bool> {
        let lock = self.locks.get(path);
        let _guard = lock.lock().await;
        self.store.delete_document(path).await
    }
}

fn attrs_differ(attrs: &DocumentAttrs, doc: &Document) -> bool {
    attrs.tags.as_ref().is_some_and(|t| *t != doc.tags)
        || attrs.metadata.as_ref().is_some_and(|m| *m != doc.metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_handle_is_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!handle.is_cancelled());
        clone.cancel();
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_path_locks_reuse_held_lock() {
        let locks = PathLocks::default();
        let a = locks.get("a.md");
        let again = locks.get("a.md");
        assert!(Arc::ptr_eq(&a, &again));
        drop(again);
        let b = locks.get("b.md");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_path_locks_prune_unheld() {
        let locks = PathLocks::default();
        drop(locks.get("a.md"));
        let _b = locks.get("b.md");
        let map = locks.locks.lock().unwrap();
        assert!(!map.contains_key("a.md"));
        assert!(map.contains_key("b.md"));
    }

    #[test]
    fn test_report_total() {
        let report = SyncReport {
            synced: vec!["a".into()],
            unchanged: vec!["b".into(), "c".into()],
            failed: vec![("d".into(), "boom".into())],
            ..Default::default()
        };
        assert_eq!(report.total(), 4);
    }
}
