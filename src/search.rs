//! Hybrid retrieval engine.
//!
//! Three modes, all operating through the [`Store`] trait:
//!
//! - **fulltext**: lexical match ranked by the store (BM25 for SQLite).
//! - **vector**: cosine similarity against the embedded query.
//! - **hybrid**: both, fused with Reciprocal Rank Fusion.
//!
//! # Reciprocal Rank Fusion
//!
//! Each method contributes at most `limit` candidates. A segment at
//! 1-based rank `r` in a method's list receives `1 / (k + r)` from that
//! method; its fused score is the sum over the methods that returned it.
//! Results are ordered by fused score, then by the best rank any single
//! method gave the segment, then by segment id, and truncated to `limit`.
//!
//! Filters (category, path, required tags) are passed to the store and
//! applied before ranking, never to the fused output.
//!
//! # Degraded mode
//!
//! Without an embedding provider, vector and hybrid requests either run as
//! fulltext (the hits report `mode = fulltext`) or fail with
//! [`Error::Degraded`], per [`MissingEmbeddings`].

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{MissingEmbeddings, RetrievalConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::models::{SearchFilters, SearchHit, SearchMode};
use crate::query::LexicalQuery;
use crate::store::{SegmentCandidate, Store};

pub const DEFAULT_RRF_K: f64 = 60.0;

/// Inputs for a single search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub mode: SearchMode,
    pub limit: usize,
    pub filters: SearchFilters,
    /// Overrides the engine default for this request.
    pub on_missing_embeddings: Option<MissingEmbeddings>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, mode: SearchMode, limit: usize) -> Self {
        Self {
            query: query.into(),
            mode,
            limit,
            filters: SearchFilters::default(),
            on_missing_embeddings: None,
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Fail instead of falling back when vectors are unavailable.
    pub fn strict(mut self) -> Self {
        self.on_missing_embeddings = Some(MissingEmbeddings::Error);
        self
    }
}

pub struct HybridEngine {
    store: Arc<dyn Store>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    rrf_k: f64,
    on_missing_embeddings: MissingEmbeddings,
}

impl HybridEngine {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            rrf_k: config.rrf_k,
            on_missing_embeddings: config.on_missing_embeddings,
        }
    }

    /// The mode a request will actually run in.
    pub fn effective_mode(&self, req: &SearchRequest) -> Result<SearchMode> {
        if req.mode == SearchMode::Fulltext || self.embedder.is_some() {
            return Ok(req.mode);
        }
        match req
            .on_missing_embeddings
            .unwrap_or(self.on_missing_embeddings)
        {
            MissingEmbeddings::Fallback => {
                warn!(requested = %req.mode, "no embedding provider, falling back to fulltext");
                Ok(SearchMode::Fulltext)
            }
            MissingEmbeddings::Error => Err(Error::Degraded(format!(
                "{} search requires an embedding provider",
                req.mode
            ))),
        }
    }

    pub async fn search(&self, req: &SearchRequest) -> Result<Vec<SearchHit>> {
        if req.limit == 0 {
            return Err(Error::Validation("limit must be >= 1".to_string()));
        }
        let query = req.query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let mode = self.effective_mode(req)?;
        debug!(query, %mode, limit = req.limit, "search");

        let hits = match mode {
            SearchMode::Fulltext => {
                let candidates = self.fulltext(query, req.limit, &req.filters).await?;
                to_hits(candidates, mode)
            }
            SearchMode::Vector => {
                let query_vec = self.embed_query(query).await?;
                let candidates = self
                    .store
                    .vector_search(&query_vec, req.limit, &req.filters)
                    .await?;
                to_hits(candidates, mode)
            }
            SearchMode::Hybrid => {
                let query_vec = self.embed_query(query).await?;
                let (vector, fulltext) = futures::try_join!(
                    self.store.vector_search(&query_vec, req.limit, &req.filters),
                    self.fulltext(query, req.limit, &req.filters),
                )?;
                reciprocal_rank_fusion(&[vector, fulltext], self.rrf_k)
                    .into_iter()
                    .take(req.limit)
                    .map(|(c, score)| hit(c, score, mode))
                    .collect()
            }
        };
        Ok(hits)
    }

    async fn fulltext(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SegmentCandidate>> {
        let parsed = LexicalQuery::parse(query);
        if parsed.is_empty() {
            return Ok(Vec::new());
        }
        self.store.keyword_search(&parsed, limit, filters).await
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let embedder = self.embedder.as_ref().ok_or_else(|| {
            Error::Degraded("vector search requires an embedding provider".to_string())
        })?;
        let vector = embedder.embed_one(query).await?;
        if vector.len() != embedder.dims() {
            return Err(Error::Inconsistent(format!(
                "embedding provider '{}' returned a {}-dimension query vector, expected {}",
                embedder.model_name(),
                vector.len(),
                embedder.dims()
            )));
        }
        Ok(vector)
    }
}

fn hit(c: SegmentCandidate, score: f64, mode: SearchMode) -> SearchHit {
    SearchHit {
        segment_id: c.segment_id,
        path: c.path,
        title: c.title,
        category: c.category,
        content: c.content,
        header_path: c.header_path,
        score,
        mode,
    }
}

fn to_hits(candidates: Vec<SegmentCandidate>, mode: SearchMode) -> Vec<SearchHit> {
    candidates
        .into_iter()
        .map(|c| {
            let score = c.raw_score;
            hit(c, score, mode)
        })
        .collect()
}

/// Fuse ranked candidate lists. Each list must be ordered best-first.
///
/// Returns every distinct segment with its fused score, best first.
pub fn reciprocal_rank_fusion(
    lists: &[Vec<SegmentCandidate>],
    k: f64,
) -> Vec<(SegmentCandidate, f64)> {
    struct Entry {
        candidate: SegmentCandidate,
        score: f64,
        best_rank: usize,
    }

    let mut fused: HashMap<i64, Entry> = HashMap::new();
    for list in lists {
        for (index, candidate) in list.iter().enumerate() {
            let rank = index + 1;
            let contribution = 1.0 / (k + rank as f64);
            fused
                .entry(candidate.segment_id)
                .and_modify(|e| {
                    e.score += contribution;
                    e.best_rank = e.best_rank.min(rank);
                })
                .or_insert_with(|| Entry {
                    candidate: candidate.clone(),
                    score: contribution,
                    best_rank: rank,
                });
        }
    }

    let mut entries: Vec<Entry> = fused.into_values().collect();
    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.best_rank.cmp(&b.best_rank))
            .then(a.candidate.segment_id.cmp(&b.candidate.segment_id))
    });
    entries.into_iter().map(|e| (e.candidate, e.score)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;
    use crate::store::memory::InMemoryStore;

    fn candidate(segment_id: i64) -> SegmentCandidate {
        SegmentCandidate {
            segment_id,
            document_id: format!("doc-{}", segment_id),
            path: format!("s{}.md", segment_id),
            title: String::new(),
            category: Category::Other,
            content: String::new(),
            header_path: Vec::new(),
            raw_score: 0.0,
        }
    }

    fn ranked(ids: &[i64]) -> Vec<SegmentCandidate> {
        ids.iter().map(|&id| candidate(id)).collect()
    }

    #[test]
    fn test_rrf_sums_contributions() {
        // S is rank 1 in vector, rank 3 in fulltext.
        let fused = reciprocal_rank_fusion(&[ranked(&[7, 1, 2]), ranked(&[3, 4, 7])], 60.0);
        let (top, score) = &fused[0];
        assert_eq!(top.segment_id, 7);
        assert!((score - (1.0 / 61.0 + 1.0 / 63.0)).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_single_method_scores() {
        let fused = reciprocal_rank_fusion(&[ranked(&[1, 2]), Vec::new()], 60.0);
        assert_eq!(fused.len(), 2);
        assert!((fused[0].1 - 1.0 / 61.0).abs() < 1e-12);
        assert!((fused[1].1 - 1.0 / 62.0).abs() < 1e-12);
    }

    #[test]
    fn test_rrf_tie_prefers_better_raw_rank() {
        // 5: ranks 2 and 2 → 2/62. 9: ranks 1 and 3 → 1/61 + 1/63.
        // 1/61 + 1/63 > 2/62, so 9 wins outright.
        let fused = reciprocal_rank_fusion(&[ranked(&[9, 5, 8]), ranked(&[6, 5, 9])], 60.0);
        assert_eq!(fused[0].0.segment_id, 9);

        // Exact tie on fused score: both appear once at rank 1.
        let fused = reciprocal_rank_fusion(&[ranked(&[4]), ranked(&[2])], 60.0);
        assert_eq!(fused[0].1, fused[1].1);
        assert_eq!(fused[0].0.segment_id, 2);
    }

    #[test]
    fn test_rrf_is_monotone_in_rank() {
        // Improving a segment's rank in one list never lowers its fused score.
        let before = reciprocal_rank_fusion(&[ranked(&[1, 2, 3]), ranked(&[3, 2, 1])], 60.0);
        let after = reciprocal_rank_fusion(&[ranked(&[3, 1, 2]), ranked(&[3, 2, 1])], 60.0);
        let score = |fused: &[(SegmentCandidate, f64)], id: i64| {
            fused.iter().find(|(c, _)| c.segment_id == id).map(|(_, s)| *s).unwrap()
        };
        assert!(score(&after, 3) >= score(&before, 3));
    }

    #[test]
    fn test_rrf_dedups_segments() {
        let fused = reciprocal_rank_fusion(&[ranked(&[1, 2]), ranked(&[2, 1])], 60.0);
        assert_eq!(fused.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_query_returns_nothing() {
        let engine = HybridEngine::new(
            Arc::new(InMemoryStore::new()),
            None,
            &RetrievalConfig::default(),
        );
        let hits = engine
            .search(&SearchRequest::new("   ", SearchMode::Hybrid, 5))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_zero_limit_rejected() {
        let engine = HybridEngine::new(
            Arc::new(InMemoryStore::new()),
            None,
            &RetrievalConfig::default(),
        );
        let err = engine
            .search(&SearchRequest::new("x", SearchMode::Fulltext, 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_missing_embeddings_policy() {
        let lenient = HybridEngine::new(
            Arc::new(InMemoryStore::new()),
            None,
            &RetrievalConfig::default(),
        );
        let req = SearchRequest::new("x", SearchMode::Vector, 5);
        assert_eq!(lenient.effective_mode(&req).unwrap(), SearchMode::Fulltext);

        let err = lenient.effective_mode(&req.clone().strict()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Degraded);

        let strict = HybridEngine::new(
            Arc::new(InMemoryStore::new()),
            None,
            &RetrievalConfig {
                on_missing_embeddings: MissingEmbeddings::Error,
                ..Default::default()
            },
        );
        assert!(strict.effective_mode(&req).is_err());
        let fulltext = SearchRequest::new("x", SearchMode::Fulltext, 5);
        assert_eq!(strict.effective_mode(&fulltext).unwrap(), SearchMode::Fulltext);
    }
}
