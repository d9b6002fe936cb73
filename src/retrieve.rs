//! Tenant-scoped semantic retrieval over the knowledge base.
//!
//! Retrieval operates entirely through the [`Store`] and
//! [`EmbeddingProvider`] traits:
//!
//! 1. Fetch valid chunks of active, in-window sources for the tenant.
//! 2. Re-check each candidate's source window against `now`.
//! 3. Embed the (already masked) query, unless there is nothing to rank.
//! 4. Score every candidate by cosine similarity.
//! 5. Drop scores below `min_score`.
//! 6. Sort by score (desc), source `updated_at` (desc), chunk id (asc).
//! 7. Truncate to `top_k`.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::embedding::{cosine_similarity, embed_query, EmbeddingProvider};
use crate::error::{EngineError, EngineResult};
use crate::store::Store;

/// Inputs for one retrieval.
#[derive(Debug, Clone)]
pub struct RetrieveRequest<'a> {
    pub tenant_id: &'a str,
    /// Masked customer text.
    pub query: &'a str,
    pub top_k: usize,
    pub min_score: f64,
    pub now: DateTime<Utc>,
}

/// A ranked chunk with enough provenance to cite it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub knowledge_source_id: String,
    pub source_version: i64,
    pub chunk_index: i64,
    pub content: String,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f64,
    pub source_updated_at: DateTime<Utc>,
}

pub async fn retrieve(
    store: &dyn Store,
    provider: &dyn EmbeddingProvider,
    req: &RetrieveRequest<'_>,
) -> EngineResult<Vec<RetrievedChunk>> {
    if req.query.trim().is_empty() || req.top_k == 0 {
        return Ok(Vec::new());
    }

    let candidates: Vec<_> = store
        .retrievable_chunks(req.tenant_id, req.now)
        .await
        .map_err(EngineError::Storage)?
        .into_iter()
        .filter(|c| {
            c.chunk.tenant_id == req.tenant_id && c.chunk.is_valid && c.source.contains(req.now)
        })
        .filter(|c| !c.chunk.embedding.is_empty())
        .collect();

    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let query_vec = embed_query(provider, req.query).await?;

    let mut results = Vec::with_capacity(candidates.len());
    for c in candidates {
        if c.chunk.embedding.len() != query_vec.len() {
            return Err(EngineError::EmbeddingDimensionMismatch {
                expected: c.chunk.embedding.len(),
                actual: query_vec.len(),
            });
        }
        let score = cosine_similarity(&query_vec, &c.chunk.embedding) as f64;
        if score < req.min_score {
            continue;
        }
        results.push(RetrievedChunk {
            chunk_id: c.chunk.id,
            knowledge_source_id: c.chunk.knowledge_source_id,
            source_version: c.chunk.source_version,
            chunk_index: c.chunk.chunk_index,
            content: c.chunk.content,
            score,
            source_updated_at: c.source.updated_at,
        });
    }

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.source_updated_at.cmp(&a.source_updated_at))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(req.top_k);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use crate::models::{new_id, Chunk, KnowledgeSource, KnowledgeSourceType};
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        inner: HashingProvider,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(texts).await
        }
    }

    fn counting(dims: usize) -> CountingProvider {
        CountingProvider {
            inner: HashingProvider::new(dims),
            calls: AtomicUsize::new(0),
        }
    }

    async fn publish(
        store: &InMemoryStore,
        provider: &HashingProvider,
        tenant: &str,
        texts: &[&str],
        edit: impl FnOnce(&mut KnowledgeSource),
    ) -> String {
        let now = Utc::now();
        let mut src = KnowledgeSource {
            id: new_id(),
            tenant_id: tenant.to_string(),
            name: "kb".into(),
            source_type: KnowledgeSourceType::Faq,
            content: texts.join("\n\n"),
            category: "general".into(),
            tags: vec![],
            author: "ops".into(),
            version: 1,
            is_active: true,
            effective_date: None,
            expiry_date: None,
            created_at: now,
            updated_at: now,
        };
        edit(&mut src);
        let chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk {
                id: new_id(),
                tenant_id: tenant.to_string(),
                knowledge_source_id: src.id.clone(),
                source_version: src.version,
                chunk_index: i as i64,
                content: t.to_string(),
                embedding: provider.embed_one(t),
                hash: String::new(),
                is_valid: true,
                created_at: now,
            })
            .collect();
        store.put_knowledge_source(&src, &chunks).await.unwrap();
        src.id
    }

    fn req<'a>(tenant: &'a str, query: &'a str) -> RetrieveRequest<'a> {
        RetrieveRequest {
            tenant_id: tenant,
            query,
            top_k: 5,
            min_score: 0.0,
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_empty_kb_returns_empty_without_embedding() {
        let store = InMemoryStore::new();
        let provider = counting(64);
        let out = retrieve(&store, &provider, &req("t1", "wire transfer fee"))
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ranks_relevant_chunk_first() {
        let store = InMemoryStore::new();
        let hasher = HashingProvider::new(256);
        publish(
            &store,
            &hasher,
            "t1",
            &[
                "Wire transfer fees are 25 dollars per outgoing wire.",
                "Reset your online banking password from the login page.",
            ],
            |_| {},
        )
        .await;
        let provider = counting(256);
        let mut r = req("t1", "what is the wire transfer fee");
        r.min_score = -1.0;
        let out = retrieve(&store, &provider, &r).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].content.starts_with("Wire transfer"));
        assert!(out[0].score >= out[1].score);
    }

    #[tokio::test]
    async fn test_excludes_inactive_future_expired_and_foreign() {
        let store = InMemoryStore::new();
        let hasher = HashingProvider::new(64);
        let now = Utc::now();
        publish(&store, &hasher, "t1", &["inactive wire fee"], |s| s.is_active = false).await;
        publish(&store, &hasher, "t1", &["future wire fee"], |s| {
            s.effective_date = Some(now + Duration::days(1))
        })
        .await;
        publish(&store, &hasher, "t1", &["expired wire fee"], |s| {
            s.expiry_date = Some(now - Duration::days(1))
        })
        .await;
        publish(&store, &hasher, "t2", &["other tenant wire fee"], |_| {}).await;
        let live = publish(&store, &hasher, "t1", &["current wire fee"], |_| {}).await;

        let provider = counting(64);
        let out = retrieve(&store, &provider, &req("t1", "wire fee")).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].knowledge_source_id, live);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_an_error() {
        let store = InMemoryStore::new();
        publish(&store, &HashingProvider::new(32), "t1", &["wire fee"], |_| {}).await;
        let provider = counting(64);
        let err = retrieve(&store, &provider, &req("t1", "wire fee"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::EmbeddingDimensionMismatch {
                expected: 32,
                actual: 64
            }
        ));
    }

    #[tokio::test]
    async fn test_top_k_and_min_score() {
        let store = InMemoryStore::new();
        let hasher = HashingProvider::new(64);
        publish(
            &store,
            &hasher,
            "t1",
            &["wire fee one", "wire fee two", "wire fee three", "unrelated mortgage"],
            |_| {},
        )
        .await;
        let provider = counting(64);
        let mut r = req("t1", "wire fee");
        r.top_k = 2;
        let out = retrieve(&store, &provider, &r).await.unwrap();
        assert_eq!(out.len(), 2);

        r.top_k = 10;
        r.min_score = 0.99;
        let out = retrieve(&store, &provider, &r).await.unwrap();
        assert!(out.iter().all(|c| c.score >= 0.99));
    }
}
