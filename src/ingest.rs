//! Knowledge publishing.
//!
//! Publishing a source writes a new version: the content is chunked on
//! paragraph boundaries, embedded in batches, and stored as the source's
//! only valid chunk set. Chunks of the previous version are kept but
//! invalidated. Deactivating a source invalidates its chunks without
//! writing new ones. Either write is committed together with its
//! `knowledge_published` audit record or not at all.
//!
//! Embedding failures are non-fatal: the version is stored with
//! unembedded chunks, which retrieval skips until the source is
//! republished.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditDetails, AuditDraft};
use crate::chunk::chunk_source;
use crate::embedding::embed_batched;
use crate::models::{new_id, now_millis, KnowledgeSource, KnowledgeSourceType};
use crate::pipeline::{Engine, RequestContext};
use crate::store::{Commit, SourceUpdate};

/// Input for [`publish_source`]. `id` selects an existing source to
/// republish; without it a new source is created at version 1.
#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeDraft {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: KnowledgeSourceType,
    pub content: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub effective_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expiry_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub source_id: String,
    pub version: i64,
    pub chunks: usize,
    pub embedded: usize,
}

pub async fn publish_source(
    engine: &Engine,
    ctx: &RequestContext,
    draft: KnowledgeDraft,
) -> Result<PublishReport> {
    let tenant = engine.active_tenant(&ctx.tenant_id).await?;
    if draft.name.trim().is_empty() {
        bail!("knowledge source name is required");
    }
    if let (Some(from), Some(until)) = (draft.effective_date, draft.expiry_date) {
        if until <= from {
            bail!("expiry_date must be after effective_date");
        }
    }

    let now = now_millis();
    let previous = match &draft.id {
        Some(id) => engine
            .store()
            .get_knowledge_source(&tenant.id, id)
            .await?,
        None => None,
    };
    let (id, version, created_at) = match previous {
        Some(prev) => (prev.id, prev.version + 1, prev.created_at),
        None => (draft.id.unwrap_or_else(new_id), 1, now),
    };

    let source = KnowledgeSource {
        id,
        tenant_id: tenant.id.clone(),
        name: draft.name,
        source_type: draft.source_type,
        content: draft.content,
        category: draft.category,
        tags: draft.tags,
        author: draft.author,
        version,
        is_active: true,
        effective_date: draft.effective_date,
        expiry_date: draft.expiry_date,
        created_at,
        updated_at: now,
    };

    let config = engine.config();
    let mut chunks = chunk_source(&source, config.chunking.max_tokens, now);
    let mut embedded = 0;
    if !chunks.is_empty() {
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        match embed_batched(
            engine.embedder().as_ref(),
            &texts,
            config.embedding.batch_size,
        )
        .await
        {
            Ok(vectors) => {
                for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                    chunk.embedding = vector;
                }
                embedded = chunks.len();
            }
            Err(e) => tracing::warn!(
                source_id = %source.id,
                error = %e,
                "embedding failed; chunks stored without embeddings"
            ),
        }
    }

    let draft = AuditDraft::new(
        &ctx.actor,
        None,
        AuditDetails::KnowledgePublished {
            source_id: source.id.clone(),
            version,
            chunk_count: chunks.len(),
            is_active: true,
        },
    );
    let chunk_count = chunks.len();
    let mut commit = Commit::new(&tenant.id);
    commit.sources.push(SourceUpdate::new(source.clone(), chunks));
    engine
        .recorder()
        .seal(engine.store().as_ref(), commit, vec![draft])
        .await
        .with_context(|| format!("failed to store knowledge source {}", source.id))?;

    tracing::info!(
        tenant_id = %tenant.id,
        source_id = %source.id,
        version,
        chunks = chunk_count,
        embedded,
        "knowledge source published"
    );
    Ok(PublishReport {
        source_id: source.id,
        version,
        chunks: chunk_count,
        embedded,
    })
}

/// Take a source out of retrieval. Its version is unchanged.
pub async fn deactivate_source(
    engine: &Engine,
    ctx: &RequestContext,
    source_id: &str,
) -> Result<KnowledgeSource> {
    let tenant = engine.active_tenant(&ctx.tenant_id).await?;
    let mut source = engine
        .store()
        .get_knowledge_source(&tenant.id, source_id)
        .await?
        .with_context(|| format!("knowledge source not found: {}", source_id))?;

    source.is_active = false;
    source.updated_at = now_millis();
    let draft = AuditDraft::new(
        &ctx.actor,
        None,
        AuditDetails::KnowledgePublished {
            source_id: source.id.clone(),
            version: source.version,
            chunk_count: 0,
            is_active: false,
        },
    );
    let mut commit = Commit::new(&tenant.id);
    commit.sources.push(SourceUpdate::new(source.clone(), Vec::new()));
    engine
        .recorder()
        .seal(engine.store().as_ref(), commit, vec![draft])
        .await?;

    tracing::info!(tenant_id = %tenant.id, source_id, "knowledge source deactivated");
    Ok(source)
}
