//! SQLite-backed [`Store`] implementation.
//!
//! Typed record fields (settings, tags, entities, citations, redactions,
//! escalation reasons, audit details) are stored as `serde_json` text,
//! embeddings as little-endian `f32` BLOBs, and timestamps as epoch
//! milliseconds. [`Store::commit`] runs in one transaction.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::audit::AuditRecord;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{
    Chunk, Customer, KnowledgeSource, Message, RedactionRule, Session, SessionStatus,
    SourceWindow, Tenant, Thread, Ticket,
};
use crate::store::{ChunkCandidate, Commit, SourceUpdate, Store};

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
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn opt_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(millis)
}

fn ts(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let ms: i64 = row.try_get(column)?;
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("invalid timestamp in {}", column))
}

fn opt_ts(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.try_get(column)?;
    ms.map(|ms| {
        DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("invalid timestamp in {}", column))
    })
    .transpose()
}

fn json<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let text: String = row.try_get(column)?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", column))
}

fn label<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.try_get(column)?;
    Ok(text.parse::<T>()?)
}

fn tenant_from_row(row: &SqliteRow) -> Result<Tenant> {
    Ok(Tenant {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        domain: row.try_get("domain")?,
        settings: json(row, "settings_json")?,
        is_active: row.try_get("is_active")?,
        created_at: ts(row, "created_at")?,
        updated_at: ts(row, "updated_at")?,
    })
}

fn customer_from_row(row: &SqliteRow) -> Result<Customer> {
    Ok(Customer {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        tier: label(row, "tier")?,
        account_type: label(row, "account_type")?,
        created_at: ts(row, "created_at")?,
    })
}

fn rule_from_row(row: &SqliteRow) -> Result<RedactionRule> {
    Ok(RedactionRule {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        pattern: row.try_get("pattern")?,
        rule_type: label(row, "type")?,
        is_active: row.try_get("is_active")?,
        created_at: ts(row, "created_at")?,
        updated_at: ts(row, "updated_at")?,
    })
}

fn source_from_row(row: &SqliteRow) -> Result<KnowledgeSource> {
    Ok(KnowledgeSource {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        source_type: label(row, "type")?,
        content: row.try_get("content")?,
        category: row.try_get("category")?,
        tags: json(row, "tags_json")?,
        author: row.try_get("author")?,
        version: row.try_get("version")?,
        is_active: row.try_get("is_active")?,
        effective_date: opt_ts(row, "effective_date")?,
        expiry_date: opt_ts(row, "expiry_date")?,
        created_at: ts(row, "created_at")?,
        updated_at: ts(row, "updated_at")?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<Session> {
    let reason: Option<String> = row.try_get("escalation_reason_json")?;
    Ok(Session {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        customer_id: row.try_get("customer_id")?,
        status: label(row, "status")?,
        channel: label(row, "channel")?,
        agent_id: row.try_get("agent_id")?,
        escalation_reason: reason
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .context("invalid escalation reason")?,
        created_at: ts(row, "created_at")?,
        updated_at: ts(row, "updated_at")?,
        ended_at: opt_ts(row, "ended_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let intent: Option<String> = row.try_get("intent")?;
    Ok(Message {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        session_id: row.try_get("session_id")?,
        content: row.try_get("content")?,
        message_type: label(row, "message_type")?,
        status: label(row, "status")?,
        confidence: row.try_get("confidence")?,
        intent: intent.map(|i| i.parse()).transpose()?,
        entities: json(row, "entities_json")?,
        citations: json(row, "citations_json")?,
        redactions: json(row, "redactions_json")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: ts(row, "created_at")?,
    })
}

fn thread_from_row(row: &SqliteRow) -> Result<Thread> {
    Ok(Thread {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        session_id: row.try_get("session_id")?,
        parent_message_id: row.try_get("parent_message_id")?,
        message_id: row.try_get("message_id")?,
        thread_order: row.try_get("thread_order")?,
        created_at: ts(row, "created_at")?,
    })
}

fn ticket_from_row(row: &SqliteRow) -> Result<Ticket> {
    Ok(Ticket {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        session_id: row.try_get("session_id")?,
        customer_id: row.try_get("customer_id")?,
        source_message_id: row.try_get("source_message_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        priority: label(row, "priority")?,
        category: label(row, "category")?,
        status: label(row, "status")?,
        assigned_agent_id: row.try_get("assigned_agent_id")?,
        tags: json(row, "tags_json")?,
        created_at: ts(row, "created_at")?,
        updated_at: ts(row, "updated_at")?,
        resolved_at: opt_ts(row, "resolved_at")?,
        closed_at: opt_ts(row, "closed_at")?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<AuditRecord> {
    Ok(AuditRecord {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        sequence: row.try_get("sequence")?,
        event_type: label(row, "event_type")?,
        actor: label(row, "actor")?,
        session_id: row.try_get("session_id")?,
        details: json(row, "details_json")?,
        prev_hash: row.try_get("prev_hash")?,
        hash: row.try_get("hash")?,
        created_at: ts(row, "created_at")?,
    })
}

async fn upsert_session(tx: &mut Transaction<'_, Sqlite>, s: &Session) -> Result<()> {
    let reason = s
        .escalation_reason
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let result = sqlx::query(
        r#"
        INSERT INTO sessions (id, tenant_id, customer_id, status, channel, agent_id,
                              escalation_reason_json, created_at, updated_at, ended_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            agent_id = excluded.agent_id,
            escalation_reason_json = excluded.escalation_reason_json,
            updated_at = excluded.updated_at,
            ended_at = excluded.ended_at
        WHERE sessions.tenant_id = excluded.tenant_id
        "#,
    )
    .bind(&s.id)
    .bind(&s.tenant_id)
    .bind(&s.customer_id)
    .bind(s.status.as_str())
    .bind(s.channel.as_str())
    .bind(&s.agent_id)
    .bind(reason)
    .bind(millis(s.created_at))
    .bind(millis(s.updated_at))
    .bind(opt_millis(s.ended_at))
    .execute(&mut **tx)
    .await?;
    if result.rows_affected() == 0 {
        bail!("session {} belongs to another tenant", s.id);
    }
    Ok(())
}

async fn insert_message(tx: &mut Transaction<'_, Sqlite>, m: &Message) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO messages (id, tenant_id, session_id, content, message_type, status,
                              confidence, intent, entities_json, citations_json,
                              redactions_json, idempotency_key, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&m.id)
    .bind(&m.tenant_id)
    .bind(&m.session_id)
    .bind(&m.content)
    .bind(m.message_type.as_str())
    .bind(m.status.as_str())
    .bind(m.confidence)
    .bind(m.intent.map(|i| i.as_str()))
    .bind(serde_json::to_string(&m.entities)?)
    .bind(serde_json::to_string(&m.citations)?)
    .bind(serde_json::to_string(&m.redactions)?)
    .bind(&m.idempotency_key)
    .bind(millis(m.created_at))
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to insert message {}", m.id))?;
    Ok(())
}

async fn upsert_ticket(tx: &mut Transaction<'_, Sqlite>, t: &Ticket) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO tickets (id, tenant_id, session_id, customer_id, source_message_id, title,
                             description, priority, category, status, assigned_agent_id,
                             tags_json, created_at, updated_at, resolved_at, closed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            description = excluded.description,
            priority = excluded.priority,
            category = excluded.category,
            status = excluded.status,
            assigned_agent_id = excluded.assigned_agent_id,
            tags_json = excluded.tags_json,
            updated_at = excluded.updated_at,
            resolved_at = excluded.resolved_at,
            closed_at = excluded.closed_at
        WHERE tickets.tenant_id = excluded.tenant_id
        "#,
    )
    .bind(&t.id)
    .bind(&t.tenant_id)
    .bind(&t.session_id)
    .bind(&t.customer_id)
    .bind(&t.source_message_id)
    .bind(&t.title)
    .bind(&t.description)
    .bind(t.priority.as_str())
    .bind(t.category.as_str())
    .bind(t.status.as_str())
    .bind(&t.assigned_agent_id)
    .bind(serde_json::to_string(&t.tags)?)
    .bind(millis(t.created_at))
    .bind(millis(t.updated_at))
    .bind(opt_millis(t.resolved_at))
    .bind(opt_millis(t.closed_at))
    .execute(&mut **tx)
    .await?;
    if result.rows_affected() == 0 {
        bail!("ticket {} belongs to another tenant", t.id);
    }
    Ok(())
}

async fn insert_audit(tx: &mut Transaction<'_, Sqlite>, a: &AuditRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audits (id, tenant_id, sequence, event_type, actor, session_id,
                            details_json, prev_hash, hash, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&a.id)
    .bind(&a.tenant_id)
    .bind(a.sequence)
    .bind(a.event_type.as_str())
    .bind(a.actor.to_string())
    .bind(&a.session_id)
    .bind(serde_json::to_string(&a.details)?)
    .bind(&a.prev_hash)
    .bind(&a.hash)
    .bind(millis(a.created_at))
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to append audit record {}", a.sequence))?;
    Ok(())
}

/// Upsert a source and replace its valid chunk set inside `tx`.
async fn write_source(tx: &mut Transaction<'_, Sqlite>, update: &SourceUpdate) -> Result<()> {
    let source = &update.source;
    let result = sqlx::query(
        r#"
        INSERT INTO knowledge_sources (id, tenant_id, name, type, content, category, tags_json,
                                       author, version, is_active, effective_date,
                                       expiry_date, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            type = excluded.type,
            content = excluded.content,
            category = excluded.category,
            tags_json = excluded.tags_json,
            author = excluded.author,
            version = excluded.version,
            is_active = excluded.is_active,
            effective_date = excluded.effective_date,
            expiry_date = excluded.expiry_date,
            updated_at = excluded.updated_at
        WHERE knowledge_sources.tenant_id = excluded.tenant_id
        "#,
    )
    .bind(&source.id)
    .bind(&source.tenant_id)
    .bind(&source.name)
    .bind(source.source_type.as_str())
    .bind(&source.content)
    .bind(&source.category)
    .bind(serde_json::to_string(&source.tags)?)
    .bind(&source.author)
    .bind(source.version)
    .bind(source.is_active)
    .bind(opt_millis(source.effective_date))
    .bind(opt_millis(source.expiry_date))
    .bind(millis(source.created_at))
    .bind(millis(source.updated_at))
    .execute(&mut **tx)
    .await?;
    if result.rows_affected() == 0 {
        bail!("knowledge source {} belongs to another tenant", source.id);
    }

    sqlx::query("UPDATE chunks SET is_valid = 0 WHERE knowledge_source_id = ? AND is_valid = 1")
        .bind(&source.id)
        .execute(&mut **tx)
        .await?;

    for chunk in &update.chunks {
        let blob = (!chunk.embedding.is_empty()).then(|| vec_to_blob(&chunk.embedding));
        sqlx::query(
            r#"
            INSERT INTO chunks (id, tenant_id, knowledge_source_id, source_version, chunk_index,
                                content, embedding, hash, is_valid, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.tenant_id)
        .bind(&chunk.knowledge_source_id)
        .bind(chunk.source_version)
        .bind(chunk.chunk_index)
        .bind(&chunk.content)
        .bind(blob)
        .bind(&chunk.hash)
        .bind(chunk.is_valid)
        .bind(millis(chunk.created_at))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn put_tenant(&self, tenant: &Tenant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, domain, settings_json, is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                domain = excluded.domain,
                settings_json = excluded.settings_json,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(&tenant.domain)
        .bind(serde_json::to_string(&tenant.settings)?)
        .bind(tenant.is_active)
        .bind(millis(tenant.created_at))
        .bind(millis(tenant.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = ?")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(tenant_from_row).transpose()
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query("SELECT * FROM tenants ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(tenant_from_row).collect()
    }

    async fn put_customer(&self, customer: &Customer) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO customers (id, tenant_id, name, email, phone, tier, account_type, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                email = excluded.email,
                phone = excluded.phone,
                tier = excluded.tier,
                account_type = excluded.account_type
            WHERE customers.tenant_id = excluded.tenant_id
            "#,
        )
        .bind(&customer.id)
        .bind(&customer.tenant_id)
        .bind(&customer.name)
        .bind(&customer.email)
        .bind(&customer.phone)
        .bind(customer.tier.as_str())
        .bind(customer.account_type.as_str())
        .bind(millis(customer.created_at))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("customer {} belongs to another tenant", customer.id);
        }
        Ok(())
    }

    async fn get_customer(&self, tenant_id: &str, customer_id: &str) -> Result<Option<Customer>> {
        let row = sqlx::query("SELECT * FROM customers WHERE id = ? AND tenant_id = ?")
            .bind(customer_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(customer_from_row).transpose()
    }

    async fn put_redaction_rule(&self, rule: &RedactionRule) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO redaction_rules (id, tenant_id, name, pattern, type, is_active,
                                         created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                pattern = excluded.pattern,
                type = excluded.type,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            WHERE redaction_rules.tenant_id = excluded.tenant_id
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.tenant_id)
        .bind(&rule.name)
        .bind(&rule.pattern)
        .bind(rule.rule_type.as_str())
        .bind(rule.is_active)
        .bind(millis(rule.created_at))
        .bind(millis(rule.updated_at))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("redaction rule {} belongs to another tenant", rule.id);
        }
        Ok(())
    }

    async fn active_redaction_rules(&self, tenant_id: &str) -> Result<Vec<RedactionRule>> {
        let rows = sqlx::query("SELECT * FROM redaction_rules WHERE tenant_id = ? AND is_active = 1")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn get_knowledge_source(
        &self,
        tenant_id: &str,
        source_id: &str,
    ) -> Result<Option<KnowledgeSource>> {
        let row = sqlx::query("SELECT * FROM knowledge_sources WHERE id = ? AND tenant_id = ?")
            .bind(source_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn put_knowledge_source(&self, source: &KnowledgeSource, chunks: &[Chunk]) -> Result<()> {
        let update = SourceUpdate::new(source.clone(), chunks.to_vec());
        update.check_chunks()?;
        let mut tx = self.pool.begin().await?;
        write_source(&mut tx, &update).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn retrievable_chunks(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChunkCandidate>> {
        let now_ms = millis(now);
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.tenant_id, c.knowledge_source_id, c.source_version, c.chunk_index,
                   c.content, c.embedding, c.hash, c.is_valid, c.created_at,
                   s.is_active AS source_active, s.effective_date, s.expiry_date,
                   s.updated_at AS source_updated_at
            FROM chunks c
            JOIN knowledge_sources s ON s.id = c.knowledge_source_id AND s.tenant_id = c.tenant_id
            WHERE c.tenant_id = ?
              AND c.is_valid = 1
              AND s.is_active = 1
              AND (s.effective_date IS NULL OR s.effective_date <= ?)
              AND (s.expiry_date IS NULL OR s.expiry_date > ?)
            ORDER BY c.knowledge_source_id, c.chunk_index
            "#,
        )
        .bind(tenant_id)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let blob: Option<Vec<u8>> = row.try_get("embedding")?;
                Ok(ChunkCandidate {
                    chunk: Chunk {
                        id: row.try_get("id")?,
                        tenant_id: row.try_get("tenant_id")?,
                        knowledge_source_id: row.try_get("knowledge_source_id")?,
                        source_version: row.try_get("source_version")?,
                        chunk_index: row.try_get("chunk_index")?,
                        content: row.try_get("content")?,
                        embedding: blob.as_deref().map(blob_to_vec).unwrap_or_default(),
                        hash: row.try_get("hash")?,
                        is_valid: row.try_get("is_valid")?,
                        created_at: ts(row, "created_at")?,
                    },
                    source: SourceWindow {
                        is_active: row.try_get("source_active")?,
                        effective_date: opt_ts(row, "effective_date")?,
                        expiry_date: opt_ts(row, "expiry_date")?,
                        updated_at: ts(row, "source_updated_at")?,
                    },
                })
            })
            .collect()
    }

    async fn get_session(&self, tenant_id: &str, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ? AND tenant_id = ?")
            .bind(session_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions(
        &self,
        tenant_id: &str,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM sessions WHERE tenant_id = ? AND status IN ({}) ORDER BY created_at, id",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(tenant_id);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn session_messages(&self, tenant_id: &str, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE tenant_id = ? AND session_id = ? ORDER BY created_at, rowid",
        )
        .bind(tenant_id)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn session_threads(&self, tenant_id: &str, session_id: &str) -> Result<Vec<Thread>> {
        let rows = sqlx::query(
            "SELECT * FROM threads WHERE tenant_id = ? AND session_id = ? ORDER BY created_at, rowid",
        )
        .bind(tenant_id)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(thread_from_row).collect()
    }

    async fn find_message_by_key(
        &self,
        tenant_id: &str,
        session_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT * FROM messages WHERE tenant_id = ? AND session_id = ? AND idempotency_key = ?",
        )
        .bind(tenant_id)
        .bind(session_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn get_ticket(&self, tenant_id: &str, ticket_id: &str) -> Result<Option<Ticket>> {
        let row = sqlx::query("SELECT * FROM tickets WHERE id = ? AND tenant_id = ?")
            .bind(ticket_id)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(ticket_from_row).transpose()
    }

    async fn session_tickets(&self, tenant_id: &str, session_id: &str) -> Result<Vec<Ticket>> {
        let rows = sqlx::query(
            "SELECT * FROM tickets WHERE tenant_id = ? AND session_id = ? ORDER BY created_at, rowid",
        )
        .bind(tenant_id)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ticket_from_row).collect()
    }

    async fn latest_audit(&self, tenant_id: &str) -> Result<Option<AuditRecord>> {
        let row = sqlx::query(
            "SELECT * FROM audits WHERE tenant_id = ? ORDER BY sequence DESC LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(audit_from_row).transpose()
    }

    async fn audit_trail(&self, tenant_id: &str) -> Result<Vec<AuditRecord>> {
        let rows = sqlx::query("SELECT * FROM audits WHERE tenant_id = ? ORDER BY sequence")
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn commit(&self, commit: &Commit) -> Result<()> {
        commit.check()?;
        let mut tx = self.pool.begin().await?;

        if let Some(first) = commit.audits.first() {
            let head: Option<i64> =
                sqlx::query_scalar("SELECT MAX(sequence) FROM audits WHERE tenant_id = ?")
                    .bind(&commit.tenant_id)
                    .fetch_one(&mut *tx)
                    .await?;
            let expected = head.unwrap_or(0) + 1;
            if first.sequence != expected {
                bail!(
                    "stale audit chain head for tenant {}: expected sequence {}, got {}",
                    commit.tenant_id,
                    expected,
                    first.sequence
                );
            }
        }

        for s in &commit.sessions {
            upsert_session(&mut tx, s).await?;
        }
        for m in &commit.messages {
            insert_message(&mut tx, m).await?;
        }
        for th in &commit.threads {
            sqlx::query(
                r#"
                INSERT INTO threads (id, tenant_id, session_id, parent_message_id, message_id,
                                     thread_order, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&th.id)
            .bind(&th.tenant_id)
            .bind(&th.session_id)
            .bind(&th.parent_message_id)
            .bind(&th.message_id)
            .bind(th.thread_order)
            .bind(millis(th.created_at))
            .execute(&mut *tx)
            .await?;
        }
        for t in &commit.tickets {
            upsert_ticket(&mut tx, t).await?;
        }
        for update in &commit.sources {
            write_source(&mut tx, update).await?;
        }
        for a in &commit.audits {
            insert_audit(&mut tx, a).await?;
        }

        // Dropping `tx` on any error above rolls everything back.
        tx.commit().await?;
        Ok(())
    }
}
