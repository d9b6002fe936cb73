//! Storage abstraction for the support engine.
//!
//! The [`Store`] trait defines every read the pipeline performs plus a
//! single atomic write, [`Store::commit`]. Implementations must be
//! `Send + Sync` to work with async runtimes.
//!
//! # Tenant isolation
//!
//! Every read takes a `tenant_id` and never returns rows of another
//! tenant, even when the caller passes a foreign id. A [`Commit`] carrying
//! a row whose `tenant_id` differs from [`Commit::tenant_id`] is rejected
//! as a whole.
//!
//! # Audit sequencing
//!
//! Audit records are append-only. A commit whose first audit record does
//! not continue the tenant's sequence (`latest + 1`) is rejected, so two
//! writers racing on a stale chain head cannot both succeed.

pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::audit::AuditRecord;
use crate::models::{
    Chunk, Customer, KnowledgeSource, Message, RedactionRule, Session, SessionStatus,
    SourceWindow, Tenant, Thread, Ticket,
};

/// A retrievable chunk together with the state of its source at read time.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    pub chunk: Chunk,
    pub source: SourceWindow,
}

/// A knowledge source version and the chunk set that replaces its
/// current valid chunks. Empty `chunks` only invalidates.
#[derive(Debug, Clone)]
pub struct SourceUpdate {
    pub source: KnowledgeSource,
    pub chunks: Vec<Chunk>,
}

/// Everything one pipeline step writes. Applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    pub tenant_id: String,
    /// Upserted by id.
    pub sessions: Vec<Session>,
    /// Inserted; messages are never rewritten.
    pub messages: Vec<Message>,
    pub threads: Vec<Thread>,
    /// Upserted by id.
    pub tickets: Vec<Ticket>,
    /// Upserted by id; each replaces the source's valid chunk set.
    pub sources: Vec<SourceUpdate>,
    /// Appended in order.
    pub audits: Vec<AuditRecord>,
}

impl Commit {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
            && self.messages.is_empty()
            && self.threads.is_empty()
            && self.tickets.is_empty()
            && self.sources.is_empty()
            && self.audits.is_empty()
    }

    /// True when the commit writes nothing but audit records.
    pub fn is_audit_only(&self) -> bool {
        self.sessions.is_empty()
            && self.messages.is_empty()
            && self.threads.is_empty()
            && self.tickets.is_empty()
            && self.sources.is_empty()
    }

    /// Reject rows belonging to another tenant and out-of-order audits.
    pub fn check(&self) -> Result<()> {
        let t = self.tenant_id.as_str();
        let foreign = self.sessions.iter().any(|s| s.tenant_id != t)
            || self.messages.iter().any(|m| m.tenant_id != t)
            || self.threads.iter().any(|th| th.tenant_id != t)
            || self.tickets.iter().any(|tk| tk.tenant_id != t)
            || self.sources.iter().any(|u| u.source.tenant_id != t)
            || self.audits.iter().any(|a| a.tenant_id != t);
        if foreign {
            bail!("commit for tenant {} contains rows of another tenant", t);
        }
        for update in &self.sources {
            update.check_chunks()?;
        }
        for pair in self.audits.windows(2) {
            if pair[1].sequence != pair[0].sequence + 1 {
                bail!(
                    "audit sequence gap in commit: {} then {}",
                    pair[0].sequence,
                    pair[1].sequence
                );
            }
        }
        Ok(())
    }
}

impl SourceUpdate {
    pub fn new(source: KnowledgeSource, chunks: Vec<Chunk>) -> Self {
        Self { source, chunks }
    }

    /// Reject chunks that belong to another source or tenant.
    pub fn check_chunks(&self) -> Result<()> {
        let foreign = self.chunks.iter().any(|c| {
            c.tenant_id != self.source.tenant_id || c.knowledge_source_id != self.source.id
        });
        if foreign {
            bail!("chunks do not belong to knowledge source {}", self.source.id);
        }
        Ok(())
    }
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`put_tenant`](Store::put_tenant) / [`get_tenant`](Store::get_tenant) | Tenant records |
/// | [`put_customer`](Store::put_customer) / [`get_customer`](Store::get_customer) | Customer records |
/// | [`put_redaction_rule`](Store::put_redaction_rule) | Insert or update a rule |
/// | [`active_redaction_rules`](Store::active_redaction_rules) | Rules the redactor applies |
/// | [`put_knowledge_source`](Store::put_knowledge_source) | Publish a source version and its chunks |
/// | [`retrievable_chunks`](Store::retrievable_chunks) | Valid chunks of in-window, active sources |
/// | [`commit`](Store::commit) | Atomic session/message/ticket/knowledge/audit write |
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_tenant(&self, tenant: &Tenant) -> Result<()>;

    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>>;

    async fn list_tenants(&self) -> Result<Vec<Tenant>>;

    async fn put_customer(&self, customer: &Customer) -> Result<()>;

    async fn get_customer(&self, tenant_id: &str, customer_id: &str) -> Result<Option<Customer>>;

    async fn put_redaction_rule(&self, rule: &RedactionRule) -> Result<()>;

    /// Active rules of the tenant, in no particular order.
    async fn active_redaction_rules(&self, tenant_id: &str) -> Result<Vec<RedactionRule>>;

    async fn get_knowledge_source(
        &self,
        tenant_id: &str,
        source_id: &str,
    ) -> Result<Option<KnowledgeSource>>;

    /// Upsert a source and atomically replace its chunk set.
    ///
    /// All previously valid chunks of the source are invalidated (kept,
    /// flagged `is_valid = false`) and `chunks` are inserted as the new
    /// valid set. Passing no chunks only invalidates.
    async fn put_knowledge_source(&self, source: &KnowledgeSource, chunks: &[Chunk]) -> Result<()>;

    /// Valid chunks whose source is active and in its effective window at `now`.
    async fn retrievable_chunks(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChunkCandidate>>;

    async fn get_session(&self, tenant_id: &str, session_id: &str) -> Result<Option<Session>>;

    /// Sessions of the tenant currently in one of `statuses`.
    async fn list_sessions(
        &self,
        tenant_id: &str,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>>;

    /// Messages of a session ordered by creation time.
    async fn session_messages(&self, tenant_id: &str, session_id: &str) -> Result<Vec<Message>>;

    async fn session_threads(&self, tenant_id: &str, session_id: &str) -> Result<Vec<Thread>>;

    async fn find_message_by_key(
        &self,
        tenant_id: &str,
        session_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Message>>;

    async fn get_ticket(&self, tenant_id: &str, ticket_id: &str) -> Result<Option<Ticket>>;

    /// All tickets of a session, oldest first.
    async fn session_tickets(&self, tenant_id: &str, session_id: &str) -> Result<Vec<Ticket>>;

    /// The newest ticket of the session whose status is still open.
    async fn open_ticket_for_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Option<Ticket>> {
        Ok(self
            .session_tickets(tenant_id, session_id)
            .await?
            .into_iter()
            .rev()
            .find(|t| t.status.is_open()))
    }

    async fn latest_audit(&self, tenant_id: &str) -> Result<Option<AuditRecord>>;

    /// The tenant's full audit trail in sequence order.
    async fn audit_trail(&self, tenant_id: &str) -> Result<Vec<AuditRecord>>;

    /// Apply a [`Commit`] atomically.
    async fn commit(&self, commit: &Commit) -> Result<()>;
}
