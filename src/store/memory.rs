//! In-memory [`Store`] implementation for tests and single-process use.
//!
//! Every table is a `HashMap` or `Vec` behind one `std::sync::RwLock`, so
//! a [`Commit`] is applied under a single write lock and is atomic with
//! respect to readers. Retrieval candidates are filtered by scanning.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::audit::AuditRecord;
use crate::models::{
    Chunk, Customer, KnowledgeSource, Message, RedactionRule, Session, SessionStatus, Tenant,
    Thread, Ticket,
};

use super::{ChunkCandidate, Commit, SourceUpdate, Store};

#[derive(Default)]
struct Tables {
    tenants: HashMap<String, Tenant>,
    customers: HashMap<String, Customer>,
    rules: HashMap<String, RedactionRule>,
    sources: HashMap<String, KnowledgeSource>,
    chunks: Vec<Chunk>,
    sessions: HashMap<String, Session>,
    messages: Vec<Message>,
    threads: Vec<Thread>,
    tickets: Vec<Ticket>,
    audits: HashMap<String, Vec<AuditRecord>>,
}

impl Tables {
    fn check_source_owner(&self, source: &KnowledgeSource) -> Result<()> {
        match self.sources.get(&source.id) {
            Some(existing) if existing.tenant_id != source.tenant_id => {
                bail!("knowledge source {} belongs to another tenant", source.id)
            }
            _ => Ok(()),
        }
    }

    fn apply_source(&mut self, update: &SourceUpdate) {
        for chunk in self.chunks.iter_mut() {
            if chunk.knowledge_source_id == update.source.id {
                chunk.is_valid = false;
            }
        }
        self.chunks.extend(update.chunks.iter().cloned());
        self.sources
            .insert(update.source.id.clone(), update.source.clone());
    }
}

/// In-memory store for tests and embedding the engine in-process.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_tenant(&self, tenant: &Tenant) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        t.tenants.insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let t = self.tables.read().unwrap();
        Ok(t.tenants.get(tenant_id).cloned())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let t = self.tables.read().unwrap();
        let mut tenants: Vec<Tenant> = t.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }

    async fn put_customer(&self, customer: &Customer) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        if let Some(existing) = t.customers.get(&customer.id) {
            if existing.tenant_id != customer.tenant_id {
                bail!("customer {} belongs to another tenant", customer.id);
            }
        }
        t.customers.insert(customer.id.clone(), customer.clone());
        Ok(())
    }

    async fn get_customer(&self, tenant_id: &str, customer_id: &str) -> Result<Option<Customer>> {
        let t = self.tables.read().unwrap();
        Ok(t.customers
            .get(customer_id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned())
    }

    async fn put_redaction_rule(&self, rule: &RedactionRule) -> Result<()> {
        let mut t = self.tables.write().unwrap();
        if let Some(existing) = t.rules.get(&rule.id) {
            if existing.tenant_id != rule.tenant_id {
                bail!("redaction rule {} belongs to another tenant", rule.id);
            }
        }
        t.rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn active_redaction_rules(&self, tenant_id: &str) -> Result<Vec<RedactionRule>> {
        let t = self.tables.read().unwrap();
        Ok(t.rules
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.is_active)
            .cloned()
            .collect())
    }

    async fn get_knowledge_source(
        &self,
        tenant_id: &str,
        source_id: &str,
    ) -> Result<Option<KnowledgeSource>> {
        let t = self.tables.read().unwrap();
        Ok(t.sources
            .get(source_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn put_knowledge_source(&self, source: &KnowledgeSource, chunks: &[Chunk]) -> Result<()> {
        let update = SourceUpdate::new(source.clone(), chunks.to_vec());
        update.check_chunks()?;
        let mut t = self.tables.write().unwrap();
        t.check_source_owner(&update.source)?;
        t.apply_source(&update);
        Ok(())
    }

    async fn retrievable_chunks(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChunkCandidate>> {
        let t = self.tables.read().unwrap();
        let mut out = Vec::new();
        for chunk in &t.chunks {
            if chunk.tenant_id != tenant_id || !chunk.is_valid {
                continue;
            }
            let Some(source) = t.sources.get(&chunk.knowledge_source_id) else {
                continue;
            };
            if source.tenant_id != tenant_id || !source.is_retrievable(now) {
                continue;
            }
            out.push(ChunkCandidate {
                chunk: chunk.clone(),
                source: source.window(),
            });
        }
        Ok(out)
    }

    async fn get_session(&self, tenant_id: &str, session_id: &str) -> Result<Option<Session>> {
        let t = self.tables.read().unwrap();
        Ok(t.sessions
            .get(session_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn list_sessions(
        &self,
        tenant_id: &str,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>> {
        let t = self.tables.read().unwrap();
        let mut sessions: Vec<Session> = t
            .sessions
            .values()
            .filter(|s| s.tenant_id == tenant_id && statuses.contains(&s.status))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn session_messages(&self, tenant_id: &str, session_id: &str) -> Result<Vec<Message>> {
        let t = self.tables.read().unwrap();
        Ok(t.messages
            .iter()
            .filter(|m| m.tenant_id == tenant_id && m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn session_threads(&self, tenant_id: &str, session_id: &str) -> Result<Vec<Thread>> {
        let t = self.tables.read().unwrap();
        Ok(t.threads
            .iter()
            .filter(|th| th.tenant_id == tenant_id && th.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn find_message_by_key(
        &self,
        tenant_id: &str,
        session_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Message>> {
        let t = self.tables.read().unwrap();
        Ok(t.messages
            .iter()
            .find(|m| {
                m.tenant_id == tenant_id
                    && m.session_id == session_id
                    && m.idempotency_key.as_deref() == Some(idempotency_key)
            })
            .cloned())
    }

    async fn get_ticket(&self, tenant_id: &str, ticket_id: &str) -> Result<Option<Ticket>> {
        let t = self.tables.read().unwrap();
        Ok(t.tickets
            .iter()
            .find(|tk| tk.id == ticket_id && tk.tenant_id == tenant_id)
            .cloned())
    }

    async fn session_tickets(&self, tenant_id: &str, session_id: &str) -> Result<Vec<Ticket>> {
        let t = self.tables.read().unwrap();
        Ok(t.tickets
            .iter()
            .filter(|tk| tk.tenant_id == tenant_id && tk.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn latest_audit(&self, tenant_id: &str) -> Result<Option<AuditRecord>> {
        let t = self.tables.read().unwrap();
        Ok(t.audits.get(tenant_id).and_then(|chain| chain.last()).cloned())
    }

    async fn audit_trail(&self, tenant_id: &str) -> Result<Vec<AuditRecord>> {
        let t = self.tables.read().unwrap();
        Ok(t.audits.get(tenant_id).cloned().unwrap_or_default())
    }

    async fn commit(&self, commit: &Commit) -> Result<()> {
        commit.check()?;
        let mut t = self.tables.write().unwrap();

        // Validate everything before mutating anything.
        let head = t
            .audits
            .get(&commit.tenant_id)
            .and_then(|chain| chain.last())
            .map_or(0, |r| r.sequence);
        if let Some(first) = commit.audits.first() {
            if first.sequence != head + 1 {
                bail!(
                    "stale audit chain head for tenant {}: expected sequence {}, got {}",
                    commit.tenant_id,
                    head + 1,
                    first.sequence
                );
            }
        }
        for s in &commit.sessions {
            if let Some(existing) = t.sessions.get(&s.id) {
                if existing.tenant_id != commit.tenant_id {
                    bail!("session {} belongs to another tenant", s.id);
                }
            }
        }
        for m in &commit.messages {
            if t.messages.iter().any(|existing| existing.id == m.id) {
                bail!("message {} already exists", m.id);
            }
            if let Some(key) = &m.idempotency_key {
                let taken = t.messages.iter().any(|existing| {
                    existing.tenant_id == m.tenant_id
                        && existing.session_id == m.session_id
                        && existing.idempotency_key.as_ref() == Some(key)
                });
                if taken {
                    bail!("idempotency key {} already used in session {}", key, m.session_id);
                }
            }
        }
        for tk in &commit.tickets {
            if let Some(existing) = t.tickets.iter().find(|e| e.id == tk.id) {
                if existing.tenant_id != commit.tenant_id {
                    bail!("ticket {} belongs to another tenant", tk.id);
                }
            }
        }
        for update in &commit.sources {
            t.check_source_owner(&update.source)?;
        }

        for s in &commit.sessions {
            t.sessions.insert(s.id.clone(), s.clone());
        }
        t.messages.extend(commit.messages.iter().cloned());
        t.threads.extend(commit.threads.iter().cloned());
        for tk in &commit.tickets {
            match t.tickets.iter_mut().find(|e| e.id == tk.id) {
                Some(existing) => *existing = tk.clone(),
                None => t.tickets.push(tk.clone()),
            }
        }
        for update in &commit.sources {
            t.apply_source(update);
        }
        if !commit.audits.is_empty() {
            t.audits
                .entry(commit.tenant_id.clone())
                .or_default()
                .extend(commit.audits.iter().cloned());
        }
        Ok(())
    }
}
