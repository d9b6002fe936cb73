//! Tamper-evident audit log.
//!
//! Every compliance-relevant action (redactions, escalation decisions,
//! session and ticket transitions, knowledge publications, security
//! events, pipeline failures) becomes an [`AuditRecord`]. Records form one
//! hash chain per tenant:
//!
//! ```text
//! hash(n) = hex(HMAC-SHA256(key, canonical(record n) ‖ hash(n-1)))
//! ```
//!
//! `sequence` starts at 1 and is contiguous, and the first record links to
//! [`GENESIS_HASH`]. [`AuditRecorder::verify`] recomputes the chain and
//! reports the first record that was edited, removed or moved.
//!
//! The recorder never writes on its own schedule: drafts are sealed into a
//! [`Commit`] and persisted together with the state change they describe,
//! under a per-tenant chain lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::AuditConfig;
use crate::error::{EngineError, EngineResult, ErrorKind, Stage};
use crate::escalation::Decision;
use crate::lifecycle::TransitionTrigger;
use crate::models::{
    new_id, now_millis, str_enum, Actor, Channel, EscalationReason, Intent, Redaction, SessionStatus,
    TicketCategory, TicketPriority, TicketStatus,
};
use crate::store::{Commit, Store};

type HmacSha256 = Hmac<Sha256>;

/// `prev_hash` of the first record in every tenant chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const DEV_KEY: &[u8] = b"helios-dev-audit-key";

str_enum! {
    pub enum AuditEventType {
        SessionOpened => "session_opened",
        Redaction => "redaction",
        EscalationDecision => "escalation_decision",
        SessionTransition => "session_transition",
        AgentAssigned => "agent_assigned",
        TicketOpened => "ticket_opened",
        TicketTransition => "ticket_transition",
        TicketUpdated => "ticket_updated",
        KnowledgePublished => "knowledge_published",
        SecurityEvent => "security_event",
        PipelineFailure => "pipeline_failure",
        PipelineCancelled => "pipeline_cancelled",
    }
}

/// Event payload. The variant determines the record's event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditDetails {
    SessionOpened {
        customer_id: String,
        channel: Channel,
    },
    Redaction {
        message_id: String,
        redactions: Vec<Redaction>,
    },
    EscalationDecision {
        message_id: String,
        intent: Intent,
        confidence: f64,
        decision: Decision,
        citations: Vec<String>,
    },
    SessionTransition {
        from: SessionStatus,
        to: SessionStatus,
        trigger: TransitionTrigger,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<EscalationReason>,
    },
    AgentAssigned {
        agent_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<String>,
    },
    TicketOpened {
        ticket_id: String,
        priority: TicketPriority,
        category: TicketCategory,
        source_message_id: String,
    },
    TicketTransition {
        ticket_id: String,
        from: TicketStatus,
        to: TicketStatus,
        trigger: TransitionTrigger,
    },
    TicketUpdated {
        ticket_id: String,
        from_priority: TicketPriority,
        to_priority: TicketPriority,
    },
    KnowledgePublished {
        source_id: String,
        version: i64,
        chunk_count: usize,
        is_active: bool,
    },
    InvalidRedactionRule {
        rule_id: String,
        error: String,
    },
    PipelineFailure {
        stage: Stage,
        kind: ErrorKind,
        error: String,
    },
    PipelineCancelled {
        stage: Stage,
    },
}

impl AuditDetails {
    pub fn event_type(&self) -> AuditEventType {
        match self {
            AuditDetails::SessionOpened { .. } => AuditEventType::SessionOpened,
            AuditDetails::Redaction { .. } => AuditEventType::Redaction,
            AuditDetails::EscalationDecision { .. } => AuditEventType::EscalationDecision,
            AuditDetails::SessionTransition { .. } => AuditEventType::SessionTransition,
            AuditDetails::AgentAssigned { .. } => AuditEventType::AgentAssigned,
            AuditDetails::TicketOpened { .. } => AuditEventType::TicketOpened,
            AuditDetails::TicketTransition { .. } => AuditEventType::TicketTransition,
            AuditDetails::TicketUpdated { .. } => AuditEventType::TicketUpdated,
            AuditDetails::KnowledgePublished { .. } => AuditEventType::KnowledgePublished,
            AuditDetails::InvalidRedactionRule { .. } => AuditEventType::SecurityEvent,
            AuditDetails::PipelineFailure { .. } => AuditEventType::PipelineFailure,
            AuditDetails::PipelineCancelled { .. } => AuditEventType::PipelineCancelled,
        }
    }
}

/// One sealed entry of a tenant's audit chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub tenant_id: String,
    pub sequence: i64,
    pub event_type: AuditEventType,
    pub actor: Actor,
    pub session_id: Option<String>,
    pub details: AuditDetails,
    pub prev_hash: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// An audit entry that has not been sealed into the chain yet.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub actor: Actor,
    pub session_id: Option<String>,
    pub details: AuditDetails,
}

impl AuditDraft {
    pub fn new(actor: &Actor, session_id: Option<&str>, details: AuditDetails) -> Self {
        Self {
            actor: actor.clone(),
            session_id: session_id.map(str::to_string),
            details,
        }
    }
}

/// Chain verification failure, pointing at the first bad record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChainError {
    #[error("audit record {index} belongs to tenant {found}, expected {expected}")]
    ForeignRecord {
        index: usize,
        expected: String,
        found: String,
    },
    #[error("audit sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: i64, found: i64 },
    #[error("audit record {sequence} does not link to its predecessor")]
    BrokenLink { sequence: i64 },
    #[error("audit record {sequence} hash does not match its contents")]
    HashMismatch { sequence: i64 },
}

/// Seals drafts into the per-tenant HMAC chain.
pub struct AuditRecorder {
    key: Vec<u8>,
    chains: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AuditRecorder {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            chains: Mutex::new(HashMap::new()),
        }
    }

    /// Read the signing key from the environment variable named in config.
    pub fn from_config(config: &AuditConfig) -> Self {
        match std::env::var(&config.signing_key_env) {
            Ok(key) if !key.is_empty() => Self::new(key.into_bytes()),
            _ => {
                tracing::warn!(
                    env = %config.signing_key_env,
                    "audit signing key not set; using the development key"
                );
                Self::new(DEV_KEY)
            }
        }
    }

    fn chain_lock(&self, tenant_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut chains = self.chains.lock().unwrap();
        chains
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Append a single audit record and return its id.
    pub async fn record(
        &self,
        store: &dyn Store,
        tenant_id: &str,
        draft: AuditDraft,
    ) -> EngineResult<String> {
        let ids = self.seal(store, Commit::new(tenant_id), vec![draft]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| EngineError::AuditFailure(anyhow::anyhow!("no audit record sealed")))
    }

    /// Seal `drafts` onto the tenant's chain, append them to `commit`, and
    /// apply the commit. Returns the new audit ids in order.
    ///
    /// The chain head is read and the commit applied under the tenant's
    /// chain lock, so sequences stay contiguous across concurrent writers.
    pub async fn seal(
        &self,
        store: &dyn Store,
        mut commit: Commit,
        drafts: Vec<AuditDraft>,
    ) -> EngineResult<Vec<String>> {
        let lock = self.chain_lock(&commit.tenant_id);
        let _chain = lock.lock().await;

        let head = store
            .latest_audit(&commit.tenant_id)
            .await
            .map_err(EngineError::AuditFailure)?;
        let (mut sequence, mut prev_hash) = match head {
            Some(h) => (h.sequence, h.hash),
            None => (0, GENESIS_HASH.to_string()),
        };

        let created_at = now_millis();
        let mut ids = Vec::with_capacity(drafts.len());
        for draft in drafts {
            sequence += 1;
            let mut record = AuditRecord {
                id: new_id(),
                tenant_id: commit.tenant_id.clone(),
                sequence,
                event_type: draft.details.event_type(),
                actor: draft.actor,
                session_id: draft.session_id,
                details: draft.details,
                prev_hash: prev_hash.clone(),
                hash: String::new(),
                created_at,
            };
            record.hash = hex::encode(self.mac(&record)?.finalize().into_bytes());
            prev_hash = record.hash.clone();
            ids.push(record.id.clone());
            commit.audits.push(record);
        }

        let audit_only = commit.is_audit_only();
        store.commit(&commit).await.map_err(|e| {
            if audit_only {
                EngineError::AuditFailure(e)
            } else {
                EngineError::Storage(e)
            }
        })?;
        Ok(ids)
    }

    /// Recompute the chain over `records` (one tenant, sequence order).
    pub fn verify(&self, records: &[AuditRecord]) -> Result<(), ChainError> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let tenant = first.tenant_id.as_str();
        let mut prev_hash = GENESIS_HASH.to_string();
        for (i, record) in records.iter().enumerate() {
            let expected = i as i64 + 1;
            if record.tenant_id != tenant {
                return Err(ChainError::ForeignRecord {
                    index: i,
                    expected: tenant.to_string(),
                    found: record.tenant_id.clone(),
                });
            }
            if record.sequence != expected {
                return Err(ChainError::SequenceGap {
                    expected,
                    found: record.sequence,
                });
            }
            if record.prev_hash != prev_hash {
                return Err(ChainError::BrokenLink {
                    sequence: record.sequence,
                });
            }
            let mismatch = ChainError::HashMismatch {
                sequence: record.sequence,
            };
            let claimed = hex::decode(&record.hash).map_err(|_| mismatch.clone())?;
            let mac = self.mac(record).map_err(|_| mismatch.clone())?;
            if record.event_type != record.details.event_type() || mac.verify_slice(&claimed).is_err()
            {
                return Err(mismatch);
            }
            prev_hash = record.hash.clone();
        }
        Ok(())
    }

    fn mac(&self, record: &AuditRecord) -> EngineResult<HmacSha256> {
        let details = serde_json::to_string(&record.details)
            .map_err(|e| EngineError::AuditFailure(e.into()))?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| EngineError::Configuration(format!("audit key: {}", e)))?;
        let sequence = record.sequence.to_string();
        let actor = record.actor.to_string();
        let created_at = record.created_at.timestamp_millis().to_string();
        for field in [
            record.tenant_id.as_str(),
            sequence.as_str(),
            record.event_type.as_str(),
            actor.as_str(),
            record.session_id.as_deref().unwrap_or(""),
            details.as_str(),
            created_at.as_str(),
        ] {
            mac.update(field.as_bytes());
            mac.update(&[0x1f]);
        }
        mac.update(record.prev_hash.as_bytes());
        Ok(mac)
    }
}
