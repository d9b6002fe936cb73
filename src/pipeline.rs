//! The message-processing pipeline and lifecycle entry points.
//!
//! [`Engine`] is the only type transports talk to. Each call takes a
//! [`RequestContext`] carrying the already-authenticated tenant and actor.
//!
//! # `process_message`
//!
//! ```text
//! validate ─► redact ─► retrieve ─► compose ─► decide ─► persist
//! ```
//!
//! - Messages of one session are processed strictly in order: the whole
//!   pipeline runs under a per-session async mutex. Different sessions
//!   run in parallel.
//! - Every stage, storage reads included, runs under its own time budget
//!   from `[pipeline]`; exceeding one fails with
//!   [`EngineError::PipelineTimeout`].
//! - Nothing is written until the final commit, which stores the session,
//!   messages, threads, tickets and audit records atomically. The only
//!   earlier writes are security-event audits for broken redaction rules.
//! - Dependency and timeout failures leave a `pipeline_failure` audit. A
//!   pipeline future dropped mid-flight leaves a `pipeline_cancelled`
//!   audit, written from a drop guard on the runtime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::Instrument;

use crate::audit::{AuditDetails, AuditDraft, AuditRecord, AuditRecorder};
use crate::compose::{ComposedReply, ResponseComposer, SessionContext};
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{EngineError, EngineResult, ErrorKind, Stage};
use crate::escalation::{decide, uncertain_streak, Decision, Thresholds};
use crate::lifecycle::{transition_session, transition_ticket, SessionAction, TransitionTrigger};
use crate::models::{
    new_id, now_millis, Actor, Channel, EscalationReason, Intent, Message, MessageType, Session,
    SessionStatus, Tenant, Thread, Ticket, TicketCategory, TicketPriority, TicketStatus,
};
use crate::redact::RedactionEngine;
use crate::retrieve::{retrieve, RetrieveRequest};
use crate::store::{Commit, Store};

pub const HANDOFF_MESSAGE: &str =
    "I'm connecting you with a support specialist who will continue this conversation.";
pub const REVIEW_NOTICE: &str =
    "This answer has been queued for review by our support team, who may follow up.";

const LOCK_TABLE_PRUNE_AT: usize = 1024;

/// Identity of the caller, supplied by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub tenant_id: String,
    pub actor: Actor,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>, actor: Actor) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub session_id: String,
    pub text: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    /// The stored (masked) customer message.
    pub message: Message,
    /// Bot and system messages threaded under `message`.
    pub replies: Vec<Message>,
    pub decision: Decision,
    pub session_status: SessionStatus,
    pub ticket: Option<Ticket>,
    /// True only when this call opened `ticket`. Always false on replay.
    pub ticket_created: bool,
    /// Set when the bot reply was suppressed for an assigned agent.
    pub forwarded_to: Option<String>,
    /// True when an idempotency key matched an earlier message.
    pub replayed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub session: Session,
    pub ticket: Option<Ticket>,
}

#[derive(Default)]
struct SessionLocks {
    table: Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, tenant_id: &str, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().unwrap();
            if table.len() >= LOCK_TABLE_PRUNE_AT {
                table.retain(|_, l| Arc::strong_count(l) > 1);
            }
            table
                .entry((tenant_id.to_string(), session_id.to_string()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Records `pipeline_cancelled` if dropped while armed.
struct CancelGuard {
    store: Arc<dyn Store>,
    recorder: Arc<AuditRecorder>,
    tenant_id: String,
    session_id: String,
    actor: Actor,
    stage: Stage,
    armed: bool,
}

impl CancelGuard {
    fn enter(&mut self, stage: Stage) {
        tracing::debug!(stage = %stage, "entering stage");
        self.stage = stage;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(
            tenant_id = %self.tenant_id,
            session_id = %self.session_id,
            stage = %self.stage,
            "pipeline cancelled"
        );
        let draft = AuditDraft::new(
            &self.actor,
            Some(&self.session_id),
            AuditDetails::PipelineCancelled { stage: self.stage },
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let recorder = self.recorder.clone();
                let tenant_id = std::mem::take(&mut self.tenant_id);
                handle.spawn(async move {
                    if let Err(e) = recorder.record(store.as_ref(), &tenant_id, draft).await {
                        tracing::error!(error = %e, "failed to record pipeline cancellation");
                    }
                });
            }
            Err(_) => tracing::error!("no runtime available to record pipeline cancellation"),
        }
    }
}

async fn with_timeout<T>(
    stage: Stage,
    budget_ms: u64,
    fut: impl Future<Output = EngineResult<T>>,
) -> EngineResult<T> {
    match tokio::time::timeout(Duration::from_millis(budget_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::PipelineTimeout { stage, budget_ms }),
    }
}

fn storage<T>(result: anyhow::Result<T>) -> EngineResult<T> {
    result.map_err(EngineError::Storage)
}

/// The support engine. Cheap to share behind an `Arc`.
pub struct Engine {
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: Arc<Config>,
    recorder: Arc<AuditRecorder>,
    redactor: RedactionEngine,
    composer: ResponseComposer,
    locks: SessionLocks,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: Arc<Config>,
        recorder: Arc<AuditRecorder>,
    ) -> Self {
        Self {
            redactor: RedactionEngine::new(&config.redaction),
            composer: ResponseComposer::new(&config.composer),
            store,
            embedder,
            config,
            recorder,
            locks: SessionLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn recorder(&self) -> &Arc<AuditRecorder> {
        &self.recorder
    }

    pub(crate) async fn active_tenant(&self, tenant_id: &str) -> EngineResult<Tenant> {
        let tenant = storage(self.store.get_tenant(tenant_id).await)?
            .ok_or_else(|| EngineError::not_found("tenant", tenant_id))?;
        if !tenant.is_active {
            return Err(EngineError::TenantInactive(tenant.id));
        }
        Ok(tenant)
    }

    async fn session_for(&self, tenant_id: &str, session_id: &str) -> EngineResult<Session> {
        storage(self.store.get_session(tenant_id, session_id).await)?
            .ok_or_else(|| EngineError::not_found("session", session_id))
    }

    // ── Sessions ────────────────────────────────────────────────────────

    pub async fn open_session(
        &self,
        ctx: &RequestContext,
        customer_id: &str,
        channel: Channel,
    ) -> EngineResult<Session> {
        let tenant = self.active_tenant(&ctx.tenant_id).await?;
        let customer = storage(self.store.get_customer(&tenant.id, customer_id).await)?
            .ok_or_else(|| EngineError::not_found("customer", customer_id))?;

        let now = now_millis();
        let session = Session {
            id: new_id(),
            tenant_id: tenant.id.clone(),
            customer_id: customer.id.clone(),
            status: SessionStatus::Active,
            channel,
            agent_id: None,
            escalation_reason: None,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        let mut commit = Commit::new(&tenant.id);
        commit.sessions.push(session.clone());
        let draft = AuditDraft::new(
            &ctx.actor,
            Some(&session.id),
            AuditDetails::SessionOpened {
                customer_id: customer.id,
                channel,
            },
        );
        self.recorder
            .seal(self.store.as_ref(), commit, vec![draft])
            .await?;
        tracing::info!(tenant_id = %tenant.id, session_id = %session.id, %channel, "session opened");
        Ok(session)
    }

    // ── Message pipeline ────────────────────────────────────────────────

    pub async fn process_message(
        &self,
        ctx: &RequestContext,
        inbound: InboundMessage,
    ) -> EngineResult<ProcessOutcome> {
        let span = tracing::info_span!(
            "process_message",
            tenant_id = %ctx.tenant_id,
            session_id = %inbound.session_id,
        );
        async move {
            self.validate_inbound(&inbound)?;
            let tenant = with_timeout(
                Stage::Validate,
                self.config.pipeline.validate_timeout_ms,
                self.active_tenant(&ctx.tenant_id),
            )
            .await?;

            let _session_lock = self.locks.acquire(&tenant.id, &inbound.session_id).await;
            let mut guard = CancelGuard {
                store: self.store.clone(),
                recorder: self.recorder.clone(),
                tenant_id: tenant.id.clone(),
                session_id: inbound.session_id.clone(),
                actor: ctx.actor.clone(),
                stage: Stage::Validate,
                armed: true,
            };

            let result = self.run_pipeline(ctx, &tenant, &inbound, &mut guard).await;
            guard.disarm();
            if let Err(e) = &result {
                self.record_failure(ctx, &inbound.session_id, guard.stage, e)
                    .await;
            }
            result
        }
        .instrument(span)
        .await
    }

    fn validate_inbound(&self, inbound: &InboundMessage) -> EngineResult<()> {
        if inbound.session_id.trim().is_empty() {
            return Err(EngineError::Validation("session_id is required".into()));
        }
        if inbound.text.trim().is_empty() {
            return Err(EngineError::Validation("message text is empty".into()));
        }
        let max = self.config.pipeline.max_message_chars;
        if inbound.text.chars().count() > max {
            return Err(EngineError::Validation(format!(
                "message exceeds {} characters",
                max
            )));
        }
        if let Some(key) = &inbound.idempotency_key {
            if key.is_empty() || key.len() > 128 {
                return Err(EngineError::Validation(
                    "idempotency_key must be 1-128 bytes".into(),
                ));
            }
        }
        Ok(())
    }

    async fn run_pipeline(
        &self,
        ctx: &RequestContext,
        tenant: &Tenant,
        inbound: &InboundMessage,
        guard: &mut CancelGuard,
    ) -> EngineResult<ProcessOutcome> {
        let tenant_id = tenant.id.as_str();
        let pipeline = &self.config.pipeline;

        let (mut session, seen) = with_timeout(
            Stage::Validate,
            pipeline.validate_timeout_ms,
            self.load_session(tenant_id, inbound),
        )
        .await?;
        if let Some(message) = seen {
            tracing::info!(message_id = %message.id, "idempotency key seen; replaying");
            return with_timeout(
                Stage::Validate,
                pipeline.validate_timeout_ms,
                self.replay(tenant_id, session, message),
            )
            .await;
        }

        guard.enter(Stage::Redact);
        let redaction = with_timeout(
            Stage::Redact,
            pipeline.redaction_timeout_ms,
            self.redactor
                .redact(self.store.as_ref(), tenant_id, &inbound.text),
        )
        .await?;
        for skipped in &redaction.skipped_rules {
            let draft = AuditDraft::new(
                &ctx.actor,
                Some(&session.id),
                AuditDetails::InvalidRedactionRule {
                    rule_id: skipped.rule_id.clone(),
                    error: skipped.error.clone(),
                },
            );
            with_timeout(
                Stage::Redact,
                pipeline.redaction_timeout_ms,
                self.recorder.record(self.store.as_ref(), tenant_id, draft),
            )
            .await?;
        }

        guard.enter(Stage::Retrieve);
        let request = RetrieveRequest {
            tenant_id,
            query: &redaction.masked_text,
            top_k: tenant
                .settings
                .top_k
                .unwrap_or(self.config.retrieval.top_k),
            min_score: self.config.retrieval.min_score,
            now: Utc::now(),
        };
        let retrieved = with_timeout(
            Stage::Retrieve,
            pipeline.retrieval_timeout_ms,
            retrieve(self.store.as_ref(), self.embedder.as_ref(), &request),
        )
        .await?;

        guard.enter(Stage::Compose);
        let (history, customer) =
            with_timeout(Stage::Compose, pipeline.compose_timeout_ms, async {
                let history = storage(self.store.session_messages(tenant_id, &session.id).await)?;
                let customer =
                    storage(self.store.get_customer(tenant_id, &session.customer_id).await)?;
                Ok((history, customer))
            })
            .await?;
        let session_ctx = SessionContext {
            account_type: customer.as_ref().map(|c| c.account_type),
            prior_bot_replies: history
                .iter()
                .filter(|m| m.message_type == MessageType::Bot)
                .count(),
        };
        let composed = self.composer.compose(
            &redaction.masked_text,
            &redaction.redactions,
            &retrieved,
            &session_ctx,
        );

        guard.enter(Stage::Decide);
        let thresholds = Thresholds::resolve(&self.config.escalation, &tenant.settings);
        let streak = uncertain_streak(&history, thresholds.high);
        let decision = decide(
            composed.confidence,
            composed.intent,
            streak,
            &thresholds,
            customer.as_ref().map(|c| c.tier),
        );
        tracing::info!(
            intent = %composed.intent,
            confidence = composed.confidence,
            retrieved = retrieved.len(),
            cited = composed.citations.len(),
            decision = decision.label(),
            "escalation decision"
        );

        let now = now_millis();
        let mut message = Message::new(
            tenant_id,
            &session.id,
            MessageType::User,
            redaction.masked_text.clone(),
            now,
        );
        message.intent = Some(composed.intent);
        message.entities = composed.entities.clone();
        message.redactions = redaction.redactions.clone();
        message.idempotency_key = inbound.idempotency_key.clone();

        let mut commit = Commit::new(tenant_id);
        let mut drafts = Vec::new();
        if !message.redactions.is_empty() {
            drafts.push(AuditDraft::new(
                &ctx.actor,
                Some(&session.id),
                AuditDetails::Redaction {
                    message_id: message.id.clone(),
                    redactions: message.redactions.clone(),
                },
            ));
        }
        drafts.push(AuditDraft::new(
            &ctx.actor,
            Some(&session.id),
            AuditDetails::EscalationDecision {
                message_id: message.id.clone(),
                intent: composed.intent,
                confidence: composed.confidence,
                decision: decision.clone(),
                citations: composed
                    .citations
                    .iter()
                    .map(|c| c.chunk_id.clone())
                    .collect(),
            },
        ));

        let trigger = TransitionTrigger::InboundMessage {
            message_id: message.id.clone(),
        };
        if session.status == SessionStatus::Waiting {
            let from = transition_session(&mut session, SessionStatus::Active, now, None)?;
            drafts.push(session_transition_draft(
                &ctx.actor,
                &session,
                from,
                trigger.clone(),
            ));
        }
        session.updated_at = now;

        let mut ticket = None;
        let mut ticket_created = false;
        if let (Some(reason), Some(priority)) = (decision.reason(), decision.priority()) {
            if session.status != SessionStatus::Escalated {
                let from = transition_session(
                    &mut session,
                    SessionStatus::Escalated,
                    now,
                    Some(reason.clone()),
                )?;
                drafts.push(session_transition_draft(
                    &ctx.actor,
                    &session,
                    from,
                    trigger.clone(),
                ));
            }
            let open = with_timeout(Stage::Decide, pipeline.decide_timeout_ms, async {
                storage(self.store.open_ticket_for_session(tenant_id, &session.id).await)
            })
            .await?;
            match open {
                Some(mut existing) => {
                    if priority > existing.priority {
                        drafts.push(AuditDraft::new(
                            &ctx.actor,
                            Some(&session.id),
                            AuditDetails::TicketUpdated {
                                ticket_id: existing.id.clone(),
                                from_priority: existing.priority,
                                to_priority: priority,
                            },
                        ));
                        existing.priority = priority;
                        existing.updated_at = now;
                        commit.tickets.push(existing.clone());
                    }
                    ticket = Some(existing);
                }
                None => {
                    let created =
                        new_ticket(&session, &message, composed.intent, reason, priority, &decision, now);
                    drafts.push(AuditDraft::new(
                        &ctx.actor,
                        Some(&session.id),
                        AuditDetails::TicketOpened {
                            ticket_id: created.id.clone(),
                            priority: created.priority,
                            category: created.category,
                            source_message_id: message.id.clone(),
                        },
                    ));
                    commit.tickets.push(created.clone());
                    ticket = Some(created);
                    ticket_created = true;
                }
            }
        }

        let forwarded_to = match (&session.agent_id, session.status) {
            (Some(agent), SessionStatus::Escalated) => Some(agent.clone()),
            _ => None,
        };
        let replies = if forwarded_to.is_some() {
            Vec::new()
        } else {
            build_replies(&session, &message, &composed, &decision, now)
        };
        for (i, reply) in replies.iter().enumerate() {
            commit.threads.push(Thread {
                id: new_id(),
                tenant_id: tenant_id.to_string(),
                session_id: session.id.clone(),
                parent_message_id: Some(message.id.clone()),
                message_id: reply.id.clone(),
                thread_order: i as i64 + 1,
                created_at: now,
            });
        }

        commit.sessions.push(session.clone());
        commit.messages.push(message.clone());
        commit.messages.extend(replies.iter().cloned());

        guard.enter(Stage::Persist);
        with_timeout(
            Stage::Persist,
            pipeline.persist_timeout_ms,
            self.recorder.seal(self.store.as_ref(), commit, drafts),
        )
        .await?;

        if let Some(agent) = &forwarded_to {
            tracing::info!(agent_id = %agent, "bot reply suppressed; forwarded to agent");
        }
        Ok(ProcessOutcome {
            message,
            replies,
            decision,
            session_status: session.status,
            ticket,
            ticket_created,
            forwarded_to,
            replayed: false,
        })
    }

    /// The inbound message's session, plus the earlier message carrying
    /// the same idempotency key, if any.
    async fn load_session(
        &self,
        tenant_id: &str,
        inbound: &InboundMessage,
    ) -> EngineResult<(Session, Option<Message>)> {
        let session = self.session_for(tenant_id, &inbound.session_id).await?;
        if session.status == SessionStatus::Ended {
            return Err(EngineError::InvalidTransition {
                entity: "session",
                from: SessionStatus::Ended.to_string(),
                to: SessionStatus::Active.to_string(),
            });
        }
        let seen = match &inbound.idempotency_key {
            Some(key) => {
                storage(self.store.find_message_by_key(tenant_id, &session.id, key).await)?
            }
            None => None,
        };
        Ok((session, seen))
    }

    /// Rebuild the outcome of an already processed message without
    /// writing anything. `ticket_created` is false: the ticket, if any,
    /// was opened by the original call.
    async fn replay(
        &self,
        tenant_id: &str,
        session: Session,
        message: Message,
    ) -> EngineResult<ProcessOutcome> {
        let mut threads: Vec<Thread> = storage(self.store.session_threads(tenant_id, &session.id).await)?
            .into_iter()
            .filter(|t| t.parent_message_id.as_deref() == Some(message.id.as_str()))
            .collect();
        threads.sort_by_key(|t| t.thread_order);
        let messages = storage(self.store.session_messages(tenant_id, &session.id).await)?;
        let replies: Vec<Message> = threads
            .iter()
            .filter_map(|t| messages.iter().find(|m| m.id == t.message_id).cloned())
            .collect();

        let decision = storage(self.store.audit_trail(tenant_id).await)?
            .into_iter()
            .rev()
            .find_map(|r| match r.details {
                AuditDetails::EscalationDecision {
                    message_id,
                    decision,
                    ..
                } if message_id == message.id => Some(decision),
                _ => None,
            })
            .ok_or_else(|| {
                EngineError::AuditFailure(anyhow::anyhow!(
                    "no escalation decision recorded for message {}",
                    message.id
                ))
            })?;

        let tickets = storage(self.store.session_tickets(tenant_id, &session.id).await)?;
        let ticket = tickets
            .iter()
            .rev()
            .find(|t| t.source_message_id == message.id)
            .or_else(|| {
                if decision.is_escalation() {
                    tickets.iter().rev().find(|t| t.status.is_open())
                } else {
                    None
                }
            })
            .cloned();

        let forwarded_to = if replies.is_empty() {
            session.agent_id.clone()
        } else {
            None
        };
        Ok(ProcessOutcome {
            message,
            replies,
            decision,
            session_status: session.status,
            ticket,
            ticket_created: false,
            forwarded_to,
            replayed: true,
        })
    }

    async fn record_failure(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        stage: Stage,
        err: &EngineError,
    ) {
        let kind = err.kind();
        if !matches!(kind, ErrorKind::Dependency | ErrorKind::Timeout) {
            tracing::info!(stage = %stage, error = %err, "message rejected");
            return;
        }
        tracing::error!(stage = %stage, error = %err, "pipeline failed");
        let draft = AuditDraft::new(
            &ctx.actor,
            Some(session_id),
            AuditDetails::PipelineFailure {
                stage,
                kind,
                error: err.to_string(),
            },
        );
        if let Err(e) = self
            .recorder
            .record(self.store.as_ref(), &ctx.tenant_id, draft)
            .await
        {
            tracing::warn!(error = %e, "could not record pipeline failure");
        }
    }

    // ── Agent actions ───────────────────────────────────────────────────

    pub async fn advance_session(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        action: SessionAction,
    ) -> EngineResult<ActionOutcome> {
        let span = tracing::info_span!(
            "advance_session",
            tenant_id = %ctx.tenant_id,
            session_id = %session_id,
        );
        async move {
            let tenant = self.active_tenant(&ctx.tenant_id).await?;
            let tenant_id = tenant.id.as_str();
            let _session_lock = self.locks.acquire(tenant_id, session_id).await;
            let mut session = self.session_for(tenant_id, session_id).await?;

            let now = now_millis();
            let trigger = TransitionTrigger::AgentAction;
            let mut commit = Commit::new(tenant_id);
            let mut drafts = Vec::new();
            let mut ticket = None;

            let step = |session: &mut Session,
                            to: SessionStatus,
                            reason: Option<EscalationReason>,
                            drafts: &mut Vec<AuditDraft>|
             -> EngineResult<()> {
                let from = transition_session(session, to, now, reason)?;
                drafts.push(session_transition_draft(
                    &ctx.actor,
                    session,
                    from,
                    trigger.clone(),
                ));
                Ok(())
            };

            match &action {
                SessionAction::Wait => step(&mut session, SessionStatus::Waiting, None, &mut drafts)?,
                SessionAction::Resume => {
                    step(&mut session, SessionStatus::Active, None, &mut drafts)?
                }
                SessionAction::End => step(&mut session, SessionStatus::Ended, None, &mut drafts)?,
                SessionAction::Escalate { note } => step(
                    &mut session,
                    SessionStatus::Escalated,
                    Some(EscalationReason::AgentRequested { note: note.clone() }),
                    &mut drafts,
                )?,
                SessionAction::Assign { agent_id } => {
                    if agent_id.trim().is_empty() {
                        return Err(EngineError::Validation("agent_id is required".into()));
                    }
                    if session.status != SessionStatus::Escalated {
                        step(
                            &mut session,
                            SessionStatus::Escalated,
                            Some(EscalationReason::AgentRequested { note: None }),
                            &mut drafts,
                        )?;
                    }
                    let previous = session.agent_id.replace(agent_id.clone());
                    session.updated_at = now;
                    drafts.push(AuditDraft::new(
                        &ctx.actor,
                        Some(&session.id),
                        AuditDetails::AgentAssigned {
                            agent_id: agent_id.clone(),
                            previous,
                        },
                    ));
                    let open =
                        storage(self.store.open_ticket_for_session(tenant_id, &session.id).await)?;
                    if let Some(mut t) = open {
                        t.assigned_agent_id = Some(agent_id.clone());
                        t.updated_at = now;
                        if t.status == TicketStatus::Open {
                            let from = transition_ticket(&mut t, TicketStatus::InProgress, now)?;
                            drafts.push(ticket_transition_draft(&ctx.actor, &t, from, trigger.clone()));
                        }
                        commit.tickets.push(t.clone());
                        ticket = Some(t);
                    }
                }
                SessionAction::Start { .. }
                | SessionAction::AwaitCustomer { .. }
                | SessionAction::Resolve { .. }
                | SessionAction::Close { .. }
                | SessionAction::Reopen { .. } => {
                    if let Some((to, ticket_id)) = action.ticket_target() {
                        let mut t = self.ticket_for(tenant_id, &session, ticket_id).await?;
                        if matches!(action, SessionAction::Reopen { .. })
                            && t.status != TicketStatus::Resolved
                        {
                            return Err(EngineError::InvalidTransition {
                                entity: "ticket",
                                from: t.status.to_string(),
                                to: "reopened".into(),
                            });
                        }
                        let from = transition_ticket(&mut t, to, now)?;
                        drafts.push(ticket_transition_draft(&ctx.actor, &t, from, trigger.clone()));
                        commit.tickets.push(t.clone());
                        ticket = Some(t);
                    }
                }
            }

            commit.sessions.push(session.clone());
            self.recorder
                .seal(self.store.as_ref(), commit, drafts)
                .await?;
            tracing::info!(status = %session.status, "session action applied");
            Ok(ActionOutcome { session, ticket })
        }
        .instrument(span)
        .await
    }

    async fn ticket_for(
        &self,
        tenant_id: &str,
        session: &Session,
        ticket_id: Option<&str>,
    ) -> EngineResult<Ticket> {
        let found = match ticket_id {
            Some(id) => storage(self.store.get_ticket(tenant_id, id).await)?
                .filter(|t| t.session_id == session.id),
            None => storage(self.store.session_tickets(tenant_id, &session.id).await)?.pop(),
        };
        found.ok_or_else(|| EngineError::not_found("ticket", ticket_id.unwrap_or(session.id.as_str())))
    }

    // ── Idle sweeper ────────────────────────────────────────────────────

    /// End active and waiting sessions idle for longer than
    /// `pipeline.idle_timeout_secs`. Returns how many were ended.
    pub async fn sweep_idle_sessions(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let idle = chrono::Duration::seconds(self.config.pipeline.idle_timeout_secs as i64);
        let actor = Actor::Scheduler;
        let mut ended = 0;

        for tenant in storage(self.store.list_tenants().await)? {
            if !tenant.is_active {
                continue;
            }
            let candidates = storage(
                self.store
                    .list_sessions(&tenant.id, &[SessionStatus::Active, SessionStatus::Waiting])
                    .await,
            )?;
            for candidate in candidates {
                if now - candidate.updated_at < idle {
                    continue;
                }
                match self.end_idle(&tenant.id, &candidate.id, now, idle, &actor).await {
                    Ok(true) => ended += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(
                        tenant_id = %tenant.id,
                        session_id = %candidate.id,
                        error = %e,
                        "failed to end idle session"
                    ),
                }
            }
        }
        if ended > 0 {
            tracing::info!(ended, "idle sessions ended");
        }
        Ok(ended)
    }

    async fn end_idle(
        &self,
        tenant_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
        idle: chrono::Duration,
        actor: &Actor,
    ) -> EngineResult<bool> {
        let _session_lock = self.locks.acquire(tenant_id, session_id).await;
        let Some(mut session) = storage(self.store.get_session(tenant_id, session_id).await)? else {
            return Ok(false);
        };
        // Re-check under the lock; a message may have arrived meanwhile.
        let idle_for = now - session.updated_at;
        if !matches!(session.status, SessionStatus::Active | SessionStatus::Waiting) || idle_for < idle
        {
            return Ok(false);
        }
        let from = transition_session(&mut session, SessionStatus::Ended, now, None)?;
        let trigger = TransitionTrigger::Timeout {
            idle_secs: idle_for.num_seconds().max(0) as u64,
        };
        let draft = session_transition_draft(actor, &session, from, trigger);
        let mut commit = Commit::new(tenant_id);
        commit.sessions.push(session);
        self.recorder
            .seal(self.store.as_ref(), commit, vec![draft])
            .await?;
        Ok(true)
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub async fn session_messages(
        &self,
        ctx: &RequestContext,
        session_id: &str,
    ) -> EngineResult<Vec<Message>> {
        let tenant = self.active_tenant(&ctx.tenant_id).await?;
        self.session_for(&tenant.id, session_id).await?;
        storage(self.store.session_messages(&tenant.id, session_id).await)
    }

    pub async fn session_tickets(
        &self,
        ctx: &RequestContext,
        session_id: &str,
    ) -> EngineResult<Vec<Ticket>> {
        let tenant = self.active_tenant(&ctx.tenant_id).await?;
        self.session_for(&tenant.id, session_id).await?;
        storage(self.store.session_tickets(&tenant.id, session_id).await)
    }

    pub async fn audit_trail(&self, ctx: &RequestContext) -> EngineResult<Vec<AuditRecord>> {
        let tenant = self.active_tenant(&ctx.tenant_id).await?;
        storage(self.store.audit_trail(&tenant.id).await)
    }
}

fn session_transition_draft(
    actor: &Actor,
    session: &Session,
    from: SessionStatus,
    trigger: TransitionTrigger,
) -> AuditDraft {
    let reason = if session.status == SessionStatus::Escalated {
        session.escalation_reason.clone()
    } else {
        None
    };
    AuditDraft::new(
        actor,
        Some(&session.id),
        AuditDetails::SessionTransition {
            from,
            to: session.status,
            trigger,
            reason,
        },
    )
}

fn ticket_transition_draft(
    actor: &Actor,
    ticket: &Ticket,
    from: TicketStatus,
    trigger: TransitionTrigger,
) -> AuditDraft {
    AuditDraft::new(
        actor,
        Some(&ticket.session_id),
        AuditDetails::TicketTransition {
            ticket_id: ticket.id.clone(),
            from,
            to: ticket.status,
            trigger,
        },
    )
}

fn new_ticket(
    session: &Session,
    message: &Message,
    intent: Intent,
    reason: &EscalationReason,
    priority: TicketPriority,
    decision: &Decision,
    now: DateTime<Utc>,
) -> Ticket {
    let category = TicketCategory::from(intent);
    Ticket {
        id: new_id(),
        tenant_id: session.tenant_id.clone(),
        session_id: session.id.clone(),
        customer_id: session.customer_id.clone(),
        source_message_id: message.id.clone(),
        title: format!("{} escalation: {}", category, reason),
        description: message.content.clone(),
        priority,
        category,
        status: TicketStatus::Open,
        assigned_agent_id: session.agent_id.clone(),
        tags: vec![intent.to_string(), decision.label().to_string()],
        created_at: now,
        updated_at: now,
        resolved_at: None,
        closed_at: None,
    }
}

fn build_replies(
    session: &Session,
    inbound: &Message,
    composed: &ComposedReply,
    decision: &Decision,
    now: DateTime<Utc>,
) -> Vec<Message> {
    let bot = || {
        let mut m = Message::new(
            &session.tenant_id,
            &session.id,
            MessageType::Bot,
            composed.reply_text.clone(),
            now,
        );
        m.confidence = Some(composed.confidence);
        m.intent = inbound.intent;
        m.citations = composed.citations.clone();
        m
    };
    let system = |text: &str| {
        Message::new(
            &session.tenant_id,
            &session.id,
            MessageType::System,
            text,
            now,
        )
    };
    match decision {
        Decision::AutoReply => vec![bot()],
        Decision::QueueForReview { .. } => vec![bot(), system(REVIEW_NOTICE)],
        Decision::EscalateToAgent { .. } => vec![system(HANDOFF_MESSAGE)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;
    use crate::models::{AccountType, Customer, CustomerTier, RedactionRule, RedactionType};
    use crate::store::memory::InMemoryStore;

    async fn engine() -> (Engine, Session, RequestContext) {
        let store = Arc::new(InMemoryStore::new());
        store
            .put_tenant(&Tenant::new("t1", "Acme Bank"))
            .await
            .unwrap();
        store
            .put_customer(&Customer {
                id: "c1".into(),
                tenant_id: "t1".into(),
                name: "Ada".into(),
                email: "ada@example.com".into(),
                phone: None,
                tier: CustomerTier::Basic,
                account_type: AccountType::Checking,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .put_redaction_rule(&RedactionRule::new(
                "t1",
                "email",
                RedactionType::Email,
                r"[\w.+-]+@[\w-]+\.[\w.]+",
            ))
            .await
            .unwrap();
        let config = Arc::new(Config::with_db_path("unused"));
        let engine = Engine::new(
            store,
            Arc::new(HashingProvider::new(64)),
            config,
            Arc::new(AuditRecorder::new(b"test".to_vec())),
        );
        let ctx = RequestContext::new("t1", Actor::Customer("c1".into()));
        let session = engine.open_session(&ctx, "c1", Channel::Web).await.unwrap();
        (engine, session, ctx)
    }

    fn inbound(session: &Session, text: &str) -> InboundMessage {
        InboundMessage {
            session_id: session.id.clone(),
            text: text.into(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_empty_kb_escalates_and_masks() {
        let (engine, session, ctx) = engine().await;
        let out = engine
            .process_message(&ctx, inbound(&session, "contact me at a@b.com about my card"))
            .await
            .unwrap();
        assert_eq!(out.message.content, "contact me at ****@****.*** about my card");
        assert!(matches!(
            out.decision,
            Decision::EscalateToAgent {
                reason: EscalationReason::LowConfidence { .. },
                ..
            }
        ));
        assert_eq!(out.session_status, SessionStatus::Escalated);
        assert!(out.ticket_created);
        assert_eq!(out.replies[0].content, HANDOFF_MESSAGE);

        let trail = engine.audit_trail(&ctx).await.unwrap();
        assert!(engine.recorder().verify(&trail).is_ok());
        assert!(!serde_json::to_string(&trail).unwrap().contains("a@b.com"));
    }

    #[tokio::test]
    async fn test_ended_session_rejects_messages() {
        let (engine, session, ctx) = engine().await;
        engine
            .advance_session(&ctx, &session.id, SessionAction::End)
            .await
            .unwrap();
        let err = engine
            .process_message(&ctx, inbound(&session, "hello"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::State);
        assert!(engine
            .session_messages(&ctx, &session.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_validation_rejects_empty_and_foreign_tenant() {
        let (engine, session, ctx) = engine().await;
        let err = engine
            .process_message(&ctx, inbound(&session, "   "))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let other = RequestContext::new("t2", Actor::System);
        let err = engine
            .process_message(&other, inbound(&session, "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "tenant", .. }));
    }

    #[tokio::test]
    async fn test_assign_suppresses_bot_replies() {
        let (engine, session, ctx) = engine().await;
        engine
            .process_message(&ctx, inbound(&session, "where is my money"))
            .await
            .unwrap();
        let agent = RequestContext::new("t1", Actor::Agent("u9".into()));
        let action = engine
            .advance_session(&agent, &session.id, SessionAction::Assign { agent_id: "u9".into() })
            .await
            .unwrap();
        assert_eq!(action.session.agent_id.as_deref(), Some("u9"));
        assert_eq!(action.ticket.unwrap().status, TicketStatus::InProgress);

        let out = engine
            .process_message(&ctx, inbound(&session, "any update?"))
            .await
            .unwrap();
        assert!(out.replies.is_empty());
        assert_eq!(out.forwarded_to.as_deref(), Some("u9"));
        assert!(!out.ticket_created);
    }

    #[tokio::test]
    async fn test_idle_sweep_ends_stale_sessions() {
        let (engine, session, _ctx) = engine().await;
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(engine.sweep_idle_sessions(later).await.unwrap(), 1);
        let stored = engine
            .store()
            .get_session("t1", &session.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SessionStatus::Ended);
        assert_eq!(engine.sweep_idle_sessions(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wait_then_message_resumes() {
        let (engine, session, ctx) = engine().await;
        engine
            .advance_session(&ctx, &session.id, SessionAction::Wait)
            .await
            .unwrap();
        let trail_before = engine.audit_trail(&ctx).await.unwrap().len();
        let out = engine
            .process_message(&ctx, inbound(&session, "hi there"))
            .await
            .unwrap();
        // Empty knowledge base: waiting -> active -> escalated.
        assert_eq!(out.session_status, SessionStatus::Escalated);
        let trail = engine.audit_trail(&ctx).await.unwrap();
        let transitions = trail[trail_before..]
            .iter()
            .filter(|r| matches!(r.details, AuditDetails::SessionTransition { .. }))
            .count();
        assert_eq!(transitions, 2);
    }
}
