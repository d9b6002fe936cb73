use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use helios_cs::audit::{AuditDetails, AuditEventType, AuditRecord, AuditRecorder};
use helios_cs::chunk::chunk_source;
use helios_cs::config::Config;
use helios_cs::embedding::{EmbeddingProvider, HashingProvider};
use helios_cs::error::{EngineError, EngineResult, ErrorKind, Stage};
use helios_cs::escalation::Decision;
use helios_cs::ingest::{deactivate_source, publish_source, KnowledgeDraft};
use helios_cs::lifecycle::SessionAction;
use helios_cs::models::{
    AccountType, Actor, Channel, Chunk, Customer, CustomerTier, KnowledgeSource,
    KnowledgeSourceType, Message, MessageType, RedactionRule, RedactionType, Session,
    SessionStatus, Tenant, Thread, Ticket, TicketStatus,
};
use helios_cs::pipeline::{Engine, InboundMessage, RequestContext};
use helios_cs::store::memory::InMemoryStore;
use helios_cs::store::{ChunkCandidate, Commit, Store};

const DIMS: usize = 256;

/// Hashing embeddings behind an optional delay.
struct SlowProvider {
    inner: HashingProvider,
    delay: Duration,
}

#[async_trait]
impl EmbeddingProvider for SlowProvider {
    fn model_name(&self) -> &str {
        "slow-hash"
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed(texts).await
    }
}

/// In-memory store whose audit head read can be made to fail and whose
/// history reads and commits can be slowed down.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStore,
    fail_audit_head: AtomicBool,
    slow_history_ms: AtomicU64,
    slow_commit_ms: AtomicU64,
}

async fn stall(delay_ms: &AtomicU64) {
    let ms = delay_ms.load(Ordering::SeqCst);
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn put_tenant(&self, tenant: &Tenant) -> Result<()> {
        self.inner.put_tenant(tenant).await
    }
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        self.inner.get_tenant(tenant_id).await
    }
    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        self.inner.list_tenants().await
    }
    async fn put_customer(&self, customer: &Customer) -> Result<()> {
        self.inner.put_customer(customer).await
    }
    async fn get_customer(&self, tenant_id: &str, customer_id: &str) -> Result<Option<Customer>> {
        self.inner.get_customer(tenant_id, customer_id).await
    }
    async fn put_redaction_rule(&self, rule: &RedactionRule) -> Result<()> {
        self.inner.put_redaction_rule(rule).await
    }
    async fn active_redaction_rules(&self, tenant_id: &str) -> Result<Vec<RedactionRule>> {
        self.inner.active_redaction_rules(tenant_id).await
    }
    async fn get_knowledge_source(
        &self,
        tenant_id: &str,
        source_id: &str,
    ) -> Result<Option<KnowledgeSource>> {
        self.inner.get_knowledge_source(tenant_id, source_id).await
    }
    async fn put_knowledge_source(&self, source: &KnowledgeSource, chunks: &[Chunk]) -> Result<()> {
        self.inner.put_knowledge_source(source, chunks).await
    }
    async fn retrievable_chunks(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChunkCandidate>> {
        self.inner.retrievable_chunks(tenant_id, now).await
    }
    async fn get_session(&self, tenant_id: &str, session_id: &str) -> Result<Option<Session>> {
        self.inner.get_session(tenant_id, session_id).await
    }
    async fn list_sessions(
        &self,
        tenant_id: &str,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>> {
        self.inner.list_sessions(tenant_id, statuses).await
    }
    async fn session_messages(&self, tenant_id: &str, session_id: &str) -> Result<Vec<Message>> {
        stall(&self.slow_history_ms).await;
        self.inner.session_messages(tenant_id, session_id).await
    }
    async fn session_threads(&self, tenant_id: &str, session_id: &str) -> Result<Vec<Thread>> {
        self.inner.session_threads(tenant_id, session_id).await
    }
    async fn find_message_by_key(
        &self,
        tenant_id: &str,
        session_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<Message>> {
        self.inner
            .find_message_by_key(tenant_id, session_id, idempotency_key)
            .await
    }
    async fn get_ticket(&self, tenant_id: &str, ticket_id: &str) -> Result<Option<Ticket>> {
        self.inner.get_ticket(tenant_id, ticket_id).await
    }
    async fn session_tickets(&self, tenant_id: &str, session_id: &str) -> Result<Vec<Ticket>> {
        self.inner.session_tickets(tenant_id, session_id).await
    }
    async fn latest_audit(&self, tenant_id: &str) -> Result<Option<AuditRecord>> {
        if self.fail_audit_head.load(Ordering::SeqCst) {
            bail!("audit table unavailable");
        }
        self.inner.latest_audit(tenant_id).await
    }
    async fn audit_trail(&self, tenant_id: &str) -> Result<Vec<AuditRecord>> {
        self.inner.audit_trail(tenant_id).await
    }
    async fn commit(&self, commit: &Commit) -> Result<()> {
        stall(&self.slow_commit_ms).await;
        self.inner.commit(commit).await
    }
}

async fn seed(store: &dyn Store) {
    store.put_tenant(&Tenant::new("t1", "Acme Bank")).await.unwrap();
    store.put_tenant(&Tenant::new("t2", "Other Bank")).await.unwrap();
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
}

/// Store a one-chunk knowledge source embedded with the hashing provider.
async fn seed_knowledge(store: &dyn Store, content: &str) {
    let now = Utc::now();
    let source = KnowledgeSource {
        id: "ks1".into(),
        tenant_id: "t1".into(),
        name: "Wire fees".into(),
        source_type: KnowledgeSourceType::Faq,
        content: content.into(),
        category: "payments".into(),
        tags: vec![],
        author: "ops".into(),
        version: 1,
        is_active: true,
        effective_date: None,
        expiry_date: None,
        created_at: now,
        updated_at: now,
    };
    let hasher = HashingProvider::new(DIMS);
    let mut chunks = chunk_source(&source, 300, now);
    for c in &mut chunks {
        c.embedding = hasher.embed_one(&c.content);
    }
    store.put_knowledge_source(&source, &chunks).await.unwrap();
}

fn engine_with(
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: Config,
) -> Arc<Engine> {
    Arc::new(Engine::new(
        store,
        embedder,
        Arc::new(config),
        Arc::new(AuditRecorder::new(b"integration-key".to_vec())),
    ))
}

async fn default_engine() -> Arc<Engine> {
    let store = Arc::new(InMemoryStore::new());
    seed(store.as_ref()).await;
    engine_with(
        store,
        Arc::new(HashingProvider::new(DIMS)),
        Config::with_db_path("unused"),
    )
}

async fn flaky_engine(config: Config) -> (Arc<FlakyStore>, Arc<Engine>) {
    let store = Arc::new(FlakyStore::default());
    seed(store.as_ref()).await;
    let engine = engine_with(store.clone(), Arc::new(HashingProvider::new(DIMS)), config);
    (store, engine)
}

fn knowledge_draft(id: &str, content: &str) -> KnowledgeDraft {
    KnowledgeDraft {
        id: Some(id.into()),
        name: "Wire cutoffs".into(),
        source_type: KnowledgeSourceType::Faq,
        content: content.into(),
        category: "payments".into(),
        tags: vec![],
        author: "ops".into(),
        effective_date: None,
        expiry_date: None,
    }
}

fn customer_ctx() -> RequestContext {
    RequestContext::new("t1", Actor::Customer("c1".into()))
}

fn inbound(session: &Session, text: &str, key: Option<&str>) -> InboundMessage {
    InboundMessage {
        session_id: session.id.clone(),
        text: text.into(),
        idempotency_key: key.map(String::from),
    }
}

fn count_events(trail: &[AuditRecord], event: AuditEventType) -> usize {
    trail.iter().filter(|r| r.event_type == event).count()
}

#[tokio::test]
async fn test_answer_from_knowledge_base_auto_replies_with_citation() {
    let engine = default_engine().await;
    let text = "Domestic wire transfer fees are 25 dollars.";
    seed_knowledge(engine.store().as_ref(), text).await;

    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Chat).await.unwrap();
    let out = engine
        .process_message(&ctx, inbound(&session, text, None))
        .await
        .unwrap();

    assert_eq!(out.decision, Decision::AutoReply);
    assert_eq!(out.session_status, SessionStatus::Active);
    assert!(out.ticket.is_none());
    assert_eq!(out.replies.len(), 1);
    let reply = &out.replies[0];
    assert_eq!(reply.message_type, MessageType::Bot);
    assert_eq!(reply.citations.len(), 1);
    assert_eq!(reply.citations[0].knowledge_source_id, "ks1");
    assert!(reply.confidence.unwrap() >= 0.75);

    let threads = engine
        .store()
        .session_threads("t1", &session.id)
        .await
        .unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].parent_message_id.as_deref(), Some(out.message.id.as_str()));
    assert_eq!(threads[0].message_id, reply.id);

    let trail = engine.audit_trail(&ctx).await.unwrap();
    assert!(engine.recorder().verify(&trail).is_ok());
    assert_eq!(count_events(&trail, AuditEventType::EscalationDecision), 1);
}

#[tokio::test]
async fn test_empty_knowledge_base_escalates_with_ticket() {
    let engine = default_engine().await;
    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Web).await.unwrap();

    let out = engine
        .process_message(&ctx, inbound(&session, "how do I change my statement address", None))
        .await
        .unwrap();

    assert!(matches!(out.decision, Decision::EscalateToAgent { .. }));
    assert_eq!(out.session_status, SessionStatus::Escalated);
    let ticket = out.ticket.unwrap();
    assert!(out.ticket_created);
    assert_eq!(ticket.status, TicketStatus::Open);
    assert_eq!(ticket.source_message_id, out.message.id);
}

#[tokio::test]
async fn test_same_idempotency_key_replays_without_new_ticket() {
    let engine = default_engine().await;
    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Web).await.unwrap();

    let first = engine
        .process_message(&ctx, inbound(&session, "my card was stolen", Some("k-1")))
        .await
        .unwrap();
    let second = engine
        .process_message(&ctx, inbound(&session, "my card was stolen", Some("k-1")))
        .await
        .unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert!(first.ticket_created);
    assert!(!second.ticket_created);
    assert_eq!(
        first.ticket.as_ref().map(|t| &t.id),
        second.ticket.as_ref().map(|t| &t.id)
    );
    assert_eq!(first.message.id, second.message.id);
    assert_eq!(first.decision, second.decision);
    assert_eq!(
        first.replies.iter().map(|m| &m.id).collect::<Vec<_>>(),
        second.replies.iter().map(|m| &m.id).collect::<Vec<_>>()
    );

    let tickets = engine.session_tickets(&ctx, &session.id).await.unwrap();
    assert_eq!(tickets.len(), 1);
    let users = engine
        .session_messages(&ctx, &session.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.message_type == MessageType::User)
        .count();
    assert_eq!(users, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_messages_create_one_ticket() {
    let engine = default_engine().await;
    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Web).await.unwrap();

    let mut handles = Vec::new();
    for text in ["I want to file a complaint", "this is unacceptable", "where is my refund"] {
        let engine = engine.clone();
        let ctx = ctx.clone();
        let msg = inbound(&session, text, None);
        handles.push(tokio::spawn(async move {
            engine.process_message(&ctx, msg).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let tickets = engine.session_tickets(&ctx, &session.id).await.unwrap();
    assert_eq!(tickets.len(), 1);
    let trail = engine.audit_trail(&ctx).await.unwrap();
    assert_eq!(count_events(&trail, AuditEventType::TicketOpened), 1);
    assert!(engine.recorder().verify(&trail).is_ok());
}

#[tokio::test]
async fn test_retrieval_timeout_records_failure_and_persists_nothing() {
    let store = Arc::new(InMemoryStore::new());
    seed(store.as_ref()).await;
    seed_knowledge(store.as_ref(), "Wire transfers close at 5pm.").await;
    let mut config = Config::with_db_path("unused");
    config.pipeline.retrieval_timeout_ms = 50;
    let engine = engine_with(
        store,
        Arc::new(SlowProvider {
            inner: HashingProvider::new(DIMS),
            delay: Duration::from_millis(500),
        }),
        config,
    );

    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Web).await.unwrap();
    let err = engine
        .process_message(&ctx, inbound(&session, "when do wires close", None))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::PipelineTimeout {
            stage: Stage::Retrieve,
            budget_ms: 50
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(engine
        .session_messages(&ctx, &session.id)
        .await
        .unwrap()
        .is_empty());

    let trail = engine.audit_trail(&ctx).await.unwrap();
    let failure = trail
        .iter()
        .find(|r| r.event_type == AuditEventType::PipelineFailure)
        .expect("pipeline_failure audit");
    assert!(matches!(
        failure.details,
        AuditDetails::PipelineFailure {
            stage: Stage::Retrieve,
            kind: ErrorKind::Timeout,
            ..
        }
    ));
}

#[tokio::test]
async fn test_aborted_pipeline_records_cancellation() {
    let store = Arc::new(InMemoryStore::new());
    seed(store.as_ref()).await;
    seed_knowledge(store.as_ref(), "Wire transfers close at 5pm.").await;
    let engine = engine_with(
        store,
        Arc::new(SlowProvider {
            inner: HashingProvider::new(DIMS),
            delay: Duration::from_secs(5),
        }),
        Config::with_db_path("unused"),
    );

    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Web).await.unwrap();
    let task = {
        let engine = engine.clone();
        let ctx = ctx.clone();
        let msg = inbound(&session, "when do wires close", None);
        tokio::spawn(async move { engine.process_message(&ctx, msg).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let mut cancelled = None;
    for _ in 0..50 {
        let trail = engine.audit_trail(&ctx).await.unwrap();
        cancelled = trail
            .into_iter()
            .find(|r| r.event_type == AuditEventType::PipelineCancelled);
        if cancelled.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let record = cancelled.expect("pipeline_cancelled audit");
    assert!(matches!(
        record.details,
        AuditDetails::PipelineCancelled {
            stage: Stage::Retrieve
        }
    ));
    assert_eq!(record.session_id.as_deref(), Some(session.id.as_str()));
}

#[tokio::test]
async fn test_audit_failure_is_surfaced_and_nothing_persisted() {
    let store = Arc::new(FlakyStore::default());
    seed(store.as_ref()).await;
    let engine = engine_with(
        store.clone(),
        Arc::new(HashingProvider::new(DIMS)),
        Config::with_db_path("unused"),
    );
    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Web).await.unwrap();

    store.fail_audit_head.store(true, Ordering::SeqCst);
    let err = engine
        .process_message(&ctx, inbound(&session, "hello there", None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AuditFailure(_)));
    assert_eq!(err.kind(), ErrorKind::Dependency);

    store.fail_audit_head.store(false, Ordering::SeqCst);
    assert!(engine
        .session_messages(&ctx, &session.id)
        .await
        .unwrap()
        .is_empty());
    let stored = engine.store().get_session("t1", &session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Active);
}

#[tokio::test]
async fn test_slow_history_read_times_out_in_compose() {
    let mut config = Config::with_db_path("unused");
    config.pipeline.compose_timeout_ms = 50;
    let (store, engine) = flaky_engine(config).await;
    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Web).await.unwrap();

    store.slow_history_ms.store(5_000, Ordering::SeqCst);
    let err = tokio::time::timeout(
        Duration::from_secs(2),
        engine.process_message(&ctx, inbound(&session, "what are your fees", None)),
    )
    .await
    .expect("pipeline must not hang on a slow store")
    .unwrap_err();
    store.slow_history_ms.store(0, Ordering::SeqCst);

    assert!(matches!(
        err,
        EngineError::PipelineTimeout {
            stage: Stage::Compose,
            budget_ms: 50
        }
    ));
    assert!(engine
        .session_messages(&ctx, &session.id)
        .await
        .unwrap()
        .is_empty());
    let trail = engine.audit_trail(&ctx).await.unwrap();
    assert!(trail.iter().any(|r| matches!(
        r.details,
        AuditDetails::PipelineFailure {
            stage: Stage::Compose,
            kind: ErrorKind::Timeout,
            ..
        }
    )));
}

#[tokio::test]
async fn test_slow_commit_times_out_in_persist() {
    let mut config = Config::with_db_path("unused");
    config.pipeline.persist_timeout_ms = 50;
    let (store, engine) = flaky_engine(config).await;
    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Web).await.unwrap();

    store.slow_commit_ms.store(500, Ordering::SeqCst);
    let err = engine
        .process_message(&ctx, inbound(&session, "my card was stolen", None))
        .await
        .unwrap_err();
    store.slow_commit_ms.store(0, Ordering::SeqCst);

    assert!(matches!(
        err,
        EngineError::PipelineTimeout {
            stage: Stage::Persist,
            budget_ms: 50
        }
    ));
    assert!(engine
        .session_messages(&ctx, &session.id)
        .await
        .unwrap()
        .is_empty());
    assert!(engine
        .session_tickets(&ctx, &session.id)
        .await
        .unwrap()
        .is_empty());
    let stored = engine.store().get_session("t1", &session.id).await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Active);

    let trail = engine.audit_trail(&ctx).await.unwrap();
    assert_eq!(count_events(&trail, AuditEventType::EscalationDecision), 0);
    assert!(trail.iter().any(|r| matches!(
        r.details,
        AuditDetails::PipelineFailure {
            stage: Stage::Persist,
            kind: ErrorKind::Timeout,
            ..
        }
    )));
    assert!(engine.recorder().verify(&trail).is_ok());
}

#[tokio::test]
async fn test_broken_rule_in_store_is_audited_and_skipped() {
    let engine = default_engine().await;
    let broken = RedactionRule::new("t1", "broken", RedactionType::Address, "(unclosed");
    engine.store().put_redaction_rule(&broken).await.unwrap();

    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Web).await.unwrap();
    let out = engine
        .process_message(
            &ctx,
            inbound(&session, "reach me at ada@example.com about fees", None),
        )
        .await
        .unwrap();
    assert!(!out.message.content.contains("ada@example.com"));

    let trail = engine.audit_trail(&ctx).await.unwrap();
    assert_eq!(count_events(&trail, AuditEventType::SecurityEvent), 1);
    let event = trail
        .iter()
        .find(|r| r.event_type == AuditEventType::SecurityEvent)
        .unwrap();
    assert!(matches!(
        &event.details,
        AuditDetails::InvalidRedactionRule { rule_id, .. } if *rule_id == broken.id
    ));
    assert!(engine.recorder().verify(&trail).is_ok());
}

#[tokio::test]
async fn test_publish_is_atomic_with_its_audit() {
    let (store, engine) = flaky_engine(Config::with_db_path("unused")).await;
    let ops = RequestContext::new("t1", Actor::Agent("ops".into()));

    store.fail_audit_head.store(true, Ordering::SeqCst);
    assert!(publish_source(&engine, &ops, knowledge_draft("wires", "Wires close at 5pm."))
        .await
        .is_err());
    store.fail_audit_head.store(false, Ordering::SeqCst);

    assert!(store.get_knowledge_source("t1", "wires").await.unwrap().is_none());
    assert!(store
        .retrievable_chunks("t1", Utc::now())
        .await
        .unwrap()
        .is_empty());
    assert!(engine.audit_trail(&ops).await.unwrap().is_empty());

    publish_source(&engine, &ops, knowledge_draft("wires", "Wires close at 5pm."))
        .await
        .unwrap();
    store.fail_audit_head.store(true, Ordering::SeqCst);
    assert!(deactivate_source(&engine, &ops, "wires").await.is_err());
    store.fail_audit_head.store(false, Ordering::SeqCst);

    let source = store.get_knowledge_source("t1", "wires").await.unwrap().unwrap();
    assert!(source.is_active);
    assert_eq!(
        store.retrievable_chunks("t1", Utc::now()).await.unwrap().len(),
        1
    );
    let trail = engine.audit_trail(&ops).await.unwrap();
    assert_eq!(count_events(&trail, AuditEventType::KnowledgePublished), 1);
}

#[tokio::test]
async fn test_dimension_mismatch_is_configuration_error() {
    let store = Arc::new(InMemoryStore::new());
    seed(store.as_ref()).await;
    seed_knowledge(store.as_ref(), "Wire transfers close at 5pm.").await;
    let engine = engine_with(
        store,
        Arc::new(HashingProvider::new(32)),
        Config::with_db_path("unused"),
    );
    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Web).await.unwrap();
    let err = engine
        .process_message(&ctx, inbound(&session, "when do wires close", None))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::EmbeddingDimensionMismatch {
            expected: DIMS,
            actual: 32
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn test_other_tenant_cannot_see_session() {
    let engine = default_engine().await;
    let session = engine
        .open_session(&customer_ctx(), "c1", Channel::Web)
        .await
        .unwrap();

    let other = RequestContext::new("t2", Actor::Agent("u1".into()));
    let err = engine
        .process_message(&other, inbound(&session, "hello", None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "session", .. }));
    assert!(engine.session_messages(&other, &session.id).await.is_err());
    assert!(engine.audit_trail(&other).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ticket_lifecycle_through_actions() {
    let engine = default_engine().await;
    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Web).await.unwrap();
    engine
        .process_message(&ctx, inbound(&session, "I was scammed by a phishing text", None))
        .await
        .unwrap();

    let agent = RequestContext::new("t1", Actor::Agent("u7".into()));
    let assigned = engine
        .advance_session(&agent, &session.id, SessionAction::Assign { agent_id: "u7".into() })
        .await
        .unwrap();
    assert_eq!(assigned.ticket.as_ref().unwrap().status, TicketStatus::InProgress);

    let resolved = engine
        .advance_session(&agent, &session.id, SessionAction::Resolve { ticket_id: None })
        .await
        .unwrap();
    let ticket = resolved.ticket.unwrap();
    assert_eq!(ticket.status, TicketStatus::Resolved);
    assert!(ticket.resolved_at.is_some());

    let err = engine
        .advance_session(&agent, &session.id, SessionAction::Resolve { ticket_id: None })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    let closed = engine
        .advance_session(&agent, &session.id, SessionAction::Close { ticket_id: None })
        .await
        .unwrap();
    assert_eq!(closed.ticket.unwrap().status, TicketStatus::Closed);

    let ended = engine
        .advance_session(&agent, &session.id, SessionAction::End)
        .await
        .unwrap();
    assert_eq!(ended.session.status, SessionStatus::Ended);

    let trail = engine.audit_trail(&agent).await.unwrap();
    assert!(engine.recorder().verify(&trail).is_ok());
    assert_eq!(count_events(&trail, AuditEventType::AgentAssigned), 1);
    assert_eq!(count_events(&trail, AuditEventType::TicketTransition), 3);
}

#[tokio::test]
async fn test_published_knowledge_is_retrieved() {
    let engine = default_engine().await;
    let ops = RequestContext::new("t1", Actor::Agent("ops".into()));
    let text = "Savings accounts earn interest monthly.";
    publish_source(
        &engine,
        &ops,
        KnowledgeDraft {
            id: None,
            name: "Savings interest".into(),
            source_type: KnowledgeSourceType::Policy,
            content: text.into(),
            category: "savings".into(),
            tags: vec![],
            author: "ops".into(),
            effective_date: None,
            expiry_date: None,
        },
    )
    .await
    .unwrap();

    let ctx = customer_ctx();
    let session = engine.open_session(&ctx, "c1", Channel::Mobile).await.unwrap();
    let out = engine
        .process_message(&ctx, inbound(&session, text, None))
        .await
        .unwrap();
    let cited: Vec<_> = out
        .replies
        .iter()
        .flat_map(|m| m.citations.iter())
        .collect();
    assert_eq!(cited.len(), 1);
    assert_eq!(cited[0].source_version, 1);
}
