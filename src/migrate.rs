use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema in the configured database. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tenants (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        domain TEXT,
        settings_json TEXT NOT NULL DEFAULT '{}',
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS customers (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        name TEXT NOT NULL,
        email TEXT NOT NULL,
        phone TEXT,
        tier TEXT NOT NULL,
        account_type TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS redaction_rules (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        name TEXT NOT NULL,
        pattern TEXT NOT NULL,
        type TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS knowledge_sources (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        name TEXT NOT NULL,
        type TEXT NOT NULL,
        content TEXT NOT NULL,
        category TEXT NOT NULL DEFAULT '',
        tags_json TEXT NOT NULL DEFAULT '[]',
        author TEXT NOT NULL DEFAULT '',
        version INTEGER NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        effective_date INTEGER,
        expiry_date INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        knowledge_source_id TEXT NOT NULL REFERENCES knowledge_sources(id),
        source_version INTEGER NOT NULL,
        chunk_index INTEGER NOT NULL,
        content TEXT NOT NULL,
        embedding BLOB,
        hash TEXT NOT NULL,
        is_valid INTEGER NOT NULL DEFAULT 1,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        customer_id TEXT NOT NULL,
        status TEXT NOT NULL,
        channel TEXT NOT NULL,
        agent_id TEXT,
        escalation_reason_json TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        ended_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        session_id TEXT NOT NULL REFERENCES sessions(id),
        content TEXT NOT NULL,
        message_type TEXT NOT NULL,
        status TEXT NOT NULL,
        confidence REAL,
        intent TEXT,
        entities_json TEXT NOT NULL DEFAULT '[]',
        citations_json TEXT NOT NULL DEFAULT '[]',
        redactions_json TEXT NOT NULL DEFAULT '[]',
        idempotency_key TEXT,
        created_at INTEGER NOT NULL,
        UNIQUE(session_id, idempotency_key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS threads (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        session_id TEXT NOT NULL REFERENCES sessions(id),
        parent_message_id TEXT,
        message_id TEXT NOT NULL REFERENCES messages(id),
        thread_order INTEGER NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tickets (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        session_id TEXT NOT NULL REFERENCES sessions(id),
        customer_id TEXT NOT NULL,
        source_message_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        priority TEXT NOT NULL,
        category TEXT NOT NULL,
        status TEXT NOT NULL,
        assigned_agent_id TEXT,
        tags_json TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        resolved_at INTEGER,
        closed_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audits (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        actor TEXT NOT NULL,
        session_id TEXT,
        details_json TEXT NOT NULL,
        prev_hash TEXT NOT NULL,
        hash TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE(tenant_id, sequence)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_rules_tenant ON redaction_rules(tenant_id, is_active)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_tenant_valid ON chunks(tenant_id, is_valid)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(knowledge_source_id)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_tenant_status ON sessions(tenant_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_threads_session ON threads(session_id)",
    "CREATE INDEX IF NOT EXISTS idx_tickets_session ON tickets(session_id)",
];

/// Apply the schema to an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
