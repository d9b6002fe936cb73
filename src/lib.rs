//! # HeliosCS
//!
//! A message-processing and escalation engine for multi-tenant financial
//! customer support.
//!
//! Every inbound customer message is redacted of PII, answered from the
//! tenant's versioned knowledge base with citations, scored for confidence,
//! and either auto-replied, queued for review, or escalated to a human
//! agent with a ticket. Every decision and state change lands in a
//! per-tenant, HMAC-chained audit trail.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────── Engine ─────────────────────┐
//! message ──────▶ │ redact ─▶ retrieve ─▶ compose ─▶ decide ─▶ commit │
//!                 └───────┬──────────┬───────────────────────┬──────┘
//!                         │          │                       │
//!                  rules  │   chunks │           sessions,   │ audit
//!                         ▼          ▼           tickets     ▼
//!                      ┌────────────────────────────────────────┐
//!                      │     Store (in-memory | SQLite)         │
//!                      └────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Engine error taxonomy |
//! | [`redact`] | Tenant-scoped PII redaction |
//! | [`chunk`] | Paragraph chunking of knowledge sources |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`retrieve`] | Ranked retrieval over a tenant's knowledge base |
//! | [`compose`] | Reply composition, intent, entities, confidence |
//! | [`escalation`] | Auto-reply / review / escalate policy |
//! | [`lifecycle`] | Session and ticket state machines |
//! | [`audit`] | Hash-chained audit recorder |
//! | [`pipeline`] | The [`pipeline::Engine`] entry points |
//! | [`ingest`] | Knowledge publishing |
//! | [`store`] | Storage trait and in-memory backend |
//! | [`sqlite_store`] | SQLite backend |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`server`] | HTTP server |

pub mod audit;
pub mod chunk;
pub mod compose;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod escalation;
pub mod ingest;
pub mod lifecycle;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod redact;
pub mod retrieve;
pub mod server;
pub mod sqlite_store;
pub mod store;
