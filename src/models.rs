//! Core data models used throughout the support engine.
//!
//! Every persisted entity carries its `tenant_id`. Relations are plain
//! string ids: a [`Session`] owns its [`Message`]s by id, a [`Thread`] is a
//! weak back-reference between two messages, and a [`Chunk`] points at the
//! [`KnowledgeSource`] version it was cut from.
//!
//! Fields that the schema historically kept as JSON text (settings, tags,
//! entities, citations, redactions, escalation reasons) are typed records
//! or tagged enums here. Backends serialize them with `serde_json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Error returned when a stored enum label is not recognised.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a fieldless enum with a stable snake_case label used for
/// serde, SQLite columns, CLI arguments and log fields.
macro_rules! str_enum {
    ($(#[$meta:meta])* pub enum $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::models::ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($name::$variant),)+
                    other => Err($crate::models::ParseEnumError {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

pub(crate) use str_enum;

/// Generate a fresh entity id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time truncated to the millisecond precision the stores keep.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

// ═══════════════════════════════════════════════════════════════════════
// Tenants and customers
// ═══════════════════════════════════════════════════════════════════════

/// Isolation boundary for all data and configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub domain: Option<String>,
    #[serde(default)]
    pub settings: TenantSettings,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            domain: None,
            settings: TenantSettings::default(),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-tenant overrides of the engine defaults in `[escalation]` and
/// `[retrieval]`. Unset fields fall back to the process configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uncertain_turns: Option<u32>,
}

str_enum! {
    /// Service tier; premium and enterprise customers get higher ticket priority.
    pub enum CustomerTier {
        Basic => "basic",
        Premium => "premium",
        Enterprise => "enterprise",
    }
}

str_enum! {
    pub enum AccountType {
        Trading => "trading",
        Savings => "savings",
        Checking => "checking",
        Investment => "investment",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub tier: CustomerTier,
    pub account_type: AccountType,
    pub created_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// Redaction
// ═══════════════════════════════════════════════════════════════════════

str_enum! {
    /// PII category of a redaction rule.
    ///
    /// Declaration order is evaluation priority: when matches of two rules
    /// overlap, the variant declared first wins.
    pub enum RedactionType {
        Ssn => "ssn",
        CreditCard => "credit_card",
        AccountNumber => "account_number",
        Email => "email",
        Phone => "phone",
        Address => "address",
    }
}

impl RedactionType {
    /// Rank used for ordering rules; lower is evaluated first.
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    /// Fixed-length mask shape. `#` is replaced by the masking character.
    pub fn mask_template(&self) -> &'static str {
        match self {
            RedactionType::Ssn => "###-##-####",
            RedactionType::CreditCard => "####-####-####-####",
            RedactionType::AccountNumber => "########",
            RedactionType::Email => "####@####.###",
            RedactionType::Phone => "###-###-####",
            RedactionType::Address => "##########",
        }
    }
}

/// A tenant-scoped PII pattern maintained by compliance staff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionRule {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub pattern: String,
    #[serde(rename = "type")]
    pub rule_type: RedactionType,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RedactionRule {
    pub fn new(
        tenant_id: impl Into<String>,
        name: impl Into<String>,
        rule_type: RedactionType,
        pattern: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            pattern: pattern.into(),
            rule_type,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One masked span. `start`/`end` are byte offsets into the original text;
/// the original substring itself is never kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redaction {
    #[serde(rename = "type")]
    pub redaction_type: RedactionType,
    pub start: usize,
    pub end: usize,
    pub rule_id: String,
    pub masked_value: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Knowledge
// ═══════════════════════════════════════════════════════════════════════

str_enum! {
    pub enum KnowledgeSourceType {
        Document => "document",
        Faq => "faq",
        Policy => "policy",
        Procedure => "procedure",
        Article => "article",
    }
}

/// Versioned knowledge-base text. Each publish bumps `version` and
/// invalidates the chunks of the previous version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSource {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: KnowledgeSourceType,
    pub content: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub author: String,
    pub version: i64,
    pub is_active: bool,
    pub effective_date: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeSource {
    pub fn window(&self) -> SourceWindow {
        SourceWindow {
            is_active: self.is_active,
            effective_date: self.effective_date,
            expiry_date: self.expiry_date,
            updated_at: self.updated_at,
        }
    }

    pub fn is_retrievable(&self, now: DateTime<Utc>) -> bool {
        self.window().contains(now)
    }
}

/// The part of a [`KnowledgeSource`] that decides retrievability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceWindow {
    pub is_active: bool,
    pub effective_date: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SourceWindow {
    /// Active and `effective_date <= now < expiry_date`; a missing bound is open.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.effective_date.map_or(true, |from| from <= now)
            && self.expiry_date.map_or(true, |until| now < until)
    }
}

/// A retrieval unit cut from one knowledge source version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub tenant_id: String,
    pub knowledge_source_id: String,
    pub source_version: i64,
    pub chunk_index: i64,
    pub content: String,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub embedding: Vec<f32>,
    pub hash: String,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// Sessions, messages, threads
// ═══════════════════════════════════════════════════════════════════════

str_enum! {
    pub enum SessionStatus {
        Active => "active",
        Waiting => "waiting",
        Escalated => "escalated",
        Ended => "ended",
    }
}

str_enum! {
    pub enum Channel {
        Web => "web",
        Mobile => "mobile",
        Email => "email",
        Chat => "chat",
        Phone => "phone",
    }
}

/// Why a session left automated handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    LowConfidence { confidence: f64 },
    SensitiveIntent { intent: Intent },
    RepeatedUncertainty { turns: u32 },
    ReviewRequired { confidence: f64 },
    AgentRequested { note: Option<String> },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::LowConfidence { confidence } => {
                write!(f, "low confidence ({:.2})", confidence)
            }
            EscalationReason::SensitiveIntent { intent } => write!(f, "sensitive intent: {}", intent),
            EscalationReason::RepeatedUncertainty { turns } => {
                write!(f, "{} uncertain replies in a row", turns)
            }
            EscalationReason::ReviewRequired { confidence } => {
                write!(f, "review required ({:.2})", confidence)
            }
            EscalationReason::AgentRequested { note } => match note {
                Some(n) => write!(f, "agent requested: {}", n),
                None => f.write_str("agent requested"),
            },
        }
    }
}

/// One customer conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub tenant_id: String,
    pub customer_id: String,
    pub status: SessionStatus,
    pub channel: Channel,
    pub agent_id: Option<String>,
    pub escalation_reason: Option<EscalationReason>,
    pub created_at: DateTime<Utc>,
    /// Last activity; the idle sweeper measures timeouts from here.
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

str_enum! {
    pub enum MessageType {
        User => "user",
        Bot => "bot",
        System => "system",
        Agent => "agent",
    }
}

str_enum! {
    pub enum MessageStatus {
        Sent => "sent",
        Delivered => "delivered",
        Read => "read",
        Failed => "failed",
    }
}

str_enum! {
    /// Classified purpose of a customer message.
    ///
    /// Declaration order breaks classifier ties, so the intents that force
    /// escalation come first.
    pub enum Intent {
        FraudReport => "fraud_report",
        Complaint => "complaint",
        Security => "security",
        AccountInquiry => "account_inquiry",
        Billing => "billing",
        Trading => "trading",
        TechnicalSupport => "technical_support",
        Greeting => "greeting",
        General => "general",
    }
}

impl Intent {
    /// Intents that always go to a human agent.
    pub fn is_sensitive(&self) -> bool {
        matches!(self, Intent::FraudReport | Intent::Complaint)
    }
}

/// A structured value detected in a (masked) message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Pii {
        redaction_type: RedactionType,
        masked_value: String,
    },
    Amount {
        value: String,
        start: usize,
        end: usize,
    },
    Date {
        value: String,
        start: usize,
        end: usize,
    },
    Product {
        account_type: AccountType,
    },
}

/// Reference from a composed reply to a chunk it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub knowledge_source_id: String,
    pub source_version: i64,
    pub score: f64,
    pub excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub tenant_id: String,
    pub session_id: String,
    /// Always the masked text for customer messages.
    pub content: String,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub confidence: Option<f64>,
    pub intent: Option<Intent>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub redactions: Vec<Redaction>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        tenant_id: &str,
        session_id: &str,
        message_type: MessageType,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            tenant_id: tenant_id.to_string(),
            session_id: session_id.to_string(),
            content: content.into(),
            message_type,
            status: MessageStatus::Sent,
            confidence: None,
            intent: None,
            entities: Vec::new(),
            citations: Vec::new(),
            redactions: Vec::new(),
            idempotency_key: None,
            created_at,
        }
    }
}

/// Parent/child link between two messages of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub tenant_id: String,
    pub session_id: String,
    pub parent_message_id: Option<String>,
    pub message_id: String,
    pub thread_order: i64,
    pub created_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// Tickets
// ═══════════════════════════════════════════════════════════════════════

str_enum! {
    pub enum TicketStatus {
        Open => "open",
        InProgress => "in_progress",
        Waiting => "waiting",
        Resolved => "resolved",
        Closed => "closed",
    }
}

impl TicketStatus {
    /// Open tickets block creation of another ticket for the same session.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TicketStatus::Open | TicketStatus::InProgress | TicketStatus::Waiting
        )
    }
}

str_enum! {
    pub enum TicketPriority {
        Low => "low",
        Medium => "medium",
        High => "high",
        Urgent => "urgent",
    }
}

impl TicketPriority {
    /// One level higher, saturating at `urgent`.
    pub fn raised(self) -> Self {
        match self {
            TicketPriority::Low => TicketPriority::Medium,
            TicketPriority::Medium => TicketPriority::High,
            TicketPriority::High | TicketPriority::Urgent => TicketPriority::Urgent,
        }
    }
}

str_enum! {
    pub enum TicketCategory {
        TechnicalSupport => "technical_support",
        AccountInquiry => "account_inquiry",
        Billing => "billing",
        Trading => "trading",
        Security => "security",
        General => "general",
    }
}

impl From<Intent> for TicketCategory {
    fn from(intent: Intent) -> Self {
        match intent {
            Intent::FraudReport | Intent::Security => TicketCategory::Security,
            Intent::AccountInquiry => TicketCategory::AccountInquiry,
            Intent::Billing => TicketCategory::Billing,
            Intent::Trading => TicketCategory::Trading,
            Intent::TechnicalSupport => TicketCategory::TechnicalSupport,
            Intent::Complaint | Intent::Greeting | Intent::General => TicketCategory::General,
        }
    }
}

/// Human follow-up opened by an escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub tenant_id: String,
    pub session_id: String,
    pub customer_id: String,
    pub source_message_id: String,
    pub title: String,
    pub description: String,
    pub priority: TicketPriority,
    pub category: TicketCategory,
    pub status: TicketStatus,
    pub assigned_agent_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════
// Actors
// ═══════════════════════════════════════════════════════════════════════

/// Who triggered an action, as supplied by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    System,
    Scheduler,
    Customer(String),
    Agent(String),
}

impl Actor {
    pub fn id(&self) -> Option<&str> {
        match self {
            Actor::Customer(id) | Actor::Agent(id) => Some(id),
            Actor::System | Actor::Scheduler => None,
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::Scheduler => f.write_str("scheduler"),
            Actor::Customer(id) => write!(f, "customer:{}", id),
            Actor::Agent(id) => write!(f, "agent:{}", id),
        }
    }
}

impl FromStr for Actor {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("customer", id)) if !id.is_empty() => Ok(Actor::Customer(id.to_string())),
            Some(("agent", id)) if !id.is_empty() => Ok(Actor::Agent(id.to_string())),
            None if s == "system" => Ok(Actor::System),
            None if s == "scheduler" => Ok(Actor::Scheduler),
            _ => Err(ParseEnumError {
                kind: "Actor",
                value: s.to_string(),
            }),
        }
    }
}
