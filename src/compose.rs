//! Reply composition from retrieved knowledge.
//!
//! The composer never sees raw customer text: it works on the masked text
//! and the redaction records. It classifies intent with a fixed keyword
//! lexicon, extracts entities, picks the chunks worth citing and scores
//! how well they cover the question:
//!
//! ```text
//! coverage   = 1 - Π (1 - clamp(score_i))        over used chunks
//! confidence = coverage × ((1 - w) + w × certainty)
//! ```
//!
//! where `w` is `composer.intent_weight`. With no used chunk the
//! confidence is 0 and the reply is a fallback that promises follow-up.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::config::ComposerConfig;
use crate::models::{AccountType, Citation, Entity, Intent, Redaction};
use crate::retrieve::RetrievedChunk;

pub const FALLBACK_REPLY: &str = "I'm sorry, I couldn't find a reliable answer to that. \
A member of our support team will follow up with you.";

static AMOUNT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\s?\d{1,3}(?:,\d{3})*(?:\.\d{1,2})?|\$\s?\d+(?:\.\d{1,2})?")
        .expect("Invalid amount regex")
});

static DATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}-\d{2}-\d{2}\b|\b\d{1,2}/\d{1,2}/(?:\d{4}|\d{2})\b")
        .expect("Invalid date regex")
});

fn lexicon(intent: Intent) -> &'static [&'static str] {
    match intent {
        Intent::FraudReport => &[
            "fraud",
            "fraudulent",
            "unauthorized",
            "unauthorised",
            "stolen",
            "scam",
            "scammed",
            "phishing",
            "hacked",
            "suspicious",
        ],
        Intent::Complaint => &[
            "complaint",
            "complain",
            "unacceptable",
            "terrible",
            "awful",
            "angry",
            "frustrated",
            "disappointed",
            "worst",
            "ridiculous",
        ],
        Intent::Security => &[
            "password",
            "login",
            "locked",
            "2fa",
            "otp",
            "verification",
            "pin",
            "security",
            "authenticate",
        ],
        Intent::AccountInquiry => &[
            "account",
            "balance",
            "statement",
            "deposit",
            "withdrawal",
            "transfer",
            "wire",
            "routing",
        ],
        Intent::Billing => &[
            "fee", "fees", "charge", "charged", "bill", "billing", "invoice", "refund", "payment",
            "interest",
        ],
        Intent::Trading => &[
            "trade",
            "trading",
            "stock",
            "stocks",
            "order",
            "shares",
            "portfolio",
            "market",
            "options",
            "margin",
        ],
        Intent::TechnicalSupport => &[
            "app", "website", "error", "crash", "bug", "loading", "update", "browser", "download",
            "outage",
        ],
        Intent::Greeting => &[
            "hello", "hi", "hey", "thanks", "thank", "morning", "afternoon", "evening",
        ],
        Intent::General => &[],
    }
}

/// What the composer knows about the conversation.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub account_type: Option<AccountType>,
    /// Bot replies already sent in this session.
    pub prior_bot_replies: usize,
}

/// A candidate reply with its scoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComposedReply {
    pub reply_text: String,
    pub confidence: f64,
    pub intent: Intent,
    pub intent_certainty: f64,
    pub entities: Vec<Entity>,
    /// Exactly the chunks `reply_text` was built from, in retrieval order.
    pub citations: Vec<Citation>,
}

pub struct ResponseComposer {
    config: ComposerConfig,
}

impl ResponseComposer {
    pub fn new(config: &ComposerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn compose(
        &self,
        masked_text: &str,
        redactions: &[Redaction],
        retrieved: &[RetrievedChunk],
        ctx: &SessionContext,
    ) -> ComposedReply {
        let (intent, intent_certainty) = classify_intent(masked_text);
        let entities = extract_entities(masked_text, redactions, ctx);

        let citations: Vec<Citation> = retrieved
            .iter()
            .filter(|c| c.score >= self.config.citation_min_score)
            .take(self.config.max_citations)
            .map(|c| Citation {
                chunk_id: c.chunk_id.clone(),
                knowledge_source_id: c.knowledge_source_id.clone(),
                source_version: c.source_version,
                score: c.score,
                excerpt: excerpt(&c.content, self.config.excerpt_chars),
            })
            .collect();

        let scores: Vec<f64> = citations.iter().map(|c| c.score).collect();
        let confidence = confidence(&scores, intent_certainty, self.config.intent_weight);

        let reply_text = if citations.is_empty() {
            FALLBACK_REPLY.to_string()
        } else {
            let mut reply = String::new();
            if intent == Intent::Greeting && ctx.prior_bot_replies == 0 {
                reply.push_str("Hello! ");
            }
            reply.push_str("Here is what I found:");
            for (i, c) in citations.iter().enumerate() {
                reply.push_str(&format!("\n\n[{}] {}", i + 1, c.excerpt));
            }
            reply
        };

        ComposedReply {
            reply_text,
            confidence,
            intent,
            intent_certainty,
            entities,
            citations,
        }
    }
}

/// Lexicon classifier. Returns the intent with the most keyword hits and
/// its certainty; ties go to the intent declared first.
pub fn classify_intent(text: &str) -> (Intent, f64) {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();

    let mut best = (Intent::General, 0usize);
    let mut total = 0usize;
    for &intent in Intent::ALL {
        let words = lexicon(intent);
        let hits = tokens.iter().filter(|t| words.contains(&t.as_str())).count();
        total += hits;
        if hits > best.1 {
            best = (intent, hits);
        }
    }

    let (intent, top) = best;
    if top == 0 {
        return (Intent::General, 0.5);
    }
    let share = top as f64 / total as f64;
    let saturation = 1.0 - 0.5f64.powi(top as i32);
    (intent, share * saturation)
}

pub fn confidence(scores: &[f64], certainty: f64, intent_weight: f64) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    let miss: f64 = scores.iter().map(|s| 1.0 - s.clamp(0.0, 1.0)).product();
    let coverage = 1.0 - miss;
    let w = intent_weight.clamp(0.0, 1.0);
    let raw = coverage * ((1.0 - w) + w * certainty.clamp(0.0, 1.0));
    (raw * 10_000.0).round() / 10_000.0
}

fn extract_entities(text: &str, redactions: &[Redaction], ctx: &SessionContext) -> Vec<Entity> {
    let mut entities: Vec<Entity> = redactions
        .iter()
        .map(|r| Entity::Pii {
            redaction_type: r.redaction_type,
            masked_value: r.masked_value.clone(),
        })
        .collect();

    for m in AMOUNT_REGEX.find_iter(text) {
        entities.push(Entity::Amount {
            value: m.as_str().to_string(),
            start: m.start(),
            end: m.end(),
        });
    }
    for m in DATE_REGEX.find_iter(text) {
        entities.push(Entity::Date {
            value: m.as_str().to_string(),
            start: m.start(),
            end: m.end(),
        });
    }

    let lower = text.to_lowercase();
    let mut products: Vec<AccountType> = AccountType::ALL
        .iter()
        .copied()
        .filter(|t| {
            lower
                .split(|c: char| !c.is_alphanumeric())
                .any(|w| w == t.as_str())
        })
        .collect();
    if products.is_empty() {
        products.extend(ctx.account_type);
    }
    entities.extend(
        products
            .into_iter()
            .map(|account_type| Entity::Product { account_type }),
    );
    entities
}

fn excerpt(content: &str, max_chars: usize) -> String {
    let trimmed = content.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", trimmed[..idx].trim_end()),
        None => trimmed.to_string(),
    }
}
