//! Escalation policy.
//!
//! | condition | outcome |
//! |---|---|
//! | intent is fraud_report or complaint | escalate to agent |
//! | confidence < low threshold | escalate to agent |
//! | confidence ≥ high threshold | auto-reply |
//! | ≥ `max_uncertain_turns` uncertain bot replies in a row | escalate to agent |
//! | otherwise | queue for review |
//!
//! Thresholds come from `[escalation]` unless the tenant overrides them.

use serde::{Deserialize, Serialize};

use crate::config::EscalationConfig;
use crate::models::{
    CustomerTier, EscalationReason, Intent, Message, MessageType, TenantSettings, TicketPriority,
};

/// Outcome of the policy for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Decision {
    AutoReply,
    EscalateToAgent {
        reason: EscalationReason,
        priority: TicketPriority,
    },
    QueueForReview {
        reason: EscalationReason,
        priority: TicketPriority,
    },
}

impl Decision {
    pub fn is_escalation(&self) -> bool {
        !matches!(self, Decision::AutoReply)
    }

    pub fn reason(&self) -> Option<&EscalationReason> {
        match self {
            Decision::AutoReply => None,
            Decision::EscalateToAgent { reason, .. } | Decision::QueueForReview { reason, .. } => {
                Some(reason)
            }
        }
    }

    pub fn priority(&self) -> Option<TicketPriority> {
        match self {
            Decision::AutoReply => None,
            Decision::EscalateToAgent { priority, .. }
            | Decision::QueueForReview { priority, .. } => Some(*priority),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::AutoReply => "auto_reply",
            Decision::EscalateToAgent { .. } => "escalate_to_agent",
            Decision::QueueForReview { .. } => "queue_for_review",
        }
    }
}

/// Effective thresholds for one tenant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub high: f64,
    pub low: f64,
    pub max_uncertain_turns: u32,
}

impl Thresholds {
    pub fn resolve(config: &EscalationConfig, settings: &TenantSettings) -> Self {
        let high = settings.high_threshold.unwrap_or(config.high_threshold);
        let low = settings.low_threshold.unwrap_or(config.low_threshold);
        Self {
            high,
            // An override pair that crosses collapses the review band.
            low: low.min(high),
            max_uncertain_turns: settings
                .max_uncertain_turns
                .unwrap_or(config.max_uncertain_turns),
        }
    }
}

/// Number of most recent bot replies, in a row, that were below `high`.
pub fn uncertain_streak(history: &[Message], high: f64) -> u32 {
    let mut streak = 0;
    for m in history.iter().rev() {
        if m.message_type != MessageType::Bot {
            continue;
        }
        match m.confidence {
            Some(c) if c >= high => break,
            _ => streak += 1,
        }
    }
    streak
}

pub fn decide(
    confidence: f64,
    intent: Intent,
    uncertain_streak: u32,
    thresholds: &Thresholds,
    tier: Option<CustomerTier>,
) -> Decision {
    let escalate = |reason: EscalationReason, base: TicketPriority| Decision::EscalateToAgent {
        reason,
        priority: adjust_for_tier(base, tier),
    };

    if intent.is_sensitive() {
        let base = match intent {
            Intent::FraudReport => TicketPriority::Urgent,
            _ => TicketPriority::High,
        };
        return escalate(EscalationReason::SensitiveIntent { intent }, base);
    }
    if confidence < thresholds.low {
        return escalate(
            EscalationReason::LowConfidence { confidence },
            TicketPriority::Medium,
        );
    }
    if confidence >= thresholds.high {
        return Decision::AutoReply;
    }
    if uncertain_streak >= thresholds.max_uncertain_turns {
        return escalate(
            EscalationReason::RepeatedUncertainty {
                turns: uncertain_streak,
            },
            TicketPriority::High,
        );
    }
    Decision::QueueForReview {
        reason: EscalationReason::ReviewRequired { confidence },
        priority: adjust_for_tier(TicketPriority::Low, tier),
    }
}

fn adjust_for_tier(priority: TicketPriority, tier: Option<CustomerTier>) -> TicketPriority {
    match tier {
        Some(CustomerTier::Premium | CustomerTier::Enterprise) => priority.raised(),
        _ => priority,
    }
}
