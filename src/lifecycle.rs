//! Session and ticket state machines.
//!
//! ```text
//! session:  active ──► waiting ──► active
//!             │  └──────┬────┘
//!             ▼         ▼
//!          escalated ──► ended
//!
//! ticket:   open ──► in_progress ◄──► waiting
//!             │          │              │
//!             │          └──► resolved ◄┘
//!             │                  │  └──► in_progress (reopen)
//!             └──────► closed ◄──┘
//! ```
//!
//! Transitions mutate the record in place, stamp it, and return the prior
//! state so the caller can audit it. An illegal transition returns
//! [`EngineError::InvalidTransition`] and leaves the record untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::models::{EscalationReason, Session, SessionStatus, Ticket, TicketStatus};

/// What caused a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionTrigger {
    InboundMessage { message_id: String },
    AgentAction,
    Timeout { idle_secs: u64 },
}

/// An explicit action from an agent or operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SessionAction {
    Wait,
    Resume,
    Escalate {
        #[serde(default)]
        note: Option<String>,
    },
    Assign {
        agent_id: String,
    },
    End,
    /// Ticket actions apply to `ticket_id`, or the session's newest ticket.
    Start {
        #[serde(default)]
        ticket_id: Option<String>,
    },
    AwaitCustomer {
        #[serde(default)]
        ticket_id: Option<String>,
    },
    Resolve {
        #[serde(default)]
        ticket_id: Option<String>,
    },
    Close {
        #[serde(default)]
        ticket_id: Option<String>,
    },
    Reopen {
        #[serde(default)]
        ticket_id: Option<String>,
    },
}

impl SessionAction {
    /// Target ticket status for ticket actions.
    pub fn ticket_target(&self) -> Option<(TicketStatus, Option<&str>)> {
        let (status, id) = match self {
            SessionAction::Start { ticket_id } => (TicketStatus::InProgress, ticket_id),
            SessionAction::AwaitCustomer { ticket_id } => (TicketStatus::Waiting, ticket_id),
            SessionAction::Resolve { ticket_id } => (TicketStatus::Resolved, ticket_id),
            SessionAction::Close { ticket_id } => (TicketStatus::Closed, ticket_id),
            SessionAction::Reopen { ticket_id } => (TicketStatus::InProgress, ticket_id),
            _ => return None,
        };
        Some((status, id.as_deref()))
    }
}

pub fn session_transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Active, Waiting)
            | (Active, Escalated)
            | (Active, Ended)
            | (Waiting, Active)
            | (Waiting, Escalated)
            | (Waiting, Ended)
            | (Escalated, Ended)
    )
}

pub fn ticket_transition_allowed(from: TicketStatus, to: TicketStatus) -> bool {
    use TicketStatus::*;
    matches!(
        (from, to),
        (Open, InProgress)
            | (Open, Closed)
            | (InProgress, Waiting)
            | (InProgress, Resolved)
            | (Waiting, InProgress)
            | (Waiting, Resolved)
            | (Resolved, Closed)
            | (Resolved, InProgress)
    )
}

/// Move `session` to `to`. `reason` is recorded only when entering
/// `escalated`.
pub fn transition_session(
    session: &mut Session,
    to: SessionStatus,
    now: DateTime<Utc>,
    reason: Option<EscalationReason>,
) -> EngineResult<SessionStatus> {
    let from = session.status;
    if !session_transition_allowed(from, to) {
        return Err(EngineError::InvalidTransition {
            entity: "session",
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    session.status = to;
    session.updated_at = now;
    match to {
        SessionStatus::Escalated => session.escalation_reason = reason,
        SessionStatus::Ended => session.ended_at = Some(now),
        SessionStatus::Active | SessionStatus::Waiting => {}
    }
    Ok(from)
}

pub fn transition_ticket(
    ticket: &mut Ticket,
    to: TicketStatus,
    now: DateTime<Utc>,
) -> EngineResult<TicketStatus> {
    let from = ticket.status;
    if !ticket_transition_allowed(from, to) {
        return Err(EngineError::InvalidTransition {
            entity: "ticket",
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    ticket.status = to;
    ticket.updated_at = now;
    match to {
        TicketStatus::Resolved => ticket.resolved_at = Some(now),
        TicketStatus::Closed => ticket.closed_at = Some(now),
        TicketStatus::InProgress if from == TicketStatus::Resolved => ticket.resolved_at = None,
        _ => {}
    }
    Ok(from)
}
