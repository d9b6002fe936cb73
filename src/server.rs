//! HTTP transport for the support engine.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/tenants/{t}/sessions` | Open a session |
//! | `POST` | `/tenants/{t}/sessions/{s}/messages` | Process a customer message |
//! | `GET`  | `/tenants/{t}/sessions/{s}/messages` | Session transcript |
//! | `POST` | `/tenants/{t}/sessions/{s}/actions` | Agent action on a session or ticket |
//! | `GET`  | `/tenants/{t}/sessions/{s}/tickets` | Tickets of a session |
//! | `GET`  | `/tenants/{t}/audit` | Tenant audit trail |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Identity
//!
//! The caller is taken from the `x-actor-id` and `x-actor-role` headers
//! (`customer`, `agent` or `system`), which an upstream gateway is
//! expected to set after authentication. Customers only reach their own
//! sessions; actions, tickets and the audit trail are restricted to agents
//! and the system.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "validation", "message": "message text is empty" } }
//! ```
//!
//! | Error | Status | Code |
//! |-------|--------|------|
//! | validation, inactive tenant | 400 | `validation` |
//! | unknown or foreign id | 404 | `not_found` |
//! | invalid transition | 409 | `invalid_transition` |
//! | configuration | 422 | `configuration` |
//! | dependency | 503 | `unavailable` |
//! | stage timeout | 504 | `timeout` |

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use crate::audit::AuditRecord;
use crate::config::Config;
use crate::db;
use crate::error::{EngineError, ErrorKind};
use crate::lifecycle::SessionAction;
use crate::models::{Actor, Channel, Message, Session, Ticket};
use crate::pipeline::{ActionOutcome, Engine, InboundMessage, ProcessOutcome, RequestContext};

const ACTOR_ID_HEADER: &str = "x-actor-id";
const ACTOR_ROLE_HEADER: &str = "x-actor-role";

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Open the engine over the configured database and serve until the
/// process is terminated. Also runs the idle-session sweeper.
pub async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let engine = Arc::new(db::open_engine(config.clone()).await?);

    if config.server.sweep_interval_secs > 0 {
        spawn_sweeper(
            engine.clone(),
            Duration::from_secs(config.server.sweep_interval_secs),
        );
    }

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "helios server listening");
    axum::serve(listener, router(engine)).await?;

    Ok(())
}

/// Build the route table over an existing engine.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tenants/{tenant}/sessions", post(handle_open_session))
        .route(
            "/tenants/{tenant}/sessions/{session}/messages",
            post(handle_send_message).get(handle_list_messages),
        )
        .route(
            "/tenants/{tenant}/sessions/{session}/actions",
            post(handle_action),
        )
        .route(
            "/tenants/{tenant}/sessions/{session}/tickets",
            get(handle_list_tickets),
        )
        .route("/tenants/{tenant}/audit", get(handle_audit))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { engine })
}

fn spawn_sweeper(engine: Arc<Engine>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = engine.sweep_idle_sessions(Utc::now()).await {
                tracing::warn!(error = %e, "idle session sweep failed");
            }
        }
    });
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let (status, code) = match (&err, err.kind()) {
            (EngineError::NotFound { .. }, _) => (StatusCode::NOT_FOUND, "not_found"),
            (_, ErrorKind::Validation) => (StatusCode::BAD_REQUEST, "validation"),
            (_, ErrorKind::State) => (StatusCode::CONFLICT, "invalid_transition"),
            (_, ErrorKind::Configuration) => (StatusCode::UNPROCESSABLE_ENTITY, "configuration"),
            (_, ErrorKind::Dependency) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
            (_, ErrorKind::Timeout) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "forbidden",
        message: message.into(),
    }
}

/// Build the request context from the identity headers.
fn request_context(tenant_id: String, headers: &HeaderMap) -> Result<RequestContext, AppError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let role = header(ACTOR_ROLE_HEADER)
        .ok_or_else(|| bad_request(format!("missing {} header", ACTOR_ROLE_HEADER)))?;
    let actor = match role {
        "system" => Actor::System,
        "customer" | "agent" => {
            let id = header(ACTOR_ID_HEADER)
                .ok_or_else(|| bad_request(format!("missing {} header", ACTOR_ID_HEADER)))?
                .to_string();
            if role == "customer" {
                Actor::Customer(id)
            } else {
                Actor::Agent(id)
            }
        }
        other => return Err(bad_request(format!("unknown actor role: {}", other))),
    };
    Ok(RequestContext::new(tenant_id, actor))
}

fn require_staff(ctx: &RequestContext) -> Result<(), AppError> {
    match ctx.actor {
        Actor::Agent(_) | Actor::System => Ok(()),
        _ => Err(forbidden("agent or system role required")),
    }
}

/// Customers may only touch their own sessions.
async fn authorize_session(
    engine: &Engine,
    ctx: &RequestContext,
    session_id: &str,
) -> Result<(), AppError> {
    let Actor::Customer(customer_id) = &ctx.actor else {
        return Ok(());
    };
    let session = engine
        .store()
        .get_session(&ctx.tenant_id, session_id)
        .await
        .map_err(EngineError::Storage)?
        .ok_or_else(|| EngineError::not_found("session", session_id))?;
    if session.customer_id != *customer_id {
        return Err(forbidden("session belongs to another customer"));
    }
    Ok(())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Sessions ============

#[derive(Deserialize)]
struct OpenSessionRequest {
    customer_id: String,
    channel: Channel,
}

async fn handle_open_session(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(req): Json<OpenSessionRequest>,
) -> Result<(StatusCode, Json<Session>), AppError> {
    let ctx = request_context(tenant, &headers)?;
    if let Actor::Customer(id) = &ctx.actor {
        if *id != req.customer_id {
            return Err(forbidden("customers may only open their own sessions"));
        }
    }
    let session = state
        .engine
        .open_session(&ctx, &req.customer_id, req.channel)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Deserialize)]
struct SendMessageRequest {
    text: String,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn handle_send_message(
    State(state): State<AppState>,
    Path((tenant, session)): Path<(String, String)>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<ProcessOutcome>, AppError> {
    let ctx = request_context(tenant, &headers)?;
    authorize_session(&state.engine, &ctx, &session).await?;
    let inbound = InboundMessage {
        session_id: session,
        text: req.text,
        idempotency_key: req.idempotency_key,
    };
    let outcome = state.engine.process_message(&ctx, inbound).await?;
    Ok(Json(outcome))
}

#[derive(Serialize)]
struct MessagesResponse {
    messages: Vec<Message>,
}

async fn handle_list_messages(
    State(state): State<AppState>,
    Path((tenant, session)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<MessagesResponse>, AppError> {
    let ctx = request_context(tenant, &headers)?;
    authorize_session(&state.engine, &ctx, &session).await?;
    let messages = state.engine.session_messages(&ctx, &session).await?;
    Ok(Json(MessagesResponse { messages }))
}

async fn handle_action(
    State(state): State<AppState>,
    Path((tenant, session)): Path<(String, String)>,
    headers: HeaderMap,
    Json(action): Json<SessionAction>,
) -> Result<Json<ActionOutcome>, AppError> {
    let ctx = request_context(tenant, &headers)?;
    require_staff(&ctx)?;
    let outcome = state.engine.advance_session(&ctx, &session, action).await?;
    Ok(Json(outcome))
}

#[derive(Serialize)]
struct TicketsResponse {
    tickets: Vec<Ticket>,
}

async fn handle_list_tickets(
    State(state): State<AppState>,
    Path((tenant, session)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<TicketsResponse>, AppError> {
    let ctx = request_context(tenant, &headers)?;
    require_staff(&ctx)?;
    let tickets = state.engine.session_tickets(&ctx, &session).await?;
    Ok(Json(TicketsResponse { tickets }))
}

#[derive(Serialize)]
struct AuditResponse {
    records: Vec<AuditRecord>,
    verified: bool,
}

async fn handle_audit(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AuditResponse>, AppError> {
    let ctx = request_context(tenant, &headers)?;
    require_staff(&ctx)?;
    let records = state.engine.audit_trail(&ctx).await?;
    let verified = match state.engine.recorder().verify(&records) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(tenant_id = %ctx.tenant_id, error = %e, "audit chain verification failed");
            false
        }
    };
    Ok(Json(AuditResponse { records, verified }))
}
