//! Hub HTTP surface
//!
//! The operator endpoints live under `/api/beszel` behind a bearer admin
//! token; `/api/beszel/agent-connect` upgrades authenticated agents to the
//! duplex session. Full user management stays outside the core; this
//! surface is what agents and operator tooling need.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::HubSettings;
use crate::domain::{MonitoringConfig, SystemStatus};
use crate::domain_types::{FingerprintValue, SystemId, SystemName, TokenValue};
use crate::storage::{FingerprintRecord, Repository, SharedRepository, StoreError, SystemRecord};
use crate::time_provider::SharedClock;
use crate::wire::{HEADER_KEY, HEADER_TOKEN, HEADER_VERSION};

use super::averages;
use super::config_manager::{ConfigManager, PushPriority};
use super::events::{EventBus, SystemEvent};
use super::sessions::{SharedSessions, spawn_session};
use super::system_manager::SystemManager;

/// Agent identity header presented during the handshake
pub const HEADER_FINGERPRINT: &str = "X-Fingerprint";

/// Lifetime of a universal enrollment token
const UNIVERSAL_TOKEN_TTL: ChronoDuration = ChronoDuration::hours(1);

/// Shared state behind every handler
#[derive(Clone)]
pub struct HubState {
    /// Persistence
    pub repo: SharedRepository,
    /// Live sessions
    pub sessions: SharedSessions,
    /// Per-system orchestration
    pub manager: Arc<SystemManager>,
    /// Config cache and push pipeline
    pub config: Arc<ConfigManager>,
    /// Record-change bus
    pub events: EventBus,
    /// Resolved hub settings
    pub settings: Arc<HubSettings>,
    /// Active enrollment tokens and their expiry
    pub universal_tokens: Arc<DashMap<String, DateTime<Utc>>>,
    /// Injected clock
    pub clock: SharedClock,
}

/// Builds the router over the shared state.
pub fn create_router(state: HubState) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/api/beszel/getkey", get(get_key))
        .route("/api/beszel/first-run", get(first_run))
        .route("/api/beszel/agent-connect", get(agent_connect))
        .route("/api/beszel/universal-token", get(universal_token))
        .route("/api/beszel/config/sync-all", post(sync_all))
        .route("/api/beszel/config/sync/{id}", post(sync_one))
        .route("/api/beszel/calculate-averages", get(calculate_averages))
        .route("/api/beszel/systems", post(create_system))
        .route("/api/beszel/systems/{id}", delete(delete_system))
        .route("/api/beszel/systems/{id}/pause", post(pause_system))
        .route("/api/beszel/systems/{id}/resume", post(resume_system))
        .route("/api/beszel/systems/{id}/rotate-token", post(rotate_token))
        .route("/api/beszel/systems/{id}/config", put(put_config))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

fn store_error(e: StoreError) -> Response {
    match e {
        StoreError::NotFound { .. } => error_response(StatusCode::NOT_FOUND, e.to_string()),
        other => {
            warn!(error = %other, "storage failure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

/// Checks the bearer admin token; with none configured the surface is open
/// (development setups).
fn require_admin(state: &HubState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.settings.admin_token else {
        return Ok(());
    };
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "admin token required"))
    }
}

async fn liveness() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
struct KeyResponse {
    key: String,
    v: String,
}

async fn get_key(State(state): State<HubState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    Json(KeyResponse {
        key: state.settings.key.clone(),
        v: env!("CARGO_PKG_VERSION").to_string(),
    })
    .into_response()
}

#[derive(Debug, Serialize)]
struct FirstRunResponse {
    #[serde(rename = "firstRun")]
    first_run: bool,
}

async fn first_run(State(state): State<HubState>) -> Response {
    match state.repo.any_systems().await {
        Ok(any) => Json(FirstRunResponse { first_run: !any }).into_response(),
        Err(e) => store_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct UniversalTokenQuery {
    enable: Option<u8>,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct UniversalTokenResponse {
    token: String,
    active: bool,
}

async fn universal_token(
    State(state): State<HubState>,
    headers: HeaderMap,
    Query(query): Query<UniversalTokenQuery>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }

    let token = query
        .token
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    match query.enable {
        Some(1) => {
            let expires = state.clock.now() + UNIVERSAL_TOKEN_TTL;
            state.universal_tokens.insert(token.clone(), expires);
            info!("universal enrollment token enabled");
            Json(UniversalTokenResponse {
                token,
                active: true,
            })
            .into_response()
        }
        Some(0) => {
            state.universal_tokens.remove(&token);
            Json(UniversalTokenResponse {
                token,
                active: false,
            })
            .into_response()
        }
        _ => {
            let active = state
                .universal_tokens
                .get(&token)
                .is_some_and(|expiry| *expiry > state.clock.now());
            Json(UniversalTokenResponse { token, active }).into_response()
        }
    }
}

async fn sync_all(State(state): State<HubState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let systems = match state.repo.find_systems().await {
        Ok(systems) => systems,
        Err(e) => return store_error(e),
    };
    let mut synced = 0;
    for system in &systems {
        if state.config.sync_now(&system.id).await.is_ok() {
            synced += 1;
        }
    }
    Json(serde_json::json!({ "synced": synced })).into_response()
}

async fn sync_one(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let Ok(id) = SystemId::try_new(id) else {
        return error_response(StatusCode::BAD_REQUEST, "malformed system id");
    };
    match state.config.sync_now(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn calculate_averages(State(state): State<HubState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    averages::snapshot_all(&state.repo, &state.clock).await;
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Debug, Deserialize)]
struct CreateSystemRequest {
    name: String,
    host: String,
    #[serde(default)]
    users: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateSystemResponse {
    id: String,
    token: String,
}

async fn create_system(
    State(state): State<HubState>,
    headers: HeaderMap,
    Json(request): Json<CreateSystemRequest>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let Ok(name) = SystemName::try_new(request.name) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid system name");
    };

    let record = SystemRecord {
        id: SystemId::generate(),
        name,
        host: request.host,
        status: SystemStatus::Pending,
        info: None,
        current_averages: None,
        users: request.users,
        created: state.clock.now(),
    };
    let token = TokenValue::generate();

    if let Err(e) = state.repo.upsert_system(&record).await {
        return store_error(e);
    }
    if let Err(e) = state
        .repo
        .insert_fingerprint(&FingerprintRecord {
            system: record.id.clone(),
            token: token.clone(),
            fingerprint: None,
            updated: state.clock.now(),
        })
        .await
    {
        return store_error(e);
    }

    state.events.publish(SystemEvent::Created(record.clone()));
    (
        StatusCode::CREATED,
        Json(CreateSystemResponse {
            id: record.id.to_string(),
            token: token.to_string(),
        }),
    )
        .into_response()
}

fn parse_id(raw: String) -> Result<SystemId, Response> {
    SystemId::try_new(raw)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "malformed system id"))
}

async fn delete_system(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    if let Err(e) = state.repo.delete_system(&id).await {
        return store_error(e);
    }
    state.events.publish(SystemEvent::Deleted(id));
    StatusCode::NO_CONTENT.into_response()
}

async fn pause_system(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    state.events.publish(SystemEvent::Paused(id));
    StatusCode::ACCEPTED.into_response()
}

async fn resume_system(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    state.events.publish(SystemEvent::Resumed(id));
    StatusCode::ACCEPTED.into_response()
}

async fn rotate_token(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let token = TokenValue::generate();
    if let Err(e) = state.repo.rotate_token(&id, &token).await {
        return store_error(e);
    }
    state.events.publish(SystemEvent::TokenRotated(id));
    Json(serde_json::json!({ "token": token.to_string() })).into_response()
}

async fn put_config(
    State(state): State<HubState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(config): Json<MonitoringConfig>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let id = match parse_id(id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.config.submit(&id, config, PushPriority::Normal).await {
        Ok(version) => {
            Json(serde_json::json!({ "version": version.as_i64() })).into_response()
        }
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// Handshake outcome carrying what the session needs
struct HandshakeOk {
    system: SystemId,
    agent_version: String,
}

/// Verifies token, key, version, and fingerprint binding. No state is
/// touched on any rejection path.
async fn verify_handshake(state: &HubState, headers: &HeaderMap) -> Result<HandshakeOk, Response> {
    let token_raw = headers
        .get(HEADER_TOKEN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let Ok(token) = TokenValue::try_new(token_raw.to_string()) else {
        return Err(error_response(StatusCode::BAD_REQUEST, "missing or oversized token"));
    };

    let version_raw = headers
        .get(HEADER_VERSION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if semver::Version::parse(version_raw).is_err() {
        return Err(error_response(StatusCode::BAD_REQUEST, "invalid agent version"));
    }

    if !state.settings.key.is_empty() {
        let presented = headers
            .get(HEADER_KEY)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented != state.settings.key {
            return Err(error_response(StatusCode::UNAUTHORIZED, "key mismatch"));
        }
    }

    let fingerprint_raw = headers
        .get(HEADER_FINGERPRINT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let Ok(fingerprint) = FingerprintValue::try_new(fingerprint_raw.to_string()) else {
        return Err(error_response(StatusCode::BAD_REQUEST, "missing fingerprint"));
    };

    let record = match state.repo.get_fingerprint_by_token(&token).await {
        Ok(Some(record)) => record,
        Ok(None) => match enroll_with_universal_token(state, &token).await? {
            Some(record) => record,
            None => {
                return Err(error_response(StatusCode::UNAUTHORIZED, "unknown token"));
            }
        },
        Err(e) => return Err(store_error(e)),
    };

    match &record.fingerprint {
        None => {
            if let Err(e) = state.repo.bind_fingerprint(&record.system, &fingerprint).await {
                return Err(store_error(e));
            }
            info!(system_id = %record.system, "fingerprint bound on first connect");
        }
        Some(bound) if *bound == fingerprint => {}
        Some(_) => {
            return Err(error_response(StatusCode::UNAUTHORIZED, "fingerprint mismatch"));
        }
    }

    Ok(HandshakeOk {
        system: record.system,
        agent_version: version_raw.to_string(),
    })
}

/// Auto-registers a system when the presented token is an active universal
/// enrollment token.
async fn enroll_with_universal_token(
    state: &HubState,
    token: &TokenValue,
) -> Result<Option<FingerprintRecord>, Response> {
    let active = state
        .universal_tokens
        .get(&token.to_string())
        .is_some_and(|expiry| *expiry > state.clock.now());
    if !active {
        return Ok(None);
    }

    let id = SystemId::generate();
    let name = SystemName::try_new(format!("system-{id}"))
        .unwrap_or_else(|_| SystemName::try_new("system".to_string()).expect("nonempty"));
    let record = SystemRecord {
        id: id.clone(),
        name,
        host: String::new(),
        status: SystemStatus::Pending,
        info: None,
        current_averages: None,
        users: Vec::new(),
        created: state.clock.now(),
    };
    let fingerprint = FingerprintRecord {
        system: id.clone(),
        token: token.clone(),
        fingerprint: None,
        updated: state.clock.now(),
    };

    if let Err(e) = state.repo.upsert_system(&record).await {
        return Err(store_error(e));
    }
    if let Err(e) = state.repo.insert_fingerprint(&fingerprint).await {
        return Err(store_error(e));
    }
    info!(system_id = %id, "system auto-enrolled via universal token");
    state.events.publish(SystemEvent::Created(record));
    Ok(Some(fingerprint))
}

async fn agent_connect(
    State(state): State<HubState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ok = match verify_handshake(&state, &headers).await {
        Ok(ok) => ok,
        Err(rejection) => return rejection,
    };

    info!(system_id = %ok.system, agent_version = %ok.agent_version, "agent connected");
    ws.on_upgrade(move |socket| async move {
        let _handle = spawn_session(
            Arc::clone(&state.sessions),
            socket,
            ok.system.clone(),
            ok.agent_version,
        )
        .await;
        state.manager.on_agent_connected(&ok.system).await;
    })
}
