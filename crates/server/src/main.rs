use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use shared::{
    domain::CaseId,
    error::{ApiError, ErrorCode},
    protocol::{
        ActionBody, CreateCaseRequest, DispatchEnvelope, ErrorBody, SessionExchangeRequest,
        SessionProfile,
    },
};
use storage::TrustStore;
use tracing::{error, info};

mod api;
mod auth;
mod config;

use api::{ApiContext, PaymentLimiter, ACTION_ENDPOINTS};
use auth::{SessionClaims, SessionKeys};
use config::{load_settings, normalize_database_url};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    keys: Arc<SessionKeys>,
    limiter: Arc<PaymentLimiter>,
    system_api_key: String,
    session_ttl: chrono::Duration,
}

#[derive(Debug, Deserialize)]
struct CaseQuery {
    id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = normalize_database_url(&settings.database_url);
    let store = TrustStore::new(&database_url).await.map_err(|err| {
        error!(%database_url, %err, "failed to open SQLite database");
        err
    })?;

    let state = AppState {
        api: ApiContext {
            store,
            payment_window: chrono::Duration::hours(settings.payment_window_hours),
            token_ttl: chrono::Duration::hours(settings.session_ttl_hours),
        },
        keys: Arc::new(SessionKeys::new(&settings.jwt_secret)),
        limiter: Arc::new(PaymentLimiter::default()),
        system_api_key: settings.system_api_key,
        session_ttl: chrono::Duration::hours(settings.session_ttl_hours),
    };
    let app = build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "trust room server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/trust/status", get(http_status))
        .route("/api/trust/:action", post(http_action))
        .route("/api/session/exchange", post(http_exchange))
        .route("/api/session/me", get(http_me))
        .route("/api/system/cases", post(http_create_case))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_status(
    State(state): State<AppState>,
    Query(query): Query<CaseQuery>,
    headers: HeaderMap,
) -> Response {
    let _claims = match authorize(&state, &headers, Some(&query.id)) {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    match api::status(&state.api, &CaseId::new(query.id)).await {
        Ok(tx) => Json(tx).into_response(),
        Err(err) => error_response(err),
    }
}

async fn http_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Query(query): Query<CaseQuery>,
    headers: HeaderMap,
    body: Option<Json<ActionBody>>,
) -> Response {
    if !ACTION_ENDPOINTS.contains(&action.as_str()) {
        return error_response(ApiError::not_found("unknown action"));
    }
    let claims = match authorize(&state, &headers, Some(&query.id)) {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    let case_id = CaseId::new(query.id);
    if action == "payment" && !state.limiter.allow(&case_id, Utc::now()) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorBody {
                error: ErrorCode::Unknown.as_str().to_string(),
                message: Some("too many payment attempts".to_string()),
            }),
        )
            .into_response();
    }

    let body = body.map(|Json(body)| body).unwrap_or_default();
    match api::dispatch_action(&state.api, &action, &case_id, claims.role, body).await {
        Ok(tx) => Json(DispatchEnvelope {
            success: true,
            state: tx,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn http_exchange(
    State(state): State<AppState>,
    Json(request): Json<SessionExchangeRequest>,
) -> Response {
    let profile = match api::exchange_session(&state.api, &request.token).await {
        Ok(profile) => profile,
        Err(err) => return error_response(err),
    };

    let token = match auth::mint_session(
        &state.keys,
        &profile.case_id,
        profile.role,
        state.session_ttl,
    ) {
        Ok(token) => token,
        Err(err) => return error_response(ApiError::new(ErrorCode::Unknown, err.to_string())),
    };

    let cookie = match HeaderValue::from_str(&auth::session_cookie(&token)) {
        Ok(cookie) => cookie,
        Err(err) => return error_response(ApiError::new(ErrorCode::Unknown, err.to_string())),
    };

    let mut response = Json(profile).into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    response
}

async fn http_me(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match authorize(&state, &headers, None) {
        Ok(claims) => Json(SessionProfile {
            case_id: claims.case_id,
            role: claims.role,
        })
        .into_response(),
        Err(response) => response,
    }
}

async fn http_create_case(
    State(state): State<AppState>,
    Json(request): Json<CreateCaseRequest>,
) -> Response {
    if request.api_key != state.system_api_key {
        return forbidden("invalid system key");
    }
    match api::create_case(&state.api, request.case_id).await {
        Ok(created) => Json(created).into_response(),
        Err(err) => error_response(err),
    }
}

/// Resolves the session from the request headers. When `case_id` is given the
/// session must be bound to that exact case.
fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    case_id: Option<&str>,
) -> Result<SessionClaims, Response> {
    let token = auth::token_from_headers(headers)
        .ok_or_else(|| error_response(ApiError::unauthorized("missing session")))?;
    let claims = auth::verify_session(&state.keys, &token)
        .ok_or_else(|| error_response(ApiError::unauthorized("session expired or invalid")))?;
    if let Some(case_id) = case_id {
        if claims.case_id.as_str() != case_id {
            return Err(forbidden("session is not bound to this case"));
        }
    }
    Ok(claims)
}

fn forbidden(message: &str) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(ErrorBody {
            error: ErrorCode::Unauthorized.as_str().to_string(),
            message: Some(message.to_string()),
        }),
    )
        .into_response()
}

fn error_response(err: ApiError) -> Response {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ErrorBody {
            error: err.code.as_str().to_string(),
            message: Some(err.message),
        }),
    )
        .into_response()
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
