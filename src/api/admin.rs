// 管理端 API：后端切换、凭据更新、会话清理与状态查询。
use crate::state::AppState;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/status", get(status))
        .route("/admin/backend", post(change_backend))
        .route("/admin/backend/dify", post(change_dify))
        .route("/admin/backend/coze", post(change_coze))
        .route("/admin/engine", post(change_engine))
        .route("/admin/sessions/clear", post(clear_sessions))
}

/// Admin calls carry the configured key in `X-Api-Key`; with no key
/// configured the admin surface stays open, matching a local deployment.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let config = state.config_store.get().await;
    let Some(expected) = config.api_key() else {
        return Ok(());
    };
    let provided = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if provided == expected {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "invalid api key"))
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "message": message }))).into_response()
}

fn ok_response() -> Response {
    Json(json!({ "success": true })).into_response()
}

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }
    let config = state.config_store.get().await;
    Json(json!({
        "platform": config.backend.platform,
        "config_version": state.config_store.version(),
        "quiet_period_s": state.aggregator.quiet_period().as_secs(),
    }))
    .into_response()
}

async fn change_backend(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }
    let platform = body
        .get("platform")
        .and_then(Value::as_str)
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if platform != "dify" && platform != "coze" {
        return error_response(StatusCode::BAD_REQUEST, "platform must be dify or coze");
    }
    if let Err(err) = state
        .config_store
        .update(|config| config.backend.platform = platform.clone())
        .await
    {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
    }
    info!(%platform, "active backend switched");
    ok_response()
}

async fn change_dify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }
    let base_url = non_empty(&body, "base_url");
    let api_key = non_empty(&body, "api_key");
    if base_url.is_none() && api_key.is_none() {
        return error_response(StatusCode::BAD_REQUEST, "nothing to update");
    }
    if let Err(err) = state
        .config_store
        .update(|config| {
            if let Some(value) = base_url {
                config.backend.dify.base_url = value;
            }
            if let Some(value) = api_key {
                config.backend.dify.api_key = value;
            }
        })
        .await
    {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
    }
    ok_response()
}

async fn change_coze(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }
    let base_url = non_empty(&body, "base_url");
    let api_token = non_empty(&body, "api_token");
    let bot_id = non_empty(&body, "bot_id");
    if base_url.is_none() && api_token.is_none() && bot_id.is_none() {
        return error_response(StatusCode::BAD_REQUEST, "nothing to update");
    }
    if let Err(err) = state
        .config_store
        .update(|config| {
            if let Some(value) = base_url {
                config.backend.coze.base_url = value;
            }
            if let Some(value) = api_token {
                config.backend.coze.api_token = value;
            }
            if let Some(value) = bot_id {
                config.backend.coze.bot_id = value;
            }
        })
        .await
    {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
    }
    ok_response()
}

async fn change_engine(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }
    let Some(quiet_period_s) = body.get("quiet_period_s").and_then(Value::as_u64) else {
        return error_response(StatusCode::BAD_REQUEST, "quiet_period_s required");
    };
    if quiet_period_s == 0 || quiet_period_s > 300 {
        return error_response(StatusCode::BAD_REQUEST, "quiet_period_s out of range");
    }
    if let Err(err) = state
        .config_store
        .update(|config| config.engine.quiet_period_s = quiet_period_s)
        .await
    {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string());
    }
    state
        .aggregator
        .set_quiet_period(Duration::from_secs(quiet_period_s));
    ok_response()
}

async fn clear_sessions(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(response) = authorize(&state, &headers).await {
        return response;
    }
    match state.sessions.clear_all() {
        Ok(()) => ok_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn non_empty(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
