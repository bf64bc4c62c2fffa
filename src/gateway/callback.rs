//! The single inbound entry point: the gateway's message-delivery callback.
//!
//! The handler always acknowledges with `"success"` no matter what happened
//! internally; anything else makes the gateway retry and duplicate events.

use crate::gateway::message::{classify, EventKind};
use crate::state::AppState;
use axum::extract::State;
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

const ACK: &str = "success";

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/wx/callback", post(handle_callback))
}

async fn handle_callback(State(state): State<Arc<AppState>>, body: String) -> &'static str {
    let payload: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => {
            debug!("callback body is not json, acknowledging anyway: {err}");
            return ACK;
        }
    };

    let config = state.config_store.get().await;
    let self_wxid = config.gateway.wxid.as_deref().unwrap_or_default();
    let event = classify(&payload, self_wxid, config.engine.stale_window_s, Utc::now());
    match event.kind {
        EventKind::UserText => {
            if state.commands.try_handle(&event.peer, &event.text).await {
                return ACK;
            }
            info!(peer = %event.peer, "queueing inbound user message");
            state.aggregator.enqueue(&event.peer, event.text);
        }
        kind => {
            debug!(?kind, peer = %event.peer, "ignoring non-actionable callback");
        }
    }
    ACK
}
