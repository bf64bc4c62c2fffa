//! Serves locally generated files at fetchable URLs so the gateway can
//! pull them (callback-collect). Each published file gets a uuid id;
//! release removes exactly that file, never a whole directory.

use crate::state::AppState;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
pub struct AssetStore {
    entries: Mutex<HashMap<String, PathBuf>>,
}

impl AssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exposes `path` under a fresh id and returns `(id, url)`.
    pub fn publish(&self, path: impl Into<PathBuf>, public_base_url: &str) -> (String, String) {
        let id = Uuid::new_v4().simple().to_string();
        let url = format!(
            "{}/assets/{id}",
            public_base_url.trim().trim_end_matches('/')
        );
        self.entries.lock().insert(id.clone(), path.into());
        (id, url)
    }

    pub fn resolve(&self, id: &str) -> Option<PathBuf> {
        self.entries.lock().get(id).cloned()
    }

    /// Unpublishes the id and deletes its backing file.
    pub fn release(&self, id: &str) {
        let removed = self.entries.lock().remove(id);
        if let Some(path) = removed {
            debug!(id, path = %path.display(), "releasing published asset");
            let _ = std::fs::remove_file(path);
        }
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/assets/{id}", get(serve_asset))
}

async fn serve_asset(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> impl IntoResponse {
    let Some(path) = state.assets.resolve(&id) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}
