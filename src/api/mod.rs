// API 路由汇总入口。
pub mod admin;

use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(crate::gateway::callback::router())
        .merge(crate::assets::router())
        .merge(admin::router())
        .with_state(state)
}
