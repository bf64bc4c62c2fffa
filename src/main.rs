// Rust 入口：初始化配置与组件，启动回调服务器并注册回调地址。
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use wxbridge_server::config::Config;
use wxbridge_server::shutdown::shutdown_signal;
use wxbridge_server::{api, AppState, ConfigStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_store = ConfigStore::new(ConfigStore::override_path_default());
    let config = config_store.get().await;
    init_tracing(&config);

    let state = Arc::new(AppState::new(config_store.clone()).await?);
    let app = api::build_router(state.clone()).layer(TraceLayer::new_for_http());

    let addr = bind_address(&config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("wxbridge 回调服务已启动: http://{addr}");

    register_callback(state.clone());

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("服务退出异常: {err}");
    }

    // 停机前把尚未到期的待合并消息冲刷出去。
    state.aggregator.flush_all().await;
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn bind_address(config: &Config) -> String {
    // 保留环境变量覆盖，便于容器化部署。
    let host = std::env::var("WXBRIDGE_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("WXBRIDGE_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}

/// 服务监听就绪后向网关登记回调地址；失败只告警，旧的登记可能仍然有效。
fn register_callback(state: Arc<AppState>) {
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        let config = state.config_store.get().await;
        let Some(callback_url) = config
            .gateway
            .callback_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            warn!("未配置 gateway.callback_url，跳过回调注册");
            return;
        };
        match state.gateway.set_callback(callback_url).await {
            Ok(()) => info!("回调地址注册成功: {callback_url}"),
            Err(err) => warn!("回调地址注册失败，继续运行: {err}"),
        }
    });
}
