// 全局状态：每个组件在此构造一次并显式传递，不使用模块级单例。

use crate::assets::AssetStore;
use crate::backends::BackendSelector;
use crate::commands::CommandRouter;
use crate::config_store::ConfigStore;
use crate::engine::aggregator::DebounceAggregator;
use crate::engine::dispatcher::OutputDispatcher;
use crate::engine::session::SessionStore;
use crate::engine::turn::BridgeEngine;
use crate::gateway::client::{GatewayPort, GewechatClient};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

pub struct AppState {
    pub config_store: ConfigStore,
    pub sessions: Arc<SessionStore>,
    pub backends: Arc<BackendSelector>,
    pub gateway: Arc<GewechatClient>,
    pub assets: Arc<AssetStore>,
    pub aggregator: DebounceAggregator,
    pub commands: Arc<CommandRouter>,
}

impl AppState {
    pub async fn new(config_store: ConfigStore) -> Result<Self> {
        let config = config_store.get().await;
        let sessions = Arc::new(SessionStore::open(&config.sessions.store_path));
        let gateway = Arc::new(GewechatClient::new(&config.gateway));
        let gateway_port: Arc<dyn GatewayPort> = gateway.clone();
        let assets = Arc::new(AssetStore::new());
        let backends =
            Arc::new(BackendSelector::new(config_store.clone(), sessions.clone()).await?);
        let dispatcher = Arc::new(OutputDispatcher::new(
            gateway_port.clone(),
            assets.clone(),
            config_store.clone(),
        ));
        let engine = Arc::new(BridgeEngine::new(backends.clone(), dispatcher));
        let aggregator = DebounceAggregator::new(
            Duration::from_secs(config.engine.quiet_period_s.max(1)),
            engine,
        );
        let commands = Arc::new(CommandRouter::new(
            config_store.clone(),
            sessions.clone(),
            gateway_port,
        ));
        Ok(Self {
            config_store,
            sessions,
            backends,
            gateway,
            assets,
            aggregator,
            commands,
        })
    }
}
