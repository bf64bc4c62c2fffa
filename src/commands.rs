//! Operator commands. `#`-prefixed messages from the configured master
//! peer bypass the AI backend entirely.

use crate::config::Config;
use crate::config_store::ConfigStore;
use crate::engine::session::SessionStore;
use crate::gateway::client::GatewayPort;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

const USAGE: &str = "可用命令:\n#设置 - 获取设置页面链接\n#重置 - 清空所有对话记录";

pub struct CommandRouter {
    config_store: ConfigStore,
    sessions: Arc<SessionStore>,
    gateway: Arc<dyn GatewayPort>,
    /// Master configured by display name, resolved through the contact
    /// directory once and cached.
    resolved_master: Mutex<Option<String>>,
}

impl CommandRouter {
    pub fn new(
        config_store: ConfigStore,
        sessions: Arc<SessionStore>,
        gateway: Arc<dyn GatewayPort>,
    ) -> Self {
        Self {
            config_store,
            sessions,
            gateway,
            resolved_master: Mutex::new(None),
        }
    }

    async fn master_peer(&self, config: &Config) -> Option<String> {
        if let Some(wxid) = config
            .gateway
            .master_wxid
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return Some(wxid.to_string());
        }
        if let Some(cached) = self.resolved_master.lock().clone() {
            return Some(cached);
        }
        let name = config
            .gateway
            .master_name
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())?;
        match self.gateway.peer_directory().await {
            Ok(directory) => {
                let found = directory
                    .into_iter()
                    .find(|entry| entry.display_name == name)
                    .map(|entry| entry.peer);
                if let Some(peer) = found.as_ref() {
                    info!(name, peer = %peer, "resolved master peer from directory");
                    *self.resolved_master.lock() = Some(peer.clone());
                }
                found
            }
            Err(err) => {
                warn!("fetching peer directory failed: {err}");
                None
            }
        }
    }

    /// Handles `text` as an operator command if it is one. Returns false for
    /// non-commands and for commands from anyone but the master peer; those
    /// flow on to the aggregator as ordinary messages.
    pub async fn try_handle(&self, peer: &str, text: &str) -> bool {
        let trimmed = text.trim();
        if !trimmed.starts_with('#') {
            return false;
        }
        let config = self.config_store.get().await;
        let is_master = self
            .master_peer(&config)
            .await
            .map(|master| master == peer)
            .unwrap_or(false);
        if !is_master {
            return false;
        }

        info!(peer, command = trimmed, "handling operator command");
        let reply = match trimmed {
            "#设置" | "#setting" | "#settings" | "#config" => config
                .server
                .settings_url
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|url| format!("设置页面已就绪，请访问:\n{url}\n设置保存后立即生效，无需重启。"))
                .unwrap_or_else(|| "未配置设置页面地址 (server.settings_url)。".to_string()),
            "#重置" | "#reset" => match self.sessions.clear_all() {
                Ok(()) => "所有对话记录已清空。".to_string(),
                Err(err) => {
                    warn!(peer, "clearing sessions failed: {err}");
                    format!("清空对话记录失败: {err}")
                }
            },
            _ => USAGE.to_string(),
        };
        if let Err(err) = self.gateway.send_text(peer, &reply).await {
            warn!(peer, "sending command reply failed: {err}");
        }
        true
    }
}
