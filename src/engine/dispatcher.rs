//! Fans a decoded reply out to the messaging channel, one segment at a
//! time. A failing segment is logged and skipped; later segments still go
//! out.

use crate::assets::AssetStore;
use crate::config_store::ConfigStore;
use crate::engine::decoder::ReplySegment;
use crate::error::BridgeError;
use crate::gateway::client::GatewayPort;
use crate::voice::transcode::{self, ScopedFiles};
use reqwest::Client;
use std::sync::Arc;
use tracing::{info, warn};

pub struct OutputDispatcher {
    gateway: Arc<dyn GatewayPort>,
    assets: Arc<AssetStore>,
    config_store: ConfigStore,
    http: Client,
}

impl OutputDispatcher {
    pub fn new(
        gateway: Arc<dyn GatewayPort>,
        assets: Arc<AssetStore>,
        config_store: ConfigStore,
    ) -> Self {
        Self {
            gateway,
            assets,
            config_store,
            http: Client::new(),
        }
    }

    pub async fn dispatch(&self, peer: &str, segments: &[ReplySegment]) {
        let total = segments.len();
        let mut failed = 0usize;
        for segment in segments {
            let result = match segment {
                ReplySegment::Text(text) => self.gateway.send_text(peer, text).await,
                ReplySegment::Voice(url) => self.deliver_voice(peer, url).await,
                ReplySegment::Sticker(name) => self.deliver_sticker(peer, name).await,
            };
            if let Err(err) = result {
                failed += 1;
                warn!(peer, code = err.code(), "reply segment failed: {err}");
            }
        }
        if failed > 0 {
            // Terminal: there is no user-facing retry channel.
            warn!(peer, "{}", BridgeError::dispatch_partial(failed, total));
        } else if total > 0 {
            info!(peer, segments = total, "reply delivered");
        }
    }

    /// Download, transcode, publish, send, then release every artifact this
    /// invocation created, on success and on every failure path alike.
    async fn deliver_voice(&self, peer: &str, url: &str) -> Result<(), BridgeError> {
        let config = self.config_store.get().await;
        let public_base = config
            .server
            .public_base_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                BridgeError::gateway("server.public_base_url not configured, cannot serve voice")
            })?
            .to_string();

        let mut scoped = ScopedFiles::default();
        let source = transcode::tmp_path(&config.voice, &source_extension(url));
        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| BridgeError::transcode(format!("audio download failed: {err}")))?
            .bytes()
            .await
            .map_err(|err| BridgeError::transcode(format!("audio download failed: {err}")))?;
        tokio::fs::write(&source, &bytes)
            .await
            .map_err(|err| BridgeError::transcode(format!("writing audio source failed: {err}")))?;
        scoped.track(&source);

        let (encoded, duration_ms) = transcode::to_channel_codec(&config.voice, &source).await?;
        scoped.track(&encoded);

        let (asset_id, asset_url) = self.assets.publish(&encoded, &public_base);
        let sent = self
            .gateway
            .send_voice(peer, &asset_url, duration_ms)
            .await;
        self.assets.release(&asset_id);
        sent
    }

    async fn deliver_sticker(&self, peer: &str, name: &str) -> Result<(), BridgeError> {
        let config = self.config_store.get().await;
        let Some(asset) = config.stickers.get(name) else {
            return Err(BridgeError::gateway(format!(
                "sticker {name:?} not in sticker table"
            )));
        };
        self.gateway.send_sticker(peer, &asset.md5, asset.size).await
    }
}

fn source_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.len() <= 4 && ext.chars().all(char::is_alphanumeric))
        .unwrap_or("mp3")
        .to_ascii_lowercase()
}
