//! Narrow capability interface over the messaging gateway, plus the
//! gewechat REST implementation.

use crate::config::GatewayConfig;
use crate::error::BridgeError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer: String,
    pub display_name: String,
}

#[async_trait]
pub trait GatewayPort: Send + Sync {
    async fn send_text(&self, peer: &str, text: &str) -> Result<(), BridgeError>;
    /// `audio_url` must be fetchable by the gateway (callback-collect).
    async fn send_voice(
        &self,
        peer: &str,
        audio_url: &str,
        duration_ms: u64,
    ) -> Result<(), BridgeError>;
    async fn send_sticker(&self, peer: &str, md5: &str, size: u64) -> Result<(), BridgeError>;
    async fn peer_directory(&self) -> Result<Vec<PeerEntry>, BridgeError>;
}

pub struct GewechatClient {
    http: Client,
    base_url: String,
    token: String,
    app_id: String,
}

impl GewechatClient {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            token: config.token.trim().to_string(),
            app_id: config.app_id.trim().to_string(),
        }
    }

    /// Registers the callback URL the gateway will deliver messages to.
    /// Called once on startup; a failure is the caller's to log, the server
    /// keeps running since an earlier registration may still be in effect.
    pub async fn set_callback(&self, callback_url: &str) -> Result<(), BridgeError> {
        self.post(
            "/tools/setCallback",
            json!({ "token": self.token, "callbackUrl": callback_url }),
        )
        .await
        .map(|_| ())
    }

    /// Every gateway call returns a `{ret, msg, data}` envelope; anything
    /// but `ret == 200` is a failure.
    async fn post(&self, route: &str, payload: Value) -> Result<Value, BridgeError> {
        let url = format!("{}{route}", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("X-GEWE-TOKEN", &self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| BridgeError::gateway(format!("{route}: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::gateway(format!("{route}: {status} {body}")));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| BridgeError::gateway(format!("{route}: invalid body: {err}")))?;
        let ret = body.get("ret").and_then(Value::as_i64).unwrap_or(-1);
        if ret != 200 {
            let msg = body.get("msg").and_then(Value::as_str).unwrap_or("unknown");
            return Err(BridgeError::gateway(format!("{route}: ret={ret} {msg}")));
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl GatewayPort for GewechatClient {
    async fn send_text(&self, peer: &str, text: &str) -> Result<(), BridgeError> {
        self.post(
            "/message/postText",
            json!({ "appId": self.app_id, "toWxid": peer, "content": text }),
        )
        .await
        .map(|_| ())
    }

    async fn send_voice(
        &self,
        peer: &str,
        audio_url: &str,
        duration_ms: u64,
    ) -> Result<(), BridgeError> {
        self.post(
            "/message/postVoice",
            json!({
                "appId": self.app_id,
                "toWxid": peer,
                "voiceUrl": audio_url,
                "voiceDuration": duration_ms,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn send_sticker(&self, peer: &str, md5: &str, size: u64) -> Result<(), BridgeError> {
        self.post(
            "/message/postEmoji",
            json!({
                "appId": self.app_id,
                "toWxid": peer,
                "emojiMd5": md5,
                "emojiSize": size,
            }),
        )
        .await
        .map(|_| ())
    }

    /// Friends list plus brief info, flattened to peer id + display name.
    async fn peer_directory(&self) -> Result<Vec<PeerEntry>, BridgeError> {
        let contacts = self
            .post(
                "/contacts/fetchContactsList",
                json!({ "appId": self.app_id }),
            )
            .await?;
        let friends: Vec<String> = contacts
            .get("friends")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if friends.is_empty() {
            return Ok(Vec::new());
        }
        let brief = self
            .post(
                "/contacts/getBriefInfo",
                json!({ "appId": self.app_id, "wxids": friends }),
            )
            .await?;
        let entries = brief
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let peer = item.get("userName").and_then(Value::as_str)?;
                        let display_name = item
                            .get("nickName")
                            .and_then(Value::as_str)
                            .unwrap_or(peer);
                        Some(PeerEntry {
                            peer: peer.to_string(),
                            display_name: display_name.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }
}
