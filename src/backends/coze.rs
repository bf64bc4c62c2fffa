//! Coze v3 chat adapter (SSE stream).
//!
//! The chat endpoint streams `event:`/`data:` frames; the conversation id
//! shows up on `conversation.chat.created` and the answer accumulates from
//! `conversation.message.delta` frames.

use crate::backends::{BackendAdapter, TurnReply};
use crate::config::CozeConfig;
use crate::engine::session::SessionStore;
use crate::error::BridgeError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const COZE_BACKEND: &str = "coze";

pub struct CozeAdapter {
    http: Client,
    base_url: String,
    api_token: String,
    bot_id: String,
    sessions: Arc<SessionStore>,
}

struct StreamedChat {
    answer: String,
    conversation_id: String,
}

impl CozeAdapter {
    pub fn new(config: &CozeConfig, timeout: Duration, sessions: Arc<SessionStore>) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            api_token: config.api_token.trim().to_string(),
            bot_id: config.bot_id.trim().to_string(),
            sessions,
        }
    }

    async fn chat_once(
        &self,
        peer: &str,
        text: &str,
        conversation_id: Option<&str>,
    ) -> Result<StreamedChat, BridgeError> {
        let mut url = format!("{}/v3/chat", self.base_url);
        if let Some(id) = conversation_id {
            url.push_str(&format!("?conversation_id={id}"));
            debug!(peer, conversation_id = id, "continuing coze conversation");
        } else {
            debug!(peer, "starting new coze conversation");
        }

        let payload = json!({
            "bot_id": self.bot_id,
            "user_id": peer,
            "stream": true,
            "auto_save_history": true,
            "additional_messages": [{
                "role": "user",
                "content": text,
                "content_type": "text",
            }],
        });
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| BridgeError::backend(COZE_BACKEND, err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::backend(
                COZE_BACKEND,
                format!("{status} {body}"),
            ));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut parser = SseParser::default();
        while let Some(item) = stream.next().await {
            let bytes =
                item.map_err(|err| BridgeError::backend(COZE_BACKEND, err.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(at) = buffer.find('\n') {
                let line = buffer[..at].trim().to_string();
                buffer = buffer[at + 1..].to_string();
                if parser.feed_line(&line)? {
                    return parser.finish();
                }
            }
        }
        parser.finish()
    }
}

#[async_trait]
impl BackendAdapter for CozeAdapter {
    fn backend_id(&self) -> &'static str {
        COZE_BACKEND
    }

    async fn send(&self, peer: &str, text: &str) -> Result<TurnReply, BridgeError> {
        let stored = self.sessions.get(COZE_BACKEND, peer);
        let chat = match self.chat_once(peer, text, stored.as_deref()).await {
            Ok(chat) => chat,
            Err(err) if stored.is_some() && is_conversation_rejected(&err) => {
                warn!(peer, "coze rejected stored conversation, starting fresh: {err}");
                if let Err(err) = self.sessions.forget(COZE_BACKEND, peer) {
                    warn!(peer, "dropping stale conversation record failed: {err}");
                }
                self.chat_once(peer, text, None).await?
            }
            Err(err) => return Err(err),
        };

        if !chat.conversation_id.is_empty() {
            if let Err(err) = self
                .sessions
                .set(COZE_BACKEND, peer, &chat.conversation_id)
            {
                warn!(peer, "persisting coze conversation id failed: {err}");
            }
        }
        Ok(TurnReply {
            answer: chat.answer,
            conversation_id: chat.conversation_id,
        })
    }
}

fn is_conversation_rejected(err: &BridgeError) -> bool {
    match err {
        BridgeError::Backend { message, .. } => {
            message.to_ascii_lowercase().contains("conversation")
        }
        _ => false,
    }
}

/// Minimal SSE frame state machine for the coze chat stream.
#[derive(Default)]
struct SseParser {
    current_event: String,
    answer: String,
    conversation_id: String,
    failed: Option<String>,
}

impl SseParser {
    /// Returns `Ok(true)` once the stream signalled completion.
    fn feed_line(&mut self, line: &str) -> Result<bool, BridgeError> {
        if line.is_empty() {
            return Ok(false);
        }
        if let Some(event) = line.strip_prefix("event:") {
            self.current_event = event.trim().to_string();
            return Ok(false);
        }
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(false);
        };
        let data = data.trim();
        if data == "[DONE]" || data == "\"[DONE]\"" {
            return Ok(true);
        }
        let payload: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(_) => return Ok(false),
        };
        match self.current_event.as_str() {
            "conversation.chat.created" | "conversation.chat.in_progress" => {
                if let Some(id) = payload.get("conversation_id").and_then(Value::as_str) {
                    self.conversation_id = id.to_string();
                }
            }
            "conversation.message.delta" => {
                let is_answer = payload
                    .get("type")
                    .and_then(Value::as_str)
                    .map(|kind| kind == "answer")
                    .unwrap_or(true);
                if is_answer {
                    if let Some(content) = payload.get("content").and_then(Value::as_str) {
                        self.answer.push_str(content);
                    }
                }
            }
            "conversation.chat.failed" => {
                let detail = payload
                    .get("last_error")
                    .map(Value::to_string)
                    .unwrap_or_else(|| payload.to_string());
                self.failed = Some(detail);
                return Ok(true);
            }
            "conversation.chat.completed" | "done" => return Ok(true),
            _ => {}
        }
        Ok(false)
    }

    fn finish(self) -> Result<StreamedChat, BridgeError> {
        if let Some(detail) = self.failed {
            return Err(BridgeError::backend(COZE_BACKEND, detail));
        }
        Ok(StreamedChat {
            answer: self.answer,
            conversation_id: self.conversation_id,
        })
    }
}
