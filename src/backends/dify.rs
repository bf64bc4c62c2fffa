//! Dify chat-messages adapter (blocking response mode).

use crate::backends::{BackendAdapter, TurnReply};
use crate::config::DifyConfig;
use crate::engine::session::SessionStore;
use crate::error::BridgeError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DIFY_BACKEND: &str = "dify";

pub struct DifyAdapter {
    http: Client,
    api_base: String,
    origin: String,
    api_key: String,
    sessions: Arc<SessionStore>,
}

impl DifyAdapter {
    pub fn new(config: &DifyConfig, timeout: Duration, sessions: Arc<SessionStore>) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            api_base: config.api_base(),
            origin: config.origin(),
            api_key: config.api_key.trim().to_string(),
            sessions,
        }
    }

    async fn chat_once(
        &self,
        peer: &str,
        text: &str,
        conversation_id: Option<&str>,
    ) -> Result<Value, BridgeError> {
        let mut payload = json!({
            "inputs": {},
            "query": text,
            "response_mode": "blocking",
            "user": peer,
        });
        if let Some(id) = conversation_id {
            payload["conversation_id"] = Value::String(id.to_string());
            debug!(peer, conversation_id = id, "continuing dify conversation");
        } else {
            debug!(peer, "starting new dify conversation");
        }

        let response = self
            .http
            .post(format!("{}/chat-messages", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| BridgeError::backend(DIFY_BACKEND, err.to_string()))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(BridgeError::backend(
                DIFY_BACKEND,
                format!("{status} {body}"),
            ));
        }
        Ok(body)
    }
}

#[async_trait]
impl BackendAdapter for DifyAdapter {
    fn backend_id(&self) -> &'static str {
        DIFY_BACKEND
    }

    async fn send(&self, peer: &str, text: &str) -> Result<TurnReply, BridgeError> {
        let stored = self.sessions.get(DIFY_BACKEND, peer);
        let body = match self.chat_once(peer, text, stored.as_deref()).await {
            Ok(body) => body,
            // The backend no longer knows the stored conversation; restart
            // once with a fresh one. This is the only internal retry.
            Err(err) if stored.is_some() && is_conversation_rejected(&err) => {
                warn!(peer, "dify rejected stored conversation, starting fresh: {err}");
                if let Err(err) = self.sessions.forget(DIFY_BACKEND, peer) {
                    warn!(peer, "dropping stale conversation record failed: {err}");
                }
                self.chat_once(peer, text, None).await?
            }
            Err(err) => return Err(err),
        };

        let answer = body
            .get("answer")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let conversation_id = body
            .get("conversation_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !conversation_id.is_empty() {
            if let Err(err) = self.sessions.set(DIFY_BACKEND, peer, &conversation_id) {
                warn!(peer, "persisting dify conversation id failed: {err}");
            }
        }

        Ok(TurnReply {
            answer: absolutize_voice_links(answer, &self.origin),
            conversation_id,
        })
    }
}

fn is_conversation_rejected(err: &BridgeError) -> bool {
    match err {
        BridgeError::Backend { message, .. } => {
            let lowered = message.to_ascii_lowercase();
            lowered.contains("conversation") && lowered.contains("not")
        }
        _ => false,
    }
}

/// Dify answers reference generated audio as a markdown link with a
/// server-relative path inside the voice marker; rewrite those to absolute
/// URLs so the dispatcher can fetch them.
fn absolutize_voice_links(answer: &str, origin: &str) -> String {
    let mut output = String::with_capacity(answer.len());
    let mut rest = answer;
    while let Some(start) = rest.find("<voice>") {
        let after = &rest[start + "<voice>".len()..];
        let Some(end) = after.find("</voice>") else {
            break;
        };
        output.push_str(&rest[..start]);
        output.push_str("<voice>");
        output.push_str(&resolve_voice_ref(after[..end].trim(), origin));
        output.push_str("</voice>");
        rest = &after[end + "</voice>".len()..];
    }
    output.push_str(rest);
    output
}

fn resolve_voice_ref(body: &str, origin: &str) -> String {
    // `[label](/files/...)` or a bare path/URL.
    let url = body
        .rfind("](")
        .filter(|_| body.starts_with('[') && body.ends_with(')'))
        .map(|at| &body[at + 2..body.len() - 1])
        .unwrap_or(body)
        .trim();
    if url.starts_with('/') {
        format!("{origin}{url}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_voice_link_becomes_absolute() {
        let answer = "<text>here</text><voice>[audio](/files/tools/a.mp3)</voice>";
        assert_eq!(
            absolutize_voice_links(answer, "http://dify.local"),
            "<text>here</text><voice>http://dify.local/files/tools/a.mp3</voice>"
        );
    }

    #[test]
    fn absolute_voice_url_is_untouched() {
        let answer = "<voice>http://cdn.example/a.wav</voice>";
        assert_eq!(
            absolutize_voice_links(answer, "http://dify.local"),
            answer
        );
    }

    #[test]
    fn bare_relative_path_is_prefixed() {
        let answer = "<voice>/files/a.mp3</voice>";
        assert_eq!(
            absolutize_voice_links(answer, "http://dify.local"),
            "<voice>http://dify.local/files/a.mp3</voice>"
        );
    }

    #[test]
    fn unterminated_voice_marker_is_left_alone() {
        let answer = "<voice>[audio](/files/a.mp3)";
        assert_eq!(absolutize_voice_links(answer, "http://dify.local"), answer);
    }

    #[test]
    fn conversation_rejection_is_detected() {
        let err = BridgeError::backend(DIFY_BACKEND, "404 Not Found Conversation Not Exists.");
        assert!(is_conversation_rejected(&err));
        let err = BridgeError::backend(DIFY_BACKEND, "500 internal");
        assert!(!is_conversation_rejected(&err));
    }
}
