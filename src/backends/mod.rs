pub mod coze;
pub mod dify;
pub mod selector;

pub use selector::BackendSelector;

use crate::error::BridgeError;
use async_trait::async_trait;

/// One backend answer: the raw multi-segment text and the conversation id
/// that correlates follow-up turns.
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub answer: String,
    pub conversation_id: String,
}

/// Uniform adapter contract over conversational-AI vendors. `send` carries
/// the peer's stored conversation id on the wire and persists whatever id
/// the backend returns. It does not retry network failures, since a retry
/// can duplicate a delivered turn.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn backend_id(&self) -> &'static str;

    async fn send(&self, peer: &str, text: &str) -> Result<TurnReply, BridgeError>;
}
