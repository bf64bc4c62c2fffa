//! Turn delivery: selector → backend send → decode → dispatch.

use crate::backends::BackendSelector;
use crate::engine::aggregator::TurnHandler;
use crate::engine::decoder;
use crate::engine::dispatcher::OutputDispatcher;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

pub struct BridgeEngine {
    selector: Arc<BackendSelector>,
    dispatcher: Arc<OutputDispatcher>,
}

impl BridgeEngine {
    pub fn new(selector: Arc<BackendSelector>, dispatcher: Arc<OutputDispatcher>) -> Self {
        Self {
            selector,
            dispatcher,
        }
    }
}

#[async_trait]
impl TurnHandler for BridgeEngine {
    async fn handle_turn(&self, peer: &str, text: &str) {
        let adapter = self.selector.current().await;
        let backend = adapter.backend_id();
        match adapter.send(peer, text).await {
            Ok(reply) => {
                let segments = decoder::decode(&reply.answer);
                if segments.is_empty() {
                    debug!(peer, backend, "backend answered with nothing to deliver");
                    return;
                }
                self.dispatcher.dispatch(peer, &segments).await;
            }
            Err(err) => {
                // At-most-once: the turn is not re-queued, nothing partial
                // goes out.
                error!(peer, backend, "turn delivery aborted: {err}");
            }
        }
    }
}
