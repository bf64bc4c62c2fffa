// End-to-end engine flow with the vendor and gateway seams faked out:
// callback bursts collapse into one combined turn, the backend's multi
// segment answer fans back out through the dispatcher.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use wxbridge_server::assets::AssetStore;
use wxbridge_server::backends::{BackendAdapter, BackendSelector, TurnReply};
use wxbridge_server::config::StickerAsset;
use wxbridge_server::engine::aggregator::{DebounceAggregator, TurnHandler};
use wxbridge_server::engine::decoder;
use wxbridge_server::engine::dispatcher::OutputDispatcher;
use wxbridge_server::engine::session::SessionStore;
use wxbridge_server::engine::turn::BridgeEngine;
use wxbridge_server::error::BridgeError;
use wxbridge_server::gateway::client::{GatewayPort, PeerEntry};
use wxbridge_server::{Config, ConfigStore};

struct ScriptedAdapter {
    answer: String,
    prompts: Mutex<Vec<(String, String)>>,
    sessions: Arc<SessionStore>,
}

#[async_trait]
impl BackendAdapter for ScriptedAdapter {
    fn backend_id(&self) -> &'static str {
        "scripted"
    }

    async fn send(&self, peer: &str, text: &str) -> Result<TurnReply, BridgeError> {
        self.prompts.lock().push((peer.to_string(), text.to_string()));
        self.sessions
            .set("scripted", peer, "conv-test")
            .map_err(|err| BridgeError::backend("scripted", err.to_string()))?;
        Ok(TurnReply {
            answer: self.answer.clone(),
            conversation_id: "conv-test".to_string(),
        })
    }
}

#[derive(Default)]
struct RecordingGateway {
    texts: Mutex<Vec<(String, String)>>,
    stickers: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl GatewayPort for RecordingGateway {
    async fn send_text(&self, peer: &str, text: &str) -> Result<(), BridgeError> {
        self.texts.lock().push((peer.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_voice(&self, _: &str, _: &str, _: u64) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn send_sticker(&self, peer: &str, md5: &str, _: u64) -> Result<(), BridgeError> {
        self.stickers.lock().push((peer.to_string(), md5.to_string()));
        Ok(())
    }

    async fn peer_directory(&self) -> Result<Vec<PeerEntry>, BridgeError> {
        Ok(Vec::new())
    }
}

/// The turn pipeline with the adapter pinned instead of selector-resolved.
struct PinnedEngine {
    adapter: Arc<ScriptedAdapter>,
    dispatcher: Arc<OutputDispatcher>,
}

#[async_trait]
impl TurnHandler for PinnedEngine {
    async fn handle_turn(&self, peer: &str, text: &str) {
        let reply = self.adapter.send(peer, text).await.expect("scripted send");
        let segments = decoder::decode(&reply.answer);
        self.dispatcher.dispatch(peer, &segments).await;
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    adapter: Arc<ScriptedAdapter>,
    gateway: Arc<RecordingGateway>,
    sessions: Arc<SessionStore>,
    aggregator: DebounceAggregator,
}

fn harness(answer: &str, quiet: Duration) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.stickers.insert(
        "wave".to_string(),
        StickerAsset {
            md5: "feedbeef".to_string(),
            size: 1024,
        },
    );
    let config_store = ConfigStore::with_config(config, dir.path().join("override.yaml"));
    let sessions = Arc::new(SessionStore::open(dir.path().join("sessions.json")));
    let gateway = Arc::new(RecordingGateway::default());
    let dispatcher = Arc::new(OutputDispatcher::new(
        gateway.clone(),
        Arc::new(AssetStore::new()),
        config_store,
    ));
    let adapter = Arc::new(ScriptedAdapter {
        answer: answer.to_string(),
        prompts: Mutex::new(Vec::new()),
        sessions: sessions.clone(),
    });
    let aggregator = DebounceAggregator::new(
        quiet,
        Arc::new(PinnedEngine {
            adapter: adapter.clone(),
            dispatcher,
        }),
    );
    Harness {
        _dir: dir,
        adapter,
        gateway,
        sessions,
        aggregator,
    }
}

#[tokio::test]
async fn burst_becomes_one_turn_and_reply_is_delivered() {
    let harness = harness("<text>Hello!</text>", Duration::from_millis(60));

    harness.aggregator.enqueue("u1", "hi");
    harness.aggregator.enqueue("u1", "there");
    sleep(Duration::from_millis(300)).await;

    let prompts = harness.adapter.prompts.lock().clone();
    assert_eq!(prompts, vec![("u1".to_string(), "hi\nthere".to_string())]);
    let texts = harness.gateway.texts.lock().clone();
    assert_eq!(texts, vec![("u1".to_string(), "Hello!".to_string())]);
    assert_eq!(
        harness.sessions.get("scripted", "u1").as_deref(),
        Some("conv-test")
    );
}

#[tokio::test]
async fn multi_segment_answer_fans_out_in_order() {
    let harness = harness(
        "<text>here you go</text><emoji>wave</emoji>",
        Duration::from_millis(50),
    );

    harness.aggregator.enqueue("u2", "send a sticker");
    sleep(Duration::from_millis(250)).await;

    let texts = harness.gateway.texts.lock().clone();
    assert_eq!(texts, vec![("u2".to_string(), "here you go".to_string())]);
    let stickers = harness.gateway.stickers.lock().clone();
    assert_eq!(stickers, vec![("u2".to_string(), "feedbeef".to_string())]);
}

#[tokio::test]
async fn separate_bursts_become_separate_turns() {
    let harness = harness("<text>ok</text>", Duration::from_millis(40));

    harness.aggregator.enqueue("u3", "first");
    sleep(Duration::from_millis(150)).await;
    harness.aggregator.enqueue("u3", "second");
    sleep(Duration::from_millis(150)).await;

    let prompts = harness.adapter.prompts.lock().clone();
    assert_eq!(
        prompts,
        vec![
            ("u3".to_string(), "first".to_string()),
            ("u3".to_string(), "second".to_string()),
        ]
    );
}

#[tokio::test]
async fn backend_failure_aborts_the_turn_without_partial_output() {
    // Real selector + dify adapter pointed at a closed port: the send fails
    // and nothing reaches the gateway.
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.backend.dify.base_url = "http://127.0.0.1:9".to_string();
    config.backend.timeout_s = 1;
    let config_store = ConfigStore::with_config(config, dir.path().join("override.yaml"));
    let sessions = Arc::new(SessionStore::open(dir.path().join("sessions.json")));
    let selector = Arc::new(
        BackendSelector::new(config_store.clone(), sessions)
            .await
            .expect("selector"),
    );
    let gateway = Arc::new(RecordingGateway::default());
    let dispatcher = Arc::new(OutputDispatcher::new(
        gateway.clone(),
        Arc::new(AssetStore::new()),
        config_store,
    ));
    let engine = Arc::new(BridgeEngine::new(selector, dispatcher));
    let aggregator = DebounceAggregator::new(Duration::from_millis(40), engine);

    aggregator.enqueue("u4", "hello?");
    sleep(Duration::from_millis(1500)).await;

    assert!(gateway.texts.lock().is_empty());
}
