#![allow(dead_code)]
// Library entrypoint for integration tests and internal reuse.
pub mod api;
pub mod assets;
pub mod backends;
pub mod commands;
pub mod config;
pub mod config_store;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod shutdown;
pub mod state;
pub mod voice;

pub use backends::{BackendAdapter, BackendSelector, TurnReply};
pub use config::Config;
pub use config_store::ConfigStore;
pub use engine::{DebounceAggregator, ReplySegment, SessionStore, TurnHandler};
pub use error::BridgeError;
pub use state::AppState;
