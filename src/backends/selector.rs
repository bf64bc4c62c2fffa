//! Resolves the active backend adapter from current configuration.
//!
//! A configuration update bumps the ConfigStore version; the next
//! `current()` call notices, builds a fresh adapter and swaps the single
//! shared reference. Readers clone the Arc, so sends already in flight on
//! the previous adapter complete normally.

use crate::backends::coze::CozeAdapter;
use crate::backends::dify::DifyAdapter;
use crate::backends::BackendAdapter;
use crate::config::BackendConfig;
use crate::config_store::ConfigStore;
use crate::engine::session::SessionStore;
use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

struct CurrentAdapter {
    version: u64,
    adapter: Arc<dyn BackendAdapter>,
}

pub struct BackendSelector {
    config_store: ConfigStore,
    sessions: Arc<SessionStore>,
    current: RwLock<CurrentAdapter>,
}

impl BackendSelector {
    pub async fn new(config_store: ConfigStore, sessions: Arc<SessionStore>) -> Result<Self> {
        let config = config_store.get().await;
        let adapter = build_adapter(&config.backend, sessions.clone())?;
        let version = config_store.version();
        Ok(Self {
            config_store,
            sessions,
            current: RwLock::new(CurrentAdapter { version, adapter }),
        })
    }

    /// Returns the active adapter, rebuilding it first when configuration
    /// changed since the last call. A broken new configuration keeps the
    /// previous adapter serving.
    pub async fn current(&self) -> Arc<dyn BackendAdapter> {
        let version = self.config_store.version();
        {
            let guard = self.current.read();
            if guard.version == version {
                return guard.adapter.clone();
            }
        }

        let config = self.config_store.get().await;
        match build_adapter(&config.backend, self.sessions.clone()) {
            Ok(adapter) => {
                let mut guard = self.current.write();
                if guard.version != version {
                    info!(
                        backend = adapter.backend_id(),
                        "backend configuration changed, adapter swapped"
                    );
                    *guard = CurrentAdapter { version, adapter };
                }
                guard.adapter.clone()
            }
            Err(err) => {
                warn!("backend reload failed, keeping previous adapter: {err}");
                let mut guard = self.current.write();
                guard.version = version;
                guard.adapter.clone()
            }
        }
    }
}

pub fn build_adapter(
    config: &BackendConfig,
    sessions: Arc<SessionStore>,
) -> Result<Arc<dyn BackendAdapter>> {
    let timeout = Duration::from_secs(config.timeout_s.max(1));
    match config.platform.trim().to_ascii_lowercase().as_str() {
        "dify" => Ok(Arc::new(DifyAdapter::new(&config.dify, timeout, sessions))),
        "coze" => Ok(Arc::new(CozeAdapter::new(&config.coze, timeout, sessions))),
        other => Err(anyhow!("unknown backend platform: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_store(dir: &tempfile::TempDir) -> (ConfigStore, Arc<SessionStore>) {
        let store = ConfigStore::with_config(Config::default(), dir.path().join("override.yaml"));
        let sessions = Arc::new(SessionStore::open(dir.path().join("sessions.json")));
        (store, sessions)
    }

    #[tokio::test]
    async fn swaps_adapter_when_platform_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (config_store, sessions) = test_store(&dir);
        let selector = BackendSelector::new(config_store.clone(), sessions)
            .await
            .expect("selector");
        assert_eq!(selector.current().await.backend_id(), "dify");

        config_store
            .update(|config| config.backend.platform = "coze".to_string())
            .await
            .expect("update");
        assert_eq!(selector.current().await.backend_id(), "coze");
    }

    #[tokio::test]
    async fn broken_reload_keeps_previous_adapter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (config_store, sessions) = test_store(&dir);
        let selector = BackendSelector::new(config_store.clone(), sessions)
            .await
            .expect("selector");

        config_store
            .update(|config| config.backend.platform = "gpt-anywhere".to_string())
            .await
            .expect("update");
        assert_eq!(selector.current().await.backend_id(), "dify");
        // And it stops re-attempting the rebuild until the next change.
        assert_eq!(selector.current().await.backend_id(), "dify");
    }

    #[tokio::test]
    async fn unknown_initial_platform_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (config_store, sessions) = test_store(&dir);
        config_store
            .update(|config| config.backend.platform = "nope".to_string())
            .await
            .expect("update");
        assert!(BackendSelector::new(config_store, sessions).await.is_err());
    }
}
