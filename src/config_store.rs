// 配置存储：加载基础配置与覆盖配置，支持运行时更新并写回覆盖文件。
use crate::config::{load_config, override_config_path, Config};
use anyhow::Result;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::RwLock;
use tracing::warn;

/// Shared configuration handle. Every runtime update bumps the version
/// counter, which is what the backend selector watches for hot swaps.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<Config>>,
    override_path: PathBuf,
    version: Arc<AtomicU64>,
}

impl ConfigStore {
    pub fn new(override_path: PathBuf) -> Self {
        Self::with_config(load_config(), override_path)
    }

    pub fn with_config(config: Config, override_path: PathBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
            override_path,
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn get(&self) -> Config {
        self.inner.read().await.clone()
    }

    pub async fn update<F>(&self, updater: F) -> Result<Config>
    where
        F: FnOnce(&mut Config),
    {
        let mut guard = self.inner.write().await;
        updater(&mut guard);
        let updated = guard.clone();
        drop(guard);
        self.version.fetch_add(1, Ordering::SeqCst);
        self.persist(&updated).await?;
        Ok(updated)
    }

    async fn persist(&self, config: &Config) -> Result<()> {
        let value = serde_yaml::to_value(config).unwrap_or(Value::Null);
        let text = serde_yaml::to_string(&value).unwrap_or_default();
        if let Some(parent) = self.override_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        if let Err(err) = tokio::fs::write(&self.override_path, text).await {
            warn!(
                "writing override config failed: {}: {err}",
                self.override_path.display()
            );
        }
        Ok(())
    }

    pub fn override_path_default() -> PathBuf {
        Path::new(&override_config_path()).to_path_buf()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
