// 配置读取与覆盖合并：基础 YAML + 管理端覆盖文件 + 环境变量占位符。
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub stickers: HashMap<String, StickerAsset>,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL, used to build asset URLs the gateway pulls.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Where the settings command points operators to.
    #[serde(default)]
    pub settings_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8002,
            public_base_url: None,
            settings_url: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub app_id: String,
    /// The bridged account's own wxid; callbacks also carry it, this is the
    /// fallback for payloads that do not.
    #[serde(default)]
    pub wxid: Option<String>,
    /// Callback URL registered with the gateway on startup.
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Operator peer allowed to run `#` commands.
    #[serde(default)]
    pub master_wxid: Option<String>,
    /// Alternative to `master_wxid`: resolved to a peer id through the
    /// gateway's contact directory on first use.
    #[serde(default)]
    pub master_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Quiet period of the debounce aggregator, seconds.
    pub quiet_period_s: u64,
    /// Inbound events older than this are classified stale, seconds.
    pub stale_window_s: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quiet_period_s: 5,
            stale_window_s: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Active platform: "dify" or "coze".
    pub platform: String,
    pub timeout_s: u64,
    #[serde(default)]
    pub dify: DifyConfig,
    #[serde(default)]
    pub coze: CozeConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            platform: "dify".to_string(),
            timeout_s: 120,
            dify: DifyConfig::default(),
            coze: CozeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DifyConfig {
    /// Server address; `/v1` is appended when missing, `http://` when bare.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

impl DifyConfig {
    pub fn api_base(&self) -> String {
        let trimmed = self.base_url.trim().trim_end_matches('/');
        let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("http://{trimmed}")
        };
        if with_scheme.ends_with("/v1") {
            with_scheme
        } else {
            format!("{with_scheme}/v1")
        }
    }

    /// Origin without the `/v1` suffix, used to absolutize relative voice links.
    pub fn origin(&self) -> String {
        self.api_base()
            .trim_end_matches("/v1")
            .trim_end_matches('/')
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CozeConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub bot_id: String,
}

impl Default for CozeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coze.cn".to_string(),
            api_token: String::new(),
            bot_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub ffmpeg_path: String,
    pub silk_encoder_path: String,
    /// Target sample rate of the channel codec.
    pub sample_rate: u32,
    pub timeout_s: u64,
    /// Per-invocation temp files live here; defaults to the system temp dir.
    #[serde(default)]
    pub tmp_dir: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            silk_encoder_path: "silk_v3_encoder".to_string(),
            sample_rate: 24000,
            timeout_s: 60,
            tmp_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickerAsset {
    pub md5: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    pub store_path: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            store_path: "data/sessions.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn api_key(&self) -> Option<String> {
        self.server
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .or_else(|| {
                env::var("WXBRIDGE_API_KEY")
                    .ok()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
    }
}

pub fn base_config_path() -> String {
    env::var("WXBRIDGE_CONFIG_PATH").unwrap_or_else(|_| "wxbridge.yaml".to_string())
}

pub fn override_config_path() -> String {
    env::var("WXBRIDGE_CONFIG_OVERRIDE_PATH")
        .unwrap_or_else(|_| "data/wxbridge.override.yaml".to_string())
}

pub fn load_config() -> Config {
    let base_path = base_config_path();
    let override_path = override_config_path();

    let mut merged = read_yaml(&base_path);
    if Path::new(&override_path).exists() {
        // 只对非空字段做递归覆盖，避免误清空已有配置。
        merge_yaml(&mut merged, read_yaml(&override_path));
    }
    expand_yaml_env(&mut merged);

    if merged.is_null() {
        return Config::default();
    }
    serde_yaml::from_value::<Config>(merged).unwrap_or_else(|err| {
        warn!("config parse failed, falling back to defaults: {err}");
        Config::default()
    })
}

fn read_yaml(path: &str) -> Value {
    // 配置文件允许不存在，首次启动直接用默认值。
    let content = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return Value::Null,
    };
    serde_yaml::from_str(&content).unwrap_or_else(|err| {
        warn!("yaml parse failed: {path}, {err}");
        Value::Null
    })
}

fn merge_yaml(base: &mut Value, override_value: Value) {
    match (base, override_value) {
        (Value::Mapping(base_map), Value::Mapping(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => {
            if !value.is_null() {
                *slot = value;
            }
        }
    }
}

fn expand_yaml_env(value: &mut Value) {
    match value {
        Value::String(text) => *text = expand_env_placeholders(text),
        Value::Sequence(items) => items.iter_mut().for_each(expand_yaml_env),
        Value::Mapping(map) => map.iter_mut().for_each(|(_, item)| expand_yaml_env(item)),
        _ => {}
    }
}

fn expand_env_placeholders(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            output.push_str("${");
            output.push_str(rest);
            return output;
        };
        let inner = &rest[..end];
        rest = &rest[end + 1..];
        let (name, fallback) = match inner.split_once(":-") {
            Some((name, fallback)) => (name.trim(), Some(fallback)),
            None => (inner.trim(), None),
        };
        match env::var(name).ok().filter(|value| !value.is_empty()) {
            Some(value) => output.push_str(&value),
            None => output.push_str(fallback.unwrap_or("")),
        }
    }
    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();
        assert_eq!(config.server.port, 8002);
        assert_eq!(config.engine.quiet_period_s, 5);
        assert_eq!(config.engine.stale_window_s, 300);
        assert_eq!(config.backend.platform, "dify");
        assert_eq!(config.voice.sample_rate, 24000);
    }

    #[test]
    fn dify_api_base_normalizes() {
        let bare = DifyConfig {
            base_url: "192.168.1.10".to_string(),
            api_key: String::new(),
        };
        assert_eq!(bare.api_base(), "http://192.168.1.10/v1");
        assert_eq!(bare.origin(), "http://192.168.1.10");

        let full = DifyConfig {
            base_url: "https://dify.example.com/v1/".to_string(),
            api_key: String::new(),
        };
        assert_eq!(full.api_base(), "https://dify.example.com/v1");
    }

    #[test]
    fn merge_keeps_base_fields() {
        let mut base = serde_yaml::from_str::<Value>("backend:\n  platform: dify\n  timeout_s: 30")
            .expect("base yaml");
        let override_value =
            serde_yaml::from_str::<Value>("backend:\n  platform: coze").expect("override yaml");
        merge_yaml(&mut base, override_value);
        let config: Config = serde_yaml::from_value(base).expect("merged config");
        assert_eq!(config.backend.platform, "coze");
        assert_eq!(config.backend.timeout_s, 30);
    }

    #[test]
    fn env_placeholders_expand() {
        std::env::remove_var("WXBRIDGE_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("${WXBRIDGE_TEST_PLACEHOLDER:-fallback}"),
            "fallback"
        );
        std::env::set_var("WXBRIDGE_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("a-${WXBRIDGE_TEST_PLACEHOLDER}-b"),
            "a-value-b"
        );
        std::env::remove_var("WXBRIDGE_TEST_PLACEHOLDER");
    }
}
