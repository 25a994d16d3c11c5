use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 全局配置单例
static CONFIG: OnceCell<AppConfig> = OnceCell::new();

/// 动作中心基础配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// 对外可访问的基础地址（用于拼接 OAuth 登录链接等）
    #[serde(default = "HubConfig::default_base_url")]
    pub base_url: String,
    /// 展示名称
    #[serde(default = "HubConfig::default_label")]
    pub label: String,
    /// 动作白名单（为空表示不过滤）
    #[serde(default)]
    pub action_whitelist: Vec<String>,
    /// 是否允许把 `execute_in_own_process` 的动作派发到工作进程
    #[serde(default = "HubConfig::default_enable_forking")]
    pub enable_forking: bool,
}

impl HubConfig {
    fn default_base_url() -> String {
        "http://localhost:8080".to_string()
    }
    fn default_label() -> String {
        "Action Hub".to_string()
    }
    fn default_enable_forking() -> bool {
        true
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            label: Self::default_label(),
            action_whitelist: Vec::new(),
            enable_forking: Self::default_enable_forking(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
    /// 日志格式：full | compact
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
    fn default_format() -> String {
        "full".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

/// 远程拉取数据流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// 下载请求超时（毫秒），默认 13 分钟
    #[serde(default = "StreamConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// 下载方与消费方之间的有界通道容量（以 chunk 计）
    #[serde(default = "StreamConfig::default_channel_capacity")]
    pub channel_capacity: usize,
}

impl StreamConfig {
    fn default_request_timeout_ms() -> u64 {
        13 * 60 * 1000
    }
    fn default_channel_capacity() -> usize {
        16
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: Self::default_request_timeout_ms(),
            channel_capacity: Self::default_channel_capacity(),
        }
    }
}

/// 隔离工作进程池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// 工作进程可执行文件；为空时使用与当前进程同目录的 `action-hub-worker`
    #[serde(default)]
    pub program: Option<String>,
    /// 追加的命令行参数
    #[serde(default)]
    pub args: Vec<String>,
    /// 最大并发工作进程数
    #[serde(default = "WorkerConfig::default_max_workers")]
    pub max_workers: usize,
    /// 单个任务执行超时（秒），默认 2 小时
    #[serde(default = "WorkerConfig::default_execution_timeout")]
    pub execution_timeout_secs: u64,
    /// 空闲工作进程最长保留时间（秒）
    #[serde(default = "WorkerConfig::default_idle_lifetime")]
    pub idle_lifetime_secs: u64,
    /// kill 之后等待进程回收的宽限时间（毫秒）
    #[serde(default = "WorkerConfig::default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl WorkerConfig {
    fn default_max_workers() -> usize {
        2
    }
    fn default_execution_timeout() -> u64 {
        2 * 60 * 60
    }
    fn default_idle_lifetime() -> u64 {
        60
    }
    fn default_kill_grace_ms() -> u64 {
        2000
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn idle_lifetime(&self) -> Duration {
        Duration::from_secs(self.idle_lifetime_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            max_workers: Self::default_max_workers(),
            execution_timeout_secs: Self::default_execution_timeout(),
            idle_lifetime_secs: Self::default_idle_lifetime(),
            kill_grace_ms: Self::default_kill_grace_ms(),
        }
    }
}

/// 已退役但仍需可解密的密钥
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetiredKeyConfig {
    /// cipher id
    pub cipher_id: String,
    /// 存放十六进制密钥的环境变量名
    pub key_env: String,
}

/// 加密信封配置：只记录密钥所在的环境变量名，密钥本身不进配置文件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// 当前加密使用的 cipher id
    #[serde(default = "CryptoConfig::default_primary_cipher_id")]
    pub primary_cipher_id: String,
    /// 主密钥所在环境变量
    #[serde(default = "CryptoConfig::default_master_key_env")]
    pub master_key_env: String,
    /// 轮换期内仍可解密的旧密钥
    #[serde(default)]
    pub retired_keys: Vec<RetiredKeyConfig>,
}

impl CryptoConfig {
    fn default_primary_cipher_id() -> String {
        "master".to_string()
    }
    fn default_master_key_env() -> String {
        "CIPHER_MASTER".to_string()
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            primary_cipher_id: Self::default_primary_cipher_id(),
            master_key_env: Self::default_master_key_env(),
            retired_keys: Vec::new(),
        }
    }
}

/// OAuth 相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// access token 距离过期不足该秒数时先刷新
    #[serde(default = "OAuthConfig::default_refresh_margin")]
    pub refresh_margin_secs: u64,
}

impl OAuthConfig {
    fn default_refresh_margin() -> u64 {
        5 * 60
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: Self::default_refresh_margin(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

impl AppConfig {
    /// 从配置文件加载配置（文件可选），支持环境变量覆盖
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path();

        tracing::info!("正在从 {:?} 加载配置文件", config_path);

        let builder = ConfigBuilder::builder()
            // 配置文件不存在时全部使用默认值
            .add_source(File::from(config_path).required(false))
            // 支持环境变量覆盖，例如：APP_WORKER__MAX_WORKERS=4
            // 字段名本身含下划线，层级分隔符使用双下划线
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("hub.action_whitelist")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Self = builder.try_deserialize()?;
        config.apply_legacy_env(|key| std::env::var(key).ok());

        tracing::debug!(
            "配置加载完成: base_url = {}, forking = {}, max_workers = {}",
            config.hub.base_url,
            config.hub.enable_forking,
            config.worker.max_workers
        );

        Ok(config)
    }

    /// 兼容历史部署使用的环境变量名（优先级高于配置文件）
    pub fn apply_legacy_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ACTION_HUB_BASE_URL").filter(|v| !v.is_empty()) {
            self.hub.base_url = v;
        }
        if let Some(v) = lookup("ACTION_HUB_LABEL").filter(|v| !v.is_empty()) {
            self.hub.label = v;
        }
        if let Some(v) = lookup("ACTION_WHITELIST") {
            self.hub.action_whitelist = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("ACTION_HUB_ENABLE_FORKING") {
            // 只有显式写 false 才关闭
            self.hub.enable_forking = v.trim() != "false";
        }
        if let Some(v) = lookup("ACTION_HUB_STREAM_REQUEST_TIMEOUT") {
            match v.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.stream.request_timeout_ms = ms,
                _ => tracing::warn!("忽略无效的 ACTION_HUB_STREAM_REQUEST_TIMEOUT: {}", v),
            }
        }
    }

    /// 获取全局配置单例；尚未显式初始化时按需加载，加载失败回退到默认值
    pub fn global() -> &'static AppConfig {
        CONFIG.get_or_init(|| match Self::load() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("配置加载失败，使用默认配置: {}", e);
                let mut c = Self::default();
                c.apply_legacy_env(|key| std::env::var(key).ok());
                c
            }
        })
    }

    /// 初始化全局配置
    pub fn init_global() -> Result<(), ConfigError> {
        let config = Self::load()?;
        CONFIG
            .set(config)
            .map_err(|_| ConfigError::Message("配置已经被初始化".to_string()))?;
        Ok(())
    }

    /// 获取配置文件路径（可通过 ACTION_HUB_CONFIG 指定）
    fn get_config_path() -> PathBuf {
        std::env::var("ACTION_HUB_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.stream.request_timeout(), Duration::from_secs(13 * 60));
        assert_eq!(cfg.worker.max_workers, 2);
        assert_eq!(cfg.worker.execution_timeout(), Duration::from_secs(7200));
        assert_eq!(cfg.oauth.refresh_margin(), Duration::from_secs(300));
        assert_eq!(cfg.crypto.master_key_env, "CIPHER_MASTER");
        assert!(cfg.hub.enable_forking);
        assert!(cfg.hub.action_whitelist.is_empty());
    }

    #[test]
    fn legacy_env_overrides_apply() {
        let mut cfg = AppConfig::default();
        cfg.apply_legacy_env(lookup_from(&[
            ("ACTION_HUB_BASE_URL", "https://hub.example.com"),
            ("ACTION_WHITELIST", "debug, slack ,,"),
            ("ACTION_HUB_ENABLE_FORKING", "false"),
            ("ACTION_HUB_STREAM_REQUEST_TIMEOUT", "5000"),
        ]));
        assert_eq!(cfg.hub.base_url, "https://hub.example.com");
        assert_eq!(cfg.hub.action_whitelist, vec!["debug", "slack"]);
        assert!(!cfg.hub.enable_forking);
        assert_eq!(cfg.stream.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn forking_stays_enabled_unless_explicitly_false() {
        let mut cfg = AppConfig::default();
        cfg.apply_legacy_env(lookup_from(&[("ACTION_HUB_ENABLE_FORKING", "0")]));
        assert!(cfg.hub.enable_forking);
    }

    #[test]
    fn invalid_stream_timeout_is_ignored() {
        let mut cfg = AppConfig::default();
        cfg.apply_legacy_env(lookup_from(&[("ACTION_HUB_STREAM_REQUEST_TIMEOUT", "soon")]));
        assert_eq!(cfg.stream.request_timeout_ms, 13 * 60 * 1000);
    }
}
