//! 日志初始化
//!
//! 工作进程的 stdout 是 IPC 通道，所以所有日志一律写 stderr。

use crate::config::LoggingConfig;

/// 安装全局 tracing subscriber；RUST_LOG 优先于配置文件中的级别。
///
/// 重复调用（例如测试里多次初始化）时静默忽略。
pub fn init(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("action_hub={}", cfg.level).into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match cfg.format.as_str() {
        "compact" => builder.compact().try_init(),
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber 已存在，跳过初始化");
    }
}
