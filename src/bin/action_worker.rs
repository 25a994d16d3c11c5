//! 隔离执行的工作进程：stdin 读任务，stdout 写结果，日志走 stderr。

use std::sync::Arc;

use action_hub::actions::register_builtin;
use action_hub::config::AppConfig;
use action_hub::registry::RegistryBuilder;
use action_hub::{telemetry, xpc};

#[tokio::main]
async fn main() {
    let config = AppConfig::global();
    telemetry::init(&config.logging);

    let registry = match register_builtin(RegistryBuilder::new()) {
        Ok(builder) => Arc::new(builder.build(&config.hub.action_whitelist)),
        Err(e) => {
            tracing::error!("动作注册失败: {}", e);
            std::process::exit(1);
        }
    };
    tracing::debug!("工作进程已加载 {} 个动作", registry.len());

    if let Err(e) = xpc::worker::serve_stdio(registry).await {
        tracing::error!("工作进程异常退出: {}", e);
        std::process::exit(1);
    }
}
