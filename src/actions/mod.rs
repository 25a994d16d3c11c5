//! 内置动作

pub mod debug;

pub use debug::DebugAction;

use crate::error::HubError;
use crate::registry::RegistryBuilder;

/// 设置了该环境变量时注册调试动作
pub const DEBUG_ENDPOINT_ENV: &str = "ACTION_HUB_DEBUG_ENDPOINT";

/// 注册全部内置动作
pub fn register_builtin(builder: RegistryBuilder) -> Result<RegistryBuilder, HubError> {
    if std::env::var_os(DEBUG_ENDPOINT_ENV).is_some() {
        builder.register(DebugAction::new())
    } else {
        Ok(builder)
    }
}
