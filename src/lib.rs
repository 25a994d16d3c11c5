//! 动作中心核心
//!
//! 接收描述数据导出作业的 webhook 负载，路由到可插拔的动作，返回结构化结果。
//!
//! - [`crypto`]：跨重定向链路携带状态的加密信封
//! - [`request`] / [`json_stream`] / [`json_detail`]：附件与远程下载统一成字节流，增量 JSON 解析
//! - [`action`] / [`registry`]：动作契约与注册表
//! - [`xpc`]：工作进程隔离执行
//! - [`oauth`]：OAuth 握手编排
//! - [`dispatcher`]：把以上组件串成一次作业

/// 统一错误处理模块
pub mod error;

/// 配置模块
pub mod config;

/// 日志初始化
pub mod telemetry;

/// HTTP Client 复用工具
pub mod http;

pub mod crypto;
pub mod json_detail;
pub mod json_stream;
pub mod request;
pub mod response;

pub mod action;
pub mod registry;

pub mod xpc;

pub mod oauth;

pub mod dispatcher;

/// 内置动作
pub mod actions;

// 导出常用类型供外部使用
pub use action::{Action, ActionDescriptor, DelegateOAuthAction, OAuthAction};
pub use config::AppConfig;
pub use crypto::{ActionCrypto, EncryptedPayload};
pub use dispatcher::{Dispatcher, RequestMeta};
pub use error::HubError;
pub use registry::{ActionRegistry, RegistryBuilder};
pub use request::{JobKind, JobRequest};
pub use response::{ActionForm, ActionResponse, ActionState};
