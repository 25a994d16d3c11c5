use std::any::Any;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HubError;
use crate::request::JobRequest;
use crate::response::ActionResponse;

/// 父进程 → 工作进程
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    pub task_id: String,
    pub action_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_version: Option<semver::Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<String>,
    /// 扩展动作：工作进程按扩展动作查找，不受白名单与版本过滤
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub extended: bool,
    /// 序列化后的 [`JobRequest`]
    pub request: Value,
}

impl WorkerTask {
    pub fn new(action_id: &str, request: &JobRequest) -> Result<Self, HubError> {
        Ok(Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            action_id: action_id.to_string(),
            caller_version: request.caller_version.clone(),
            webhook_id: request.webhook_id.clone(),
            extended: false,
            request: request.to_ipc()?,
        })
    }

    pub fn extended(action_id: &str, request: &JobRequest) -> Result<Self, HubError> {
        Ok(Self {
            extended: true,
            ..Self::new(action_id, request)?
        })
    }
}

/// 工作进程 → 父进程
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    pub task_id: String,
    #[serde(flatten)]
    pub response: ActionResponse,
}

/// panic 负载转成可读文案：字符串原样、错误取其消息、JSON 对象取 `message` 字段，
/// 其余一律 "Unnamed Error"。
pub fn stringify_panic(payload: &(dyn Any + Send)) -> String {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<HubError>() {
        err.public_message()
    } else if let Some(err) = payload.downcast_ref::<Box<dyn std::error::Error + Send + Sync>>() {
        err.to_string()
    } else if let Some(value) = payload.downcast_ref::<Value>() {
        stringify_value(value)
    } else {
        String::new()
    };
    if message.trim().is_empty() {
        "Unnamed Error".to_string()
    } else {
        message
    }
}

fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("message") {
            Some(Value::String(m)) => m.clone(),
            _ => value.to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
