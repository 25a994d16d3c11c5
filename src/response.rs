//! 动作执行结果与表单

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// 宿主需重放的不透明状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ActionState {
    /// 通知宿主丢弃已保存的状态（重新走登录流程）
    pub fn reset() -> Self {
        Self {
            data: Some("reset".to_string()),
            url: None,
        }
    }

    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            url: None,
        }
    }
}

/// 字段级校验错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

fn default_success() -> bool {
    true
}

/// 回传给宿主的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub refresh_query: bool,
    #[serde(default)]
    pub validation_errors: Vec<ValidationError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ActionState>,
    /// 只用于日志，不回传
    #[serde(skip)]
    pub webhook_id: Option<String>,
}

impl Default for ActionResponse {
    fn default() -> Self {
        Self {
            success: true,
            message: None,
            refresh_query: false,
            validation_errors: Vec::new(),
            state: None,
            webhook_id: None,
        }
    }
}

impl ActionResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn ok_with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "Unnamed Error".to_string();
        }
        Self {
            success: false,
            message: Some(message),
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: ActionState) -> Self {
        self.state = Some(state);
        self
    }

    /// 错误 → 结构化失败结果。
    ///
    /// 敏感错误只在服务端记录细节；`MissingAuth` 附带 `reset` 状态让宿主重新展示登录表单。
    pub fn from_error(err: &HubError) -> Self {
        if err.is_sensitive() {
            tracing::error!(code = err.stable_code(), "动作执行失败: {}", err);
        } else {
            tracing::info!(code = err.stable_code(), "动作执行失败");
        }
        let resp = Self::failure(err.public_message());
        match err {
            HubError::MissingAuth(_) => resp.with_state(ActionState::reset()),
            _ => resp,
        }
    }
}

/// 表单选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormOption {
    pub name: String,
    pub label: String,
}

/// 表单字段
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<FormOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_url: Option<String>,
}

/// 动作表单（也用于 delegate OAuth 的状态展示）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionForm {
    #[serde(default)]
    pub fields: Vec<FormField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ActionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionForm {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}
