use thiserror::Error;

/// 动作中心统一错误类型
///
/// `Display` 输出（带中文前缀）只用于服务端日志；
/// 回传给宿主的文案统一走 [`HubError::public_message`]。
#[derive(Error, Debug, Clone)]
pub enum HubError {
    /// 请求在任何副作用之前未通过校验（修正请求后可安全重试）
    #[error("请求不受支持: {0}")]
    UnsupportedRequest(String),

    /// 既没有附件也没有下载地址（调用方配置问题）
    #[error("缺少数据源: {0}")]
    StreamSource(String),

    /// 状态 blob 缺失/无效/无法刷新，需要重新登录
    #[error("缺少授权: {0}")]
    MissingAuth(String),

    /// 密钥材料缺失或格式错误
    #[error("加密配置错误: {0}")]
    CryptoConfig(String),

    /// 密文损坏、被篡改或 cipher id 未知
    #[error("解密失败: {0}")]
    Decrypt(String),

    /// 注册表中不存在该动作（或对当前调用方版本不可见）
    #[error("未找到动作: {0}")]
    ActionNotFound(String),

    /// 下载流错误（非 2xx、连接中断等）
    #[error("数据流错误: {0}")]
    Stream(String),

    /// JSON 解析错误
    #[error("JSON 解析错误: {0}")]
    Json(String),

    /// 网络请求错误
    #[error("网络错误: {0}")]
    Network(String),

    /// 上游请求超时（包含 connect/read 等阶段）
    #[error("请求超时: {0}")]
    Timeout(String),

    /// 隔离工作进程失败（超时、崩溃、协议错误）
    #[error("工作进程错误: {0}")]
    Worker(String),

    /// 动作自身报告的失败（供应商 API 错误等），原样回传
    #[error("动作执行失败: {0}")]
    Handler(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 不可对外暴露细节的错误统一使用的文案
pub const GENERIC_FAILURE_MESSAGE: &str = "An internal error occurred while processing this request.";

impl HubError {
    /// 稳定的错误码，用于程序化处理与日志聚合。
    pub fn stable_code(&self) -> &'static str {
        match self {
            HubError::UnsupportedRequest(_) => "UNSUPPORTED_REQUEST",
            HubError::StreamSource(_) => "STREAM_SOURCE_MISSING",
            HubError::MissingAuth(_) => "MISSING_AUTH",
            HubError::CryptoConfig(_) => "CRYPTO_CONFIG",
            HubError::Decrypt(_) => "DECRYPT_FAILED",
            HubError::ActionNotFound(_) => "ACTION_NOT_FOUND",
            HubError::Stream(_) => "STREAM_FAILED",
            HubError::Json(_) => "INVALID_JSON",
            HubError::Network(_) => "UPSTREAM_ERROR",
            HubError::Timeout(_) => "UPSTREAM_TIMEOUT",
            HubError::Worker(_) => "WORKER_FAILED",
            HubError::Handler(_) => "HANDLER_FAILED",
            HubError::Io(_) => "IO_ERROR",
            HubError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否属于部署配置/篡改/内部故障：这类错误只在服务端记录完整细节。
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            HubError::CryptoConfig(_)
                | HubError::Decrypt(_)
                | HubError::Io(_)
                | HubError::Internal(_)
        )
    }

    /// 回传给宿主的文案。
    pub fn public_message(&self) -> String {
        if self.is_sensitive() {
            return GENERIC_FAILURE_MESSAGE.to_string();
        }
        match self {
            HubError::UnsupportedRequest(m)
            | HubError::StreamSource(m)
            | HubError::MissingAuth(m)
            | HubError::ActionNotFound(m)
            | HubError::Stream(m)
            | HubError::Json(m)
            | HubError::Network(m)
            | HubError::Timeout(m)
            | HubError::Worker(m)
            | HubError::Handler(m) => m.clone(),
            _ => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }

    /// 便捷构造：动作内部的任意失败
    pub fn handler(msg: impl Into<String>) -> Self {
        HubError::Handler(msg.into())
    }
}

// =============== Error conversions for common external errors ===============

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HubError::Timeout(err.to_string())
        } else {
            HubError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Json(err.to_string())
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::Io(err.to_string())
    }
}
