//! 作业请求：把内联附件与远程下载地址统一成一条字节流。

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{AppConfig, StreamConfig};
use crate::error::HubError;
use crate::json_detail::{Fieldset, JsonDetailVisitor, parse_detail};
use crate::json_stream::parse_rows;

/// 交给消费方的字节流。丢弃它即取消上游下载。
pub type JobByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, HubError>> + Send>>;

/// 参数表（表单参数 / 凭据参数）
pub type ParamMap = BTreeMap<String, String>;

const USER_AGENT_PREFIX: &str = "LookerOutgoingWebhook/";

/// 作业类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// 单元格更新
    Cell,
    /// 行导出 / 查询结果
    Query,
    /// 仪表盘导出
    Dashboard,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Cell, JobKind::Query, JobKind::Dashboard];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Cell => "cell",
            JobKind::Query => "query",
            JobKind::Dashboard => "dashboard",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cell" => Ok(JobKind::Cell),
            "query" => Ok(JobKind::Query),
            "dashboard" => Ok(JobKind::Dashboard),
            other => Err(HubError::UnsupportedRequest(format!(
                "Unknown request type \"{other}\"."
            ))),
        }
    }
}

/// 附件编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentEncoding {
    Base64,
    Utf8,
}

/// 内联附件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobAttachment {
    /// 解码后的原始字节；跨进程时以 base64 字符串传输
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Option::is_none")]
    pub data_buffer: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<AttachmentEncoding>,
    /// mimetype 为 application/json 时预先解析好的文档
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_json: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_extension: Option<String>,
}

/// 定时计划描述
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduledPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_plan_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters_differ_from_look: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// 一次作业请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub kind: Option<JobKind>,
    #[serde(default)]
    pub attachment: Option<JobAttachment>,
    /// 每次调用可变的表单参数
    #[serde(default)]
    pub form_params: ParamMap,
    /// 安装级凭据参数
    #[serde(default)]
    pub params: ParamMap,
    #[serde(default)]
    pub scheduled_plan: Option<ScheduledPlan>,
    #[serde(default)]
    pub action_id: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    /// 只用于日志关联
    #[serde(default)]
    pub webhook_id: Option<String>,
    #[serde(default)]
    pub caller_version: Option<semver::Version>,
}

/// 把 JSON 对象拍平成字符串表：字符串原样保留，数字/布尔转文本，null 丢弃
fn string_map(value: Option<&Value>) -> ParamMap {
    let mut out = ParamMap::new();
    if let Some(Value::Object(obj)) = value {
        for (k, v) in obj {
            let s = match v {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.insert(k.clone(), s);
        }
    }
    out
}

fn str_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// 从 `LookerOutgoingWebhook/<ver>` User-Agent 中提取调用方版本。
///
/// 只有 `major.minor` 时补 `.0`。
pub fn parse_caller_version(user_agent: &str) -> Option<semver::Version> {
    let rest = user_agent.split(USER_AGENT_PREFIX).nth(1)?;
    let raw = rest.split_whitespace().next()?.trim_start_matches('v');
    if let Ok(v) = semver::Version::parse(raw) {
        return Some(v);
    }
    if raw.split('.').count() == 2 {
        return semver::Version::parse(&format!("{raw}.0")).ok();
    }
    None
}

impl JobRequest {
    /// 解析宿主推送的 webhook JSON
    pub fn from_payload(json: &Value) -> Result<Self, HubError> {
        let obj = json
            .as_object()
            .ok_or_else(|| HubError::UnsupportedRequest("Request body must be a JSON object.".into()))?;

        let kind = match obj.get("type").and_then(Value::as_str) {
            Some(t) => Some(t.parse::<JobKind>()?),
            None => None,
        };

        let attachment = match obj.get("attachment") {
            Some(Value::Object(att)) => Some(Self::parse_attachment(att)?),
            _ => None,
        };

        let scheduled_plan = match obj.get("scheduled_plan") {
            Some(Value::Object(plan)) => Some(ScheduledPlan {
                scheduled_plan_id: plan.get("scheduled_plan_id").cloned(),
                title: str_field(plan, "title"),
                kind: str_field(plan, "type"),
                url: str_field(plan, "url"),
                query_id: plan.get("query_id").cloned(),
                query: plan.get("query").cloned(),
                filters_differ_from_look: plan
                    .get("filters_differ_from_look")
                    .and_then(Value::as_bool),
                download_url: str_field(plan, "download_url"),
            }),
            _ => None,
        };

        Ok(Self {
            kind,
            attachment,
            form_params: string_map(obj.get("form_params")),
            params: string_map(obj.get("data")),
            scheduled_plan,
            ..Default::default()
        })
    }

    fn parse_attachment(att: &serde_json::Map<String, Value>) -> Result<JobAttachment, HubError> {
        let mut out = JobAttachment {
            mime: str_field(att, "mimetype"),
            file_extension: str_field(att, "extension"),
            ..Default::default()
        };
        let (Some(mime), Some(data)) = (out.mime.clone(), att.get("data").and_then(Value::as_str))
        else {
            return Ok(out);
        };
        if data.is_empty() {
            return Ok(out);
        }

        let (encoding, buffer) = if mime.ends_with(";base64") {
            let decoded = STANDARD.decode(data.trim()).map_err(|e| {
                HubError::UnsupportedRequest(format!("Attachment data is not valid base64: {e}"))
            })?;
            (AttachmentEncoding::Base64, Bytes::from(decoded))
        } else {
            (AttachmentEncoding::Utf8, Bytes::from(data.to_string()))
        };

        // `application/json` 与 `application/json;base64` 都预先解析
        let media_type = mime.split(';').next().unwrap_or_default().trim();
        if media_type == "application/json" {
            out.data_json = Some(serde_json::from_slice(&buffer)?);
        }
        out.encoding = Some(encoding);
        out.data_buffer = Some(buffer);
        Ok(out)
    }

    /// 补充来自请求头/路由的元数据
    pub fn with_headers(
        mut self,
        instance_id: Option<String>,
        webhook_id: Option<String>,
        user_agent: Option<&str>,
    ) -> Self {
        self.instance_id = instance_id;
        self.webhook_id = webhook_id;
        self.caller_version = user_agent.and_then(parse_caller_version);
        self
    }

    /// 工作进程侧：从 IPC 信封里的 JSON 重建请求（字节缓冲由 base64 还原）
    pub fn from_ipc(value: Value) -> Result<Self, HubError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_ipc(&self) -> Result<Value, HubError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn download_url(&self) -> Option<&str> {
        self.scheduled_plan
            .as_ref()
            .and_then(|p| p.download_url.as_deref())
            .filter(|u| !u.is_empty())
    }

    pub fn attachment_buffer(&self) -> Option<&Bytes> {
        self.attachment.as_ref().and_then(|a| a.data_buffer.as_ref())
    }

    /// 既没有下载地址也没有附件
    pub fn empty(&self) -> bool {
        self.download_url().is_none() && self.attachment_buffer().is_none()
    }

    /// 内联文档中的字段元数据（流式请求拿不到）；`fields` 结构不合法时报错
    pub fn field_metadata(&self) -> Result<Option<Fieldset>, HubError> {
        let Some(fields) = self
            .attachment
            .as_ref()
            .and_then(|a| a.data_json.as_ref())
            .and_then(|d| d.get("fields"))
        else {
            return Ok(None);
        };
        serde_json::from_value(fields.clone()).map(Some).map_err(|e| {
            HubError::UnsupportedRequest(format!("Request field metadata is malformed: {e}"))
        })
    }

    /// 请求的数据格式：优先表单参数 `format`，其次由附件扩展名推断
    pub fn requested_format(&self) -> Option<String> {
        if let Some(f) = self.form_params.get("format").filter(|f| !f.is_empty()) {
            return Some(f.clone());
        }
        let ext = self.attachment.as_ref()?.file_extension.as_deref()?;
        Some(ext.to_ascii_lowercase())
    }

    /// 日志用的简短上下文
    pub fn log_context(&self) -> String {
        format!(
            "webhook_id={} action={} instance={}",
            self.webhook_id.as_deref().unwrap_or("-"),
            self.action_id.as_deref().unwrap_or("-"),
            self.instance_id.as_deref().unwrap_or("-"),
        )
    }

    // =============== 文件名与消息辅助 ===============

    /// 推荐文件名：`<计划标题>.<扩展名>`，没有标题时 `looker_file_<毫秒时间戳>`
    pub fn suggested_filename(&self) -> String {
        let title = self
            .scheduled_plan
            .as_ref()
            .and_then(|p| p.title.as_deref())
            .filter(|t| !t.is_empty());
        let stem = match title {
            Some(t) => t.to_string(),
            None => format!("looker_file_{}", chrono::Utc::now().timestamp_millis()),
        };

        let ext = match &self.attachment {
            Some(att) => att.file_extension.clone(),
            None => self.form_params.get("format").map(|f| format_to_extension(f)),
        };
        match ext {
            Some(ext) if !ext.is_empty() => sanitize_filename(&format!("{stem}.{ext}")),
            _ => {
                tracing::warn!("无法推断文件扩展名，使用默认文件名 ({})", self.log_context());
                sanitize_filename(&stem)
            }
        }
    }

    /// 表单里指定了 `filename` 时：去掉空白、补齐扩展名
    pub fn complete_filename(&self) -> Option<String> {
        let filename = self.form_params.get("filename")?;
        let ext = self
            .attachment
            .as_ref()
            .and_then(|a| a.file_extension.as_deref());
        let Some(ext) = ext else {
            return Some(filename.clone());
        };
        let cleaned: String = filename
            .trim()
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();
        if filename.ends_with(ext) {
            Some(cleaned)
        } else if filename.contains('.') {
            Some(self.suggested_filename())
        } else {
            Some(format!("{cleaned}.{ext}"))
        }
    }

    /// 标题 + URL + 附件前 `max_lines` 行，总长不超过 `max_chars`
    pub fn suggested_truncated_message(&self, max_lines: usize, max_chars: usize) -> Option<String> {
        let buffer = self.attachment_buffer()?;
        let mut head = String::new();
        if let Some(plan) = &self.scheduled_plan {
            if let Some(title) = plan.title.as_deref().filter(|t| !t.is_empty()) {
                head.push_str(title);
                head.push_str(":\n");
            }
            if let Some(url) = plan.url.as_deref().filter(|u| !u.is_empty()) {
                head.push_str(url);
                head.push('\n');
            }
        }
        let text = String::from_utf8_lossy(buffer);
        let mut lines: Vec<&str> = text.split('\n').take(max_lines).collect();
        if lines.len() == max_lines {
            lines.push("");
        }
        let body = format!("{head}{}", lines.join("\n"));
        Some(truncate_string(&body, max_chars))
    }

    // =============== 流式读取 ===============

    /// 使用全局配置的 [`JobRequest::stream_with`]
    pub async fn stream<F, Fut, T>(&self, consumer: F) -> Result<T, HubError>
    where
        F: FnOnce(JobByteStream) -> Fut,
        Fut: Future<Output = Result<T, HubError>>,
    {
        self.stream_with(&AppConfig::global().stream, consumer).await
    }

    /// 把数据源交给 `consumer`，待下载与消费都结束后返回消费方的结果。
    ///
    /// - 有下载地址：后台任务拉取并经有界通道转发，消费慢时反压下载；
    /// - 只有附件：一次性产出整个缓冲；
    /// - 都没有：立即返回 `StreamSource`。
    pub async fn stream_with<F, Fut, T>(&self, cfg: &StreamConfig, consumer: F) -> Result<T, HubError>
    where
        F: FnOnce(JobByteStream) -> Fut,
        Fut: Future<Output = Result<T, HubError>>,
    {
        if let Some(url) = self.download_url() {
            tracing::info!("开始远程拉取数据流 ({})", self.log_context());
            let client = crate::http::stream_client(cfg.request_timeout())?;
            let (tx, rx) = mpsc::channel(cfg.channel_capacity.max(1));
            let producer = tokio::spawn(pump_download(
                client,
                url.to_string(),
                tx,
                self.log_context(),
            ));

            let bytes: JobByteStream = Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }));

            return match consumer(bytes).await {
                Ok(value) => match producer.await {
                    Ok(Ok(())) => Ok(value),
                    Ok(Err(e)) => Err(e),
                    Err(join) => Err(HubError::Internal(format!("下载任务异常退出: {join}"))),
                },
                Err(e) => {
                    // 消费方放弃：立即终止上游请求
                    producer.abort();
                    Err(e)
                }
            };
        }

        if let Some(buffer) = self.attachment_buffer() {
            tracing::debug!("使用内联附件作为数据流 ({})", self.log_context());
            let chunk = buffer.clone();
            let bytes: JobByteStream = Box::pin(stream::once(async move { Ok(chunk) }));
            return consumer(bytes).await;
        }

        Err(HubError::StreamSource(
            "Request has neither an attachment nor a download url to stream from.".into(),
        ))
    }

    /// 顶层 JSON 数组逐行回调，返回行数
    pub async fn stream_json<F>(&self, on_row: F) -> Result<u64, HubError>
    where
        F: FnMut(Value) -> Result<(), HubError> + Send,
    {
        let ctx = self.log_context();
        let result = self.stream(|bytes| parse_rows(bytes, on_row)).await;
        match &result {
            Ok(rows) => tracing::info!("[stream_json] 完成，rows = {} ({})", rows, ctx),
            // 错误可能来自动作回调、可能含用户数据，只记录发生了错误
            Err(_) => tracing::info!("[stream_json] 报告了错误 ({})", ctx),
        }
        result
    }

    /// `json_detail` 文档按区段回调，返回行数
    pub async fn stream_json_detail<V>(&self, visitor: &mut V) -> Result<u64, HubError>
    where
        V: JsonDetailVisitor + ?Sized,
    {
        let ctx = self.log_context();
        let result = self.stream(|bytes| parse_detail(bytes, visitor)).await;
        match &result {
            Ok(rows) => tracing::info!("[stream_json_detail] 完成，rows = {} ({})", rows, ctx),
            Err(_) => tracing::info!("[stream_json_detail] 报告了错误 ({})", ctx),
        }
        result
    }
}

/// 后台下载任务：把响应体逐块送入通道。
async fn pump_download(
    client: reqwest::Client,
    url: String,
    tx: mpsc::Sender<Result<Bytes, HubError>>,
    ctx: String,
) -> Result<(), HubError> {
    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            let err = HubError::from(e);
            let _ = tx.send(Err(err.clone())).await;
            return Err(err);
        }
    };

    let status = response.status();
    if !status.is_success() {
        let err = HubError::Stream(format!("Download failed with HTTP status {status}."));
        let _ = tx.send(Err(err.clone())).await;
        return Err(err);
    }

    let expected = response.content_length();
    let mut received: u64 = 0;
    let mut body = response.bytes_stream();

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("消费方已关闭数据流，终止下载 ({})", ctx);
                return Ok(());
            }
            next = body.next() => next,
        };

        match next {
            None => break,
            Some(Ok(chunk)) => {
                received += chunk.len() as u64;
                if tx.send(Ok(chunk)).await.is_err() {
                    tracing::debug!("消费方已关闭数据流，终止下载 ({})", ctx);
                    return Ok(());
                }
            }
            Some(Err(e)) => {
                if expected.is_some_and(|n| received >= n) && is_connection_reset(&e) {
                    tracing::info!(
                        "传输完成后连接被重置，忽略 (received = {}, {})",
                        received,
                        ctx
                    );
                    break;
                }
                let err = if e.is_timeout() {
                    HubError::Timeout(format!("Download timed out after {received} bytes."))
                } else {
                    HubError::Stream(format!("Download interrupted after {received} bytes: {e}"))
                };
                let _ = tx.send(Err(err.clone())).await;
                return Err(err);
            }
        }
    }

    tracing::debug!("下载完成，bytes = {} ({})", received, ctx);
    Ok(())
}

/// 错误链中是否包含 ECONNRESET
fn is_connection_reset(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::ConnectionReset
        {
            return true;
        }
        current = e.source();
    }
    false
}

/// 数据格式到文件扩展名
pub fn format_to_extension(format: &str) -> String {
    match format {
        "csv" => "csv",
        "csv_zip" => "zip",
        "txt" => "txt",
        "xlsx" => "xlsx",
        "html" | "wysiwyg_html" => "html",
        "wysiwyg_pdf" | "assembled_pdf" => "pdf",
        "wysiwyg_png" => "png",
        f if f.starts_with("json") || f == "inline_json" => "json",
        other => other,
    }
    .to_string()
}

/// 超长时截断，并尽量退回到上一处换行
pub fn truncate_string(s: &str, limit: usize) -> String {
    if s.chars().count() <= limit {
        return s.to_string();
    }
    let cut: String = s.chars().take(limit).collect();
    match cut.rfind('\n') {
        Some(pos) if pos > 0 => cut[..=pos].to_string(),
        _ => cut,
    }
}

/// 去掉路径分隔符、保留字符和控制字符，限制在 255 字节内
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '/' | '\\' | '?' | '<' | '>' | ':' | '*' | '|' | '"'))
        .collect();
    if out == "." || out == ".." {
        out.clear();
    }
    while out.ends_with('.') || out.ends_with(' ') {
        out.pop();
    }
    if out.len() > 255 {
        let mut end = 255;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }
    out
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| STANDARD.decode(s).map(Bytes::from))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}
