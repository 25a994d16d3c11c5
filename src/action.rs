//! 动作契约：描述符、校验与三种能力变体（普通 / OAuth / delegate OAuth）。

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HubError;
use crate::json_detail::Field;
use crate::request::{JobKind, JobRequest, ParamMap};
use crate::response::{ActionForm, ActionResponse};

/// 最低支持的调用方版本（未单独声明时）
pub const DEFAULT_MINIMUM_VERSION: semver::Version = semver::Version::new(5, 5, 0);

/// 安装级参数声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParameter {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// 字段要求：`tag` 精确匹配 / `any_tag` 任一 / `all_tags` 全部
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequiredField {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_tag: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all_tags: Vec<String>,
}

impl RequiredField {
    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, field: &Field) -> bool {
        if let Some(tag) = &self.tag
            && !field.has_tag(tag)
        {
            return false;
        }
        if !self.any_tag.is_empty() && !self.any_tag.iter().any(|t| field.has_tag(t)) {
            return false;
        }
        self.all_tags.iter().all(|t| field.has_tag(t))
    }

    fn describe(&self) -> String {
        if let Some(tag) = &self.tag {
            format!("a field tagged \"{tag}\"")
        } else if !self.any_tag.is_empty() {
            format!("a field tagged with any of: {}", self.any_tag.join(", "))
        } else {
            format!("a field tagged with all of: {}", self.all_tags.join(", "))
        }
    }
}

/// 支持的数据格式：固定列表，或随调用方版本变化
#[derive(Clone)]
pub enum SupportedFormats {
    Fixed(Vec<String>),
    ByVersion(fn(Option<&semver::Version>) -> Vec<String>),
}

impl fmt::Debug for SupportedFormats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupportedFormats::Fixed(list) => f.debug_tuple("Fixed").field(list).finish(),
            SupportedFormats::ByVersion(_) => f.write_str("ByVersion(..)"),
        }
    }
}

impl SupportedFormats {
    pub fn fixed<I, S>(formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SupportedFormats::Fixed(formats.into_iter().map(Into::into).collect())
    }

    pub fn resolve(&self, caller_version: Option<&semver::Version>) -> Vec<String> {
        match self {
            SupportedFormats::Fixed(list) => list.clone(),
            SupportedFormats::ByVersion(f) => f(caller_version),
        }
    }
}

/// 动作的静态元数据，启动时创建后不再变化
#[derive(Debug, Clone)]
pub struct ActionDescriptor {
    pub name: String,
    pub label: String,
    pub description: String,
    pub params: Vec<ActionParameter>,
    pub supported_action_types: Vec<JobKind>,
    /// None 表示不限制格式
    pub supported_formats: Option<SupportedFormats>,
    pub supported_formattings: Vec<String>,
    pub supported_visualization_formattings: Vec<String>,
    pub required_fields: Vec<RequiredField>,
    pub uses_streaming: bool,
    pub execute_in_own_process: bool,
    pub extended_action: bool,
    pub minimum_supported_version: semver::Version,
}

impl ActionDescriptor {
    pub fn new(
        name: impl Into<String>,
        label: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            description: description.into(),
            params: Vec::new(),
            supported_action_types: JobKind::ALL.to_vec(),
            supported_formats: None,
            supported_formattings: Vec::new(),
            supported_visualization_formattings: Vec::new(),
            required_fields: Vec::new(),
            uses_streaming: false,
            execute_in_own_process: false,
            extended_action: false,
            minimum_supported_version: DEFAULT_MINIMUM_VERSION,
        }
    }

    /// 调用方版本未知时视为可见
    pub fn is_supported_by(&self, caller_version: Option<&semver::Version>) -> bool {
        caller_version.is_none_or(|v| *v >= self.minimum_supported_version)
    }

    pub fn formats_for(&self, caller_version: Option<&semver::Version>) -> Option<Vec<String>> {
        self.supported_formats
            .as_ref()
            .map(|f| f.resolve(caller_version))
    }

    /// 在任何网络调用/流式读取之前完成的校验，按顺序：
    /// 作业类型 → 数据格式 → 必填凭据参数 → 字段要求 → 流式数据源。
    pub fn validate(&self, request: &JobRequest) -> Result<(), HubError> {
        let kinds = || {
            self.supported_action_types
                .iter()
                .map(JobKind::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        };
        match request.kind {
            Some(kind) if self.supported_action_types.contains(&kind) => {}
            Some(kind) => {
                return Err(HubError::UnsupportedRequest(format!(
                    "This action does not support requests of type \"{kind}\". The request must be of type: {}.",
                    kinds()
                )));
            }
            None => {
                return Err(HubError::UnsupportedRequest(format!(
                    "No request type specified. The request must be of type: {}.",
                    kinds()
                )));
            }
        }

        if let (Some(formats), Some(requested)) = (
            self.formats_for(request.caller_version.as_ref()),
            request.requested_format(),
        ) && !format_is_supported(&formats, &requested)
        {
            return Err(HubError::UnsupportedRequest(format!(
                "This action does not support the \"{requested}\" format. Supported formats: {}.",
                formats.join(", ")
            )));
        }

        check_required_params(&self.params, &request.params)?;

        if !self.required_fields.is_empty()
            && let Some(fieldset) = request.field_metadata()?
        {
            let fields = fieldset.all_fields();
            for required in &self.required_fields {
                if !fields.iter().any(|f| required.matches(f)) {
                    return Err(HubError::UnsupportedRequest(format!(
                        "This action requires {}.",
                        required.describe()
                    )));
                }
            }
        }

        if self.uses_streaming && request.empty() {
            return Err(HubError::UnsupportedRequest(
                "A streaming action was sent incompatible data. The action must have a download url or an attachment.".into(),
            ));
        }

        Ok(())
    }
}

/// 扩展名推断出的格式（如 `json`）可与同族的具体格式（`json_detail`）匹配
fn format_is_supported(formats: &[String], requested: &str) -> bool {
    formats.iter().any(|f| {
        f == requested || (requested == "json" && (f.starts_with("json") || f == "inline_json"))
    })
}

fn check_required_params(declared: &[ActionParameter], given: &ParamMap) -> Result<(), HubError> {
    for p in declared.iter().filter(|p| p.required) {
        let present = given.get(&p.name).is_some_and(|v| !v.is_empty());
        if !present {
            return Err(HubError::UnsupportedRequest(format!(
                "Required setting \"{}\" not specified in action settings.",
                p.label
            )));
        }
    }
    Ok(())
}

/// 单个作业的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Validating,
    Form,
    Executing,
    Succeeded,
    Failed,
}

impl JobPhase {
    pub fn can_advance_to(self, next: JobPhase) -> bool {
        use JobPhase::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Pending, Failed)
                | (Validating, Form)
                | (Validating, Executing)
                | (Validating, Failed)
                | (Form, Succeeded)
                | (Form, Failed)
                | (Executing, Succeeded)
                | (Executing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }
}

/// 作业阶段跟踪（只做日志与合法性检查）
#[derive(Debug)]
pub struct JobTracker {
    phase: JobPhase,
    label: String,
}

impl JobTracker {
    pub fn new(action: &str, webhook_id: Option<&str>) -> Self {
        Self {
            phase: JobPhase::Pending,
            label: format!("action={action} webhook_id={}", webhook_id.unwrap_or("-")),
        }
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn advance(&mut self, next: JobPhase) {
        if !self.phase.can_advance_to(next) {
            tracing::warn!("非法的作业阶段迁移 {:?} -> {:?} ({})", self.phase, next, self.label);
        }
        tracing::debug!("作业阶段 {:?} -> {:?} ({})", self.phase, next, self.label);
        self.phase = next;
    }
}

/// 所有动作共享的契约
#[async_trait]
pub trait Action: Send + Sync {
    fn descriptor(&self) -> &ActionDescriptor;

    async fn execute(&self, request: &JobRequest) -> Result<ActionResponse, HubError>;

    fn has_form(&self) -> bool {
        false
    }

    async fn form(&self, _request: &JobRequest) -> Result<ActionForm, HubError> {
        Ok(ActionForm::default())
    }

    /// OAuth 能力；非 OAuth 动作返回 None
    fn as_oauth(&self) -> Option<&dyn OAuthAction> {
        None
    }

    /// delegate OAuth 能力（由宿主代为授权）
    fn as_delegate_oauth(&self) -> Option<&dyn DelegateOAuthAction> {
        None
    }

    fn name(&self) -> &str {
        &self.descriptor().name
    }
}

/// 自行完成 OAuth 握手的动作
#[async_trait]
pub trait OAuthAction: Send + Sync {
    /// 当前安装的状态是否可用
    async fn oauth_check(&self, request: &JobRequest) -> Result<bool, HubError>;

    /// provider 授权页地址
    async fn oauth_url(&self, redirect_uri: &str, encrypted_state: &str) -> Result<String, HubError>;

    /// provider 回调：换取 token 并回写宿主
    async fn oauth_fetch_info(
        &self,
        url_params: &ParamMap,
        redirect_uri: &str,
    ) -> Result<(), HubError>;
}

/// 授权由宿主代为完成，只需要展示状态表单
#[async_trait]
pub trait DelegateOAuthAction: Send + Sync {
    async fn oauth_check(&self, request: &JobRequest) -> Result<ActionForm, HubError>;
}

pub fn is_oauth_action(action: &dyn Action) -> bool {
    action.as_oauth().is_some()
}

pub fn is_delegate_oauth_action(action: &dyn Action) -> bool {
    action.as_delegate_oauth().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{JobAttachment, ScheduledPlan};
    use serde_json::json;

    fn json_detail_request(fields: serde_json::Value) -> JobRequest {
        JobRequest {
            kind: Some(JobKind::Query),
            attachment: Some(JobAttachment {
                data_json: Some(json!({"fields": fields, "data": []})),
                file_extension: Some("json".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn descriptor() -> ActionDescriptor {
        let mut d = ActionDescriptor::new("mail", "Mail", "sends mail");
        d.supported_action_types = vec![JobKind::Query];
        d
    }

    #[test]
    fn rejects_unsupported_kind() {
        let d = descriptor();
        let mut req = json_detail_request(json!({}));
        req.kind = Some(JobKind::Cell);
        let err = d.validate(&req).unwrap_err();
        assert_eq!(
            err.public_message(),
            "This action does not support requests of type \"cell\". The request must be of type: query."
        );
        req.kind = None;
        assert!(d.validate(&req).is_err());
    }

    #[test]
    fn format_list_may_depend_on_caller_version() {
        fn by_version(v: Option<&semver::Version>) -> Vec<String> {
            match v {
                Some(v) if *v >= semver::Version::new(6, 2, 0) => {
                    vec!["csv".into(), "json_detail".into()]
                }
                _ => vec!["csv".into()],
            }
        }
        let mut d = descriptor();
        d.supported_formats = Some(SupportedFormats::ByVersion(by_version));

        let mut req = json_detail_request(json!({}));
        req.form_params.insert("format".into(), "json_detail".into());
        req.caller_version = Some(semver::Version::new(6, 0, 0));
        assert!(d.validate(&req).is_err());
        req.caller_version = Some(semver::Version::new(7, 0, 0));
        assert!(d.validate(&req).is_ok());

        // 扩展名推断出的 json 匹配 json_detail
        req.form_params.clear();
        assert!(d.validate(&req).is_ok());
    }

    #[test]
    fn required_params_are_checked_by_label() {
        let mut d = descriptor();
        d.params.push(ActionParameter {
            name: "api_key".into(),
            label: "API Key".into(),
            required: true,
            sensitive: true,
            description: None,
        });
        let mut req = json_detail_request(json!({}));
        let err = d.validate(&req).unwrap_err();
        assert_eq!(
            err.public_message(),
            "Required setting \"API Key\" not specified in action settings."
        );
        req.params.insert("api_key".into(), "k".into());
        assert!(d.validate(&req).is_ok());
    }

    #[test]
    fn required_fields_match_by_tag_predicates() {
        let mut d = descriptor();
        d.required_fields = vec![RequiredField {
            any_tag: vec!["email".into(), "user_id".into()],
            ..Default::default()
        }];
        let ok = json_detail_request(json!({"dimensions": [{"name": "u.id", "tags": ["user_id"]}]}));
        assert!(d.validate(&ok).is_ok());
        let bad = json_detail_request(json!({"dimensions": [{"name": "u.id", "tags": ["phone"]}]}));
        assert!(matches!(d.validate(&bad), Err(HubError::UnsupportedRequest(_))));

        d.required_fields = vec![RequiredField {
            all_tags: vec!["email".into(), "primary".into()],
            ..Default::default()
        }];
        let both = json_detail_request(json!({"measures": [{"name": "m", "tags": ["email", "primary"]}]}));
        assert!(d.validate(&both).is_ok());
        let one = json_detail_request(json!({"measures": [{"name": "m", "tags": ["email"]}]}));
        assert!(d.validate(&one).is_err());
    }

    #[test]
    fn malformed_field_metadata_is_rejected() {
        let mut d = descriptor();
        d.required_fields = vec![RequiredField::tag("email")];
        let req = json_detail_request(json!({"dimensions": "not a list"}));
        let err = d.validate(&req).unwrap_err();
        assert!(matches!(err, HubError::UnsupportedRequest(_)), "{err:?}");
        assert!(err.public_message().starts_with("Request field metadata is malformed"));

        // 没有字段要求的动作不关心元数据
        d.required_fields.clear();
        assert!(d.validate(&req).is_ok());
    }

    #[test]
    fn streaming_action_needs_a_source() {
        let mut d = descriptor();
        d.uses_streaming = true;
        let req = JobRequest {
            kind: Some(JobKind::Query),
            ..Default::default()
        };
        assert!(d.validate(&req).is_err());
        let req = JobRequest {
            kind: Some(JobKind::Query),
            scheduled_plan: Some(ScheduledPlan {
                download_url: Some("http://127.0.0.1:1/data".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(d.validate(&req).is_ok());
    }

    #[test]
    fn version_gate() {
        let mut d = descriptor();
        d.minimum_supported_version = semver::Version::new(7, 0, 0);
        assert!(!d.is_supported_by(Some(&semver::Version::new(6, 24, 0))));
        assert!(d.is_supported_by(Some(&semver::Version::new(7, 0, 0))));
        assert!(d.is_supported_by(None));
    }

    #[test]
    fn phase_transitions() {
        assert!(JobPhase::Pending.can_advance_to(JobPhase::Validating));
        assert!(JobPhase::Validating.can_advance_to(JobPhase::Form));
        assert!(JobPhase::Executing.can_advance_to(JobPhase::Failed));
        assert!(!JobPhase::Succeeded.can_advance_to(JobPhase::Executing));
        assert!(!JobPhase::Pending.can_advance_to(JobPhase::Executing));
        assert!(JobPhase::Failed.is_terminal());
    }
}
