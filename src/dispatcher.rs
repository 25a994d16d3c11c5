//! 作业分发：查找动作 → 校验 → 进程内执行或派发到工作进程。
//!
//! 对宿主而言所有结果都是 [`ActionResponse`]；这里不向上传播错误。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;

use crate::action::{JobPhase, JobTracker};
use crate::config::AppConfig;
use crate::error::HubError;
use crate::registry::ActionRegistry;
use crate::request::JobRequest;
use crate::response::{ActionForm, ActionResponse};
use crate::xpc::{ExecuteProcessQueue, WorkerTask, stringify_panic};

/// 来自宿主请求头的元数据
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub instance_id: Option<String>,
    pub webhook_id: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ActionRegistry>,
    queue: Option<ExecuteProcessQueue>,
    enable_forking: bool,
}

impl Dispatcher {
    /// 不带工作进程池：所有动作都在当前进程执行
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self {
            registry,
            queue: None,
            enable_forking: AppConfig::global().hub.enable_forking,
        }
    }

    pub fn with_queue(mut self, queue: ExecuteProcessQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn forking(mut self, enabled: bool) -> Self {
        self.enable_forking = enabled;
        self
    }

    /// 按全局配置组装（工作进程池按配置创建）
    pub fn from_global(registry: Arc<ActionRegistry>) -> Result<Self, HubError> {
        let cfg = AppConfig::global();
        let queue = ExecuteProcessQueue::new(&cfg.worker)?;
        Ok(Self::new(registry)
            .with_queue(queue)
            .forking(cfg.hub.enable_forking))
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// 宿主原始 JSON 入口
    pub async fn execute_payload(
        &self,
        action_id: &str,
        payload: &serde_json::Value,
        meta: RequestMeta,
    ) -> ActionResponse {
        match JobRequest::from_payload(payload) {
            Ok(request) => {
                let request =
                    request.with_headers(meta.instance_id, meta.webhook_id, meta.user_agent.as_deref());
                self.execute(action_id, request).await
            }
            Err(e) => ActionResponse::from_error(&e),
        }
    }

    pub async fn execute(&self, action_id: &str, request: JobRequest) -> ActionResponse {
        self.run_job(action_id, request, false).await
    }

    /// 扩展动作入口：查找不受白名单与版本过滤，配置了工作进程池时总是隔离执行
    pub async fn execute_extended(&self, action_id: &str, request: JobRequest) -> ActionResponse {
        self.run_job(action_id, request, true).await
    }

    async fn run_job(&self, action_id: &str, mut request: JobRequest, extended: bool) -> ActionResponse {
        let mut tracker = JobTracker::new(action_id, request.webhook_id.as_deref());
        request.action_id = Some(action_id.to_string());

        let lookup = if extended {
            self.registry.find_extended_action(action_id)
        } else {
            self.registry
                .find_action(action_id, request.caller_version.as_ref())
        };
        let action = match lookup {
            Ok(a) => a,
            Err(e) => {
                tracker.advance(JobPhase::Failed);
                return self.finish(ActionResponse::from_error(&e), &request);
            }
        };

        tracker.advance(JobPhase::Validating);
        let descriptor = action.descriptor();
        if let Err(e) = descriptor.validate(&request) {
            tracker.advance(JobPhase::Failed);
            return self.finish(ActionResponse::from_error(&e), &request);
        }

        tracker.advance(JobPhase::Executing);
        tracing::info!("开始执行动作 ({})", request.log_context());
        let isolate = extended || (descriptor.execute_in_own_process && self.enable_forking);
        let response = match (&self.queue, isolate) {
            (Some(queue), true) => {
                let task = if extended {
                    WorkerTask::extended(action_id, &request)
                } else {
                    WorkerTask::new(action_id, &request)
                };
                match task {
                    Ok(task) => queue.run(task).await,
                    Err(e) => ActionResponse::from_error(&e),
                }
            }
            (None, true) => {
                tracing::warn!("未配置工作进程池，动作 {} 在当前进程执行", action_id);
                run_in_process(action.as_ref(), &request).await
            }
            _ => run_in_process(action.as_ref(), &request).await,
        };

        tracker.advance(if response.success {
            JobPhase::Succeeded
        } else {
            JobPhase::Failed
        });
        self.finish(response, &request)
    }

    /// 表单：delegate OAuth 动作在 `test` 请求时返回授权状态表单
    pub async fn form(&self, action_id: &str, request: JobRequest) -> ActionForm {
        let mut tracker = JobTracker::new(action_id, request.webhook_id.as_deref());
        let action = match self
            .registry
            .find_action(action_id, request.caller_version.as_ref())
        {
            Ok(a) => a,
            Err(e) => {
                tracker.advance(JobPhase::Failed);
                return ActionForm::error(e.public_message());
            }
        };
        tracker.advance(JobPhase::Validating);
        tracker.advance(JobPhase::Form);

        let result = match action.as_delegate_oauth() {
            Some(delegate) if request.params.contains_key("test") => {
                delegate.oauth_check(&request).await
            }
            _ => action.form(&request).await,
        };
        match result {
            Ok(form) => {
                tracker.advance(JobPhase::Succeeded);
                form
            }
            Err(e) => {
                tracker.advance(JobPhase::Failed);
                let resp = ActionResponse::from_error(&e);
                ActionForm {
                    fields: Vec::new(),
                    state: resp.state,
                    error: resp.message,
                }
            }
        }
    }

    fn finish(&self, mut response: ActionResponse, request: &JobRequest) -> ActionResponse {
        response.webhook_id = request.webhook_id.clone();
        if response.success {
            tracing::info!("动作执行完成 ({})", request.log_context());
        } else {
            tracing::info!(
                "动作执行失败 ({}): {}",
                request.log_context(),
                response.message.as_deref().unwrap_or_default()
            );
        }
        response
    }
}

async fn run_in_process(action: &dyn crate::action::Action, request: &JobRequest) -> ActionResponse {
    match AssertUnwindSafe(action.execute(request)).catch_unwind().await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => ActionResponse::from_error(&e),
        Err(payload) => {
            let message = stringify_panic(payload.as_ref());
            tracing::error!("动作 panic ({}): {}", request.log_context(), message);
            ActionResponse::failure(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionDescriptor, ActionParameter};
    use crate::registry::RegistryBuilder;
    use crate::request::JobKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        descriptor: ActionDescriptor,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Action for Counting {
        fn descriptor(&self) -> &ActionDescriptor {
            &self.descriptor
        }
        async fn execute(&self, request: &JobRequest) -> Result<ActionResponse, HubError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if request.form_params.contains_key("expired") {
                return Err(HubError::MissingAuth("Please log in again.".into()));
            }
            Ok(ActionResponse::ok())
        }
    }

    fn dispatcher(calls: Arc<AtomicUsize>) -> Dispatcher {
        let mut descriptor = ActionDescriptor::new("counting", "Counting", "");
        descriptor.supported_action_types = vec![JobKind::Query];
        descriptor.params.push(ActionParameter {
            name: "token".into(),
            label: "Token".into(),
            required: true,
            sensitive: true,
            description: None,
        });
        let registry = RegistryBuilder::new()
            .register(Counting { descriptor, calls })
            .unwrap()
            .build(&[]);
        Dispatcher::new(Arc::new(registry)).forking(false)
    }

    fn valid_request() -> JobRequest {
        let mut request = JobRequest {
            kind: Some(JobKind::Query),
            webhook_id: Some("wh".into()),
            ..Default::default()
        };
        request.params.insert("token".into(), "t".into());
        request
    }

    #[tokio::test]
    async fn validation_failure_never_reaches_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(calls.clone());
        let mut request = valid_request();
        request.params.clear();
        let resp = d.execute("counting", request).await;
        assert!(!resp.success);
        assert_eq!(
            resp.message.as_deref(),
            Some("Required setting \"Token\" not specified in action settings.")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let ok = d.execute("counting", valid_request()).await;
        assert!(ok.success);
        assert_eq!(ok.webhook_id.as_deref(), Some("wh"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_action_and_missing_auth() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let resp = d.execute("nope", valid_request()).await;
        assert_eq!(resp.message.as_deref(), Some("No action found."));

        let mut request = valid_request();
        request.form_params.insert("expired".into(), "1".into());
        let resp = d.execute("counting", request).await;
        assert!(!resp.success);
        assert_eq!(resp.state.and_then(|s| s.data).as_deref(), Some("reset"));
    }

    #[tokio::test]
    async fn raw_payload_entry_point() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let payload = serde_json::json!({"type": "query", "data": {"token": "t"}});
        let resp = d
            .execute_payload(
                "counting",
                &payload,
                RequestMeta {
                    webhook_id: Some("wh-9".into()),
                    user_agent: Some("LookerOutgoingWebhook/7.4.1".into()),
                    ..Default::default()
                },
            )
            .await;
        assert!(resp.success);
        assert_eq!(resp.webhook_id.as_deref(), Some("wh-9"));

        let bad = serde_json::json!({"type": "spreadsheet"});
        let resp = d.execute_payload("counting", &bad, RequestMeta::default()).await;
        assert!(!resp.success);
    }

    #[tokio::test]
    async fn extended_entry_point_bypasses_whitelist() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut descriptor = ActionDescriptor::new("trainer", "Trainer", "");
        descriptor.extended_action = true;
        descriptor.minimum_supported_version = semver::Version::new(99, 0, 0);
        let registry = RegistryBuilder::new()
            .register(Counting {
                descriptor,
                calls: calls.clone(),
            })
            .unwrap()
            .build(&["other".to_string()]);
        let d = Dispatcher::new(Arc::new(registry)).forking(false);
        let request = JobRequest {
            kind: Some(JobKind::Query),
            caller_version: Some(semver::Version::new(7, 0, 0)),
            ..Default::default()
        };

        let resp = d.execute("trainer", request.clone()).await;
        assert_eq!(resp.message.as_deref(), Some("No action found."));
        let resp = d.execute_extended("trainer", request).await;
        assert!(resp.success, "{resp:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // 普通动作不能走扩展入口
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let resp = d.execute_extended("counting", valid_request()).await;
        assert_eq!(resp.message.as_deref(), Some("No action found."));
    }

    #[tokio::test]
    async fn form_errors_are_reported_in_the_form() {
        let d = dispatcher(Arc::new(AtomicUsize::new(0)));
        let form = d.form("nope", JobRequest::default()).await;
        assert_eq!(form.error.as_deref(), Some("No action found."));
        let form = d.form("counting", JobRequest::default()).await;
        assert!(form.error.is_none());
        assert!(form.fields.is_empty());
    }
}
