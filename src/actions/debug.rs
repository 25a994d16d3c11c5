//! 调试动作：按表单参数休眠、拉取模拟下载地址或注入故障，用于验证隔离执行。

use std::time::Duration;

use async_trait::async_trait;

use crate::action::{Action, ActionDescriptor};
use crate::error::HubError;
use crate::request::{JobRequest, ScheduledPlan};
use crate::response::{ActionForm, ActionResponse, FormField};
use crate::xpc::worker::in_worker_process;

const DEFAULT_SLEEP_MS: u64 = 1000;

pub struct DebugAction {
    descriptor: ActionDescriptor,
}

impl Default for DebugAction {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugAction {
    pub fn new() -> Self {
        Self {
            descriptor: ActionDescriptor::new(
                "debug",
                "Debug",
                "Sends data to a sample website and optionally sleeps.",
            ),
        }
    }

    /// 在工作进程中执行的变体
    pub fn isolated() -> Self {
        let mut action = Self::new();
        action.descriptor.execute_in_own_process = true;
        action
    }
}

fn sleep_ms(request: &JobRequest) -> Result<u64, HubError> {
    match request.form_params.get("sleep").map(|s| s.trim()) {
        None | Some("") => Ok(DEFAULT_SLEEP_MS),
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            HubError::UnsupportedRequest(format!("Sleep must be a whole number of milliseconds, got \"{raw}\"."))
        }),
    }
}

#[async_trait]
impl Action for DebugAction {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn execute(&self, request: &JobRequest) -> Result<ActionResponse, HubError> {
        let mut activities = Vec::new();

        let sleep = sleep_ms(request)?;
        if sleep > 0 {
            tracing::info!("[debug action] sleep {} ms", sleep);
            activities.push(format!("sleep {sleep} ms"));
            tokio::time::sleep(Duration::from_millis(sleep)).await;
        }

        if let Some(url) = request.form_params.get("simulated_download_url").filter(|u| !u.is_empty()) {
            let mut simulated = request.clone();
            simulated.attachment = None;
            simulated.scheduled_plan = Some(ScheduledPlan {
                download_url: Some(url.clone()),
                ..simulated.scheduled_plan.unwrap_or_default()
            });
            let rows = simulated.stream_json(|_row| Ok(())).await?;
            tracing::info!("[debug action] streamed {} rows", rows);
            activities.push(format!("stream {rows} rows"));
        }

        if let Some(message) = request.form_params.get("fail") {
            return Err(HubError::handler(message.clone()));
        }
        if let Some(message) = request.form_params.get("panic") {
            panic!("{message}");
        }
        if request.form_params.contains_key("crash") && in_worker_process() {
            tracing::warn!("[debug action] 模拟工作进程崩溃");
            std::process::exit(70);
        }

        let done = if activities.is_empty() {
            "nothing".to_string()
        } else {
            activities.join(", ")
        };
        Ok(ActionResponse::ok_with_message(format!(
            "Completed debug action successfully by doing {done}."
        )))
    }

    fn has_form(&self) -> bool {
        true
    }

    async fn form(&self, _request: &JobRequest) -> Result<ActionForm, HubError> {
        let text = |name: &str, label: &str| FormField {
            name: name.into(),
            label: Some(label.into()),
            field_type: Some("string".into()),
            ..Default::default()
        };
        Ok(ActionForm {
            fields: vec![
                text("sleep", "Sleep"),
                text("simulated_download_url", "Simulated Download URL (JSON)"),
            ],
            ..Default::default()
        })
    }
}
