//! 工作进程侧：逐行读取任务，执行后回写结果。stdin 关闭即退出。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::WORKER_ENV;
use super::envelope::{WorkerReply, WorkerTask, stringify_panic};
use crate::error::HubError;
use crate::registry::ActionRegistry;
use crate::request::JobRequest;
use crate::response::ActionResponse;

/// 当前进程是否由任务队列拉起
pub fn in_worker_process() -> bool {
    std::env::var(WORKER_ENV).is_ok_and(|v| v == "1")
}

/// 服务标准输入输出，直到父进程关闭 stdin
pub async fn serve_stdio(registry: Arc<ActionRegistry>) -> Result<(), HubError> {
    serve(registry, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

pub async fn serve<R, W>(registry: Arc<ActionRegistry>, reader: R, mut writer: W) -> Result<(), HubError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    tracing::debug!("工作进程就绪: pid = {}", std::process::id());
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&registry, &line).await;
        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;
    }
    tracing::debug!("父进程已关闭 stdin，工作进程退出");
    Ok(())
}

async fn handle_line(registry: &ActionRegistry, line: &str) -> WorkerReply {
    let task: WorkerTask = match serde_json::from_str(line) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("无法解析任务信封: {}", e);
            return WorkerReply {
                task_id: String::new(),
                response: ActionResponse::failure(format!("Malformed task envelope: {e}")),
            };
        }
    };
    let task_id = task.task_id.clone();
    let response = run_task(registry, task).await;
    WorkerReply { task_id, response }
}

async fn run_task(registry: &ActionRegistry, task: WorkerTask) -> ActionResponse {
    let mut request = match JobRequest::from_ipc(task.request) {
        Ok(r) => r,
        Err(e) => return ActionResponse::from_error(&e),
    };
    request.action_id = Some(task.action_id.clone());
    let lookup = if task.extended {
        registry.find_extended_action(&task.action_id)
    } else {
        registry.find_action(&task.action_id, task.caller_version.as_ref())
    };
    let action = match lookup {
        Ok(a) => a,
        Err(e) => return ActionResponse::from_error(&e),
    };

    tracing::info!("工作进程开始执行 ({})", request.log_context());
    match AssertUnwindSafe(action.execute(&request)).catch_unwind().await {
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
    use crate::action::{Action, ActionDescriptor};
    use crate::registry::RegistryBuilder;
    use async_trait::async_trait;
    use serde_json::json;

    struct Flaky(ActionDescriptor);

    #[async_trait]
    impl Action for Flaky {
        fn descriptor(&self) -> &ActionDescriptor {
            &self.0
        }
        async fn execute(&self, request: &JobRequest) -> Result<ActionResponse, HubError> {
            match request.form_params.get("mode").map(String::as_str) {
                Some("panic") => panic!("kaboom"),
                Some("error") => Err(HubError::handler("vendor rejected")),
                _ => Ok(ActionResponse::ok_with_message("done")),
            }
        }
    }

    fn registry() -> Arc<ActionRegistry> {
        Arc::new(
            RegistryBuilder::new()
                .register(Flaky(ActionDescriptor::new("flaky", "Flaky", "")))
                .unwrap()
                .build(&[]),
        )
    }

    /// 白名单之外的扩展动作 `trainer`
    fn registry_with_extended() -> Arc<ActionRegistry> {
        let mut trainer = ActionDescriptor::new("trainer", "Trainer", "");
        trainer.extended_action = true;
        Arc::new(
            RegistryBuilder::new()
                .register(Flaky(ActionDescriptor::new("flaky", "Flaky", "")))
                .unwrap()
                .register(Flaky(trainer))
                .unwrap()
                .build(&["flaky".to_string()]),
        )
    }

    fn task_line(id: &str, mode: &str) -> String {
        let task = json!({
            "task_id": id,
            "action_id": "flaky",
            "request": {"kind": "query", "form_params": {"mode": mode}},
        });
        format!("{task}\n")
    }

    #[tokio::test]
    async fn panics_and_errors_become_failures_and_loop_continues() {
        let input = [
            task_line("1", "panic"),
            task_line("2", "error"),
            "\n".to_string(),
            "not json\n".to_string(),
            task_line("3", "ok"),
        ]
        .concat();
        let mut out = Vec::new();
        serve(registry(), input.as_bytes(), &mut out).await.unwrap();

        let replies: Vec<WorkerReply> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies.len(), 4);
        assert_eq!(replies[0].task_id, "1");
        assert!(!replies[0].response.success);
        assert_eq!(replies[0].response.message.as_deref(), Some("kaboom"));
        assert_eq!(replies[1].response.message.as_deref(), Some("vendor rejected"));
        assert!(!replies[2].response.success);
        assert_eq!(replies[3].task_id, "3");
        assert!(replies[3].response.success);
        assert_eq!(replies[3].response.message.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn unknown_action_is_reported() {
        let line = json!({"task_id": "x", "action_id": "nope", "request": {}}).to_string() + "\n";
        let mut out = Vec::new();
        serve(registry(), line.as_bytes(), &mut out).await.unwrap();
        let reply: WorkerReply = serde_json::from_slice(out.trim_ascii_end()).unwrap();
        assert_eq!(reply.response.message.as_deref(), Some("No action found."));
    }

    #[tokio::test]
    async fn extended_tasks_use_the_extended_lookup() {
        let line = |id: &str, action: &str, extended: bool| {
            json!({
                "task_id": id,
                "action_id": action,
                "extended": extended,
                "request": {"kind": "query"},
            })
            .to_string()
                + "\n"
        };
        let input = [
            line("1", "trainer", true),
            line("2", "trainer", false),
            line("3", "flaky", true),
        ]
        .concat();
        let mut out = Vec::new();
        serve(registry_with_extended(), input.as_bytes(), &mut out).await.unwrap();
        let replies: Vec<WorkerReply> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        // 扩展查找绕过白名单
        assert!(replies[0].response.success);
        // 普通查找受白名单限制
        assert_eq!(replies[1].response.message.as_deref(), Some("No action found."));
        // 非扩展动作不能走扩展查找
        assert_eq!(replies[2].response.message.as_deref(), Some("No action found."));
    }
}
