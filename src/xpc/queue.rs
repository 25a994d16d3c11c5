//! 父进程侧：有界的工作进程池。
//!
//! - 并发上限由信号量控制，同一时刻一个工作进程只执行一个任务
//! - 工作进程按需拉起，执行完放回空闲列表复用，空闲超过 `idle_lifetime` 后回收
//! - 超时 / 崩溃 / 协议错误：kill 进程，合成一条 `success: false` 的结果

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Semaphore;

use super::envelope::{WorkerReply, WorkerTask};
use super::{TIMEOUT_MESSAGE, WORKER_ENV};
use crate::config::WorkerConfig;
use crate::error::HubError;
use crate::response::ActionResponse;

/// 默认工作进程可执行文件名
pub const WORKER_BINARY: &str = "action-hub-worker";

struct WorkerProcess {
    id: u32,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerProcess {
    async fn round_trip(&mut self, task: &WorkerTask) -> Result<WorkerReply, HubError> {
        let mut line = serde_json::to_vec(task)?;
        line.push(b'\n');
        self.stdin.write_all(&line).await?;
        self.stdin.flush().await?;

        let Some(raw) = self.stdout.next_line().await? else {
            return Err(HubError::Worker("worker exited before replying".into()));
        };
        let reply: WorkerReply = serde_json::from_str(&raw)
            .map_err(|e| HubError::Worker(format!("malformed worker reply: {e}")))?;
        if reply.task_id != task.task_id {
            return Err(HubError::Worker(format!(
                "reply for task {} while waiting for {}",
                reply.task_id, task.task_id
            )));
        }
        Ok(reply)
    }

    fn exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

struct IdleWorker {
    process: WorkerProcess,
    idle_since: Instant,
}

/// 工作进程启动命令
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd
    }
}

struct QueueInner {
    command: WorkerCommand,
    permits: Semaphore,
    idle: Mutex<Vec<IdleWorker>>,
    execution_timeout: Duration,
    idle_lifetime: Duration,
    kill_grace: Duration,
    reaper_started: AtomicBool,
}

/// 隔离执行队列
#[derive(Clone)]
pub struct ExecuteProcessQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for ExecuteProcessQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteProcessQueue")
            .field("program", &self.inner.command.program)
            .field("available", &self.inner.permits.available_permits())
            .field("idle", &self.idle_workers())
            .finish()
    }
}

impl ExecuteProcessQueue {
    /// 按配置创建；未配置可执行文件时使用当前程序同目录下的 `action-hub-worker`
    pub fn new(cfg: &WorkerConfig) -> Result<Self, HubError> {
        let program = match &cfg.program {
            Some(p) if !p.is_empty() => PathBuf::from(p),
            _ => default_worker_program()?,
        };
        let command = cfg
            .args
            .iter()
            .fold(WorkerCommand::new(program), |c, a| c.arg(a.clone()));
        Ok(Self::with_command(command, cfg))
    }

    pub fn from_global() -> Result<Self, HubError> {
        Self::new(&crate::config::AppConfig::global().worker)
    }

    /// `cfg` 只取池参数；命令行参数以 `command` 为准
    pub fn with_command(command: WorkerCommand, cfg: &WorkerConfig) -> Self {
        let inner = Arc::new(QueueInner {
            command,
            permits: Semaphore::new(cfg.max_workers.max(1)),
            idle: Mutex::new(Vec::new()),
            execution_timeout: cfg.execution_timeout(),
            idle_lifetime: cfg.idle_lifetime(),
            kill_grace: cfg.kill_grace(),
            reaper_started: AtomicBool::new(false),
        });
        ensure_reaper(&inner);
        Self { inner }
    }

    /// 当前空闲的工作进程数
    pub fn idle_workers(&self) -> usize {
        self.inner.idle.lock().map(|v| v.len()).unwrap_or(0)
    }

    /// 执行一个任务。永不返回 Err：所有失败都变成 `success: false`。
    pub async fn run(&self, task: WorkerTask) -> ActionResponse {
        ensure_reaper(&self.inner);
        let _permit = match self.inner.permits.acquire().await {
            Ok(p) => p,
            Err(_) => return ActionResponse::failure("Worker pool is shut down."),
        };

        let mut worker = match self.checkout() {
            Some(w) => w,
            None => match self.spawn_worker() {
                Ok(w) => w,
                Err(e) => {
                    tracing::error!("无法启动工作进程 {:?}: {}", self.inner.command.program, e);
                    return ActionResponse::failure(format!(
                        "Failed to start worker process: {}",
                        e.public_message()
                    ));
                }
            },
        };

        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.inner.execution_timeout, worker.round_trip(&task)).await;
        match outcome {
            Ok(Ok(reply)) => {
                tracing::debug!(
                    "工作进程 {} 完成任务 {}，耗时 {:?}",
                    worker.id,
                    task.task_id,
                    started.elapsed()
                );
                self.checkin(worker);
                reply.response
            }
            Ok(Err(e)) => {
                let id = worker.id;
                let status = self.kill(worker).await;
                tracing::error!(
                    "工作进程 {} 执行任务 {} 失败: {} (exit status: {:?})",
                    id,
                    task.task_id,
                    e,
                    status
                );
                let detail = match status {
                    Some(s) => format!("{} ({s})", e.public_message()),
                    None => e.public_message(),
                };
                ActionResponse::failure(format!("Worker process failed: {detail}"))
            }
            Err(_) => {
                let id = worker.id;
                self.kill(worker).await;
                tracing::warn!(
                    "工作进程 {} 执行任务 {} 超时 ({:?})，已终止",
                    id,
                    task.task_id,
                    self.inner.execution_timeout
                );
                ActionResponse::failure(TIMEOUT_MESSAGE)
            }
        }
    }

    /// 终止所有空闲工作进程
    pub async fn shutdown(&self) {
        self.inner.permits.close();
        let drained: Vec<IdleWorker> = match self.inner.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for w in drained {
            self.kill(w.process).await;
        }
    }

    fn checkout(&self) -> Option<WorkerProcess> {
        let mut idle = self.inner.idle.lock().ok()?;
        while let Some(mut w) = idle.pop() {
            if w.idle_since.elapsed() >= self.inner.idle_lifetime || w.process.exited() {
                // kill_on_drop 负责终止
                tracing::debug!("丢弃过期/已退出的工作进程 {}", w.process.id);
                continue;
            }
            return Some(w.process);
        }
        None
    }

    fn checkin(&self, process: WorkerProcess) {
        if let Ok(mut idle) = self.inner.idle.lock() {
            idle.push(IdleWorker {
                process,
                idle_since: Instant::now(),
            });
        }
    }

    fn spawn_worker(&self) -> Result<WorkerProcess, HubError> {
        let mut child = self.inner.command.build().spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HubError::Worker("failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HubError::Worker("failed to capture worker stdout".into()))?;
        let id = child.id().unwrap_or_default();
        tracing::info!("已启动工作进程: pid = {}", id);
        Ok(WorkerProcess {
            id,
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn kill(&self, worker: WorkerProcess) -> Option<ExitStatus> {
        kill_process(worker, self.inner.kill_grace).await
    }
}

async fn kill_process(mut worker: WorkerProcess, grace: Duration) -> Option<ExitStatus> {
    // 已退出的进程 start_kill 会报错，忽略即可
    let _ = worker.child.start_kill();
    match tokio::time::timeout(grace, worker.child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!("回收工作进程 {} 失败: {}", worker.id, e);
            None
        }
        Err(_) => {
            tracing::warn!("工作进程 {} 在宽限期内未退出", worker.id);
            None
        }
    }
}

/// 回收任务只启动一次；在运行时之外创建队列时推迟到首次 `run`
fn ensure_reaper(inner: &Arc<QueueInner>) {
    if inner.reaper_started.load(Ordering::Acquire) {
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::debug!("当前不在 Tokio 运行时内，空闲回收任务推迟到首次执行时启动");
        return;
    };
    if inner.reaper_started.swap(true, Ordering::AcqRel) {
        return;
    }
    spawn_reaper(&handle, Arc::downgrade(inner));
}

/// 周期性回收空闲过期的工作进程；队列被释放后自动结束
fn spawn_reaper(handle: &tokio::runtime::Handle, inner: Weak<QueueInner>) {
    handle.spawn(async move {
        loop {
            let period = match inner.upgrade() {
                Some(q) => q.idle_lifetime.max(Duration::from_secs(1)),
                None => return,
            };
            tokio::time::sleep(period).await;
            let Some(q) = inner.upgrade() else { return };
            let expired: Vec<IdleWorker> = match q.idle.lock() {
                Ok(mut idle) => {
                    let (expired, keep): (Vec<_>, Vec<_>) = idle
                        .drain(..)
                        .partition(|w| w.idle_since.elapsed() >= q.idle_lifetime);
                    *idle = keep;
                    expired
                }
                Err(_) => return,
            };
            let grace = q.kill_grace;
            drop(q);
            for w in expired {
                tracing::debug!("回收空闲工作进程 {}", w.process.id);
                kill_process(w.process, grace).await;
            }
        }
    });
}

fn default_worker_program() -> Result<PathBuf, HubError> {
    let exe = std::env::current_exe()?;
    Ok(exe.with_file_name(format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX)))
}
