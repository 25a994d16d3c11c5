//! 隔离执行：父进程把作业派发给工作进程，通过 stdin/stdout 交换 NDJSON 信封。
//!
//! 一行一个 JSON 对象；父进程写 [`WorkerTask`]，工作进程回 [`WorkerReply`]。
//! 工作进程的日志只写 stderr，stdout 专用于协议。

pub mod envelope;
pub mod queue;
pub mod worker;

pub use envelope::{WorkerReply, WorkerTask, stringify_panic};
pub use queue::{ExecuteProcessQueue, WorkerCommand};

/// 作业超时时回传给宿主的固定文案
pub const TIMEOUT_MESSAGE: &str =
    "Killed execute process due to timeout in responding to parent process";

/// 工作进程通过该环境变量识别自身
pub const WORKER_ENV: &str = "ACTION_HUB_WORKER";
