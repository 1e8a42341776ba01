use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use scheduler_core::{SchedulerError, SchedulerResult, TaskExecutionContext, TaskResult};

/// 执行被打断的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptReason {
    Killed,
    Timeout,
}

/// 中断信号的接收端，执行器在收到信号后释放资源并返回
#[derive(Debug, Clone)]
pub struct InterruptSignal {
    receiver: watch::Receiver<Option<InterruptReason>>,
}

impl InterruptSignal {
    pub fn channel() -> (watch::Sender<Option<InterruptReason>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { receiver: rx })
    }

    /// 永远不会触发的信号
    pub fn never() -> Self {
        let (tx, signal) = Self::channel();
        // 发送端被丢弃后 changed() 会返回错误，triggered 在这种情况下保持挂起
        drop(tx);
        signal
    }

    pub fn reason(&self) -> Option<InterruptReason> {
        *self.receiver.borrow()
    }

    /// 等到收到中断信号
    pub async fn triggered(&mut self) -> InterruptReason {
        loop {
            let current = *self.receiver.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if self.receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// 一次执行的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(TaskResult),
    /// 被中断，返回前已经释放了占用的资源
    Interrupted {
        reason: InterruptReason,
        result: TaskResult,
    },
}

/// 任务执行器
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// 只检查参数，dry run 时只调用它
    fn validate(&self, context: &TaskExecutionContext) -> SchedulerResult<()>;

    async fn execute(
        &self,
        context: &TaskExecutionContext,
        interrupt: InterruptSignal,
    ) -> SchedulerResult<ExecutionOutcome>;
}

/// Shell任务参数
///
/// 没有 `args` 时 `command` 整体交给 `sh -c` 执行。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    pub command: String,
    pub args: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub env_vars: Option<HashMap<String, String>>,
}

impl ShellTaskParams {
    pub fn from_context(context: &TaskExecutionContext) -> SchedulerResult<Self> {
        let params: ShellTaskParams = serde_json::from_value(context.task_params.clone())
            .map_err(|e| SchedulerError::InvalidTaskParams(format!("解析Shell任务参数失败: {e}")))?;
        if params.command.trim().is_empty() {
            return Err(SchedulerError::InvalidTaskParams(
                "Shell任务缺少command".to_string(),
            ));
        }
        Ok(params)
    }
}

/// Shell任务执行器
///
/// 子进程单独成组，中断时先发 SIGTERM，宽限期后仍未退出则 SIGKILL，
/// 返回前一定回收子进程。
pub struct ShellExecutor {
    kill_grace_period: Duration,
}

impl ShellExecutor {
    pub fn new(kill_grace_period: Duration) -> Self {
        Self { kill_grace_period }
    }

    fn build_command(params: &ShellTaskParams, context: &TaskExecutionContext) -> Command {
        let mut cmd = match &params.args {
            Some(args) => {
                let mut cmd = Command::new(&params.command);
                cmd.args(args);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&params.command);
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(dir) = params.working_dir.as_ref().or(context.execute_path.as_ref()) {
            cmd.current_dir(dir);
        }

        // 启动参数以环境变量形式传给脚本
        for (key, value) in &context.start_params {
            cmd.env(key, value);
        }
        for (key, value) in params.env_vars.iter().flatten() {
            cmd.env(key, value);
        }
        cmd.env("TASK_INSTANCE_ID", context.task_instance_id.to_string());
        cmd
    }

    /// 终止整个进程组并回收子进程
    async fn terminate(&self, child: &mut Child, task_instance_id: i64) {
        let Some(pid) = child.id() else {
            // 已经退出，只需回收
            let _ = child.wait().await;
            return;
        };

        signal_group(pid, "TERM").await;
        match tokio::time::timeout(self.kill_grace_period, child.wait()).await {
            Ok(_) => debug!("任务 {} 的进程 {} 已退出", task_instance_id, pid),
            Err(_) => {
                warn!(
                    "任务 {} 的进程 {} 在 {:?} 内未退出，强制结束",
                    task_instance_id, pid, self.kill_grace_period
                );
                signal_group(pid, "KILL").await;
                if let Err(e) = child.kill().await {
                    warn!("强制结束进程 {} 失败: {}", pid, e);
                }
            }
        }
    }
}

#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) {
    let status = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = status {
        warn!("发送 SIG{} 到进程组 {} 失败: {}", signal, pid, e);
    }
}

#[cfg(not(unix))]
async fn signal_group(_pid: u32, _signal: &str) {}

/// 每个输出流最多保留的行数，超出时丢弃最早的行
const MAX_OUTPUT_LINES: usize = 1000;

fn collect_lines<R>(reader: R, max_lines: usize) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut collected = VecDeque::with_capacity(max_lines.min(64));
        let mut dropped = 0usize;
        while let Ok(Some(line)) = lines.next_line().await {
            if collected.len() == max_lines {
                collected.pop_front();
                dropped += 1;
            }
            collected.push_back(line);
        }
        let mut output = Vec::with_capacity(collected.len() + 1);
        if dropped > 0 {
            output.push(format!("... 省略了前 {dropped} 行输出"));
        }
        output.extend(collected);
        output
    })
}

async fn join_lines(handle: JoinHandle<Vec<String>>) -> String {
    handle.await.unwrap_or_default().join("\n")
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    fn validate(&self, context: &TaskExecutionContext) -> SchedulerResult<()> {
        ShellTaskParams::from_context(context).map(|_| ())
    }

    async fn execute(
        &self,
        context: &TaskExecutionContext,
        mut interrupt: InterruptSignal,
    ) -> SchedulerResult<ExecutionOutcome> {
        let start_time = Instant::now();
        let params = ShellTaskParams::from_context(context)?;

        info!(
            "执行Shell任务: task_instance_id={}, command={}, args={:?}",
            context.task_instance_id, params.command, params.args
        );

        let mut child = Self::build_command(&params, context)
            .spawn()
            .map_err(|e| SchedulerError::TaskExecution(format!("启动Shell命令失败: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchedulerError::TaskExecution("无法获取stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SchedulerError::TaskExecution("无法获取stderr".to_string()))?;
        let stdout_task = collect_lines(stdout, MAX_OUTPUT_LINES);
        let stderr_task = collect_lines(stderr, MAX_OUTPUT_LINES);

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| {
                    SchedulerError::TaskExecution(format!("等待Shell命令完成失败: {e}"))
                })?;
                let output = join_lines(stdout_task).await;
                let error_output = join_lines(stderr_task).await;
                let exit_code = status.code().unwrap_or(-1);
                let execution_time_ms = start_time.elapsed().as_millis() as u64;

                if exit_code == 0 {
                    info!(
                        "Shell任务执行成功: task_instance_id={}, 耗时={}ms",
                        context.task_instance_id, execution_time_ms
                    );
                } else {
                    warn!(
                        "Shell任务执行失败: task_instance_id={}, exit_code={}, stderr={}",
                        context.task_instance_id, exit_code, error_output
                    );
                }

                Ok(ExecutionOutcome::Completed(TaskResult {
                    exit_code: Some(exit_code),
                    output: Some(output),
                    error_message: (!error_output.is_empty()).then_some(error_output),
                    execution_time_ms,
                }))
            }
            reason = interrupt.triggered() => {
                info!(
                    "中断Shell任务: task_instance_id={}, 原因={:?}",
                    context.task_instance_id, reason
                );
                self.terminate(&mut child, context.task_instance_id).await;
                stdout_task.abort();
                stderr_task.abort();

                Ok(ExecutionOutcome::Interrupted {
                    reason,
                    result: TaskResult {
                        exit_code: None,
                        output: None,
                        error_message: Some(format!("任务被中断: {reason:?}")),
                        execution_time_ms: start_time.elapsed().as_millis() as u64,
                    },
                })
            }
        }
    }
}

/// HTTP任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskParams {
    pub url: String,
    pub method: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub body: Option<String>,
    pub timeout_seconds: Option<u64>,
    /// 视为成功的状态码，缺省为 2xx
    pub expected_status: Option<Vec<u16>>,
}

impl HttpTaskParams {
    pub fn from_context(context: &TaskExecutionContext) -> SchedulerResult<Self> {
        let params: HttpTaskParams = serde_json::from_value(context.task_params.clone())
            .map_err(|e| SchedulerError::InvalidTaskParams(format!("解析HTTP任务参数失败: {e}")))?;
        if !(params.url.starts_with("http://") || params.url.starts_with("https://")) {
            return Err(SchedulerError::InvalidTaskParams(format!(
                "无效的URL: {}",
                params.url
            )));
        }
        params.method()?;
        Ok(params)
    }

    fn method(&self) -> SchedulerResult<reqwest::Method> {
        match self.method.as_deref().unwrap_or("GET").to_uppercase().as_str() {
            "GET" => Ok(reqwest::Method::GET),
            "POST" => Ok(reqwest::Method::POST),
            "PUT" => Ok(reqwest::Method::PUT),
            "DELETE" => Ok(reqwest::Method::DELETE),
            "PATCH" => Ok(reqwest::Method::PATCH),
            "HEAD" => Ok(reqwest::Method::HEAD),
            other => Err(SchedulerError::InvalidTaskParams(format!(
                "不支持的HTTP方法: {other}"
            ))),
        }
    }

    fn is_expected(&self, status: u16) -> bool {
        match &self.expected_status {
            Some(codes) => codes.contains(&status),
            None => (200..300).contains(&status),
        }
    }
}

/// HTTP任务执行器
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    fn validate(&self, context: &TaskExecutionContext) -> SchedulerResult<()> {
        HttpTaskParams::from_context(context).map(|_| ())
    }

    async fn execute(
        &self,
        context: &TaskExecutionContext,
        mut interrupt: InterruptSignal,
    ) -> SchedulerResult<ExecutionOutcome> {
        let start_time = Instant::now();
        let params = HttpTaskParams::from_context(context)?;
        let method = params.method()?;

        info!(
            "执行HTTP任务: task_instance_id={}, method={}, url={}",
            context.task_instance_id, method, params.url
        );

        let mut request = self.client.request(method, &params.url);
        if let Some(timeout) = params.timeout_seconds {
            request = request.timeout(Duration::from_secs(timeout));
        }
        for (key, value) in params.headers.iter().flatten() {
            request = request.header(key, value);
        }
        if let Some(body) = &params.body {
            request = request.body(body.clone());
        }

        let response = tokio::select! {
            response = request.send() => response,
            // 丢弃请求 future 即取消请求并释放连接
            reason = interrupt.triggered() => {
                info!(
                    "中断HTTP任务: task_instance_id={}, 原因={:?}",
                    context.task_instance_id, reason
                );
                return Ok(ExecutionOutcome::Interrupted {
                    reason,
                    result: TaskResult {
                        error_message: Some(format!("任务被中断: {reason:?}")),
                        execution_time_ms: start_time.elapsed().as_millis() as u64,
                        ..Default::default()
                    },
                });
            }
        };

        let execution_time_ms = start_time.elapsed().as_millis() as u64;
        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                let success = params.is_expected(status);
                if success {
                    info!(
                        "HTTP任务执行成功: task_instance_id={}, status={}",
                        context.task_instance_id, status
                    );
                } else {
                    warn!(
                        "HTTP任务返回非预期状态: task_instance_id={}, status={}",
                        context.task_instance_id, status
                    );
                }
                Ok(ExecutionOutcome::Completed(TaskResult {
                    exit_code: Some(if success { 0 } else { i32::from(status) }),
                    output: Some(body),
                    error_message: (!success).then(|| format!("HTTP状态码: {status}")),
                    execution_time_ms,
                }))
            }
            Err(e) => Err(SchedulerError::TaskExecution(format!("HTTP请求失败: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shell_context(params: serde_json::Value) -> TaskExecutionContext {
        let mut context = TaskExecutionContext::new(1, "shell-task", "SHELL");
        context.task_params = params;
        context
    }

    #[tokio::test]
    async fn test_output_keeps_only_latest_lines() {
        let input: &'static [u8] = b"1\n2\n3\n4\n5\n";
        let lines = collect_lines(input, 3).await.unwrap();
        assert_eq!(lines, vec!["... 省略了前 2 行输出", "3", "4", "5"]);

        let lines = collect_lines(&b"a\nb\n"[..], 3).await.unwrap();
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_shell_executor_caps_large_output() {
        let context = shell_context(json!({ "command": "seq 1 5000" }));
        let outcome = ShellExecutor::new(Duration::from_secs(1))
            .execute(&context, InterruptSignal::never())
            .await
            .unwrap();
        let ExecutionOutcome::Completed(result) = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        let output = result.output.unwrap();
        assert_eq!(output.lines().count(), MAX_OUTPUT_LINES + 1);
        assert!(output.ends_with("5000"));
    }

    #[tokio::test]
    async fn test_shell_executor_captures_output() {
        let executor = ShellExecutor::new(Duration::from_secs(1));
        let context = shell_context(json!({"command": "echo hello; echo oops >&2"}));

        let outcome = executor
            .execute(&context, InterruptSignal::never())
            .await
            .unwrap();
        let ExecutionOutcome::Completed(result) = outcome else {
            panic!("expected completion");
        };
        assert!(result.is_success());
        assert_eq!(result.output.as_deref(), Some("hello"));
        assert_eq!(result.error_message.as_deref(), Some("oops"));
    }

    #[tokio::test]
    async fn test_shell_executor_reports_exit_code() {
        let executor = ShellExecutor::new(Duration::from_secs(1));
        let context = shell_context(json!({"command": "exit 3"}));

        let outcome = executor
            .execute(&context, InterruptSignal::never())
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Completed(result) => assert_eq!(result.exit_code, Some(3)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shell_executor_passes_start_params_as_env() {
        let executor = ShellExecutor::new(Duration::from_secs(1));
        let mut context = shell_context(json!({"command": "echo $BIZ_DATE"}));
        context
            .start_params
            .insert("BIZ_DATE".into(), "20240101".into());

        let outcome = executor
            .execute(&context, InterruptSignal::never())
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Completed(result) => {
                assert_eq!(result.output.as_deref(), Some("20240101"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shell_executor_stops_on_interrupt() {
        let executor = ShellExecutor::new(Duration::from_secs(2));
        let context = shell_context(json!({"command": "sleep 30"}));
        let (tx, signal) = InterruptSignal::channel();

        let started = Instant::now();
        let handle = tokio::spawn(async move { executor.execute(&context, signal).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send_replace(Some(InterruptReason::Killed));

        let outcome = handle.await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Interrupted {
                reason: InterruptReason::Killed,
                ..
            }
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_shell_validation() {
        let executor = ShellExecutor::new(Duration::from_secs(1));
        assert!(executor.validate(&shell_context(json!({"command": "ls"}))).is_ok());
        assert!(executor.validate(&shell_context(json!({"command": "  "}))).is_err());
        assert!(executor.validate(&shell_context(json!({"args": []}))).is_err());
    }

    #[test]
    fn test_http_validation() {
        let executor = HttpExecutor::new();
        let mut context = TaskExecutionContext::new(1, "http-task", "HTTP");

        context.task_params = json!({"url": "https://example.com/api", "method": "post"});
        assert!(executor.validate(&context).is_ok());

        context.task_params = json!({"url": "ftp://example.com"});
        assert!(executor.validate(&context).is_err());

        context.task_params = json!({"url": "http://example.com", "method": "TRACE"});
        assert!(executor.validate(&context).is_err());
    }

    #[test]
    fn test_http_expected_status() {
        let params = HttpTaskParams {
            url: "http://localhost".into(),
            method: None,
            headers: None,
            body: None,
            timeout_seconds: None,
            expected_status: None,
        };
        assert!(params.is_expected(204));
        assert!(!params.is_expected(404));

        let params = HttpTaskParams {
            expected_status: Some(vec![404]),
            ..params
        };
        assert!(params.is_expected(404));
    }

    #[tokio::test]
    async fn test_interrupt_signal_reports_reason() {
        let (tx, mut signal) = InterruptSignal::channel();
        assert_eq!(signal.reason(), None);
        tx.send_replace(Some(InterruptReason::Timeout));
        assert_eq!(signal.triggered().await, InterruptReason::Timeout);
        assert_eq!(signal.reason(), Some(InterruptReason::Timeout));
    }
}
