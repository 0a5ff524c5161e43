use crate::collector::{ResultCollector, TaskOutcome};
use crate::config::{Escalation, RunOptions};
use crate::error::FleetError;
use crate::pool::TransportPool;
use crate::ssh::Connection;
use crate::task::{Task, TaskModule};
use crate::types::{CommandResult, Target, TaskPayload};
use crate::utils::{generate_remote_temp_path, shell_quote};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REMOTE_SCRIPT_BASE: &str = "/tmp/rs_fleet_script.sh";

/// 运行级别的截止时间
#[derive(Debug, Clone, Copy)]
pub struct RunDeadline {
    pub at: Instant,
    pub timeout: Duration,
}

/// 在单台主机上按顺序执行任务序列
///
/// 每台主机只占用一条连接；任务间严格串行，主机间由调用方并行调度。
pub struct TaskDispatcher {
    pool: Arc<TransportPool>,
    tasks: Arc<Vec<Task>>,
    collector: ResultCollector,
    escalation: Escalation,
    task_timeout: Option<Duration>,
    check_mode: bool,
    cancel: CancellationToken,
    deadline: Option<RunDeadline>,
}

impl TaskDispatcher {
    pub fn new(
        pool: Arc<TransportPool>,
        tasks: Arc<Vec<Task>>,
        collector: ResultCollector,
        options: &RunOptions,
        cancel: CancellationToken,
        deadline: Option<RunDeadline>,
    ) -> Self {
        Self {
            pool,
            tasks,
            collector,
            escalation: options.escalation.clone(),
            task_timeout: options.task_timeout,
            check_mode: options.check_mode,
            cancel,
            deadline,
        }
    }

    pub async fn run_target(&self, target: &Target) {
        debug!("Worker started for host: {}", target.name);

        let mut connection = match self.interruptible(self.pool.acquire(target)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) | Err(e) => {
                warn!("unreachable: [{}] {}", target.name, e);
                self.mark_remaining(target, 0, TaskOutcome::Unreachable(e)).await;
                return;
            }
        };

        let mut vars = tera::Context::new();
        for (index, task) in self.tasks.iter().enumerate() {
            let outcome = match self
                .interruptible(self.execute(task, &mut *connection, &vars))
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => TaskOutcome::Unreachable(e),
            };

            if let Some(ref variable) = task.register {
                match outcome {
                    TaskOutcome::Ok(ref payload) | TaskOutcome::Failed { ref payload, .. } => {
                        vars.insert(variable.as_str(), payload);
                    }
                    TaskOutcome::Skipped(ref reason) => {
                        vars.insert(variable.as_str(), &TaskPayload::message(reason.as_str()));
                    }
                    TaskOutcome::Unreachable(_) => {}
                }
            }

            log_outcome(&task.name, &target.name, &outcome);
            let lost = match outcome {
                TaskOutcome::Unreachable(ref e) => Some(e.clone()),
                _ => None,
            };
            let halted = outcome.is_failed() && task.fatal_on_failure;
            self.collector.record(&task.name, &target.name, outcome).await;

            if let Some(e) = lost {
                // 连接已不可用或操作被中断，断开后再释放许可
                self.pool.discard(connection).await;
                self.mark_remaining(target, index + 1, TaskOutcome::Unreachable(e))
                    .await;
                return;
            }
            if halted {
                info!(
                    "Task '{}' failed on {} and is fatal, skipping remaining tasks",
                    task.name, target.name
                );
                let reason = format!("previous task '{}' failed", task.name);
                self.mark_remaining(target, index + 1, TaskOutcome::Skipped(reason))
                    .await;
                break;
            }
        }

        self.pool.release(connection).await;
        debug!("Worker finished for host: {}", target.name);
    }

    /// 给 `from` 之后（含）的所有任务记录同一个结果
    async fn mark_remaining(&self, target: &Target, from: usize, outcome: TaskOutcome) {
        for task in self.tasks.iter().skip(from) {
            self.collector
                .record(&task.name, &target.name, outcome.clone())
                .await;
        }
    }

    /// 取消或运行超时时放弃 `future`
    async fn interruptible<F: Future>(&self, future: F) -> Result<F::Output, FleetError> {
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline.at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FleetError::Cancelled),
            _ = expired => Err(FleetError::RunTimeout(
                deadline.map(|d| d.timeout.as_secs()).unwrap_or_default(),
            )),
            output = future => Ok(output),
        }
    }

    async fn execute(
        &self,
        task: &Task,
        connection: &mut dyn Connection,
        vars: &tera::Context,
    ) -> TaskOutcome {
        if self.check_mode && task.module.changes_state() {
            return TaskOutcome::Skipped(format!(
                "check mode: {} not executed",
                task.module.name()
            ));
        }

        let module = match task.module.render(vars) {
            Ok(module) => module,
            Err(e) => {
                return TaskOutcome::Failed {
                    payload: TaskPayload::default(),
                    error: e,
                };
            }
        };

        let result = match self.task_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run_module(&module, connection)).await {
                Ok(result) => result,
                Err(_) => Err(FleetError::TaskTimeout(limit.as_secs())),
            },
            None => self.run_module(&module, connection).await,
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_unreachable() => TaskOutcome::Unreachable(e),
            Err(e) => TaskOutcome::Failed {
                payload: TaskPayload::default(),
                error: e,
            },
        }
    }

    /// 执行模块。`Err` 表示传输层失败。
    async fn run_module(
        &self,
        module: &TaskModule,
        connection: &mut dyn Connection,
    ) -> Result<TaskOutcome, FleetError> {
        match module {
            TaskModule::Command { cmd } => {
                let result = connection.exec(&self.escalation.wrap(cmd)).await?;
                Ok(classify_command(result))
            }
            TaskModule::Shell { script } => {
                let remote_path = generate_remote_temp_path(REMOTE_SCRIPT_BASE);
                // 统一成 Unix 换行
                let script = script.replace('\r', "");
                connection
                    .upload(script.as_bytes(), &remote_path, 0o700)
                    .await?;

                let quoted = shell_quote(&remote_path);
                let run = format!("sh {0}; rc=$?; rm -f {0}; exit $rc", quoted);
                let result = connection.exec(&self.escalation.wrap(&run)).await?;
                Ok(classify_command(result))
            }
            TaskModule::Ping => {
                let result = connection.exec(&self.escalation.wrap("echo pong")).await?;
                if result.exit_code == 0 && result.stdout.trim() == "pong" {
                    Ok(TaskOutcome::Ok(TaskPayload {
                        stdout: result.stdout,
                        rc: Some(0),
                        msg: Some("pong".to_string()),
                        ..TaskPayload::default()
                    }))
                } else {
                    let error = FleetError::TaskError(format!(
                        "unexpected ping response (rc={}): {}",
                        result.exit_code,
                        result.stdout.trim()
                    ));
                    Ok(TaskOutcome::Failed {
                        payload: TaskPayload::from(result),
                        error,
                    })
                }
            }
            TaskModule::Debug { msg } => Ok(TaskOutcome::Ok(TaskPayload::message(msg.as_str()))),
            TaskModule::AuthorizedKey { key } => {
                let key = key.trim();
                if key.is_empty() || key.contains('\n') {
                    return Ok(TaskOutcome::Failed {
                        payload: TaskPayload::default(),
                        error: FleetError::TaskError(
                            "public key must be a single non-empty line".to_string(),
                        ),
                    });
                }
                let result = connection
                    .exec(&self.escalation.wrap(&authorized_key_script(key)))
                    .await?;
                let changed = result.stdout.trim() == "changed";
                Ok(match classify_command(result) {
                    TaskOutcome::Ok(payload) => TaskOutcome::Ok(TaskPayload { changed, ..payload }),
                    other => other,
                })
            }
        }
    }
}

fn classify_command(result: CommandResult) -> TaskOutcome {
    if result.exit_code == 0 {
        return TaskOutcome::Ok(TaskPayload::from(result));
    }

    let mut reason = format!("non-zero return code {}", result.exit_code);
    if let Some(line) = result.stderr.lines().find(|l| !l.trim().is_empty()) {
        reason.push_str(": ");
        reason.push_str(line.trim());
    }
    TaskOutcome::Failed {
        payload: TaskPayload::from(result),
        error: FleetError::TaskError(reason),
    }
}

/// 确保 `~/.ssh`(700) 与 `authorized_keys`(600) 存在，公钥行不存在时才追加。
/// 输出 `changed` 或 `unchanged`。
pub fn authorized_key_script(key: &str) -> String {
    let key = shell_quote(key);
    format!(
        concat!(
            "umask 077; d=\"$HOME/.ssh\"; f=\"$d/authorized_keys\"; ",
            "mkdir -p \"$d\" && chmod 700 \"$d\" && touch \"$f\" && chmod 600 \"$f\" || exit 1; ",
            "if grep -qxF {0} \"$f\"; then echo unchanged; else ",
            "if [ -s \"$f\" ] && [ -n \"$(tail -c1 \"$f\")\" ]; then echo >> \"$f\"; fi; ",
            "printf '%s\\n' {0} >> \"$f\" && echo changed; fi"
        ),
        key
    )
}

fn log_outcome(task: &str, host: &str, outcome: &TaskOutcome) {
    match outcome {
        TaskOutcome::Ok(payload) => {
            let state = if payload.changed { "changed" } else { "ok" };
            info!("{}: [{}] {}", state, host, task);
            if let Some(ref msg) = payload.msg {
                debug!("[{}] {} => {}", host, task, msg);
            }
        }
        TaskOutcome::Failed { error, .. } => warn!("failed: [{}] {}: {}", host, task, error),
        TaskOutcome::Unreachable(error) => warn!("unreachable: [{}] {}: {}", host, task, error),
        TaskOutcome::Skipped(reason) => info!("skipping: [{}] {}: {}", host, task, reason),
    }
}
