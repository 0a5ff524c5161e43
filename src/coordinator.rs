use crate::collector::{ResultCollector, RunResult, TaskOutcome};
use crate::config::RunOptions;
use crate::dispatcher::{RunDeadline, TaskDispatcher};
use crate::error::FleetError;
use crate::inventory::Inventory;
use crate::pool::TransportPool;
use crate::ssh::{SshTransport, Transport};
use crate::task::{validate_tasks, Task, TaskFile};
use crate::types::Target;
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 一次运行的完整输入，构造后不可变
#[derive(Debug, Clone)]
pub struct RunRequest {
    targets: Vec<Target>,
    tasks: Vec<Task>,
    options: RunOptions,
}

impl RunRequest {
    pub fn new(targets: Vec<Target>, tasks: Vec<Task>, options: RunOptions) -> Self {
        Self {
            targets,
            tasks,
            options,
        }
    }

    /// 用主机模式从清单中选出目标，匹配为空时立即失败
    pub fn from_inventory(
        inventory: &Inventory,
        pattern: &str,
        tasks: Vec<Task>,
        options: RunOptions,
    ) -> crate::Result<Self> {
        let targets = inventory.select(pattern)?;
        Ok(Self::new(targets, tasks, options))
    }

    pub fn from_task_file(
        inventory: &Inventory,
        task_file: &TaskFile,
        options: RunOptions,
    ) -> crate::Result<Self> {
        Self::from_inventory(inventory, &task_file.hosts, task_file.tasks.clone(), options)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// 在任何连接建立之前检查请求
    pub fn validate(&self) -> crate::Result<()> {
        if self.targets.is_empty() {
            return Err(FleetError::config("Run has no targets"));
        }
        let mut seen = HashSet::new();
        for target in &self.targets {
            if !seen.insert(target.name.as_str()) {
                return Err(FleetError::config(format!(
                    "Duplicate target '{}'",
                    target.name
                )));
            }
        }
        validate_tasks(&self.tasks)?;
        if self.options.forks == 0 {
            return Err(FleetError::config("Fork limit must be at least 1"));
        }
        Ok(())
    }
}

/// 运行协调器：校验 -> 建池 -> 每台主机一个 worker -> 汇总 -> 关池
pub struct RunCoordinator {
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
}

impl RunCoordinator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            cancel: CancellationToken::new(),
        }
    }

    pub fn ssh() -> Self {
        Self::new(Arc::new(SshTransport))
    }

    /// 取消该协调器上所有进行中的运行
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, request: &RunRequest) -> crate::Result<RunResult> {
        request.validate()?;
        let options = request.options();

        info!(
            "Starting run: {} task(s) on {} host(s), forks={}, become={}, check_mode={}",
            request.tasks().len(),
            request.targets().len(),
            options.forks,
            options.escalation.is_enabled(),
            options.check_mode
        );

        let pool = Arc::new(TransportPool::new(self.transport.clone(), options)?);
        let tasks = Arc::new(request.tasks().to_vec());
        let collector = ResultCollector::new(&tasks);
        let deadline = options.run_timeout.map(|timeout| RunDeadline {
            at: Instant::now() + timeout,
            timeout,
        });

        let dispatcher = Arc::new(TaskDispatcher::new(
            pool.clone(),
            tasks,
            collector.clone(),
            options,
            self.cancel.child_token(),
            deadline,
        ));

        let workers = request.targets().iter().map(|target| {
            let dispatcher = dispatcher.clone();
            let target = target.clone();
            tokio::spawn(async move { dispatcher.run_target(&target).await })
        });
        let joined = join_all(workers).await;

        for (target, joined) in request.targets().iter().zip(joined) {
            if let Err(e) = joined {
                error!("Worker for {} aborted: {}", target.name, e);
                let outcome = TaskOutcome::Unreachable(FleetError::InternalError(format!(
                    "worker aborted: {}",
                    e
                )));
                collector.fill_missing(&target.name, outcome).await;
            }
        }

        pool.close();
        drop(dispatcher);
        if pool.open_connections() > 0 {
            warn!(
                "{} connection(s) still open after all workers finished",
                pool.open_connections()
            );
        }

        let result = collector.finish().await;
        for (host, recap) in result.recap() {
            info!(
                "{:<30} ok={} changed={} unreachable={} failed={} skipped={}",
                host, recap.ok, recap.changed, recap.unreachable, recap.failed, recap.skipped
            );
        }
        info!(
            "Run finished: {} outcome(s), peak {} concurrent connection(s)",
            result.len(),
            pool.peak_connections()
        );
        Ok(result)
    }
}
