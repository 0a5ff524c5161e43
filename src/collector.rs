use crate::error::FleetError;
use crate::task::Task;
use crate::types::TaskPayload;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 单个 (任务, 主机) 的执行结果
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TaskOutcome {
    Ok(TaskPayload),
    Failed {
        payload: TaskPayload,
        error: FleetError,
    },
    Unreachable(FleetError),
    Skipped(String),
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, TaskOutcome::Ok(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskOutcome::Failed { .. })
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, TaskOutcome::Unreachable(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TaskOutcome::Skipped(_))
    }

    pub fn payload(&self) -> Option<&TaskPayload> {
        match self {
            TaskOutcome::Ok(payload) | TaskOutcome::Failed { payload, .. } => Some(payload),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FleetError> {
        match self {
            TaskOutcome::Failed { error, .. } | TaskOutcome::Unreachable(error) => Some(error),
            _ => None,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            TaskOutcome::Ok(_) => "ok",
            TaskOutcome::Failed { .. } => "failed",
            TaskOutcome::Unreachable(_) => "unreachable",
            TaskOutcome::Skipped(_) => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostOutcome {
    pub host: String,
    pub outcome: TaskOutcome,
}

/// 一个任务在所有主机上的结果，主机按完成顺序排列
#[derive(Debug, Clone, Serialize)]
pub struct TaskResults {
    pub task: String,
    pub hosts: Vec<HostOutcome>,
}

impl TaskResults {
    pub fn get(&self, host: &str) -> Option<&TaskOutcome> {
        self.hosts
            .iter()
            .find(|h| h.host == host)
            .map(|h| &h.outcome)
    }
}

/// 每台主机的汇总计数
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct HostRecap {
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
    pub unreachable: usize,
    pub skipped: usize,
}

/// 整次运行的结果，任务按提交顺序排列。运行结束后只读。
#[derive(Debug, Clone, Serialize, Default)]
pub struct RunResult {
    tasks: Vec<TaskResults>,
}

impl RunResult {
    pub fn tasks(&self) -> &[TaskResults] {
        &self.tasks
    }

    pub fn task(&self, name: &str) -> Option<&TaskResults> {
        self.tasks.iter().find(|t| t.task == name)
    }

    pub fn get(&self, task: &str, host: &str) -> Option<&TaskOutcome> {
        self.task(task).and_then(|t| t.get(host))
    }

    /// 某台主机按任务顺序排列的结果
    pub fn host_outcomes(&self, host: &str) -> Vec<(&str, &TaskOutcome)> {
        self.tasks
            .iter()
            .filter_map(|t| t.get(host).map(|outcome| (t.task.as_str(), outcome)))
            .collect()
    }

    /// 结果条目总数
    pub fn len(&self) -> usize {
        self.tasks.iter().map(|t| t.hosts.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn recap(&self) -> BTreeMap<String, HostRecap> {
        let mut recap: BTreeMap<String, HostRecap> = BTreeMap::new();
        for task in &self.tasks {
            for entry in &task.hosts {
                let counts = recap.entry(entry.host.clone()).or_default();
                match entry.outcome {
                    TaskOutcome::Ok(ref payload) => {
                        counts.ok += 1;
                        if payload.changed {
                            counts.changed += 1;
                        }
                    }
                    TaskOutcome::Failed { .. } => counts.failed += 1,
                    TaskOutcome::Unreachable(_) => counts.unreachable += 1,
                    TaskOutcome::Skipped(_) => counts.skipped += 1,
                }
            }
        }
        recap
    }

    /// 没有任何失败或不可达的结果
    pub fn is_success(&self) -> bool {
        self.tasks
            .iter()
            .flat_map(|t| &t.hosts)
            .all(|h| !h.outcome.is_failed() && !h.outcome.is_unreachable())
    }

    pub fn to_json(&self) -> Result<String, FleetError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FleetError::InternalError(format!("Failed to serialize run result: {}", e)))
    }
}

struct CollectorState {
    tasks: Vec<TaskResults>,
    index: HashMap<String, usize>,
}

impl CollectorState {
    fn slot(&mut self, task: &str) -> &mut TaskResults {
        let position = match self.index.get(task) {
            Some(position) => *position,
            None => {
                self.tasks.push(TaskResults {
                    task: task.to_string(),
                    hosts: Vec::new(),
                });
                self.index.insert(task.to_string(), self.tasks.len() - 1);
                self.tasks.len() - 1
            }
        };
        &mut self.tasks[position]
    }
}

/// 并发写入的结果收集器
///
/// 只提供写入接口，读取必须等 `finish` 消费收集器之后进行。
#[derive(Clone)]
pub struct ResultCollector {
    inner: Arc<Mutex<CollectorState>>,
}

impl ResultCollector {
    pub fn new(tasks: &[Task]) -> Self {
        let mut state = CollectorState {
            tasks: Vec::with_capacity(tasks.len()),
            index: HashMap::new(),
        };
        for task in tasks {
            state.slot(&task.name);
        }
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// 记录结果。同一 (任务, 主机) 只保留第一次记录。
    pub async fn record(&self, task: &str, host: &str, outcome: TaskOutcome) {
        let mut state = self.inner.lock().await;
        let slot = state.slot(task);
        if slot.hosts.iter().any(|h| h.host == host) {
            warn!(
                "Duplicate outcome for task '{}' on {} dropped ({})",
                task,
                host,
                outcome.status()
            );
            return;
        }
        debug!("Recorded {} for task '{}' on {}", outcome.status(), task, host);
        slot.hosts.push(HostOutcome {
            host: host.to_string(),
            outcome,
        });
    }

    /// 给该主机所有尚无结果的任务补上 `outcome`，返回补记的条数
    pub async fn fill_missing(&self, host: &str, outcome: TaskOutcome) -> usize {
        let mut state = self.inner.lock().await;
        let mut filled = 0;
        for task in state.tasks.iter_mut() {
            if !task.hosts.iter().any(|h| h.host == host) {
                task.hosts.push(HostOutcome {
                    host: host.to_string(),
                    outcome: outcome.clone(),
                });
                filled += 1;
            }
        }
        filled
    }

    pub async fn finish(self) -> RunResult {
        let tasks = match Arc::try_unwrap(self.inner) {
            Ok(mutex) => mutex.into_inner().tasks,
            Err(shared) => {
                warn!("Result collector still shared at finish, taking a snapshot");
                shared.lock().await.tasks.clone()
            }
        };
        RunResult { tasks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(stdout: &str) -> TaskOutcome {
        TaskOutcome::Ok(TaskPayload {
            stdout: stdout.to_string(),
            rc: Some(0),
            changed: true,
            ..TaskPayload::default()
        })
    }

    #[tokio::test]
    async fn test_task_order_follows_submission_and_hosts_follow_completion() {
        let collector = ResultCollector::new(&[Task::ping("first"), Task::ping("second")]);

        collector.record("second", "b", ok("2b")).await;
        collector.record("first", "b", ok("1b")).await;
        collector.record("first", "a", ok("1a")).await;

        let result = collector.finish().await;
        let order: Vec<&str> = result.tasks().iter().map(|t| t.task.as_str()).collect();
        assert_eq!(order, ["first", "second"]);

        let hosts: Vec<&str> = result.tasks()[0].hosts.iter().map(|h| h.host.as_str()).collect();
        assert_eq!(hosts, ["b", "a"]);
        assert_eq!(result.len(), 3);
        assert_eq!(result.get("first", "a").unwrap().payload().unwrap().stdout, "1a");
    }

    #[tokio::test]
    async fn test_duplicate_record_keeps_first() {
        let collector = ResultCollector::new(&[Task::ping("t")]);
        collector.record("t", "a", ok("first")).await;
        collector
            .record("t", "a", TaskOutcome::Unreachable(FleetError::Cancelled))
            .await;

        let result = collector.finish().await;
        assert_eq!(result.len(), 1);
        assert!(result.get("t", "a").unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fill_missing_and_recap() {
        let collector = ResultCollector::new(&[Task::ping("one"), Task::ping("two"), Task::ping("three")]);
        collector.record("one", "a", ok("x")).await;
        collector.record("one", "b", ok("y")).await;

        let lost = TaskOutcome::Unreachable(FleetError::InternalError("worker panicked".into()));
        assert_eq!(collector.fill_missing("a", lost).await, 2);

        let result = collector.finish().await;
        let outcomes = result.host_outcomes("a");
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].0, "one");
        assert!(outcomes[2].1.is_unreachable());

        let recap = result.recap();
        assert_eq!(
            recap["a"],
            HostRecap { ok: 1, changed: 1, unreachable: 2, ..HostRecap::default() }
        );
        assert_eq!(recap["b"].ok, 1);
        assert!(!result.is_success());
    }

    #[test]
    fn test_outcome_json_shape() {
        let json = serde_json::to_value(TaskOutcome::Skipped("check mode".into())).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["detail"], "check mode");

        let json = serde_json::to_value(TaskOutcome::Unreachable(FleetError::RunTimeout(3))).unwrap();
        assert_eq!(json["status"], "unreachable");
    }
}
