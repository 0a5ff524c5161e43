use crate::error::FleetError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

static VARIABLE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("variable name regex is valid")
});

/// 模块名加参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "module", rename_all = "snake_case")]
pub enum TaskModule {
    Command { cmd: String },
    Shell { script: String },
    Ping,
    Debug { msg: String },
    AuthorizedKey { key: String },
}

impl TaskModule {
    /// 由 ad-hoc 的模块名和参数字符串构造
    ///
    /// `debug` 和 `authorized_key` 接受 `msg=...` / `key=...` 形式，也接受裸字符串。
    pub fn from_args(module: &str, args: &str) -> Result<Self, FleetError> {
        let args = args.trim();
        let require_args = |what: &str| {
            if args.is_empty() {
                Err(FleetError::config(format!("Module '{}' requires {}", module, what)))
            } else {
                Ok(args.to_string())
            }
        };

        match module {
            "command" | "raw" => Ok(TaskModule::Command {
                cmd: require_args("a command line")?,
            }),
            "shell" | "script" => Ok(TaskModule::Shell {
                script: require_args("a script")?,
            }),
            "ping" => Ok(TaskModule::Ping),
            "debug" => Ok(TaskModule::Debug {
                msg: args.strip_prefix("msg=").unwrap_or(args).to_string(),
            }),
            "authorized_key" => {
                let key = require_args("a public key")?;
                Ok(TaskModule::AuthorizedKey {
                    key: key.strip_prefix("key=").unwrap_or(&key).to_string(),
                })
            }
            other => Err(FleetError::config(format!("Unknown module '{}'", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskModule::Command { .. } => "command",
            TaskModule::Shell { .. } => "shell",
            TaskModule::Ping => "ping",
            TaskModule::Debug { .. } => "debug",
            TaskModule::AuthorizedKey { .. } => "authorized_key",
        }
    }

    /// 会修改远程状态的模块在 check 模式下跳过
    pub fn changes_state(&self) -> bool {
        matches!(
            self,
            TaskModule::Command { .. } | TaskModule::Shell { .. } | TaskModule::AuthorizedKey { .. }
        )
    }

    /// 用已注册的变量渲染参数，不含模板标记的参数原样返回
    pub fn render(&self, vars: &tera::Context) -> Result<Self, FleetError> {
        let rendered = match self {
            TaskModule::Command { cmd } => TaskModule::Command {
                cmd: render_template(cmd, vars)?,
            },
            TaskModule::Shell { script } => TaskModule::Shell {
                script: render_template(script, vars)?,
            },
            TaskModule::Ping => TaskModule::Ping,
            TaskModule::Debug { msg } => TaskModule::Debug {
                msg: render_template(msg, vars)?,
            },
            TaskModule::AuthorizedKey { key } => TaskModule::AuthorizedKey {
                key: render_template(key, vars)?,
            },
        };
        Ok(rendered)
    }
}

fn render_template(template: &str, vars: &tera::Context) -> Result<String, FleetError> {
    if !template.contains("{{") && !template.contains("{%") {
        return Ok(template.to_string());
    }
    Ok(tera::Tera::one_off(template, vars, false)?)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub name: String,
    #[serde(flatten)]
    pub module: TaskModule,
    /// 把本任务的输出注册为变量，供同一主机上后续任务引用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register: Option<String>,
    #[serde(default)]
    pub fatal_on_failure: bool,
}

impl Task {
    pub fn new(name: &str, module: TaskModule) -> Self {
        Self {
            name: name.to_string(),
            module,
            register: None,
            fatal_on_failure: false,
        }
    }

    pub fn command(name: &str, cmd: &str) -> Self {
        Self::new(name, TaskModule::Command { cmd: cmd.to_string() })
    }

    pub fn shell(name: &str, script: &str) -> Self {
        Self::new(name, TaskModule::Shell { script: script.to_string() })
    }

    pub fn ping(name: &str) -> Self {
        Self::new(name, TaskModule::Ping)
    }

    pub fn debug(name: &str, msg: &str) -> Self {
        Self::new(name, TaskModule::Debug { msg: msg.to_string() })
    }

    pub fn authorized_key(name: &str, key: &str) -> Self {
        Self::new(name, TaskModule::AuthorizedKey { key: key.to_string() })
    }

    pub fn module(name: &str, module: &str, args: &str) -> Result<Self, FleetError> {
        Ok(Self::new(name, TaskModule::from_args(module, args)?))
    }

    pub fn register(mut self, variable: &str) -> Self {
        self.register = Some(variable.to_string());
        self
    }

    /// 失败时终止该主机上的后续任务
    pub fn fatal(mut self) -> Self {
        self.fatal_on_failure = true;
        self
    }
}

/// 检查任务序列：至少一个任务、名字非空且唯一、注册变量名合法
pub fn validate_tasks(tasks: &[Task]) -> Result<(), FleetError> {
    if tasks.is_empty() {
        return Err(FleetError::config("Run has no tasks"));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        if task.name.trim().is_empty() {
            return Err(FleetError::config("Task name must not be empty"));
        }
        if !seen.insert(task.name.as_str()) {
            return Err(FleetError::config(format!("Duplicate task name '{}'", task.name)));
        }
        if let Some(ref variable) = task.register {
            if !VARIABLE_NAME_RE.is_match(variable) {
                return Err(FleetError::config(format!(
                    "Task '{}' registers invalid variable name '{}'",
                    task.name, variable
                )));
            }
        }
    }
    Ok(())
}

/// 任务文件：一个主机模式加一组有序任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub name: String,
    #[serde(default = "default_hosts")]
    pub hosts: String,
    pub tasks: Vec<Task>,
}

fn default_hosts() -> String {
    "all".to_string()
}

/// ad-hoc 运行时保存模块输出的变量名
pub const AD_HOC_RESULT_VAR: &str = "result";

impl TaskFile {
    pub fn new(name: &str, hosts: &str) -> Self {
        Self {
            name: name.to_string(),
            hosts: hosts.to_string(),
            tasks: Vec::new(),
        }
    }

    pub fn add_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// 单个模块调用：执行并注册输出，再用 debug 任务回显 stdout
    pub fn ad_hoc(name: &str, hosts: &str, module: &str, args: &str) -> Result<Self, FleetError> {
        let task = Task::module(name, module, args)?.register(AD_HOC_RESULT_VAR);
        let echo = Task::debug(
            &format!("{} (output)", name),
            &format!("{{{{ {}.stdout }}}}", AD_HOC_RESULT_VAR),
        );
        Ok(Self::new(name, hosts).add_task(task).add_task(echo))
    }

    /// 按扩展名读取 YAML 或 JSON 任务文件
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, FleetError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FleetError::config(format!("Failed to read task file {}: {}", path.display(), e))
        })?;

        let task_file: TaskFile = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| FleetError::config(format!("Failed to parse task file JSON: {}", e)))?,
            _ => serde_yaml::from_str(&content)
                .map_err(|e| FleetError::config(format!("Failed to parse task file YAML: {}", e)))?,
        };
        validate_tasks(&task_file.tasks)?;
        Ok(task_file)
    }

    pub fn to_yaml(&self) -> Result<String, FleetError> {
        serde_yaml::to_string(self)
            .map_err(|e| FleetError::config(format!("Failed to serialize task file: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_from_args() {
        assert_eq!(
            TaskModule::from_args("command", "ls ~").unwrap(),
            TaskModule::Command { cmd: "ls ~".into() }
        );
        assert_eq!(
            TaskModule::from_args("debug", "msg=hello").unwrap(),
            TaskModule::Debug { msg: "hello".into() }
        );
        assert_eq!(TaskModule::from_args("ping", "").unwrap(), TaskModule::Ping);
        assert!(TaskModule::from_args("command", "  ").is_err());
        assert!(matches!(
            TaskModule::from_args("yum", "name=httpd"),
            Err(FleetError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_validate_tasks() {
        assert!(validate_tasks(&[]).is_err());
        assert!(validate_tasks(&[Task::ping("a"), Task::ping("a")]).is_err());
        assert!(validate_tasks(&[Task::ping(" ")]).is_err());
        assert!(validate_tasks(&[Task::ping("a").register("not-valid")]).is_err());
        assert!(validate_tasks(&[Task::ping("a").register("out"), Task::ping("b")]).is_ok());
    }

    #[test]
    fn test_render_with_registered_vars() {
        let mut vars = tera::Context::new();
        vars.insert("home", &serde_json::json!({ "stdout": "/home/ops" }));

        let module = TaskModule::Command {
            cmd: "ls {{ home.stdout }}".into(),
        };
        assert_eq!(
            module.render(&vars).unwrap(),
            TaskModule::Command { cmd: "ls /home/ops".into() }
        );

        // 没有模板标记时不经过模板引擎
        let plain = TaskModule::Command { cmd: "echo ${#}".into() };
        assert_eq!(plain.render(&vars).unwrap(), plain);

        let missing = TaskModule::Debug { msg: "{{ nope.stdout }}".into() };
        assert!(matches!(
            missing.render(&vars),
            Err(FleetError::TemplateError(_))
        ));
    }

    #[test]
    fn test_task_file_yaml() {
        let yaml = r#"
name: maintenance
hosts: web
tasks:
  - name: list-home
    module: command
    cmd: ls ~
    register: home
  - name: check
    module: ping
    fatal_on_failure: true
"#;
        let task_file: TaskFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task_file.hosts, "web");
        assert_eq!(task_file.tasks.len(), 2);
        assert_eq!(task_file.tasks[0].register.as_deref(), Some("home"));
        assert!(task_file.tasks[1].fatal_on_failure);
        assert_eq!(task_file.tasks[1].module, TaskModule::Ping);
    }

    #[test]
    fn test_ad_hoc_task_file() {
        let task_file = TaskFile::ad_hoc("uptime", "all", "command", "uptime").unwrap();
        assert_eq!(task_file.tasks.len(), 2);
        assert_eq!(task_file.tasks[0].register.as_deref(), Some("result"));
        assert_eq!(
            task_file.tasks[1].module,
            TaskModule::Debug { msg: "{{ result.stdout }}".into() }
        );
        assert!(validate_tasks(&task_file.tasks).is_ok());
    }
}
