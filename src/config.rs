use crate::error::FleetError;
use crate::types::{Credential, Target};
use crate::utils::shell_quote;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_FORKS: usize = 100;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);
pub const DEFAULT_REMOTE_USER: &str = "root";
pub const DEFAULT_BECOME_USER: &str = "root";
pub const DEFAULT_INVENTORY_PATH: &str = "/etc/ansible/hosts";

/// 结构化清单文件（YAML / JSON）中的单台主机
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct HostConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl HostConfig {
    /// 转换为 Target，`name` 为清单中的主机名
    pub fn to_target(&self, name: &str) -> Target {
        let mut builder = Target::builder(name);
        if let Some(ref hostname) = self.hostname {
            builder = builder.address(hostname);
        }
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(credential) = self.credential() {
            builder = builder.credential(credential);
        }
        builder.build()
    }

    fn credential(&self) -> Option<Credential> {
        let username = self.username.as_deref().unwrap_or(DEFAULT_REMOTE_USER);
        if let Some(ref path) = self.private_key_path {
            Some(Credential::private_key(username, path, self.passphrase.as_deref()))
        } else if let Some(ref password) = self.password {
            Some(Credential::password(username, password))
        } else {
            self.username.as_deref().map(Credential::agent)
        }
    }

    pub fn from_target(target: &Target) -> Self {
        use crate::types::AuthMethod;

        let mut config = HostConfig {
            hostname: (target.address != target.name).then(|| target.address.clone()),
            port: (target.port != crate::types::DEFAULT_SSH_PORT).then_some(target.port),
            ..HostConfig::default()
        };
        if let Some(ref credential) = target.credential {
            config.username = Some(credential.username.clone());
            match credential.auth {
                AuthMethod::Password(ref password) => config.password = Some(password.clone()),
                AuthMethod::PrivateKey {
                    ref path,
                    ref passphrase,
                } => {
                    config.private_key_path = Some(path.clone());
                    config.passphrase = passphrase.clone();
                }
                AuthMethod::Agent => {}
            }
        }
        config
    }
}

const REDACTED: &str = "********";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InventoryConfig {
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

impl InventoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从YAML文件加载配置
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, FleetError> {
        let content = read_config_file(path.as_ref())?;
        serde_yaml::from_str(&content)
            .map_err(|e| FleetError::config(format!("Failed to parse YAML inventory: {}", e)))
    }

    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, FleetError> {
        let content = read_config_file(path.as_ref())?;
        serde_json::from_str(&content)
            .map_err(|e| FleetError::config(format!("Failed to parse JSON inventory: {}", e)))
    }

    pub fn to_yaml(&self) -> Result<String, FleetError> {
        serde_yaml::to_string(self)
            .map_err(|e| FleetError::config(format!("Failed to serialize to YAML: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, FleetError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FleetError::config(format!("Failed to serialize to JSON: {}", e)))
    }

    /// 密码和私钥口令替换为掩码后的副本，用于展示
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for host in config.hosts.values_mut() {
            for secret in [&mut host.password, &mut host.passphrase] {
                if secret.is_some() {
                    *secret = Some(REDACTED.to_string());
                }
            }
        }
        config
    }

    /// 添加主机到指定组
    pub fn add_host_to_group(&mut self, host_name: String, group_name: String) {
        self.groups.entry(group_name).or_default().push(host_name);
    }
}

fn read_config_file(path: &Path) -> Result<String, FleetError> {
    std::fs::read_to_string(path).map_err(|e| {
        FleetError::config(format!(
            "Failed to read inventory file {}: {}",
            path.display(),
            e
        ))
    })
}

/// 提权方式。必须由调用方显式给出，没有默认值。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Escalation {
    Disabled,
    Sudo { user: String },
}

impl Escalation {
    pub fn sudo() -> Self {
        Escalation::Sudo {
            user: DEFAULT_BECOME_USER.to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Escalation::Sudo { .. })
    }

    /// 按提权设置包装远程命令
    pub fn wrap(&self, command: &str) -> String {
        match self {
            Escalation::Disabled => command.to_string(),
            Escalation::Sudo { user } => format!(
                "sudo -n -u {} -- sh -c {}",
                shell_quote(user),
                shell_quote(command)
            ),
        }
    }
}

/// 单次运行的执行选项
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// 最大并发连接数
    pub forks: usize,
    pub escalation: Escalation,
    pub connect_timeout: Duration,
    pub task_timeout: Option<Duration>,
    pub run_timeout: Option<Duration>,
    pub check_mode: bool,
    /// 清单里没有凭据的主机使用这个
    pub default_credential: Credential,
}

impl RunOptions {
    pub fn new(escalation: Escalation) -> Self {
        Self {
            forks: DEFAULT_FORKS,
            escalation,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            task_timeout: None,
            run_timeout: None,
            check_mode: false,
            default_credential: Credential::agent(DEFAULT_REMOTE_USER),
        }
    }

    pub fn with_forks(mut self, forks: usize) -> Self {
        self.forks = forks;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn with_check_mode(mut self, check_mode: bool) -> Self {
        self.check_mode = check_mode;
        self
    }

    pub fn with_default_credential(mut self, credential: Credential) -> Self {
        self.default_credential = credential;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthMethod;

    #[test]
    fn test_run_options_defaults() {
        let options = RunOptions::new(Escalation::Disabled);
        assert_eq!(options.forks, 100);
        assert_eq!(options.connect_timeout, Duration::from_secs(8));
        assert!(!options.check_mode);
        assert!(options.task_timeout.is_none());
        assert_eq!(options.default_credential.username, "root");
    }

    #[test]
    fn test_escalation_wrap() {
        assert_eq!(Escalation::Disabled.wrap("ls /"), "ls /");
        assert_eq!(
            Escalation::sudo().wrap("ls /"),
            "sudo -n -u 'root' -- sh -c 'ls /'"
        );
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let config: InventoryConfig = serde_yaml::from_str(
            "hosts:\n  web1:\n    username: deploy\n    password: hunter2\n  db1:\n    private_key_path: /keys/db\n    passphrase: s3cret\n  cache1:\n    port: 2200\n",
        )
        .unwrap();
        let redacted = config.redacted();

        assert_eq!(redacted.hosts["web1"].password.as_deref(), Some(REDACTED));
        assert_eq!(redacted.hosts["web1"].username.as_deref(), Some("deploy"));
        assert_eq!(redacted.hosts["db1"].passphrase.as_deref(), Some(REDACTED));
        assert_eq!(redacted.hosts["db1"].private_key_path.as_deref(), Some("/keys/db"));
        assert!(redacted.hosts["cache1"].password.is_none());
        // 原配置不受影响
        assert_eq!(config.hosts["web1"].password.as_deref(), Some("hunter2"));

        let yaml = redacted.to_yaml().unwrap();
        let json = redacted.to_json().unwrap();
        for text in [&yaml, &json] {
            assert!(!text.contains("hunter2"));
            assert!(!text.contains("s3cret"));
        }
    }

    #[test]
    fn test_host_config_to_target() {
        let config: HostConfig = serde_yaml::from_str(
            "hostname: 10.0.0.5\nport: 2222\nusername: deploy\nprivate_key_path: /keys/id\n",
        )
        .unwrap();
        let target = config.to_target("web1");
        assert_eq!(target.name, "web1");
        assert_eq!(target.address, "10.0.0.5");
        assert_eq!(target.port, 2222);
        let credential = target.credential.unwrap();
        assert_eq!(credential.username, "deploy");
        assert!(matches!(credential.auth, AuthMethod::PrivateKey { .. }));

        let bare = HostConfig::default().to_target("db1");
        assert_eq!(bare.address, "db1");
        assert!(bare.credential.is_none());
    }

    #[test]
    fn test_host_config_round_trips_target() {
        let target = Target::builder("web1")
            .address("10.0.0.5")
            .password("ops", "secret")
            .build();
        let config = HostConfig::from_target(&target);
        assert_eq!(config.hostname.as_deref(), Some("10.0.0.5"));
        assert!(config.port.is_none());
        assert_eq!(config.to_target("web1"), target);
    }
}
