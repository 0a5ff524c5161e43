use serde::{Deserialize, Serialize};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// SSH 认证方式
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Password(String),
    PrivateKey {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub auth: AuthMethod,
}

impl Credential {
    pub fn password(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            auth: AuthMethod::Password(password.to_string()),
        }
    }

    pub fn private_key(username: &str, path: &str, passphrase: Option<&str>) -> Self {
        Self {
            username: username.to_string(),
            auth: AuthMethod::PrivateKey {
                path: path.to_string(),
                passphrase: passphrase.map(str::to_string),
            },
        }
    }

    pub fn agent(username: &str) -> Self {
        Self {
            username: username.to_string(),
            auth: AuthMethod::Agent,
        }
    }
}

/// 一台被管理的远程主机。解析完成后不可变。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    /// 清单中的名字，也是结果里的主机标识
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
}

impl Target {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: name.to_string(),
            port: DEFAULT_SSH_PORT,
            credential: None,
        }
    }

    pub fn builder(name: &str) -> TargetBuilder {
        TargetBuilder::new(name)
    }

    /// 主机自身没有凭据时使用 `fallback`
    pub fn effective_credential<'a>(&'a self, fallback: &'a Credential) -> &'a Credential {
        self.credential.as_ref().unwrap_or(fallback)
    }
}

pub struct TargetBuilder {
    target: Target,
}

impl TargetBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            target: Target::new(name),
        }
    }

    pub fn address(mut self, address: &str) -> Self {
        self.target.address = address.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.target.port = port;
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.target.credential = Some(credential);
        self
    }

    pub fn password(self, username: &str, password: &str) -> Self {
        self.credential(Credential::password(username, password))
    }

    pub fn private_key(self, username: &str, path: &str) -> Self {
        self.credential(Credential::private_key(username, path, None))
    }

    pub fn build(self) -> Target {
        self.target
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// 单个任务在单台主机上的执行输出
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TaskPayload {
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl TaskPayload {
    pub fn message(msg: impl Into<String>) -> Self {
        Self {
            msg: Some(msg.into()),
            ..Self::default()
        }
    }
}

impl From<CommandResult> for TaskPayload {
    fn from(result: CommandResult) -> Self {
        Self {
            stdout: result.stdout,
            stderr: result.stderr,
            rc: Some(result.exit_code),
            changed: true,
            msg: None,
        }
    }
}
