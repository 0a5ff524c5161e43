use super::pubkey::PublicKey;
use super::store::{CredentialEntry, CredentialStore, StoreState};
use crate::collector::TaskOutcome;
use crate::config::{Escalation, RunOptions, DEFAULT_CONNECT_TIMEOUT};
use crate::coordinator::{RunCoordinator, RunRequest};
use crate::task::Task;
use crate::types::{Credential, Target, DEFAULT_SSH_PORT};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const INSTALL_TASK: &str = "install public key";

/// 凭据文件里没填密码时读取的环境变量
pub const COMMON_PASSWORD_ENV: &str = "COMMON_PASSWD";

#[derive(Debug, Clone)]
pub struct DistributionOptions {
    pub forks: usize,
    pub connect_timeout: Duration,
    /// 条目没填用户名时使用
    pub fallback_username: String,
    /// 条目没填密码时使用
    pub fallback_password: Option<String>,
}

impl DistributionOptions {
    /// 用户名默认取本机登录用户，密码默认取 `COMMON_PASSWD`
    pub fn from_env() -> Self {
        Self {
            forks: 10,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            fallback_username: whoami::username(),
            fallback_password: std::env::var(COMMON_PASSWORD_ENV)
                .ok()
                .filter(|p| !p.is_empty()),
        }
    }

    pub fn with_forks(mut self, forks: usize) -> Self {
        self.forks = forks;
        self
    }

    fn target_for(&self, host: &str, entry: &CredentialEntry) -> Target {
        let username = entry.username().unwrap_or(&self.fallback_username);
        let credential = match entry.password().or(self.fallback_password.as_deref()) {
            Some(password) => Credential::password(username, password),
            None => Credential::agent(username),
        };
        Target::builder(host)
            .port(entry.port.unwrap_or(DEFAULT_SSH_PORT))
            .credential(credential)
            .build()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DistributionSummary {
    /// 之前已完成、本次未连接的主机
    pub already_done: Vec<String>,
    pub installed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub enum DistributionReport {
    /// 凭据文件刚生成，需要编辑后重跑
    Seeded(PathBuf),
    Completed(DistributionSummary),
}

pub struct KeyDistributor {
    coordinator: RunCoordinator,
    options: DistributionOptions,
}

impl KeyDistributor {
    pub fn new(coordinator: RunCoordinator, options: DistributionOptions) -> Self {
        Self {
            coordinator,
            options,
        }
    }

    /// 对凭据文件中未完成的主机安装公钥，成功的标记为 done 并写回文件
    pub async fn distribute(
        &self,
        store_path: &Path,
        key: &PublicKey,
    ) -> crate::Result<DistributionReport> {
        let mut store = match CredentialStore::open(store_path)? {
            StoreState::Seeded(store) => {
                warn!(
                    "Credential store initialized at {}, fill in the hosts and run again",
                    store.path().display()
                );
                return Ok(DistributionReport::Seeded(store.path().to_path_buf()));
            }
            StoreState::Loaded(store) => store,
        };

        let mut summary = DistributionSummary {
            already_done: store.done_hosts().into_iter().map(str::to_string).collect(),
            ..DistributionSummary::default()
        };
        for (host, reason) in store.invalid_hosts() {
            summary
                .failed
                .push((host.to_string(), format!("invalid credential entry: {}", reason)));
        }

        let targets: Vec<Target> = store
            .pending()
            .into_iter()
            .map(|(host, entry)| self.options.target_for(host, entry))
            .collect();
        if targets.is_empty() {
            info!("No pending hosts in {}", store_path.display());
            return Ok(DistributionReport::Completed(summary));
        }

        info!(
            "Installing {} key {} on {} host(s)",
            key.algorithm(),
            key.fingerprint(),
            targets.len()
        );

        let options = RunOptions::new(Escalation::Disabled)
            .with_forks(self.options.forks)
            .with_connect_timeout(self.options.connect_timeout);
        let request = RunRequest::new(
            targets,
            vec![Task::authorized_key(INSTALL_TASK, &key.to_line())],
            options,
        );
        let result = self.coordinator.run(&request).await?;

        for target in request.targets() {
            match result.get(INSTALL_TASK, &target.name) {
                Some(TaskOutcome::Ok(_)) => {
                    store.mark_done(&target.name);
                    summary.installed.push(target.name.clone());
                }
                Some(outcome) => {
                    let reason = outcome
                        .error()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| outcome.status().to_string());
                    summary.failed.push((target.name.clone(), reason));
                }
                None => summary
                    .failed
                    .push((target.name.clone(), "no result recorded".to_string())),
            }
        }

        store.save()?;
        info!(
            "Key distribution finished: {} installed, {} failed, {} already done",
            summary.installed.len(),
            summary.failed.len(),
            summary.already_done.len()
        );
        Ok(DistributionReport::Completed(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{HostScript, MockTransport};
    use crate::types::AuthMethod;
    use std::sync::Arc;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcH op@laptop";

    fn options() -> DistributionOptions {
        DistributionOptions {
            forks: 4,
            connect_timeout: Duration::from_secs(1),
            fallback_username: "operator".to_string(),
            fallback_password: Some("shared".to_string()),
        }
    }

    fn distributor(transport: &Arc<MockTransport>) -> KeyDistributor {
        KeyDistributor::new(RunCoordinator::new(transport.clone()), options())
    }

    #[test]
    fn test_target_falls_back_to_shared_credentials() {
        let entry = CredentialEntry {
            port: Some(2222),
            ..CredentialEntry::default()
        };
        let target = options().target_for("host1", &entry);
        assert_eq!(target.port, 2222);
        let credential = target.credential.unwrap();
        assert_eq!(credential.username, "operator");
        assert_eq!(credential.auth, AuthMethod::Password("shared".into()));

        let entry = CredentialEntry {
            username: Some("ops".into()),
            password: Some("pw".into()),
            ..CredentialEntry::default()
        };
        let target = options().target_for("host2", &entry);
        assert_eq!(target.port, 22);
        let credential = target.credential.unwrap();
        assert_eq!(credential.username, "ops");
        assert_eq!(credential.auth, AuthMethod::Password("pw".into()));
    }

    #[tokio::test]
    async fn test_all_done_makes_no_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, r#"{"host1": {"done": true}, "host2": {"done": true}}"#).unwrap();

        let transport = Arc::new(MockTransport::new());
        let key = PublicKey::parse(KEY).unwrap();
        let report = distributor(&transport).distribute(&path, &key).await.unwrap();

        assert_eq!(transport.connect_count(), 0);
        let DistributionReport::Completed(summary) = report else {
            panic!("expected completed report");
        };
        assert_eq!(summary.already_done, ["host1", "host2"]);
        assert!(summary.installed.is_empty());
    }

    #[tokio::test]
    async fn test_only_pending_hosts_are_contacted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(
            &path,
            r#"{"host1": {"done": true}, "host2": {"port": "22", "user": "ops", "passwd": "pw"}}"#,
        )
        .unwrap();

        let transport = Arc::new(MockTransport::new());
        transport.script("host2", HostScript::default().stdout("changed\n"));
        let key = PublicKey::parse(KEY).unwrap();
        let report = distributor(&transport).distribute(&path, &key).await.unwrap();

        assert_eq!(transport.connect_count(), 1);
        assert_eq!(transport.connected_hosts(), ["host2"]);
        let commands = transport.commands("host2");
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("authorized_keys"));
        assert!(commands[0].contains("op@laptop"));

        let DistributionReport::Completed(summary) = report else {
            panic!("expected completed report");
        };
        assert_eq!(summary.installed, ["host2"]);

        let StoreState::Loaded(store) = CredentialStore::open(&path).unwrap() else {
            panic!("expected loaded store");
        };
        assert!(store.get("host2").unwrap().done);

        // 再跑一次不会再连接
        let again = distributor(&transport).distribute(&path, &key).await.unwrap();
        assert_eq!(transport.connect_count(), 1);
        assert!(matches!(again, DistributionReport::Completed(_)));
    }

    #[tokio::test]
    async fn test_failed_host_stays_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, r#"{"good": {}, "bad": {}}"#).unwrap();

        let transport = Arc::new(MockTransport::new());
        transport.script("good", HostScript::default().stdout("unchanged\n"));
        transport.script("bad", HostScript::default().refuse_connect());
        let key = PublicKey::parse(KEY).unwrap();
        let report = distributor(&transport).distribute(&path, &key).await.unwrap();

        let DistributionReport::Completed(summary) = report else {
            panic!("expected completed report");
        };
        assert_eq!(summary.installed, ["good"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "bad");

        let StoreState::Loaded(store) = CredentialStore::open(&path).unwrap() else {
            panic!("expected loaded store");
        };
        assert!(store.get("good").unwrap().done);
        assert!(!store.get("bad").unwrap().done);
    }

    #[tokio::test]
    async fn test_unparsable_store_is_seeded_without_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "[not, valid").unwrap();

        let transport = Arc::new(MockTransport::new());
        let key = PublicKey::parse(KEY).unwrap();
        let report = distributor(&transport).distribute(&path, &key).await.unwrap();

        assert_eq!(report, DistributionReport::Seeded(path.clone()));
        assert_eq!(transport.connect_count(), 0);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(super::super::PLACEHOLDER_HOST));
    }

    #[tokio::test]
    async fn test_invalid_entry_is_reported_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(
            &path,
            r#"{"host1": {"done": true}, "host2": {"port": "22x"}, "host3": {"user": "ops"}}"#,
        )
        .unwrap();

        let transport = Arc::new(MockTransport::new());
        let key = PublicKey::parse(KEY).unwrap();
        let report = distributor(&transport).distribute(&path, &key).await.unwrap();

        assert_eq!(transport.connected_hosts(), ["host3"]);
        let DistributionReport::Completed(summary) = report else {
            panic!("expected completed report");
        };
        assert_eq!(summary.already_done, ["host1"]);
        assert_eq!(summary.installed, ["host3"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "host2");
        assert!(summary.failed[0].1.starts_with("invalid credential entry"));

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["host1"]["done"], true);
        assert_eq!(written["host2"]["port"], "22x");
        assert_eq!(written["host3"]["done"], true);
    }
}
