use crate::error::FleetError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_STORE_PATH: &str = "hosts";

/// 初始化时写入的占位主机名，运行时会被跳过
pub const PLACEHOLDER_HOST: &str = "precise_hostname";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CredentialEntry {
    #[serde(
        default,
        deserialize_with = "deserialize_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,
    #[serde(default, alias = "user", skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, alias = "passwd", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub done: bool,
}

impl CredentialEntry {
    fn placeholder() -> Self {
        Self {
            port: Some(crate::types::DEFAULT_SSH_PORT),
            username: Some(String::new()),
            password: Some(String::new()),
            done: false,
        }
    }

    /// 空字符串视为未填写
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref().filter(|u| !u.is_empty())
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }
}

/// 端口既可以写成数字也可以写成字符串
fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        Text(String),
    }

    match Option::<PortValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(PortValue::Number(port)) => Ok(Some(port)),
        Some(PortValue::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(PortValue::Text(text)) => text
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port '{}'", text))),
    }
}

/// 打开凭据文件的结果
#[derive(Debug)]
pub enum StoreState {
    Loaded(CredentialStore),
    /// 文件缺失、为空或无法解析，已写入占位条目
    Seeded(CredentialStore),
}

/// 无法解析的条目：原样保留，写回文件时不做修改
#[derive(Debug, Clone)]
struct InvalidEntry {
    raw: Value,
    reason: String,
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    entries: BTreeMap<String, CredentialEntry>,
    invalid: BTreeMap<String, InvalidEntry>,
}

impl CredentialStore {
    /// 打开凭据文件
    ///
    /// 文件缺失、为空或不是 JSON 对象时重新生成占位条目（原内容先备份到
    /// `<文件名>.bak`）。单个条目字段非法时只跳过该主机，其余条目照常加载。
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<StoreState> {
        let path = path.as_ref().to_path_buf();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(FleetError::IoError(format!(
                    "Failed to read credential store {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        if let Some(ref content) = content {
            match serde_json::from_str::<Map<String, Value>>(content) {
                Ok(document) if !document.is_empty() => {
                    let store = Self::from_document(path, document);
                    debug!(
                        "Loaded {} entries from {} ({} invalid)",
                        store.entries.len(),
                        store.path.display(),
                        store.invalid.len()
                    );
                    return Ok(StoreState::Loaded(store));
                }
                Ok(_) => warn!("Credential store {} is empty", path.display()),
                Err(e) => {
                    warn!("Credential store {} is not valid JSON: {}", path.display(), e);
                    if !content.trim().is_empty() {
                        Self::backup(&path)?;
                    }
                }
            }
        } else {
            info!("Credential store {} does not exist", path.display());
        }

        let mut entries = BTreeMap::new();
        entries.insert(PLACEHOLDER_HOST.to_string(), CredentialEntry::placeholder());
        let store = Self {
            path,
            entries,
            invalid: BTreeMap::new(),
        };
        store.save()?;
        Ok(StoreState::Seeded(store))
    }

    fn from_document(path: PathBuf, document: Map<String, Value>) -> Self {
        let mut entries = BTreeMap::new();
        let mut invalid = BTreeMap::new();
        for (host, raw) in document {
            match CredentialEntry::deserialize(&raw) {
                Ok(entry) => {
                    entries.insert(host, entry);
                }
                Err(e) => {
                    warn!(
                        "Skipping invalid credential entry '{}' in {}: {}",
                        host,
                        path.display(),
                        e
                    );
                    invalid.insert(
                        host,
                        InvalidEntry {
                            raw,
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }
        Self {
            path,
            entries,
            invalid,
        }
    }

    fn backup(path: &Path) -> crate::Result<()> {
        let backup = sibling(path, ".bak");
        std::fs::copy(path, &backup).map_err(|e| {
            FleetError::IoError(format!("Failed to back up {}: {}", path.display(), e))
        })?;
        warn!("Previous credential store saved to {}", backup.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &BTreeMap<String, CredentialEntry> {
        &self.entries
    }

    pub fn get(&self, host: &str) -> Option<&CredentialEntry> {
        self.entries.get(host)
    }

    /// 尚未完成且不是占位条目的主机
    pub fn pending(&self) -> Vec<(&str, &CredentialEntry)> {
        self.entries
            .iter()
            .filter(|(host, entry)| {
                if host.as_str() == PLACEHOLDER_HOST {
                    warn!("Skipping placeholder entry '{}', edit the credential store first", host);
                    return false;
                }
                !entry.done
            })
            .map(|(host, entry)| (host.as_str(), entry))
            .collect()
    }

    pub fn done_hosts(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.done)
            .map(|(host, _)| host.as_str())
            .collect()
    }

    pub fn mark_done(&mut self, host: &str) {
        if let Some(entry) = self.entries.get_mut(host) {
            entry.done = true;
        }
    }

    /// 字段非法而被跳过的主机及原因
    pub fn invalid_hosts(&self) -> Vec<(&str, &str)> {
        self.invalid
            .iter()
            .map(|(host, entry)| (host.as_str(), entry.reason.as_str()))
            .collect()
    }

    /// 先写临时文件再改名，避免中途失败留下半个文件。非法条目按原样写回。
    pub fn save(&self) -> crate::Result<()> {
        let serialize_error =
            |e: serde_json::Error| FleetError::InternalError(format!("Failed to serialize credential store: {}", e));

        let mut document = Map::new();
        for (host, entry) in &self.entries {
            document.insert(host.clone(), serde_json::to_value(entry).map_err(serialize_error)?);
        }
        for (host, entry) in &self.invalid {
            document.insert(host.clone(), entry.raw.clone());
        }
        let content = serde_json::to_string_pretty(&document).map_err(serialize_error)?;

        let temp_path = sibling(&self.path, ".tmp");
        std::fs::write(&temp_path, content + "\n").map_err(|e| {
            FleetError::IoError(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        std::fs::rename(&temp_path, &self.path).map_err(|e| {
            FleetError::IoError(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;
        debug!("Credential store saved to {}", self.path.display());
        Ok(())
    }
}

/// 同目录下加后缀的文件名，如 `hosts` -> `hosts.bak`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_store_is_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");

        let state = CredentialStore::open(&path).unwrap();
        let StoreState::Seeded(store) = state else {
            panic!("expected seeded store");
        };
        assert!(store.get(PLACEHOLDER_HOST).is_some());
        assert!(store.pending().is_empty());

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written[PLACEHOLDER_HOST]["port"], 22);
        assert_eq!(written[PLACEHOLDER_HOST]["done"], false);
    }

    #[test]
    fn test_unparsable_store_is_reseeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "this is { not json").unwrap();

        assert!(matches!(
            CredentialStore::open(&path).unwrap(),
            StoreState::Seeded(_)
        ));
        // 原内容保留在备份文件中
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hosts.bak")).unwrap(),
            "this is { not json"
        );
        // 重新生成后的文件可以正常加载
        assert!(matches!(
            CredentialStore::open(&path).unwrap(),
            StoreState::Seeded(_) | StoreState::Loaded(_)
        ));
    }

    #[test]
    fn test_invalid_entry_does_not_wipe_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(
            &path,
            r#"{
                "host1": {"port": 22, "username": "ops", "password": "pw", "done": true},
                "host2": {"port": "22x", "username": "root"},
                "host3": {"port": 2200}
            }"#,
        )
        .unwrap();

        let StoreState::Loaded(mut store) = CredentialStore::open(&path).unwrap() else {
            panic!("expected loaded store");
        };
        assert!(store.get("host1").unwrap().done);
        assert!(store.get("host2").is_none());
        let invalid = store.invalid_hosts();
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].0, "host2");
        assert!(invalid[0].1.contains("22x"));
        let pending: Vec<&str> = store.pending().into_iter().map(|(h, _)| h).collect();
        assert_eq!(pending, ["host3"]);
        assert!(!dir.path().join("hosts.bak").exists());

        store.mark_done("host3");
        store.save().unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["host1"]["username"], "ops");
        assert_eq!(written["host1"]["password"], "pw");
        assert_eq!(written["host1"]["done"], true);
        assert_eq!(written["host2"]["port"], "22x");
        assert_eq!(written["host2"]["username"], "root");
        assert_eq!(written["host3"]["done"], true);
        assert!(written.get(PLACEHOLDER_HOST).is_none());
    }

    #[test]
    fn test_empty_object_is_seeded_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "{}").unwrap();

        assert!(matches!(
            CredentialStore::open(&path).unwrap(),
            StoreState::Seeded(_)
        ));
        assert!(!dir.path().join("hosts.bak").exists());
    }

    #[test]
    fn test_load_with_aliases_and_string_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(
            &path,
            r#"{
                "host1": {"done": true},
                "host2": {"port": "2222", "user": "ops", "passwd": "pw"},
                "host3": {"port": 22, "username": "", "password": ""}
            }"#,
        )
        .unwrap();

        let StoreState::Loaded(mut store) = CredentialStore::open(&path).unwrap() else {
            panic!("expected loaded store");
        };
        let host2 = store.get("host2").unwrap();
        assert_eq!(host2.port, Some(2222));
        assert_eq!(host2.username(), Some("ops"));
        assert_eq!(host2.password(), Some("pw"));
        assert_eq!(store.get("host3").unwrap().username(), None);

        let pending: Vec<&str> = store.pending().into_iter().map(|(h, _)| h).collect();
        assert_eq!(pending, ["host2", "host3"]);
        assert_eq!(store.done_hosts(), ["host1"]);

        store.mark_done("host2");
        store.save().unwrap();
        let StoreState::Loaded(reloaded) = CredentialStore::open(&path).unwrap() else {
            panic!("expected loaded store");
        };
        assert!(reloaded.get("host2").unwrap().done);
        assert!(!dir.path().join("hosts.tmp").exists());
    }
}
