use crate::config::{HostConfig, InventoryConfig, DEFAULT_REMOTE_USER};
use crate::error::FleetError;
use crate::types::{Credential, Target, DEFAULT_SSH_PORT};
use crate::utils::generate_local_temp_path;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

/// 平铺主机列表所在的组
pub const UNGROUPED: &str = "ungrouped";

static HOST_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.:\[\]-]+$").expect("host name regex is valid")
});

static GROUP_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("group name regex is valid"));

/// 清单来源
#[derive(Debug, Clone)]
pub enum InventorySource {
    Hosts(Vec<String>),
    Groups(BTreeMap<String, Vec<String>>),
    File(PathBuf),
}

/// 解析后的清单：有序、去重的 Target 集合加上组成员关系
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    targets: Vec<Target>,
    groups: BTreeMap<String, Vec<String>>,
}

impl Inventory {
    pub fn load(source: &InventorySource) -> Result<Self, FleetError> {
        match source {
            InventorySource::Hosts(hosts) => Self::from_hosts(hosts),
            InventorySource::Groups(groups) => Self::from_groups(groups),
            InventorySource::File(path) => Self::from_file(path),
        }
    }

    /// 平铺的主机列表，支持 `host:port` 写法
    pub fn from_hosts<S: AsRef<str>>(hosts: &[S]) -> Result<Self, FleetError> {
        let mut inventory = Inventory::default();
        for spec in hosts {
            let target = parse_host_spec(spec.as_ref())?;
            inventory.add_target(UNGROUPED, target)?;
        }
        Ok(inventory)
    }

    /// 组名到主机列表的映射，跨组重复的主机合并为一个 Target
    pub fn from_groups(groups: &BTreeMap<String, Vec<String>>) -> Result<Self, FleetError> {
        let mut inventory = Inventory::default();
        for (group, hosts) in groups {
            inventory.ensure_group(group)?;
            for spec in hosts {
                let target = parse_host_spec(spec)?;
                inventory.add_target(group, target)?;
            }
        }
        Ok(inventory)
    }

    pub fn from_config(config: &InventoryConfig) -> Result<Self, FleetError> {
        let mut inventory = Inventory::default();
        let mut grouped: HashSet<&str> = HashSet::new();

        for (group, members) in &config.groups {
            inventory.ensure_group(group)?;
            for name in members {
                let host = config.hosts.get(name).ok_or_else(|| {
                    FleetError::config(format!(
                        "Group '{}' references unknown host '{}'",
                        group, name
                    ))
                })?;
                inventory.add_target(group, host.to_target(name))?;
                grouped.insert(name.as_str());
            }
        }
        for (name, host) in &config.hosts {
            if !grouped.contains(name.as_str()) {
                inventory.add_target(UNGROUPED, host.to_target(name))?;
            }
        }
        Ok(inventory)
    }

    /// 按扩展名选择格式：`.yml`/`.yaml`/`.json` 为结构化清单，其余按 INI 解析
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, FleetError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        let inventory = match extension.as_deref() {
            Some("yml") | Some("yaml") => Self::from_config(&InventoryConfig::from_yaml_file(path)?)?,
            Some("json") => Self::from_config(&InventoryConfig::from_json_file(path)?)?,
            _ => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    FleetError::config(format!(
                        "Failed to read inventory file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_ini(&content)?
            }
        };

        info!(
            "Loaded inventory {} ({} hosts, {} groups)",
            path.display(),
            inventory.targets.len(),
            inventory.groups.len()
        );
        Ok(inventory)
    }

    /// 解析 INI 格式清单
    pub fn from_ini(content: &str) -> Result<Self, FleetError> {
        enum Section {
            Hosts(String),
            Children(String),
            Vars,
        }

        let mut inventory = Inventory::default();
        let mut children: Vec<(String, String)> = Vec::new();
        let mut section = Section::Hosts(UNGROUPED.to_string());

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                let header = line
                    .strip_prefix('[')
                    .and_then(|l| l.strip_suffix(']'))
                    .ok_or_else(|| {
                        FleetError::config(format!("line {}: malformed group header '{}'", line_no, line))
                    })?;
                section = match header.split_once(':') {
                    Some((group, "children")) => {
                        inventory.ensure_group(group)?;
                        Section::Children(group.to_string())
                    }
                    Some((group, "vars")) => {
                        debug!("Ignoring variables section for group '{}'", group);
                        Section::Vars
                    }
                    Some((_, kind)) => {
                        return Err(FleetError::config(format!(
                            "line {}: unknown section type '{}'",
                            line_no, kind
                        )));
                    }
                    None => {
                        inventory.ensure_group(header)?;
                        Section::Hosts(header.to_string())
                    }
                };
                continue;
            }

            match section {
                Section::Hosts(ref group) => {
                    let target = parse_ini_host_line(line)
                        .map_err(|e| FleetError::config(format!("line {}: {}", line_no, message_of(e))))?;
                    inventory.add_target(group, target)?;
                }
                Section::Children(ref parent) => {
                    children.push((parent.clone(), line.to_string()));
                }
                Section::Vars => {}
            }
        }

        inventory.resolve_children(&children)?;
        Ok(inventory)
    }

    /// 把 `[parent:children]` 中列出的子组成员并入父组（支持多层嵌套）
    fn resolve_children(&mut self, children: &[(String, String)]) -> Result<(), FleetError> {
        for (_, child) in children {
            if !self.groups.contains_key(child) {
                return Err(FleetError::config(format!("Unknown child group '{}'", child)));
            }
        }

        // 每一轮至少传播一层，组数即为上界
        for _ in 0..=self.groups.len() {
            let mut changed = false;
            for (parent, child) in children {
                let members = self.groups.get(child).cloned().unwrap_or_default();
                let entry = self.groups.entry(parent.clone()).or_default();
                for member in members {
                    if !entry.contains(&member) {
                        entry.push(member);
                        changed = true;
                    }
                }
            }
            if !changed {
                return Ok(());
            }
        }
        Err(FleetError::config("Group children definitions did not converge"))
    }

    fn ensure_group(&mut self, group: &str) -> Result<(), FleetError> {
        if !GROUP_NAME_RE.is_match(group) {
            return Err(FleetError::config(format!("Invalid group name '{}'", group)));
        }
        self.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    fn add_target(&mut self, group: &str, target: Target) -> Result<(), FleetError> {
        self.ensure_group(group)?;
        let name = target.name.clone();
        if let Some(existing) = self.targets.iter().find(|t| t.name == name) {
            if *existing != target {
                debug!("Host '{}' defined more than once, keeping first definition", name);
            }
        } else {
            self.targets.push(target);
        }

        let members = self.groups.entry(group.to_string()).or_default();
        if !members.contains(&name) {
            members.push(name);
        }
        Ok(())
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.groups
    }

    pub fn get(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// 按主机模式选择 Target
    ///
    /// 模式由逗号分隔，每一项可以是 `all`、主机名、组名或带 `*`/`?` 的通配符。
    /// 结果去重并保持清单顺序；一个都没匹配到时直接报配置错误。
    pub fn select(&self, pattern: &str) -> Result<Vec<Target>, FleetError> {
        let tokens: Vec<&str> = pattern
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Err(FleetError::config("Host pattern is empty"));
        }

        let mut selected: HashSet<&str> = HashSet::new();
        for token in &tokens {
            let matched = self.match_token(token)?;
            if matched.is_empty() {
                warn!("Pattern token '{}' did not match any host", token);
            }
            selected.extend(matched);
        }

        let targets: Vec<Target> = self
            .targets
            .iter()
            .filter(|t| selected.contains(t.name.as_str()))
            .cloned()
            .collect();

        if targets.is_empty() {
            return Err(FleetError::config(format!(
                "Host pattern '{}' matched no hosts",
                pattern
            )));
        }
        debug!("Pattern '{}' selected {} host(s)", pattern, targets.len());
        Ok(targets)
    }

    /// 只保留匹配 `pattern` 的主机，组成员关系随之裁剪
    pub fn subset(&self, pattern: &str) -> Result<Self, FleetError> {
        let targets = self.select(pattern)?;
        let names: HashSet<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        let groups = self
            .groups
            .iter()
            .map(|(group, members)| {
                let kept: Vec<String> = members
                    .iter()
                    .filter(|m| names.contains(m.as_str()))
                    .cloned()
                    .collect();
                (group.clone(), kept)
            })
            .filter(|(_, members)| !members.is_empty())
            .collect();
        Ok(Self { targets, groups })
    }

    fn match_token<'a>(&'a self, token: &str) -> Result<Vec<&'a str>, FleetError> {
        if token == "all" || token == "*" {
            return Ok(self.targets.iter().map(|t| t.name.as_str()).collect());
        }

        if token.contains('*') || token.contains('?') {
            let re = glob_to_regex(token)?;
            let mut names: Vec<&str> = self
                .targets
                .iter()
                .map(|t| t.name.as_str())
                .filter(|name| re.is_match(name))
                .collect();
            for (group, members) in &self.groups {
                if re.is_match(group) {
                    names.extend(members.iter().map(String::as_str));
                }
            }
            return Ok(names);
        }

        if let Some(target) = self.get(token) {
            return Ok(vec![target.name.as_str()]);
        }
        Ok(self
            .groups
            .get(token)
            .map(|members| members.iter().map(String::as_str).collect())
            .unwrap_or_default())
    }

    /// 渲染为 `[group]\n<host>\n...` 形式的纯文本清单
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (group, members) in &self.groups {
            out.push_str(&format!("[{}]\n", group));
            for name in members {
                out.push_str(name);
                if let Some(target) = self.get(name) {
                    if target.address != target.name {
                        out.push_str(&format!(" ansible_host={}", target.address));
                    }
                    if target.port != DEFAULT_SSH_PORT {
                        out.push_str(&format!(" ansible_port={}", target.port));
                    }
                }
                out.push('\n');
            }
        }
        out
    }

    /// 写入临时清单文件，返回的守卫在 drop 时删除文件
    pub fn write_temp(&self) -> Result<TempInventory, FleetError> {
        let path = generate_local_temp_path("rs_fleet_inventory");
        std::fs::write(&path, self.render()).map_err(|e| {
            FleetError::IoError(format!(
                "Failed to write temporary inventory {}: {}",
                path.display(),
                e
            ))
        })?;
        debug!("Temporary inventory written to {}", path.display());
        Ok(TempInventory { path })
    }

    pub fn to_config(&self) -> InventoryConfig {
        let mut config = InventoryConfig::new();
        for target in &self.targets {
            config
                .hosts
                .insert(target.name.clone(), HostConfig::from_target(target));
        }
        for (group, members) in &self.groups {
            for member in members {
                config.add_host_to_group(member.clone(), group.clone());
            }
        }
        config
    }
}

/// 临时清单文件，离开作用域时删除
#[derive(Debug)]
pub struct TempInventory {
    path: PathBuf,
}

impl TempInventory {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempInventory {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(
                "Failed to remove temporary inventory {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

fn message_of(error: FleetError) -> String {
    match error {
        FleetError::ConfigurationError(message) => message,
        other => other.to_string(),
    }
}

fn validate_host_name(name: &str) -> Result<(), FleetError> {
    if name.is_empty() {
        return Err(FleetError::config("Empty host name"));
    }
    if !HOST_NAME_RE.is_match(name) {
        return Err(FleetError::config(format!("Invalid host name '{}'", name)));
    }
    Ok(())
}

fn parse_port(value: &str) -> Result<u16, FleetError> {
    value
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| FleetError::config(format!("Invalid port '{}'", value)))
}

/// `host` 或 `host:port`；多个冒号（IPv6）视为整体地址
fn parse_host_spec(spec: &str) -> Result<Target, FleetError> {
    let spec = spec.trim();
    let (name, port) = match spec.split_once(':') {
        Some((host, port)) if !port.contains(':') => (host, Some(parse_port(port)?)),
        _ => (spec, None),
    };
    validate_host_name(name)?;

    let mut builder = Target::builder(name);
    if let Some(port) = port {
        builder = builder.port(port);
    }
    Ok(builder.build())
}

fn parse_ini_host_line(line: &str) -> Result<Target, FleetError> {
    let mut parts = line.split_whitespace();
    let spec = parts.next().unwrap_or_default();
    let mut target = parse_host_spec(spec)?;

    let mut username = None;
    let mut password = None;
    let mut key_file = None;
    for pair in parts {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| FleetError::config(format!("expected key=value, got '{}'", pair)))?;
        match key {
            "ansible_host" | "ansible_ssh_host" => target.address = value.to_string(),
            "ansible_port" | "ansible_ssh_port" => target.port = parse_port(value)?,
            "ansible_user" | "ansible_ssh_user" => username = Some(value),
            "ansible_password" | "ansible_ssh_pass" => password = Some(value),
            "ansible_ssh_private_key_file" => key_file = Some(value),
            _ => debug!("Ignoring host variable '{}' for {}", key, target.name),
        }
    }

    let user = username.unwrap_or(DEFAULT_REMOTE_USER);
    target.credential = match (key_file, password) {
        (Some(path), _) => Some(Credential::private_key(user, path, None)),
        (None, Some(password)) => Some(Credential::password(user, password)),
        (None, None) => username.map(Credential::agent),
    };
    Ok(target)
}

fn glob_to_regex(glob: &str) -> Result<Regex, FleetError> {
    let mut pattern = String::from("^");
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
        .map_err(|e| FleetError::config(format!("Invalid host pattern '{}': {}", glob, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AuthMethod;

    fn groups(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(g, hosts)| (g.to_string(), hosts.iter().map(|h| h.to_string()).collect()))
            .collect()
    }

    fn names(targets: &[Target]) -> Vec<&str> {
        targets.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn test_from_hosts_renders_ungrouped() {
        let inventory = Inventory::from_hosts(&["10.0.0.1", "10.0.0.2:2222"]).unwrap();
        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory.get("10.0.0.2").unwrap().port, 2222);
        assert_eq!(
            inventory.render(),
            "[ungrouped]\n10.0.0.1\n10.0.0.2 ansible_port=2222\n"
        );
    }

    #[test]
    fn test_duplicate_hosts_across_groups_collapse() {
        let inventory = Inventory::from_groups(&groups(&[
            ("web", &["a", "b"]),
            ("db", &["b", "c"]),
        ]))
        .unwrap();
        assert_eq!(inventory.len(), 3);
        assert_eq!(inventory.render(), "[db]\nb\nc\n[web]\na\nb\n");
    }

    #[test]
    fn test_select_patterns() {
        let inventory = Inventory::from_groups(&groups(&[
            ("web", &["web1", "web2"]),
            ("db", &["db1", "web1"]),
        ]))
        .unwrap();

        // 组按名字排序载入，db 组先出现
        assert_eq!(names(&inventory.select("all").unwrap()), ["db1", "web1", "web2"]);
        assert_eq!(names(&inventory.select("db").unwrap()), ["db1", "web1"]);
        assert_eq!(names(&inventory.select("web*,db1").unwrap()), ["db1", "web1", "web2"]);
        assert_eq!(names(&inventory.select("web?, nothing").unwrap()), ["web1", "web2"]);
    }

    #[test]
    fn test_subset_prunes_groups() {
        let inventory = Inventory::from_groups(&groups(&[
            ("web", &["web1", "web2:2200"]),
            ("db", &["db1"]),
        ]))
        .unwrap();
        let subset = inventory.subset("web2").unwrap();
        assert_eq!(subset.len(), 1);
        assert_eq!(subset.render(), "[web]\nweb2 ansible_port=2200\n");
    }

    #[test]
    fn test_select_empty_match_is_configuration_error() {
        let inventory = Inventory::from_hosts(&["a"]).unwrap();
        assert!(matches!(
            inventory.select("missing"),
            Err(FleetError::ConfigurationError(_))
        ));
        assert!(matches!(
            inventory.select(" , "),
            Err(FleetError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_malformed_hosts_rejected() {
        assert!(Inventory::from_hosts(&[""]).is_err());
        assert!(Inventory::from_hosts(&["bad host"]).is_err());
        assert!(Inventory::from_hosts(&["host:notaport"]).is_err());
        assert!(Inventory::from_hosts(&["host:0"]).is_err());
    }

    #[test]
    fn test_from_ini() {
        let content = "\
# fleet
bastion
[web]
web1 ansible_host=10.0.0.1 ansible_user=deploy ansible_password=pw
web2:2200
[db]
db1 ansible_ssh_private_key_file=/keys/db
[prod:children]
web
db
[prod:vars]
ntp=pool.ntp.org
";
        let inventory = Inventory::from_ini(content).unwrap();
        assert_eq!(inventory.len(), 4);

        let web1 = inventory.get("web1").unwrap();
        assert_eq!(web1.address, "10.0.0.1");
        assert_eq!(
            web1.credential.as_ref().unwrap().auth,
            AuthMethod::Password("pw".into())
        );
        assert_eq!(inventory.get("web2").unwrap().port, 2200);

        let db1 = inventory.get("db1").unwrap().credential.clone().unwrap();
        assert_eq!(db1.username, "root");

        assert_eq!(names(&inventory.select("prod").unwrap()), ["web1", "web2", "db1"]);
        assert_eq!(names(&inventory.select("ungrouped").unwrap()), ["bastion"]);
    }

    #[test]
    fn test_from_ini_errors() {
        assert!(Inventory::from_ini("[web\nhost").is_err());
        assert!(Inventory::from_ini("[web]\nhost novalue").is_err());
        assert!(Inventory::from_ini("[all:children]\nmissing").is_err());
        assert!(Inventory::from_ini("[web:weird]\n").is_err());
    }

    #[test]
    fn test_structured_inventory_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.yml");
        std::fs::write(
            &path,
            "hosts:\n  web1:\n    hostname: 10.0.0.1\n  db1: {}\ngroups:\n  web: [web1]\n",
        )
        .unwrap();

        let inventory = Inventory::from_file(&path).unwrap();
        assert_eq!(inventory.len(), 2);
        assert_eq!(names(&inventory.select("web").unwrap()), ["web1"]);
        assert_eq!(names(&inventory.select("ungrouped").unwrap()), ["db1"]);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"{"hosts": {}, "groups": {"web": ["ghost"]}}"#).unwrap();
        assert!(matches!(
            Inventory::from_file(&bad),
            Err(FleetError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_write_temp_removed_on_drop() {
        let inventory = Inventory::load(&InventorySource::Groups(groups(&[("web", &["a"])]))).unwrap();
        let temp = inventory.write_temp().unwrap();
        let path = temp.path().to_path_buf();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[web]\na\n");
        drop(temp);
        assert!(!path.exists());
    }
}
