use std::path::PathBuf;

/// 生成唯一的临时文件后缀
///
/// 使用纳秒级时间戳 + 随机数，确保并发的多个 worker 不会产生文件名冲突。
pub fn generate_temp_suffix() -> String {
    let now = chrono::Utc::now();
    let timestamp = now.timestamp();
    let nanos = now.timestamp_subsec_nanos();
    let random_suffix: u32 = rand::random();

    format!("{}.{}.{}", timestamp, nanos, random_suffix)
}

/// 生成本地临时文件路径
///
/// 例如 `generate_local_temp_path("rs_fleet_inventory")` 返回
/// `$TMPDIR/rs_fleet_inventory_1732492800.123456789.987654321.tmp`
pub fn generate_local_temp_path(prefix: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}_{}.tmp", prefix, generate_temp_suffix()))
}

/// 生成远程临时文件路径
///
/// 例如 `generate_remote_temp_path("/tmp/rs_fleet_script.sh")` 返回
/// `/tmp/rs_fleet_script.sh.tmp.1732492800.123456789.987654321`
pub fn generate_remote_temp_path(base_path: &str) -> String {
    format!("{}.tmp.{}", base_path, generate_temp_suffix())
}

/// 用单引号包裹，供远程 `sh` 解析
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_temp_suffix_uniqueness() {
        let mut suffixes = HashSet::new();

        for _ in 0..1000 {
            let suffix = generate_temp_suffix();
            assert!(
                suffixes.insert(suffix.clone()),
                "Generated duplicate suffix: {}",
                suffix
            );
        }
    }

    #[test]
    fn test_local_temp_path_format() {
        let path = generate_local_temp_path("test_prefix");
        assert!(path.starts_with(std::env::temp_dir()));
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("test_prefix_"));
        assert!(file_name.ends_with(".tmp"));
    }

    #[test]
    fn test_remote_temp_path_format() {
        let path = generate_remote_temp_path("/tmp/script.sh");
        assert!(path.starts_with("/tmp/script.sh.tmp."));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("ls ~"), "'ls ~'");
        assert_eq!(shell_quote("echo 'hi'"), r"'echo '\''hi'\'''");
    }
}
