use crate::error::FleetError;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// 按顺序查找的公钥文件（相对于 home 目录）
pub const PUBLIC_KEY_CANDIDATES: [&str; 4] = [
    ".ssh/id_rsa.pub",
    ".ssh/id_dsa.pub",
    ".ssh/id_ecdsa.pub",
    ".ssh/id_ed25519.pub",
];

/// 一行 OpenSSH 格式的公钥：`<算法> <base64> [注释]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    algorithm: String,
    blob: Vec<u8>,
    comment: Option<String>,
}

impl PublicKey {
    /// 在当前用户 home 目录下查找并读取公钥
    pub fn discover() -> crate::Result<(PathBuf, Self)> {
        let home = dirs::home_dir()
            .ok_or_else(|| FleetError::config("Cannot determine the home directory"))?;
        let path = Self::locate(&home)?;
        let key = Self::load(&path)?;
        Ok((path, key))
    }

    /// 返回第一个存在的候选文件
    pub fn locate(home: &Path) -> crate::Result<PathBuf> {
        PUBLIC_KEY_CANDIDATES
            .iter()
            .map(|candidate| home.join(candidate))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                FleetError::config(format!(
                    "No public key found under {} (tried {})",
                    home.display(),
                    PUBLIC_KEY_CANDIDATES.join(", ")
                ))
            })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FleetError::config(format!("Failed to read public key {}: {}", path.display(), e))
        })?;
        Self::parse(&content).map_err(|e| match e {
            FleetError::ConfigurationError(msg) => {
                FleetError::config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// 解析第一条非空、非注释的公钥行，并校验 blob 内嵌的算法名
    pub fn parse(content: &str) -> crate::Result<Self> {
        let line = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .ok_or_else(|| FleetError::config("Public key file is empty"))?;

        let mut fields = line.split_whitespace();
        let algorithm = fields.next().unwrap_or_default().to_string();
        let encoded = fields
            .next()
            .ok_or_else(|| FleetError::config("Malformed public key: missing key data"))?;
        let comment = fields.collect::<Vec<_>>().join(" ");
        let comment = (!comment.is_empty()).then_some(comment);

        let blob = STANDARD
            .decode(encoded)
            .map_err(|e| FleetError::config(format!("Malformed public key data: {}", e)))?;

        let embedded = embedded_algorithm(&blob)
            .ok_or_else(|| FleetError::config("Malformed public key: truncated key data"))?;
        if embedded != algorithm.as_bytes() {
            return Err(FleetError::config(format!(
                "Malformed public key: type '{}' does not match key data",
                algorithm
            )));
        }

        Ok(Self {
            algorithm,
            blob,
            comment,
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    /// 与 `ssh-keygen -lf` 相同的 SHA256 指纹
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }

    /// 写入 authorized_keys 的单行文本
    pub fn to_line(&self) -> String {
        let encoded = STANDARD.encode(&self.blob);
        match self.comment {
            Some(ref comment) => format!("{} {} {}", self.algorithm, encoded, comment),
            None => format!("{} {}", self.algorithm, encoded),
        }
    }
}

/// blob 以 4 字节大端长度加算法名开头
fn embedded_algorithm(blob: &[u8]) -> Option<&[u8]> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    blob.get(4..4 + len)
}
