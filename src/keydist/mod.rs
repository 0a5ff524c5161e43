//! 把本机公钥分发到凭据文件中列出的主机
//!
//! 凭据文件是 JSON：主机名 -> `{port, username, password, done}`。
//! 首次运行时文件不存在或无法解析，会写入占位条目并要求先编辑再重跑；
//! 已标记 `done` 的主机在重跑时跳过。

mod distributor;
mod pubkey;
mod store;

pub use distributor::{COMMON_PASSWORD_ENV, DistributionOptions, DistributionReport, DistributionSummary, KeyDistributor};
pub use pubkey::{PublicKey, PUBLIC_KEY_CANDIDATES};
pub use store::{CredentialEntry, CredentialStore, StoreState, DEFAULT_STORE_PATH, PLACEHOLDER_HOST};
