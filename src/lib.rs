pub mod collector;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod inventory;
pub mod keydist;
pub mod pool;
pub mod ssh;
pub mod task;
pub mod types;
pub mod utils;


pub use collector::{HostOutcome, HostRecap, ResultCollector, RunResult, TaskOutcome, TaskResults};
pub use config::{Escalation, HostConfig, InventoryConfig, RunOptions};
pub use coordinator::{RunCoordinator, RunRequest};
pub use error::FleetError;
pub use inventory::{Inventory, InventorySource};
pub use keydist::{CredentialStore, DistributionOptions, DistributionReport, KeyDistributor, PublicKey};
pub use ssh::{Connection, SshClient, SshTransport, Transport};
pub use task::{Task, TaskFile, TaskModule};
pub use types::{AuthMethod, CommandResult, Credential, Target, TaskPayload};

/// 本库公开接口统一使用的结果类型
pub type Result<T> = std::result::Result<T, FleetError>;
