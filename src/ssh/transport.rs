use crate::error::FleetError;
use crate::ssh::client::SshClient;
use crate::types::{CommandResult, Credential, Target};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// 建立连接时使用的超时设置
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    /// 连接建立后单次远程操作的超时，`None` 表示不限
    pub operation_timeout: Option<Duration>,
}

/// 到单台主机的一条已认证连接。同一时刻只被一个 worker 持有。
#[async_trait]
pub trait Connection: Send {
    /// 连接所属主机的清单名
    fn host(&self) -> &str;

    /// 执行命令。返回 `Err` 说明连接本身已不可用。
    async fn exec(&mut self, command: &str) -> Result<CommandResult, FleetError>;

    async fn upload(&mut self, content: &[u8], remote_path: &str, mode: i32)
        -> Result<(), FleetError>;

    async fn close(&mut self);

    /// 中断连接：立即断开，并等到进行中的操作真正返回
    async fn abort(&mut self) {
        self.close().await;
    }
}

/// 连接工厂
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        target: &Target,
        credential: &Credential,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, FleetError>;
}

/// 基于 ssh2 的传输实现
#[derive(Debug, Default, Clone, Copy)]
pub struct SshTransport;

#[async_trait]
impl Transport for SshTransport {
    async fn connect(
        &self,
        target: &Target,
        credential: &Credential,
        options: &ConnectOptions,
    ) -> Result<Box<dyn Connection>, FleetError> {
        let target = target.clone();
        let credential = credential.clone();
        let options = *options;

        let client = tokio::task::spawn_blocking(move || {
            SshClient::connect(&target, &credential, &options)
        })
        .await
        .map_err(|e| FleetError::InternalError(format!("SSH connect worker failed: {}", e)))??;

        Ok(Box::new(SshConnection::new(client)))
    }
}

/// 阻塞调用放在 `spawn_blocking` 中执行。调用方的 future 被丢弃后，
/// 阻塞线程仍会持有 `in_flight` 直到 ssh2 调用返回。
pub struct SshConnection {
    client: SshClient,
    in_flight: Arc<Mutex<()>>,
    closed: bool,
}

impl SshConnection {
    pub fn new(client: SshClient) -> Self {
        Self {
            client,
            in_flight: Arc::new(Mutex::new(())),
            closed: false,
        }
    }

    fn lost(&self, error: FleetError) -> FleetError {
        FleetError::ConnectionLost(format!("{}: {}", self.client.host(), error))
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn host(&self) -> &str {
        self.client.host()
    }

    async fn exec(&mut self, command: &str) -> Result<CommandResult, FleetError> {
        let guard = self.in_flight.clone().lock_owned().await;
        let client = self.client.clone();
        let command = command.to_string();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            client.execute_command(&command)
        })
        .await
        .map_err(|e| FleetError::InternalError(format!("SSH exec worker failed: {}", e)))?
        .map_err(|e| self.lost(e))
    }

    async fn upload(
        &mut self,
        content: &[u8],
        remote_path: &str,
        mode: i32,
    ) -> Result<(), FleetError> {
        let guard = self.in_flight.clone().lock_owned().await;
        let client = self.client.clone();
        let content = content.to_vec();
        let remote_path = remote_path.to_string();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            client.upload(&content, &remote_path, mode)
        })
        .await
        .map_err(|e| FleetError::InternalError(format!("SSH upload worker failed: {}", e)))?
        .map_err(|e| self.lost(e))
    }

    async fn close(&mut self) {
        let guard = self.in_flight.clone().lock_owned().await;
        let client = self.client.clone();
        let _ = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            client.disconnect();
            client.shutdown();
        })
        .await;
        self.closed = true;
    }

    async fn abort(&mut self) {
        self.client.shutdown();
        let _idle = self.in_flight.lock().await;
        self.closed = true;
        debug!("Connection to {} aborted", self.client.host());
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.client.shutdown();
        }
    }
}
