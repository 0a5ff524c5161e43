use crate::config::RunOptions;
use crate::error::FleetError;
use crate::ssh::{ConnectOptions, Connection, Transport};
use crate::types::{Credential, Target};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// 按 forks 限制并发连接数的连接池
///
/// 每个连接占用一个信号量许可，超出上限的 `acquire` 会等待空闲许可。
/// 建连失败时许可立即归还，不做重试。
pub struct TransportPool {
    transport: Arc<dyn Transport>,
    semaphore: Arc<Semaphore>,
    forks: usize,
    connect_options: ConnectOptions,
    default_credential: Credential,
    open: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl TransportPool {
    pub fn new(transport: Arc<dyn Transport>, options: &RunOptions) -> Result<Self, FleetError> {
        if options.forks == 0 {
            return Err(FleetError::config("Fork limit must be at least 1"));
        }

        info!("Opening transport pool with {} slot(s)", options.forks);
        Ok(Self {
            transport,
            semaphore: Arc::new(Semaphore::new(options.forks)),
            forks: options.forks,
            connect_options: ConnectOptions {
                connect_timeout: options.connect_timeout,
                operation_timeout: options.task_timeout,
            },
            default_credential: options.default_credential.clone(),
            open: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// 获取到 `target` 的连接，池满时等待
    pub async fn acquire(&self, target: &Target) -> Result<PooledConnection, FleetError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FleetError::InternalError("transport pool is closed".to_string()))?;

        debug!("Pool slot acquired for {}", target.name);

        let credential = target.effective_credential(&self.default_credential);
        let connection = self
            .transport
            .connect(target, credential, &self.connect_options)
            .await?;

        let open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(open, Ordering::SeqCst);

        Ok(PooledConnection {
            connection,
            open: self.open.clone(),
            _permit: permit,
        })
    }

    /// 关闭连接并归还许可
    pub async fn release(&self, mut connection: PooledConnection) {
        connection.close().await;
        debug!("Connection to {} released", connection.host());
    }

    /// 丢弃不可再用的连接：先中断，等进行中的阻塞调用返回后再归还许可
    pub async fn discard(&self, mut connection: PooledConnection) {
        connection.abort().await;
        debug!("Connection to {} discarded", connection.host());
    }

    /// 拒绝后续的 `acquire`，已发放的连接不受影响
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn forks(&self) -> usize {
        self.forks
    }

    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// 运行期间同时打开连接数的最大值
    pub fn peak_connections(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// 从池中取出的连接，drop 时归还许可。正常结束用 `release`，出错后用 `discard`。
pub struct PooledConnection {
    connection: Box<dyn Connection>,
    open: Arc<AtomicUsize>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}
