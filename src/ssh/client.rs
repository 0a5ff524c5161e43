use crate::error::FleetError;
use crate::ssh::transport::ConnectOptions;
use crate::types::{AuthMethod, CommandResult, Credential, Target};
use ssh2::Session;
use std::io::prelude::*;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 阻塞式 SSH 客户端，调用方负责放到 `spawn_blocking` 中运行
#[derive(Clone)]
pub struct SshClient {
    session: Session,
    /// 与 session 共用同一个 socket，用于在阻塞调用进行中强行断开
    stream: Arc<TcpStream>,
    host: String,
}

impl SshClient {
    /// 建立一次连接。失败不重试，由上层归类为 Unreachable。
    pub fn connect(
        target: &Target,
        credential: &Credential,
        options: &ConnectOptions,
    ) -> Result<Self, FleetError> {
        let tcp = Self::open_tcp(target, options.connect_timeout)?;

        // 禁用 Nagle 算法，减少小包延迟
        if let Err(e) = tcp.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", target.name, e);
        }

        let stream = tcp.try_clone().map_err(|e| {
            FleetError::SshConnectionError(format!("Failed to clone socket for {}: {}", target.name, e))
        })?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(duration_to_millis(options.connect_timeout));

        session.handshake().map_err(|e| {
            FleetError::SshConnectionError(format!("SSH handshake with {} failed: {}", target.name, e))
        })?;

        Self::authenticate(&session, credential).map_err(|e| {
            FleetError::AuthenticationError(format!(
                "{}@{}: {}",
                credential.username, target.name, e
            ))
        })?;

        if !session.authenticated() {
            return Err(FleetError::AuthenticationError(format!(
                "{}@{}: authentication rejected",
                credential.username, target.name
            )));
        }

        // 0 表示不设超时
        session.set_timeout(options.operation_timeout.map(duration_to_millis).unwrap_or(0));

        info!("Successfully connected to {}", target.name);

        Ok(Self {
            session,
            stream: Arc::new(stream),
            host: target.name.clone(),
        })
    }

    fn open_tcp(target: &Target, timeout: Duration) -> Result<TcpStream, FleetError> {
        let addrs = (target.address.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| {
                FleetError::SshConnectionError(format!(
                    "Failed to resolve {}:{}: {}",
                    target.address, target.port, e
                ))
            })?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(FleetError::SshConnectionError(match last_error {
            Some(e) => format!(
                "Failed to connect to {}:{}: {}",
                target.address, target.port, e
            ),
            None => format!("No address found for {}:{}", target.address, target.port),
        }))
    }

    fn authenticate(session: &Session, credential: &Credential) -> Result<(), ssh2::Error> {
        match credential.auth {
            AuthMethod::Password(ref password) => {
                session.userauth_password(&credential.username, password)
            }
            AuthMethod::PrivateKey {
                ref path,
                ref passphrase,
            } => session.userauth_pubkey_file(
                &credential.username,
                None,
                Path::new(path),
                passphrase.as_deref(),
            ),
            AuthMethod::Agent => session.userauth_agent(&credential.username),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// 执行远程命令
    pub fn execute_command(&self, command: &str) -> Result<CommandResult, FleetError> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        channel.read_to_string(&mut stdout)?;
        channel.stderr().read_to_string(&mut stderr)?;

        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        debug!(
            "Command '{}' on '{}' executed with exit code: {}",
            command, self.host, exit_code
        );

        Ok(CommandResult {
            exit_code,
            stdout,
            stderr,
        })
    }

    /// 通过 SCP 上传内容到远程路径
    pub fn upload(&self, content: &[u8], remote_path: &str, mode: i32) -> Result<(), FleetError> {
        let mut remote_file =
            self.session
                .scp_send(Path::new(remote_path), mode, content.len() as u64, None)?;
        remote_file.write_all(content)?;

        remote_file.send_eof()?;
        remote_file.wait_eof()?;
        remote_file.close()?;
        remote_file.wait_close()?;

        debug!(
            "Uploaded {} bytes to {}:{}",
            content.len(),
            self.host,
            remote_path
        );
        Ok(())
    }

    /// 直接关闭 socket，不经过 session 的锁。进行中的阻塞读写会立即出错返回。
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("Socket shutdown for {} failed: {}", self.host, e);
        }
    }

    pub fn disconnect(&self) {
        if let Err(e) = self.session.disconnect(None, "rs-fleet run finished", None) {
            debug!("Disconnect from {} failed: {}", self.host, e);
        }
    }
}

fn duration_to_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}
