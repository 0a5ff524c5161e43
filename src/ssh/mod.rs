// SSH 传输层：连接抽象与 ssh2 实现
mod client;
mod transport;

pub use client::SshClient;
pub use transport::{ConnectOptions, Connection, SshConnection, SshTransport, Transport};
