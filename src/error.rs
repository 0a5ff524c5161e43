use thiserror::Error;
use serde::Serialize;

#[derive(Error, Debug, Clone, Serialize, PartialEq, Eq)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("SSH connection failed: {0}")]
    SshConnectionError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Task timed out after {0}s")]
    TaskTimeout(u64),

    #[error("Run timed out after {0}s")]
    RunTimeout(u64),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Task failed: {0}")]
    TaskError(String),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("SSH error: {0}")]
    Ssh2Error(String),
}

impl FleetError {
    /// 是否属于连接类错误（结果归类为 Unreachable）
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            FleetError::SshConnectionError(_)
                | FleetError::AuthenticationError(_)
                | FleetError::ConnectionLost(_)
                | FleetError::TaskTimeout(_)
                | FleetError::RunTimeout(_)
                | FleetError::Cancelled
                | FleetError::InternalError(_)
                | FleetError::Ssh2Error(_)
        )
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        FleetError::ConfigurationError(message.into())
    }
}

impl From<std::io::Error> for FleetError {
    fn from(error: std::io::Error) -> Self {
        FleetError::IoError(error.to_string())
    }
}

impl From<ssh2::Error> for FleetError {
    fn from(error: ssh2::Error) -> Self {
        FleetError::Ssh2Error(error.to_string())
    }
}

impl From<tera::Error> for FleetError {
    fn from(error: tera::Error) -> Self {
        // tera 把真正原因放在 source 链里
        let mut message = error.to_string();
        let mut source = std::error::Error::source(&error);
        while let Some(inner) = source {
            message.push_str(": ");
            message.push_str(&inner.to_string());
            source = inner.source();
        }
        FleetError::TemplateError(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_classification() {
        assert!(FleetError::SshConnectionError("refused".into()).is_unreachable());
        assert!(FleetError::RunTimeout(30).is_unreachable());
        assert!(FleetError::Cancelled.is_unreachable());
        assert!(!FleetError::TaskError("exit 1".into()).is_unreachable());
        assert!(!FleetError::ConfigurationError("empty".into()).is_unreachable());
    }

    #[test]
    fn test_error_serialization() {
        let json = serde_json::to_string(&FleetError::TaskTimeout(5)).unwrap();
        assert!(json.contains("TaskTimeout"));
        assert_eq!(FleetError::TaskTimeout(5).to_string(), "Task timed out after 5s");
    }
}
