use thiserror::Error;
use crate::status::{Code, Status};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("io error: {0}")]
    Io(String),
    #[error("truncated record: {0}")]
    Truncated(String),
    #[error("header format error: {0}")]
    HeaderFormat(String),
    #[error("entry format error: {0}")]
    EntryFormat(String),
    #[error("no matching call recorded for {method}")]
    UnmatchedCall { method: String },
    #[error("recorded call #{index} to {method} has no response")]
    IncompleteCall { method: String, index: u64 },
    #[error("recorder is closed")]
    RecorderClosed,
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
}

impl From<std::io::Error> for ReplayError {
    fn from(error: std::io::Error) -> Self {
        ReplayError::Io(error.to_string())
    }
}

impl From<ReplayError> for Status {
    fn from(error: ReplayError) -> Self {
        let code = match error {
            ReplayError::UnmatchedCall { .. } | ReplayError::IncompleteCall { .. } => {
                Code::FailedPrecondition
            }
            _ => Code::Internal,
        };
        Status::new(code, format!("rpcreplay: {error}"))
    }
}
