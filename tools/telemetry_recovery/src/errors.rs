use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("fetch error: {0}")]
    Fetch(String),
    #[error("update error: {0}")]
    Update(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("delete error: {0}")]
    Delete(String),
    #[error("upload rejected: {0}")]
    UploadAccept(String),
    #[error("delivery error: {0}")]
    Delivery(String),
}
