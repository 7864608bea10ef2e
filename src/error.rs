use thiserror::Error;

/// Wire-level error codes from spec §6.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WireErrorCode {
    Protocol,
    Auth,
    Network,
    NotFound,
    Permission,
    Exists,
    Quota,
    Cancelled,
    Internal,
    Timeout,
}

impl WireErrorCode {
    pub fn retryable(self) -> bool {
        matches!(self, WireErrorCode::Network | WireErrorCode::Timeout)
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),

    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("cross-device rename: {0}")]
    CrossDevice(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl GatewayError {
    /// Maps an internal error onto the wire taxonomy of spec §6.2.
    pub fn wire_code(&self) -> WireErrorCode {
        match self {
            GatewayError::Protocol(_) => WireErrorCode::Protocol,
            GatewayError::Auth(_) => WireErrorCode::Auth,
            GatewayError::Russh(_) => WireErrorCode::Network,
            GatewayError::Sftp(_) => WireErrorCode::Internal,
            GatewayError::NotFound(_) => WireErrorCode::NotFound,
            GatewayError::PermissionDenied(_) => WireErrorCode::Permission,
            GatewayError::Exists(_) | GatewayError::CrossDevice(_) => WireErrorCode::Exists,
            GatewayError::NotEmpty(_) => WireErrorCode::Exists,
            GatewayError::QuotaExceeded(_) => WireErrorCode::Quota,
            GatewayError::Cancelled => WireErrorCode::Cancelled,
            GatewayError::Timeout(_) => WireErrorCode::Timeout,
            GatewayError::Io(_) => WireErrorCode::Internal,
            GatewayError::Anyhow(_) => WireErrorCode::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Classifies an SFTP subprotocol error against the wire taxonomy, per
/// operation, instead of letting the blanket `#[from]` conversion collapse
/// every failure to `Internal` (spec §4.4's per-operation error table,
/// §7 "map to closest wire code"). `path` becomes the message for whichever
/// variant we land on.
pub fn classify_sftp_error(err: russh_sftp::client::error::Error, path: &str) -> GatewayError {
    use russh_sftp::client::error::Error as SftpError;
    use russh_sftp::protocol::StatusCode;

    let status_code = match &err {
        SftpError::Status(status) => Some(status.status_code),
        _ => None,
    };

    match status_code {
        Some(StatusCode::NoSuchFile) | Some(StatusCode::Eof) => GatewayError::NotFound(path.to_string()),
        Some(StatusCode::PermissionDenied) | Some(StatusCode::OpUnsupported) => {
            GatewayError::PermissionDenied(path.to_string())
        }
        _ if matches!(&err, SftpError::Timeout) => GatewayError::Timeout(path.to_string()),
        _ => GatewayError::Sftp(err),
    }
}
