//! Error types for tfsproxy
//!
//! This module defines the error taxonomy shared by the codec, the block
//! cache and the operation state machine, together with the numeric status
//! codes reported by the storage cluster.

use std::fmt;
use thiserror::Error;

/// Common result type for tfsproxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric result code reported by a backend in a status message
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub i32);

impl StatusCode {
    pub const OK: Self = Self(0);
    pub const GENERAL: Self = Self(-1000);
    pub const INVALID_ARGUMENT: Self = Self(-1007);
    pub const NETWORK: Self = Self(-3000);
    pub const TIMEOUT: Self = Self(-3005);
    pub const NO_BLOCK: Self = Self(-5001);
    pub const BLOCK_NOT_FOUND: Self = Self(-5003);
    pub const LEASE_EXPIRED: Self = Self(-5007);
    pub const OBJECT_NOT_FOUND: Self = Self(-5017);
    pub const READ_OFFSET: Self = Self(-8002);
    pub const NO_LOGIC_BLOCK: Self = Self(-8006);
    pub const DISK_OPER_INCOMPLETE: Self = Self(-8012);
    pub const FILE_INFO: Self = Self(-8016);
    pub const FILE_STATUS: Self = Self(-8018);
    pub const META_NOT_FOUND: Self = Self(-8025);
    pub const PHYSIC_BLOCK_OFFSET: Self = Self(-8033);
    pub const APP_NOT_EXIST: Self = Self(-9010);
    pub const PERMISSION_DENY: Self = Self(-9011);
    pub const TARGET_EXIST: Self = Self(-14001);
    pub const PARENT_EXIST: Self = Self(-14002);
    pub const DELETE_DIR_WITH_FILE: Self = Self(-14003);
    pub const VERSION_CONFLICT: Self = Self(-14004);
    pub const NOT_CREATE: Self = Self(-14005);
    pub const WRITE_EXIST_POS: Self = Self(-14009);
    pub const INVALID_FILE_NAME: Self = Self(-14010);
    pub const MOVE_TO_SUB_DIR: Self = Self(-14011);
    pub const OVER_MAX_SUB_DIRS_COUNT: Self = Self(-14012);
    pub const OVER_MAX_SUB_DIRS_DEEP: Self = Self(-14013);
    pub const OVER_MAX_SUB_FILES_COUNT: Self = Self(-14014);
    pub const TABLE_VERSION: Self = Self(-15003);

    /// Normalize a code read from the wire.
    ///
    /// Zero is success, protocol codes (<= -1000) are kept, anything else
    /// collapses to [`StatusCode::GENERAL`].
    #[must_use]
    pub const fn from_wire(code: i32) -> Self {
        if code == 0 {
            Self::OK
        } else if code <= -1000 {
            Self(code)
        } else {
            Self::GENERAL
        }
    }

    #[must_use]
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Codes that indicate stale routing or lease state rather than a
    /// client mistake.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NO_BLOCK
                | Self::BLOCK_NOT_FOUND
                | Self::LEASE_EXPIRED
                | Self::OBJECT_NOT_FOUND
                | Self::NO_LOGIC_BLOCK
                | Self::TABLE_VERSION
                | Self::NETWORK
                | Self::TIMEOUT
        )
    }

    /// Generic HTTP mapping, used when the action does not override it
    #[must_use]
    pub const fn http_status_code(self) -> u16 {
        match self {
            Self::OK => 200,

            // 400 Bad Request
            Self::INVALID_FILE_NAME
            | Self::READ_OFFSET
            | Self::DISK_OPER_INCOMPLETE
            | Self::INVALID_ARGUMENT
            | Self::PHYSIC_BLOCK_OFFSET
            | Self::WRITE_EXIST_POS => 400,

            // 401 Unauthorized
            Self::APP_NOT_EXIST => 401,

            // 403 Forbidden
            Self::PERMISSION_DENY
            | Self::DELETE_DIR_WITH_FILE
            | Self::MOVE_TO_SUB_DIR
            | Self::OVER_MAX_SUB_DIRS_COUNT
            | Self::OVER_MAX_SUB_DIRS_DEEP
            | Self::OVER_MAX_SUB_FILES_COUNT => 403,

            // 404 Not Found
            Self::OBJECT_NOT_FOUND
            | Self::BLOCK_NOT_FOUND
            | Self::META_NOT_FOUND
            | Self::FILE_INFO
            | Self::FILE_STATUS
            | Self::TARGET_EXIST
            | Self::PARENT_EXIST
            | Self::NOT_CREATE => 404,

            // 409 Conflict
            Self::VERSION_CONFLICT => 409,

            _ => 500,
        }
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCode({})", self.0)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for StatusCode {
    fn from(code: i32) -> Self {
        Self::from_wire(code)
    }
}

/// Common error type for tfsproxy
#[derive(Debug, Error)]
pub enum Error {
    // Transport errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    // Protocol status errors
    #[error("backend status {code}: {message}")]
    Status { code: StatusCode, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    // Local resource errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("corrupted data: {0}")]
    Corrupted(String),

    // Client side
    #[error("client aborted request")]
    ClientAbort,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a backend status error
    pub fn status(code: impl Into<StatusCode>, message: impl Into<String>) -> Self {
        Self::Status {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Backend status code carried by this error, if any
    #[must_use]
    pub const fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Check if this is a transport-level failure
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Timeout(_) | Self::ConnectionReset(_)
        )
    }

    /// Check if this is a retryable error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) | Self::Timeout(_) | Self::ConnectionReset(_) => true,
            Self::Status { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Status { code, .. } => matches!(
                *code,
                StatusCode::OBJECT_NOT_FOUND
                    | StatusCode::BLOCK_NOT_FOUND
                    | StatusCode::META_NOT_FOUND
                    | StatusCode::NO_LOGIC_BLOCK
            ),
            _ => false,
        }
    }

    /// Get the externally visible HTTP status code
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::Status { code, .. } => code.http_status_code(),

            // 400 Bad Request
            Self::InvalidArgument(_) => 400,

            // 404 Not Found
            Self::NotFound(_) => 404,

            // 408 Request Timeout
            Self::Timeout(_) => 408,

            // 499 Client Closed Request
            Self::ClientAbort => 499,

            // 500 Internal Server Error
            Self::Internal(_) | Self::Corrupted(_) | Self::Decode(_) => 500,

            // 503 Service Unavailable
            Self::ConnectionFailed(_) | Self::ConnectionReset(_) | Self::Configuration(_) => 503,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => Self::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::ConnectionReset(err.to_string()),
            _ => Self::ConnectionFailed(err.to_string()),
        }
    }
}
