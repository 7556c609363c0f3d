use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::auth::AuthenticationFailed;
use crate::registry::RegistryError;

/// Error kinds that travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthenticationFailed,
    NotAuthorized,
    NotFound,
    DuplicateName,
    Exhausted,
    ServerStopping,
    AlreadyRunning,
    ExecutionFailed,
    Unavailable,
    Protocol,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::NotAuthorized => "not_authorized",
            ErrorKind::NotFound => "not_found",
            ErrorKind::DuplicateName => "duplicate_name",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::ServerStopping => "server_stopping",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(errorKind, errorDetail)` as carried in a reply frame.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct WireError {
    pub kind: ErrorKind,
    pub detail: String,
}

#[derive(Debug, Error)]
pub enum VigilError {
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("no free port in range {0}")]
    Exhausted(String),

    #[error("server is stopping")]
    ServerStopping,

    #[error("connector server is already starting or stopping")]
    AlreadyRunning,

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VigilError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VigilError::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            VigilError::NotAuthorized(_) => ErrorKind::NotAuthorized,
            VigilError::NotFound(_) => ErrorKind::NotFound,
            VigilError::DuplicateName(_) => ErrorKind::DuplicateName,
            VigilError::Exhausted(_) => ErrorKind::Exhausted,
            VigilError::ServerStopping => ErrorKind::ServerStopping,
            VigilError::AlreadyRunning => ErrorKind::AlreadyRunning,
            VigilError::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
            VigilError::Unavailable(_) => ErrorKind::Unavailable,
            VigilError::Protocol(_) => ErrorKind::Protocol,
            VigilError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn to_wire(&self) -> WireError {
        let detail = match self {
            VigilError::NotAuthorized(d)
            | VigilError::NotFound(d)
            | VigilError::DuplicateName(d)
            | VigilError::Exhausted(d)
            | VigilError::ExecutionFailed(d)
            | VigilError::Unavailable(d)
            | VigilError::Protocol(d) => d.clone(),
            VigilError::Io(e) => e.to_string(),
            VigilError::AuthenticationFailed
            | VigilError::ServerStopping
            | VigilError::AlreadyRunning => String::new(),
        };
        WireError {
            kind: self.kind(),
            detail,
        }
    }
}

impl From<WireError> for VigilError {
    fn from(err: WireError) -> Self {
        let WireError { kind, detail } = err;
        match kind {
            ErrorKind::AuthenticationFailed => VigilError::AuthenticationFailed,
            ErrorKind::NotAuthorized => VigilError::NotAuthorized(detail),
            ErrorKind::NotFound => VigilError::NotFound(detail),
            ErrorKind::DuplicateName => VigilError::DuplicateName(detail),
            ErrorKind::Exhausted => VigilError::Exhausted(detail),
            ErrorKind::ServerStopping => VigilError::ServerStopping,
            ErrorKind::AlreadyRunning => VigilError::AlreadyRunning,
            ErrorKind::ExecutionFailed => VigilError::ExecutionFailed(detail),
            ErrorKind::Unavailable => VigilError::Unavailable(detail),
            ErrorKind::Protocol => VigilError::Protocol(detail),
            ErrorKind::Io => VigilError::Io(std::io::Error::other(detail)),
        }
    }
}

impl From<AuthenticationFailed> for VigilError {
    fn from(_: AuthenticationFailed) -> Self {
        VigilError::AuthenticationFailed
    }
}

impl From<RegistryError> for VigilError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(name) => VigilError::NotFound(name),
            RegistryError::DuplicateName(name) => VigilError::DuplicateName(name),
            RegistryError::Exhausted { start, end } => {
                VigilError::Exhausted(format!("{start}-{end}"))
            }
            RegistryError::Io(e) => VigilError::Io(e),
            other => VigilError::Unavailable(other.to_string()),
        }
    }
}
