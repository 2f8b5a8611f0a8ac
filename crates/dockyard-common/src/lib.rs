// Shared types for the dockyard sandbox service: the error taxonomy,
// the tagged response shape handed to transport layers, and the read
// models produced by the engine.

use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad caller input (name, image, path); detected before any engine call.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No matching container, file, or archive member.
    #[error("not found: {0}")]
    NotFound(String),

    /// The logical name is already taken for this user.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The container engine could not be reached.
    #[error("engine unreachable: {0}")]
    EngineTransport(String),

    /// The engine accepted the connection but rejected the request.
    #[error("engine rejected request: {0}")]
    EngineApplication(String),

    /// A terminal stream could not be opened, read, or written.
    #[error("stream error: {0}")]
    Stream(String),

    /// Local failure outside the engine, e.g. archive assembly.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::EngineTransport(_) => ErrorKind::EngineTransport,
            Error::EngineApplication(_) => ErrorKind::EngineApplication,
            Error::Stream(_) => ErrorKind::Stream,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The message without the taxonomy prefix added by `Display`.
    pub fn detail(&self) -> &str {
        match self {
            Error::Validation(msg)
            | Error::NotFound(msg)
            | Error::Conflict(msg)
            | Error::EngineTransport(msg)
            | Error::EngineApplication(msg)
            | Error::Stream(msg)
            | Error::Internal(msg) => msg,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    EngineTransport,
    EngineApplication,
    Stream,
    Internal,
}

/// Tagged result shape for transport layers. Serializes with a `status`
/// discriminant so socket/HTTP callers can branch without sniffing fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ApiResponse<T> {
    Success { payload: T },
    Error { kind: ErrorKind, message: String },
}

impl<T> From<Result<T>> for ApiResponse<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(payload) => ApiResponse::Success { payload },
            Err(err) => ApiResponse::Error {
                kind: err.kind(),
                message: err.detail().to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Removed,
}

impl ContainerStatus {
    /// Collapses the engine's state string into the lifecycle states the
    /// service tracks. Paused/restarting/dead all count as stopped.
    pub fn from_engine(state: &str) -> Self {
        match state {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "removing" => ContainerStatus::Removed,
            _ => ContainerStatus::Stopped,
        }
    }
}

/// A user's container as tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Engine-assigned identifier.
    pub id: String,
    /// Generated unique tag used as the engine-level name.
    pub engine_name: String,
    pub user: String,
    /// Human-chosen logical name, unique per user.
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub last_started: Option<DateTime<Utc>>,
}

/// Read-only projection returned by `list_for_user`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerView {
    pub id: String,
    pub name: String,
    pub status: String,
    pub image: String,
    pub os: String,
    pub created: Option<DateTime<Utc>>,
    pub last_started: Option<DateTime<Utc>>,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub mime_type: String,
    /// Lossily decoded UTF-8; invalid sequences are replaced, never fatal.
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDownload {
    pub path: String,
    pub filename: String,
    pub content_base64: String,
}
