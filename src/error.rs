//! Stable error taxonomy shared by every subsystem.
//!
//! Each leaf enum maps onto one or more of the wire-level error codes
//! returned to callers and propagated through recipe summaries. `code()`
//! is the single source of truth for that string so dispatch, the
//! session, the subprocess runner and the recipe executor never redefine
//! it at the call site.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Dedup(#[from] DedupError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Recipe(#[from] RecipeError),
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(e) => e.code(),
            Error::Protocol(e) => e.code(),
            Error::Dedup(e) => e.code(),
            Error::Policy(e) => e.code(),
            Error::Audit(e) => e.code(),
            Error::Session(e) => e.code(),
            Error::Dispatch(e) => e.code(),
            Error::Process(e) => e.code(),
            Error::Recipe(e) => e.code(),
        }
    }

    /// Transport-class errors are safe to retry; policy/validation errors are terminal.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Protocol(
                ProtocolError::ReadTimeout
                    | ProtocolError::WriteTimeout
                    | ProtocolError::ConnectionClosed
                    | ProtocolError::Transport(_)
            ) | Error::Session(
                SessionError::ReadTimeout
                    | SessionError::WriteTimeout
                    | SessionError::ConnectionClosed
                    | SessionError::Transport(_)
            )
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("missing required config value {key}: {hint}")]
    MissingRequired { key: String, hint: String },
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("failed to parse config: {0}")]
    ParseError(String),
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        "INTERNAL_ERROR"
    }
}

/// Wire-level frame codec errors (C1).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame body exceeds maximum size")]
    FrameTooLarge,
    #[error("malformed frame header")]
    MalformedFrame,
    #[error("invalid json in frame body: {0}")]
    InvalidJson(String),
    #[error("read timed out")]
    ReadTimeout,
    #[error("write timed out")]
    WriteTimeout,
    #[error("connection closed mid-frame")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::FrameTooLarge => "FRAME_TOO_LARGE",
            ProtocolError::MalformedFrame => "MALFORMED_FRAME",
            ProtocolError::InvalidJson(_) => "INVALID_JSON",
            ProtocolError::ReadTimeout => "READ_TIMEOUT",
            ProtocolError::WriteTimeout => "WRITE_TIMEOUT",
            ProtocolError::ConnectionClosed => "CONNECTION_CLOSED",
            ProtocolError::Transport(_) => "TRANSPORT_ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("journal io error: {0}")]
    Journal(String),
}

impl DedupError {
    pub fn code(&self) -> &'static str {
        "INTERNAL_ERROR"
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("tool {tool} denied for role {role}")]
    ToolDenied { role: String, tool: String },
    #[error("rate limited, retry after {retry_after_sec}s")]
    RateLimited { retry_after_sec: u64 },
    #[error("request body of {actual_kb}kb exceeds limit of {limit_kb}kb")]
    RequestTooLarge { actual_kb: u64, limit_kb: u64 },
    #[error("array of {actual} items exceeds limit of {limit}")]
    ArrayTooLarge { actual: usize, limit: usize },
    #[error("path {0} not allowed")]
    PathNotAllowed(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("failed to load policy document: {0}")]
    Load(String),
}

impl PolicyError {
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::ToolDenied { .. } => "TOOL_DENIED",
            PolicyError::RateLimited { .. } => "RATE_LIMITED",
            PolicyError::RequestTooLarge { .. } => "REQUEST_TOO_LARGE",
            PolicyError::ArrayTooLarge { .. } => "ARRAY_TOO_LARGE",
            PolicyError::PathNotAllowed(_) => "PATH_NOT_ALLOWED",
            PolicyError::InvalidParams(_) => "INVALID_PARAMS",
            PolicyError::Load(_) => "INTERNAL_ERROR",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PolicyError::RateLimited { retry_after_sec } => {
                Some(Duration::from_secs(*retry_after_sec))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("hmac key of invalid length")]
    InvalidKey,
    #[error("journal io error: {0}")]
    Journal(String),
}

impl AuditError {
    pub fn code(&self) -> &'static str {
        "INTERNAL_ERROR"
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },
    #[error("read timed out")]
    ReadTimeout,
    #[error("write timed out")]
    WriteTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("mutation not allowed: allow_write is false")]
    WriteNotAllowed,
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Protocol(e) => e.code(),
            SessionError::HandshakeFailed(_) => "HANDSHAKE_FAILED",
            SessionError::ProtocolVersionMismatch { .. } => "PROTOCOL_VERSION_MISMATCH",
            SessionError::ReadTimeout => "READ_TIMEOUT",
            SessionError::WriteTimeout => "WRITE_TIMEOUT",
            SessionError::ConnectionClosed => "CONNECTION_CLOSED",
            SessionError::Transport(_) => "TRANSPORT_ERROR",
            SessionError::WriteNotAllowed => "WRITE_NOT_ALLOWED",
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("no handler registered for tool {0}")]
    UnknownTool(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Policy(e) => e.code(),
            DispatchError::Session(e) => e.code(),
            DispatchError::Process(e) => e.code(),
            DispatchError::UnknownTool(_) => "INVALID_PARAMS",
            DispatchError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process timed out after {0:?}")]
    Timeout(Duration),
    #[error("process exited with failure: {0}")]
    Failed(String),
    #[error("failed to parse process report: {0}")]
    ReportParseFailed(String),
    #[error("failed to spawn process: {0}")]
    Spawn(String),
}

impl ProcessError {
    pub fn code(&self) -> &'static str {
        match self {
            ProcessError::Timeout(_) => "TIMEOUT",
            ProcessError::Failed(_) => "PROCESS_FAILED",
            ProcessError::ReportParseFailed(_) => "REPORT_PARSE_FAILED",
            ProcessError::Spawn(_) => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),
    #[error("step {step} depends on unknown step {needs}")]
    UnknownDependency { step: String, needs: String },
    #[error("step graph contains a cycle")]
    Cycle,
    #[error("step {0} must set exactly one of params/params_file")]
    AmbiguousParams(String),
    #[error("failed to parse recipe: {0}")]
    Parse(String),
    #[error("template error: {0}")]
    Template(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl RecipeError {
    pub fn code(&self) -> &'static str {
        match self {
            RecipeError::DuplicateStep(_)
            | RecipeError::UnknownDependency { .. }
            | RecipeError::Cycle
            | RecipeError::AmbiguousParams(_)
            | RecipeError::Parse(_)
            | RecipeError::Template(_) => "INVALID_PARAMS",
            RecipeError::Dispatch(e) => e.code(),
        }
    }
}
