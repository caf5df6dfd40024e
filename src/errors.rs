//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Protocol message carried the wrong argument count or types.
    MalformedRequest(String),
    /// An argument was well-typed but outside its allowed values.
    InvalidArgument(String),
    /// Duplicate session name or duplicate client pid.
    AlreadyExists(String),
    /// Operation referenced an unknown session, client, or process name.
    NotFound(String),
    /// Session removal blocked by clients with unsaved changes.
    UnsavedChanges(String),
    /// Handshake or I/O deadline exceeded.
    Timeout(String),
    /// Operation aborted by supervisor shutdown.
    Cancelled(String),
    /// File-system or pipe operation failure.
    Io(String),
    /// Persisted current-session marker names an untracked session.
    InconsistentState(String),
    /// Child process spawn, wait, or exit-status failure.
    Process(String),
    /// OSC encoding or decoding failure.
    Protocol(String),
}

impl AppError {
    /// Numeric wire code carried in protocol error replies.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Protocol(_) => -1,
            Self::MalformedRequest(_) => -2,
            Self::InvalidArgument(_) => -3,
            Self::AlreadyExists(_) => -4,
            Self::NotFound(_) => -5,
            Self::UnsavedChanges(_) => -6,
            Self::Timeout(_) => -7,
            Self::Io(_) => -8,
            Self::InconsistentState(_) => -9,
            Self::Cancelled(_) => -10,
            Self::Process(_) => -11,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::MalformedRequest(msg) => write!(f, "malformed request: {msg}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::UnsavedChanges(msg) => write!(f, "unsaved changes: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::InconsistentState(msg) => write!(f, "inconsistent state: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<rosc::OscError> for AppError {
    fn from(err: rosc::OscError) -> Self {
        Self::Protocol(err.to_string())
    }
}
