//! # Conductor error taxonomy
//!
//! Every fallible daemon operation returns a [`ConductorError`]. The control
//! plane maps each variant onto an HTTP status, and the CLI surfaces the
//! message verbatim (plain text or `{ "error": .. }` JSON).

use thiserror::Error;

/// Result alias used throughout the daemon libraries.
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Coarse classification of a [`ConductorError`], stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    BackendUnavailable,
    InvalidInput,
    Conflict,
    Unauthorized,
    Fatal,
}

impl ErrorKind {
    /// Machine-readable code carried in error bodies.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Fatal => "fatal",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "not_found" => Some(ErrorKind::NotFound),
            "backend_unavailable" => Some(ErrorKind::BackendUnavailable),
            "invalid_input" => Some(ErrorKind::InvalidInput),
            "conflict" => Some(ErrorKind::Conflict),
            "unauthorized" => Some(ErrorKind::Unauthorized),
            "fatal" => Some(ErrorKind::Fatal),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConductorError {
    /// The workspace id is unknown to the registry.
    #[error("workspace '{0}' not found")]
    NotFound(String),

    /// The engine could not be reached, even after one ensure-running retry.
    #[error("engine unavailable: {0}")]
    BackendUnavailable(String),

    /// Malformed request or CLI arguments.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Uniqueness violation. Idempotent adds make this unreachable today.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing or wrong bearer token on the control plane.
    #[error("unauthorized")]
    Unauthorized,

    /// State could not be read or written even after self-healing.
    #[error("{0}")]
    Fatal(String),
}

impl ConductorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConductorError::NotFound(_) => ErrorKind::NotFound,
            ConductorError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            ConductorError::InvalidInput(_) => ErrorKind::InvalidInput,
            ConductorError::Conflict(_) => ErrorKind::Conflict,
            ConductorError::Unauthorized => ErrorKind::Unauthorized,
            ConductorError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ConductorError::InvalidInput(message.into())
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        ConductorError::BackendUnavailable(message.into())
    }

    /// Wrap an I/O or serialization failure on durable state.
    pub fn fatal(context: &str, err: impl std::fmt::Display) -> Self {
        ConductorError::Fatal(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_kind() {
        let errors = [
            ConductorError::NotFound("ws-1".into()),
            ConductorError::unavailable("down"),
            ConductorError::invalid("bad"),
            ConductorError::Conflict("dup".into()),
            ConductorError::Unauthorized,
            ConductorError::fatal("write state", "disk full"),
        ];
        for err in errors {
            assert_eq!(ErrorKind::from_code(err.code()), Some(err.kind()));
        }
    }

    #[test]
    fn messages_are_human_readable() {
        assert_eq!(
            ConductorError::NotFound("ws-abc".into()).to_string(),
            "workspace 'ws-abc' not found"
        );
        assert_eq!(
            ConductorError::fatal("write state", "disk full").to_string(),
            "write state: disk full"
        );
    }
}
