use thiserror::Error;

pub type InvokeResult<T> = Result<T, InvokeError>;

/// Error kinds exposed to callers. A non-zero tool exit is NOT an
/// error; it is a completed invocation carrying its exit code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvokeError {
    #[error("no such tool: {0}")]
    NoSuchTool(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("spawn error: {0}")]
    SpawnError(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

impl InvokeError {
    /// Stable kind token used in wire payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InvokeError::NoSuchTool(_) => "no-such-tool",
            InvokeError::BadRequest(_) => "bad-request",
            InvokeError::Forbidden(_) => "forbidden",
            InvokeError::Overloaded(_) => "overloaded",
            InvokeError::Timeout(_) => "timeout",
            InvokeError::Cancelled => "cancelled",
            InvokeError::SpawnError(_) => "spawn-error",
            InvokeError::DeadlineExceeded => "deadline-exceeded",
            InvokeError::Internal(_) => "internal",
        }
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        InvokeError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tokens_are_stable() {
        assert_eq!(InvokeError::NoSuchTool("x".into()).kind(), "no-such-tool");
        assert_eq!(InvokeError::Cancelled.kind(), "cancelled");
        assert_eq!(InvokeError::DeadlineExceeded.kind(), "deadline-exceeded");
        assert_eq!(InvokeError::SpawnError("e".into()).kind(), "spawn-error");
    }
}
