//! Error taxonomy surfaced by engine entry points.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("recalculation already running (lock age {age_secs}s)")]
    LockHeld { age_secs: i64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("datastore error: {0:#}")]
    Datastore(#[from] anyhow::Error),
}

impl EngineError {
    /// HTTP-like status for callers that map errors onto a response.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Unauthorized(_) => 401,
            EngineError::Validation(_) => 400,
            EngineError::LockHeld { .. } => 409,
            EngineError::NotFound(_) => 404,
            EngineError::Datastore(_) => 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::Validation(_) => "validation",
            EngineError::LockHeld { .. } => "lock_held",
            EngineError::NotFound(_) => "not_found",
            EngineError::Datastore(_) => "datastore",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_is_distinct() {
        let err = EngineError::LockHeld { age_secs: 12 };
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.kind(), "lock_held");
        assert!(err.to_string().contains("12s"));

        let err: EngineError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.kind(), "datastore");
    }
}
