#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("content must not be empty")]
    EmptyContent,

    #[error("content exceeds maximum length")]
    ContentTooLong,

    #[error("validation error: {0}")]
    Validation(String),

    /// Something tried to break a guarantee the store makes (physical delete,
    /// demoting a protected memory, an illegal status transition). Always fatal
    /// to the call.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("AI not configured (set STRATA_LLM_URL)")]
    AiNotConfigured,

    #[error("AI backend error: {0}")]
    AiBackend(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    /// Store, embedding and completion hiccups the caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AiBackend(_) | Self::Timeout(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}
