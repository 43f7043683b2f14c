pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Already enrolled in this course")]
    AlreadyEnrolled,
    #[error("This course has already been completed")]
    AlreadyCompleted,
    #[error("Course already reviewed")]
    AlreadyReviewed,
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("Unique constraint violated: {0}")]
    UniqueConstraintViolation(String),
    #[error("Transaction aborted: {0}")]
    TransactionAborted(#[source] sqlx::Error),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Permission denied")]
    Forbidden,
    #[error("Database error: {0}")]
    Database(sqlx::Error),
    #[error("Fatal error: {0}")]
    Internal(anyhow::Error),
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::UniqueConstraintViolation(db.message().to_string())
            }
            _ => Error::Database(e),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Internal(e)
    }
}

impl Error {
    /// Wraps a failure that happened inside a multi-step transaction.
    /// Unique violations keep their own kind so callers can retry.
    pub fn aborted(e: sqlx::Error) -> Self {
        match Error::from(e) {
            Error::Database(e) => Error::TransactionAborted(e),
            other => other,
        }
    }

    /// Lost races: a unique clash, or sqlite giving up on the write lock.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::UniqueConstraintViolation(_) => true,
            Error::TransactionAborted(e) | Error::Database(e) => is_busy(e),
            _ => false,
        }
    }
}

/// `SQLITE_BUSY` or `SQLITE_LOCKED`, including their extended codes.
fn is_busy(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = e else {
        return false;
    };
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

/// Runs a read-modify-write operation, retrying it once when it lost a race
/// on a unique constraint or the write lock. The second attempt re-reads the
/// winner's state.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if e.is_retryable() => {
            tracing::warn!("retrying after lost race: {}", e);
            op().await
        }
        other => other,
    }
}
