// ⚠️ Error taxonomy
// Validation failures, invitation business rules, auth, remote/storage/database failures

use thiserror::Error;

// ============================================================================
// INVITATION ERRORS
// ============================================================================

/// Reasons an invitation token cannot be used.
/// All variants are the same class ("invitation not usable") with distinct messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvitationError {
    #[error("Invitation has expired")]
    Expired,

    #[error("Invitation has already been used")]
    AlreadyUsed,

    #[error("Invitation not found")]
    NotFound,
}

// ============================================================================
// APPLICATION ERROR
// ============================================================================

#[derive(Debug, Error)]
pub enum AppError {
    /// Synchronous input validation, messages already joined for display
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Invitation(#[from] InvitationError),

    #[error("Not authenticated")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Failure reported by the remote processing function, passed through as-is
    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    pub fn validation<I, S>(messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined: Vec<String> = messages
            .into_iter()
            .map(|m| m.as_ref().to_string())
            .collect();
        AppError::Validation(joined.join(", "))
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Invitation(InvitationError::Expired) => "INVITATION_EXPIRED",
            AppError::Invitation(InvitationError::AlreadyUsed) => "INVITATION_USED",
            AppError::Invitation(InvitationError::NotFound) => "INVITATION_NOT_FOUND",
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Remote(_) => "REMOTE_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Map "no rows" from a single-row query into a typed not-found error
pub(crate) fn not_found_on_empty(err: rusqlite::Error, what: &str) -> AppError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(what.to_string()),
        other => AppError::Database(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_joins_messages() {
        let err = AppError::validation(["first problem", "second problem"]);
        assert_eq!(err.to_string(), "first problem, second problem");
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_invitation_messages_are_distinct() {
        let expired: AppError = InvitationError::Expired.into();
        let used: AppError = InvitationError::AlreadyUsed.into();

        assert_eq!(expired.to_string(), "Invitation has expired");
        assert_eq!(used.to_string(), "Invitation has already been used");
        assert_ne!(expired.code(), used.code());
    }

    #[test]
    fn test_no_rows_maps_to_not_found() {
        let err = not_found_on_empty(rusqlite::Error::QueryReturnedNoRows, "file abc");
        assert!(matches!(err, AppError::NotFound(ref what) if what == "file abc"));
    }
}
