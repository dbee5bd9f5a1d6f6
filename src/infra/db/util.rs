use sqlx::error::ErrorKind;

use crate::application::repos::RepoError;

/// `query_canceled`, raised when `statement_timeout` fires.
const SQLSTATE_QUERY_CANCELED: &str = "57014";
/// `invalid_text_representation`, e.g. a malformed uuid literal.
const SQLSTATE_INVALID_TEXT: &str = "22P02";

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            match db.kind() {
                ErrorKind::UniqueViolation => RepoError::Duplicate {
                    constraint: db.constraint().unwrap_or("unknown").to_string(),
                },
                ErrorKind::ForeignKeyViolation => RepoError::InvalidInput { message },
                ErrorKind::CheckViolation | ErrorKind::NotNullViolation => {
                    RepoError::Integrity { message }
                }
                _ => match db.code().as_deref() {
                    Some(SQLSTATE_QUERY_CANCELED) => RepoError::Timeout,
                    Some(SQLSTATE_INVALID_TEXT) => RepoError::InvalidInput { message },
                    _ => RepoError::from_persistence(message),
                },
            }
        }
        other => RepoError::from_persistence(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_rows_map_to_not_found() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            RepoError::NotFound
        ));
    }

    #[test]
    fn exhausted_pool_is_a_timeout() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            RepoError::Timeout
        ));
    }

    #[test]
    fn other_errors_become_persistence_failures() {
        let err = map_sqlx_error(sqlx::Error::Protocol("unexpected frame".to_string()));
        match err {
            RepoError::Persistence(message) => assert!(message.contains("unexpected frame")),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
