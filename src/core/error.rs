use crate::core::sqlstate::{SqlState, SqlStateError};
use thiserror::Error;

/// Errors reported by the database client collaborators.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("{message} (SQLSTATE {code})")]
    Database { code: SqlState, message: String },

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Table '{table}' expects {expected} columns, got {actual}")]
    ColumnCount {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("Transaction is no longer active")]
    TransactionClosed,

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    /// A restart error as an optimistic database reports it.
    pub fn serialization_failure(message: impl Into<String>) -> Self {
        DbError::Database {
            code: SqlState::SERIALIZATION_FAILURE,
            message: message.into(),
        }
    }

    pub fn database(code: SqlState, message: impl Into<String>) -> Self {
        DbError::Database {
            code,
            message: message.into(),
        }
    }
}

impl SqlStateError for DbError {
    fn sql_state(&self) -> Option<SqlState> {
        match self {
            DbError::Database { code, .. } => Some(code.clone()),
            DbError::TableExists(_) => Some(SqlState::DUPLICATE_TABLE),
            DbError::TableNotFound(_) => Some(SqlState::UNDEFINED_TABLE),
            DbError::TransactionClosed => Some(SqlState::INVALID_TRANSACTION_STATE),
            DbError::ConnectionError(_) => Some(SqlState::CONNECTION_FAILURE),
            #[cfg(feature = "postgres")]
            DbError::Postgres(err) => err.sql_state(),
            DbError::ColumnCount { .. } | DbError::ExecutionError(_) | DbError::ConfigError(_) => {
                None
            }
        }
    }
}

#[cfg(feature = "postgres")]
impl SqlStateError for tokio_postgres::Error {
    fn sql_state(&self) -> Option<SqlState> {
        self.code().map(|code| SqlState::new(code.code()))
    }
}

/// Looks through the whole cause chain for an error that carries a SQLSTATE.
impl SqlStateError for anyhow::Error {
    fn sql_state(&self) -> Option<SqlState> {
        self.chain().find_map(|cause| {
            if let Some(err) = cause.downcast_ref::<DbError>() {
                return err.sql_state();
            }
            #[cfg(feature = "postgres")]
            if let Some(err) = cause.downcast_ref::<tokio_postgres::Error>() {
                return err.sql_state();
            }
            None
        })
    }
}

/// Failure of a retried unit of work.
///
/// Every variant holds the original error untouched, so callers can inspect
/// the underlying cause with [`TxError::inner`] or [`TxError::into_inner`].
#[derive(Error, Debug)]
pub enum TxError<E> {
    /// No transaction could be opened. Nothing was attempted.
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] E),

    /// The work function failed with a non-retryable error.
    #[error("{0}")]
    Work(#[source] E),

    /// Commit failed with a non-retryable error.
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] E),

    /// The retry policy refused another attempt after a retryable failure.
    #[error("transaction gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> TxError<E> {
    pub fn inner(&self) -> &E {
        match self {
            TxError::Begin(err)
            | TxError::Work(err)
            | TxError::Commit(err)
            | TxError::RetriesExhausted { source: err, .. } => err,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            TxError::Begin(err)
            | TxError::Work(err)
            | TxError::Commit(err)
            | TxError::RetriesExhausted { source: err, .. } => err,
        }
    }

    pub fn is_begin(&self) -> bool {
        matches!(self, TxError::Begin(_))
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, TxError::Commit(_))
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, TxError::RetriesExhausted { .. })
    }
}

impl<E: SqlStateError> SqlStateError for TxError<E> {
    fn sql_state(&self) -> Option<SqlState> {
        self.inner().sql_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sqlstate::is_retryable;
    use anyhow::Context;

    #[test]
    fn test_db_error_codes() {
        assert!(is_retryable(&DbError::serialization_failure("restart transaction")));
        assert!(!is_retryable(&DbError::TableNotFound("t".into())));
        assert!(!is_retryable(&DbError::ExecutionError("boom".into())));
        assert_eq!(
            DbError::TransactionClosed.sql_state(),
            Some(SqlState::INVALID_TRANSACTION_STATE)
        );
    }

    #[test]
    fn test_database_error_display_carries_code() {
        let err = DbError::database(SqlState::DEADLOCK_DETECTED, "deadlock");
        assert_eq!(err.to_string(), "deadlock (SQLSTATE 40P01)");
    }

    #[test]
    fn test_anyhow_chain_is_classified() {
        let wrapped = Err::<(), _>(DbError::serialization_failure("conflict"))
            .context("moving funds")
            .unwrap_err();
        assert!(is_retryable(&wrapped));

        let plain = anyhow::anyhow!("insufficient funds");
        assert!(!is_retryable(&plain));
    }

    #[test]
    fn test_tx_error_preserves_original() {
        let err: TxError<DbError> = TxError::Work(DbError::ExecutionError("bad input".into()));
        assert_eq!(err.to_string(), "Execution error: bad input");
        assert!(matches!(err.into_inner(), DbError::ExecutionError(msg) if msg == "bad input"));

        let exhausted = TxError::RetriesExhausted {
            attempts: 3,
            source: DbError::serialization_failure("conflict"),
        };
        assert!(exhausted.is_exhausted());
        assert!(is_retryable(&exhausted));
        assert!(std::error::Error::source(&exhausted).is_some());
    }
}
