// ============================================================================
// SQLSTATE codes and retry classification
// ============================================================================
//
// The database reports "transaction must restart" through a five character
// SQLSTATE. Classification is a pure function of that code: only a
// serialization failure is retryable, everything else (including errors that
// carry no code at all) is fatal.
//
// ============================================================================

use std::borrow::Cow;
use std::fmt;

/// A five character SQLSTATE error code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqlState(Cow<'static, str>);

impl SqlState {
    /// `40001`: the transaction conflicted with a concurrent one and must restart.
    pub const SERIALIZATION_FAILURE: SqlState = SqlState(Cow::Borrowed("40001"));
    pub const DEADLOCK_DETECTED: SqlState = SqlState(Cow::Borrowed("40P01"));
    pub const INVALID_TRANSACTION_STATE: SqlState = SqlState(Cow::Borrowed("25000"));
    pub const CONNECTION_FAILURE: SqlState = SqlState(Cow::Borrowed("08006"));
    pub const UNDEFINED_TABLE: SqlState = SqlState(Cow::Borrowed("42P01"));
    pub const DUPLICATE_TABLE: SqlState = SqlState(Cow::Borrowed("42P07"));
    pub const INVALID_PARAMETER_VALUE: SqlState = SqlState(Cow::Borrowed("22023"));
    pub const UNIQUE_VIOLATION: SqlState = SqlState(Cow::Borrowed("23505"));

    pub fn new(code: impl Into<String>) -> Self {
        SqlState(Cow::Owned(code.into()))
    }

    pub fn code(&self) -> &str {
        &self.0
    }

    /// The two character class prefix, e.g. `40` for transaction rollback.
    pub fn class(&self) -> &str {
        self.0.get(..2).unwrap_or(&self.0)
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The database discarded the transaction; the whole unit of work may run again.
    Retryable,
    /// Anything else. Surfaced to the caller unchanged.
    Fatal,
}

impl ErrorClass {
    pub fn of(code: Option<&SqlState>) -> Self {
        match code {
            Some(code) if *code == SqlState::SERIALIZATION_FAILURE => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Retryable)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Retryable => write!(f, "RETRYABLE"),
            ErrorClass::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Errors that may carry a protocol-level SQLSTATE.
pub trait SqlStateError {
    fn sql_state(&self) -> Option<SqlState>;

    fn error_class(&self) -> ErrorClass {
        ErrorClass::of(self.sql_state().as_ref())
    }
}

/// Returns `true` when `err` tells the caller to restart the transaction.
pub fn is_retryable<E: SqlStateError + ?Sized>(err: &E) -> bool {
    err.error_class().is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Coded(Option<&'static str>);

    impl SqlStateError for Coded {
        fn sql_state(&self) -> Option<SqlState> {
            self.0.map(SqlState::new)
        }
    }

    #[test]
    fn test_only_serialization_failure_is_retryable() {
        assert_eq!(ErrorClass::of(Some(&SqlState::SERIALIZATION_FAILURE)), ErrorClass::Retryable);
        assert_eq!(ErrorClass::of(Some(&SqlState::new("40001"))), ErrorClass::Retryable);

        assert_eq!(ErrorClass::of(Some(&SqlState::DEADLOCK_DETECTED)), ErrorClass::Fatal);
        assert_eq!(ErrorClass::of(Some(&SqlState::UNDEFINED_TABLE)), ErrorClass::Fatal);
        assert_eq!(ErrorClass::of(None), ErrorClass::Fatal);
    }

    #[test]
    fn test_is_retryable_uses_code() {
        assert!(is_retryable(&Coded(Some("40001"))));
        assert!(!is_retryable(&Coded(Some("40002"))));
        assert!(!is_retryable(&Coded(None)));
    }

    #[test]
    fn test_owned_and_borrowed_codes_compare_equal() {
        let owned = SqlState::new(String::from("42P01"));
        assert_eq!(owned, SqlState::UNDEFINED_TABLE);
        assert_eq!(owned.class(), "42");
        assert_eq!(owned.to_string(), "42P01");
    }

    #[test]
    fn test_short_code_class() {
        assert_eq!(SqlState::new("4").class(), "4");
    }
}
