// ============================================================================
// Attempt State Machine
// ============================================================================
//
// One invocation of the runner walks these states:
//
// ```text
// Begin ──ok──> Run ──ok──> Commit ──ok──> Done
//   │            │            │
//   │            └──retryable─┴──> Retry ──policy allows──> Begin
//   │            │            │      │
//   └─error──────┴──fatal─────┴──────┴──policy refuses──> Failed
// ```
//
// ============================================================================

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// About to open a fresh transaction.
    Begin,
    /// The work function is running against the open handle.
    Run,
    /// Work succeeded; commit pending.
    Commit,
    /// The attempt hit a restart error and was discarded.
    Retry,
    /// Committed.
    Done,
    /// A fatal error ended the invocation.
    Failed,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Done | AttemptState::Failed)
    }

    /// Whether a transaction handle is open in this state.
    pub fn holds_transaction(&self) -> bool {
        matches!(self, AttemptState::Run | AttemptState::Commit)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptState::Begin => write!(f, "BEGIN"),
            AttemptState::Run => write!(f, "RUN"),
            AttemptState::Commit => write!(f, "COMMIT"),
            AttemptState::Retry => write!(f, "RETRY"),
            AttemptState::Done => write!(f, "DONE"),
            AttemptState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Lifecycle of a single transaction handle.
///
/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(AttemptState::Done.is_terminal());
        assert!(AttemptState::Failed.is_terminal());
        assert!(!AttemptState::Retry.is_terminal());
        assert!(TransactionState::Aborted.is_terminal());
        assert!(!TransactionState::Active.is_terminal());
    }

    #[test]
    fn test_handle_is_open_only_while_running_or_committing() {
        assert!(AttemptState::Run.holds_transaction());
        assert!(AttemptState::Commit.holds_transaction());
        assert!(!AttemptState::Begin.holds_transaction());
        assert!(!AttemptState::Retry.holds_transaction());
    }
}
