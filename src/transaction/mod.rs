// ============================================================================
// Transaction Retry Module
// ============================================================================
//
// Runs a unit of work inside a database transaction and restarts the whole
// unit when the database reports a serialization failure (SQLSTATE 40001).
//
// - state:  the attempt state machine and per-handle lifecycle
// - policy: when to give up and how long to pause between attempts
// - runner: the orchestrator driving begin / work / commit / rollback
//
// ============================================================================

pub mod policy;
pub mod runner;
pub mod state;

pub use policy::{Bounded, ExponentialBackoff, RetryDecision, RetryPolicy, Unbounded};
pub use runner::{Committed, TxRunner, execute_tx};
pub use state::{AttemptState, TransactionState};
