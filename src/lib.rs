// ============================================================================
// txretry Library
// ============================================================================

pub mod connection;
pub mod core;
pub mod interface;
pub mod naming;
pub mod prelude;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use crate::core::{
    DbError, ErrorClass, Result, Row, SqlState, SqlStateError, TxError, Value, is_retryable,
};
pub use interface::{DatabaseClient, Transaction};
pub use storage::{MemoryDb, MemoryStats, MemoryTransaction};
pub use transaction::{
    AttemptState, Bounded, Committed, ExponentialBackoff, RetryDecision, RetryPolicy,
    TransactionState, TxRunner, Unbounded, execute_tx,
};

pub use connection::{ConnectionConfig, RetryConfig};
#[cfg(feature = "postgres")]
pub use connection::{PgClient, PgTransaction};
