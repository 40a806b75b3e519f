use async_trait::async_trait;
use crate::core::SqlStateError;

/// A database client able to open transactions.
///
/// This is the seam between the retry orchestrator and a concrete driver.
/// The in-memory [`MemoryDb`](crate::storage::MemoryDb) implements it for
/// tests and local use; [`PgClient`](crate::connection::postgres::PgClient)
/// wraps a PostgreSQL-wire database such as CockroachDB.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Handle for one open transaction.
    type Transaction: Transaction<Error = Self::Error>;

    /// Error reported by the driver. Its SQLSTATE drives retry decisions.
    type Error: SqlStateError + std::error::Error + Send + Sync + 'static;

    /// Open a new transaction. Every call yields a fresh, independent handle.
    async fn begin(&self) -> Result<Self::Transaction, Self::Error>;
}

/// A single-use transaction handle.
///
/// `commit` and `rollback` consume the handle, so a finished transaction
/// cannot be used again.
#[async_trait]
pub trait Transaction: Send + Sized {
    type Error: SqlStateError + std::error::Error + Send + Sync + 'static;

    async fn commit(self) -> Result<(), Self::Error>;

    async fn rollback(self) -> Result<(), Self::Error>;
}
