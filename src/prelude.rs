//! Everything a work function usually needs, in one import.
//!
//! ```
//! use txretry::prelude::*;
//! ```

pub use crate::{
    DatabaseClient, DbError, SqlStateError, Transaction, TxError, TxRunner, Value, execute_tx,
    is_retryable,
};
pub use futures::future::BoxFuture;
