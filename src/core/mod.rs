pub mod error;
pub mod sqlstate;
pub mod value;

pub use error::{DbError, Result, TxError};
pub use sqlstate::{ErrorClass, SqlState, SqlStateError, is_retryable};
pub use value::{Row, Value};
