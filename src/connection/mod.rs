pub mod config;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use config::{ConnectionConfig, DATABASE_URL_ENV, DEFAULT_PORT, RetryConfig};
#[cfg(feature = "postgres")]
pub use postgres::{PgClient, PgTransaction};
