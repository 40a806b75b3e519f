//! Adapter for PostgreSQL-wire databases such as CockroachDB.

use super::ConnectionConfig;
use crate::core::{DbError, Result};
use crate::interface::{DatabaseClient, Transaction};
use async_trait::async_trait;
use log::{debug, error, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};

/// One connection to the server.
///
/// A connection runs one transaction at a time: `begin` waits until the
/// previous handle has been committed, rolled back or dropped. Open one
/// client per concurrent writer.
#[derive(Clone)]
pub struct PgClient {
    client: Arc<Mutex<Client>>,
}

impl PgClient {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let (client, connection) = config
            .to_pg_config()
            .connect(NoTls)
            .await
            .map_err(|e| DbError::ConnectionError(format!("{}: {}", config.to_url(), e)))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection terminated: {}", e);
            }
        });

        debug!("Connected to {}", config.to_url());
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    /// Run one or more statements outside any transaction, e.g. schema setup.
    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        let client = self.client.lock().await;
        client.batch_execute(sql).await?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseClient for PgClient {
    type Transaction = PgTransaction;
    type Error = DbError;

    async fn begin(&self) -> Result<PgTransaction> {
        let conn = Arc::clone(&self.client).lock_owned().await;
        // Owned by the handle before BEGIN goes out, so a cancelled begin
        // still rolls back on drop.
        let tx = PgTransaction { conn: Some(conn) };
        tx.batch_execute("BEGIN").await?;
        Ok(tx)
    }
}

/// An open transaction on a [`PgClient`] connection.
pub struct PgTransaction {
    conn: Option<OwnedMutexGuard<Client>>,
}

impl PgTransaction {
    fn client(&self) -> Result<&Client> {
        self.conn.as_deref().ok_or(DbError::TransactionClosed)
    }

    /// Execute a statement, returning the number of rows affected.
    pub async fn exec(&self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self.client()?.execute(statement, params).await?)
    }

    pub async fn query(&self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        Ok(self.client()?.query(statement, params).await?)
    }

    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        self.client()?.batch_execute(sql).await?;
        Ok(())
    }

    /// Ends the transaction with `statement`. The connection is released only
    /// once the server answered; if this future is dropped first, `Drop`
    /// still sends `ROLLBACK`.
    async fn finish(mut self, statement: &str) -> Result<()> {
        let outcome = self.client()?.batch_execute(statement).await;
        self.conn = None;
        outcome?;
        Ok(())
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    type Error = DbError;

    async fn commit(self) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.batch_execute("ROLLBACK").await {
                        warn!("Background rollback of dropped transaction failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("Transaction dropped outside a runtime; connection left mid-transaction"),
        }
    }
}
