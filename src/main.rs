use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Barrier;
use txretry::connection::{DATABASE_URL_ENV, RetryConfig};
use txretry::naming::{NameGenerator, RandomNames};
use txretry::{DbError, MemoryDb, RetryPolicy, TxRunner, Unbounded, Value};

#[derive(Parser)]
#[command(name = "txretry")]
#[command(about = "Run contended transactions under automatic restart")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Move balances between two accounts from several concurrent writers.
    Transfer {
        #[arg(long, value_enum, default_value_t = Backend::Memory)]
        backend: Backend,
        #[arg(long, env = DATABASE_URL_ENV)]
        url: Option<String>,
        #[arg(long, default_value_t = 2)]
        writers: usize,
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Base delay between attempts; 0 retries immediately.
        #[arg(long, default_value_t = 0)]
        backoff_ms: u64,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
enum Backend {
    Memory,
    Postgres,
}

#[derive(Debug, Serialize)]
struct WriterReport {
    writer: usize,
    attempts: u32,
}

#[derive(Debug, Serialize)]
struct TransferReport {
    backend: Backend,
    writers: Vec<WriterReport>,
    balances: (i64, i64),
}

type Runner = TxRunner<Box<dyn RetryPolicy>>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("txretry=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Transfer {
            backend,
            url,
            writers,
            max_attempts,
            backoff_ms,
            json,
        } => {
            if writers == 0 {
                bail!("--writers must be at least 1");
            }
            let retry = retry_from_flags(max_attempts, backoff_ms)?;
            let report = match backend {
                Backend::Memory => {
                    transfer_memory(Arc::new(build_runner(retry.as_ref())), writers).await?
                }
                Backend::Postgres => transfer_postgres(retry, writers, url).await?,
            };
            print_report(&report, json)
        }
    }
}

/// `None` when no pacing flag was given.
fn retry_from_flags(max_attempts: Option<u32>, backoff_ms: u64) -> Result<Option<RetryConfig>> {
    if max_attempts.is_none() && backoff_ms == 0 {
        return Ok(None);
    }
    let retry = RetryConfig {
        max_attempts,
        base_backoff_ms: backoff_ms,
        max_backoff_ms: backoff_ms.saturating_mul(16),
    };
    retry.validate()?;
    Ok(Some(retry))
}

fn build_runner(retry: Option<&RetryConfig>) -> Runner {
    let policy: Box<dyn RetryPolicy> = match retry {
        Some(retry) => Box::new(retry.policy()),
        None => Box::new(Unbounded),
    };
    TxRunner::with_policy(policy)
}

fn print_report(report: &TransferReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for writer in &report.writers {
        println!("writer {}: {} attempt(s)", writer.writer, writer.attempts);
    }
    let total: u32 = report.writers.iter().map(|w| w.attempts).sum();
    println!(
        "balances: acct1={} acct2={} (total attempts {})",
        report.balances.0, report.balances.1, total
    );
    Ok(())
}

/// Amounts after moving 100 from the larger balance to the other account.
fn transfer(bal1: i64, bal2: i64) -> (i64, i64) {
    if bal1 > bal2 {
        (bal1 - 100, bal2 + 100)
    } else {
        (bal1 + 100, bal2 - 100)
    }
}

async fn transfer_memory(runner: Arc<Runner>, writers: usize) -> Result<TransferReport> {
    let db = MemoryDb::new();
    let table = Arc::new(RandomNames.generate("accounts"));
    db.create_table(&table, &["balance"]).await?;
    runner
        .run(&db, |tx| {
            let table = Arc::clone(&table);
            Box::pin(async move {
                tx.insert(&table, 1, vec![Value::Integer(100)]).await?;
                tx.insert(&table, 2, vec![Value::Integer(100)]).await?;
                Ok::<_, DbError>(())
            })
        })
        .await?;

    let barrier = Arc::new(Barrier::new(writers));
    let mut handles = Vec::with_capacity(writers);
    for writer in 1..=writers {
        let db = db.clone();
        let runner = Arc::clone(&runner);
        let table = Arc::clone(&table);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            let iteration = Arc::new(AtomicU32::new(0));
            runner
                .run(&db, |tx| {
                    let table = Arc::clone(&table);
                    let barrier = Arc::clone(&barrier);
                    let iteration = Arc::clone(&iteration);
                    Box::pin(async move {
                        let first = iteration.fetch_add(1, Ordering::SeqCst) == 0;
                        let bal1 = read_balance(tx, &table, 1).await?;
                        let bal2 = read_balance(tx, &table, 2).await?;
                        if first {
                            barrier.wait().await;
                        }
                        let (new1, new2) = transfer(bal1, bal2);
                        tx.write(&table, 1, vec![Value::Integer(new1)]).await?;
                        tx.write(&table, 2, vec![Value::Integer(new2)]).await?;
                        Ok::<_, DbError>(())
                    })
                })
                .await
                .map(|committed| WriterReport {
                    writer,
                    attempts: committed.attempts,
                })
        }));
    }

    let mut reports = Vec::with_capacity(writers);
    for handle in handles {
        reports.push(handle.await??);
    }

    let bal1 = committed_balance(&db, &table, 1).await?;
    let bal2 = committed_balance(&db, &table, 2).await?;
    Ok(TransferReport {
        backend: Backend::Memory,
        writers: reports,
        balances: (bal1, bal2),
    })
}

async fn read_balance(tx: &mut txretry::MemoryTransaction, table: &str, acct: i64) -> txretry::Result<i64> {
    let row = tx.read(table, acct).await?;
    row.and_then(|r| r.first().and_then(Value::as_i64))
        .ok_or_else(|| DbError::ExecutionError(format!("account {} has no balance", acct)))
}

async fn committed_balance(db: &MemoryDb, table: &str, acct: i64) -> Result<i64> {
    db.read_committed(table, acct)
        .await?
        .and_then(|r| r.first().and_then(Value::as_i64))
        .with_context(|| format!("account {} missing after transfer", acct))
}

#[cfg(feature = "postgres")]
async fn transfer_postgres(
    retry: Option<RetryConfig>,
    writers: usize,
    url: Option<String>,
) -> Result<TransferReport> {
    use txretry::connection::{ConnectionConfig, PgClient, PgTransaction};

    let url = url.with_context(|| format!("--url or {} is required for postgres", DATABASE_URL_ENV))?;
    let mut config = ConnectionConfig::from_url(&url)?;
    if let Some(retry) = retry {
        config = config.retry(retry);
    }
    let runner = Arc::new(config.runner());
    let admin = PgClient::connect(&config).await?;

    let db_name = Arc::new(RandomNames.generate("txretry"));
    admin
        .batch_execute(&format!(
            "CREATE DATABASE {0};
             CREATE TABLE {0}.t (acct INT PRIMARY KEY, balance INT);
             INSERT INTO {0}.t (acct, balance) VALUES (1, 100), (2, 100);",
            db_name
        ))
        .await?;

    async fn balances(tx: &PgTransaction, db_name: &str) -> txretry::Result<(i64, i64)> {
        let rows = tx
            .query(
                &format!("SELECT balance FROM {}.t WHERE acct IN (1, 2) ORDER BY acct", db_name),
                &[],
            )
            .await?;
        if rows.len() != 2 {
            return Err(DbError::ExecutionError(format!(
                "expected two balances; got {}",
                rows.len()
            )));
        }
        Ok((rows[0].try_get(0)?, rows[1].try_get(0)?))
    }

    let barrier = Arc::new(Barrier::new(writers));
    let mut handles = Vec::with_capacity(writers);
    for writer in 1..=writers {
        let client = PgClient::connect(&config).await?;
        let runner = Arc::clone(&runner);
        let db_name = Arc::clone(&db_name);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            let iteration = Arc::new(AtomicU32::new(0));
            runner
                .run(&client, |tx| {
                    let db_name = Arc::clone(&db_name);
                    let barrier = Arc::clone(&barrier);
                    let iteration = Arc::clone(&iteration);
                    Box::pin(async move {
                        let first = iteration.fetch_add(1, Ordering::SeqCst) == 0;
                        let (bal1, bal2) = balances(tx, &db_name).await?;
                        if first {
                            barrier.wait().await;
                        }
                        let (from, to) = if bal1 > bal2 { (1, 2) } else { (2, 1) };
                        tx.batch_execute(&format!(
                            "UPDATE {0}.t SET balance = balance - 100 WHERE acct = {1};
                             UPDATE {0}.t SET balance = balance + 100 WHERE acct = {2};",
                            db_name, from, to
                        ))
                        .await?;
                        Ok::<_, DbError>(())
                    })
                })
                .await
                .map(|committed| WriterReport {
                    writer,
                    attempts: committed.attempts,
                })
        }));
    }

    let mut reports = Vec::with_capacity(writers);
    for handle in handles {
        reports.push(handle.await??);
    }

    let final_balances = txretry::execute_tx(&admin, |tx| {
        let db_name = Arc::clone(&db_name);
        Box::pin(async move { balances(tx, &db_name).await })
    })
    .await?;
    admin
        .batch_execute(&format!("DROP DATABASE {} CASCADE", db_name))
        .await?;

    Ok(TransferReport {
        backend: Backend::Postgres,
        writers: reports,
        balances: final_balances,
    })
}

#[cfg(not(feature = "postgres"))]
async fn transfer_postgres(
    _retry: Option<RetryConfig>,
    _writers: usize,
    _url: Option<String>,
) -> Result<TransferReport> {
    bail!("built without the `postgres` feature")
}
