use crate::core::{DbError, Result};
use crate::transaction::{ExponentialBackoff, TxRunner};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Default port of a CockroachDB node.
pub const DEFAULT_PORT: u16 = 26257;

/// Environment variable holding the connection URL used by the binary and
/// the live-database tests.
pub const DATABASE_URL_ENV: &str = "TXRETRY_DATABASE_URL";

/// Retry pacing, loadable from JSON or built in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Ceiling on attempts, counting the first. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay after the first failed attempt; doubles after each further one.
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_backoff_ms: 5,
            max_backoff_ms: 100,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> ExponentialBackoff {
        let policy = ExponentialBackoff::new(
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        );
        match self.max_attempts {
            Some(max) => policy.max_attempts(max),
            None => policy,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == Some(0) {
            return Err(DbError::ConfigError("max_attempts must be > 0".into()));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(DbError::ConfigError(
                "base_backoff_ms cannot exceed max_backoff_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Where and how to reach a PostgreSQL-wire database.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Empty means the server's default database.
    pub database: String,
    pub username: String,
    pub password: Option<String>,
    pub application_name: String,
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
}

impl ConnectionConfig {
    pub fn new(username: &str) -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            database: String::new(),
            username: username.to_string(),
            password: None,
            application_name: "txretry".to_string(),
            connect_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn application_name(mut self, name: &str) -> Self {
        self.application_name = name.to_string();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Parse a `postgres://` or `postgresql://` URL.
    ///
    /// # Examples
    ///
    /// ```
    /// use txretry::connection::ConnectionConfig;
    ///
    /// let config = ConnectionConfig::from_url("postgres://root@localhost:26257/bank").unwrap();
    /// assert_eq!(config.username, "root");
    /// assert_eq!(config.database, "bank");
    /// ```
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| DbError::ConfigError(format!("invalid URL: {}", e)))?;
        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Err(DbError::ConfigError(format!(
                "unsupported scheme '{}', expected postgres://",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| DbError::ConfigError("URL has no host".into()))?;
        let username = match decode("username", url.username())? {
            name if name.is_empty() => "root".to_string(),
            name => name,
        };
        let database = decode("database", url.path().trim_start_matches('/'))?;

        let mut config = Self::new(&username)
            .host(host)
            .port(url.port().unwrap_or(DEFAULT_PORT))
            .database(&database);
        if let Some(password) = url.password() {
            config = config.password(&decode("password", password)?);
        }

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "application_name" => config.application_name = value.into_owned(),
                "connect_timeout" => {
                    let secs = value.parse::<u64>().map_err(|_| {
                        DbError::ConfigError(format!("invalid connect_timeout '{}'", value))
                    })?;
                    config.connect_timeout = Duration::from_secs(secs);
                }
                _ => {}
            }
        }
        Ok(config)
    }

    /// Render as a URL with the password masked.
    pub fn to_url(&self) -> String {
        let auth = match &self.password {
            Some(_) => format!("{}:***", self.username),
            None => self.username.clone(),
        };
        format!(
            "postgres://{}@{}:{}/{}",
            auth, self.host, self.port, self.database
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(DbError::ConfigError("username cannot be empty".into()));
        }
        if self.host.is_empty() {
            return Err(DbError::ConfigError("host cannot be empty".into()));
        }
        if self.port == 0 {
            return Err(DbError::ConfigError("port must be > 0".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(DbError::ConfigError("connect_timeout must be > 0".into()));
        }
        self.retry.validate()
    }

    /// A runner paced by this connection's retry settings.
    pub fn runner(&self) -> TxRunner<ExponentialBackoff> {
        TxRunner::with_policy(self.retry.policy())
    }

    #[cfg(feature = "postgres")]
    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&self.host)
            .port(self.port)
            .user(&self.username)
            .application_name(&self.application_name)
            .connect_timeout(self.connect_timeout);
        if !self.database.is_empty() {
            pg.dbname(&self.database);
        }
        if let Some(password) = &self.password {
            pg.password(password);
        }
        pg
    }
}

/// Userinfo and path come out of `Url` percent-encoded.
fn decode(part: &str, raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| DbError::ConfigError(format!("{} is not valid UTF-8 once decoded", part)))
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("root")
    }
}
