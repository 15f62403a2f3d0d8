//! Typed configuration from environment variables.
//!
//! Loaded once at startup. Every variable has a default; malformed values
//! fail fast. The database URL is wrapped in `SecretString` so it never
//! reaches a log line.

pub mod secrets;

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::StartPosition;
use crate::queue::{DEFAULT_HOST_NAME, QueueKeys};
use secrecy::SecretString;

pub const DEFAULT_STREAM: &str = "jobQueueSTR";
pub const DEFAULT_GROUP: &str = "jobQueueGRP";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:4000";
const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 60;

#[derive(Debug)]
pub struct Config {
    /// Postgres URL. `None` selects the in-memory store.
    pub database_url: Option<SecretString>,
    pub host_name: String,
    pub stream: String,
    pub group: String,
    pub group_start: StartPosition,
    pub idle_threshold: Duration,
    pub listen_addr: SocketAddr,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// or `None` when unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let group_start = match var("JOBQ_GROUP_START") {
            Some(raw) => raw.parse()?,
            None => StartPosition::Latest,
        };
        let idle_secs = match var("JOBQ_IDLE_THRESHOLD_SECS") {
            Some(raw) => parse_var::<u64>("JOBQ_IDLE_THRESHOLD_SECS", &raw)?,
            None => DEFAULT_IDLE_THRESHOLD_SECS,
        };
        let listen_addr = parse_var(
            "JOBQ_LISTEN_ADDR",
            &var("JOBQ_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
        )?;

        Ok(Self {
            database_url: var("DATABASE_URL").map(SecretString::from),
            host_name: var("JOBQ_HOST_NAME")
                .or_else(|| var("HOSTNAME"))
                .unwrap_or_else(|| DEFAULT_HOST_NAME.to_string()),
            stream: var("JOBQ_STREAM").unwrap_or_else(|| DEFAULT_STREAM.to_string()),
            group: var("JOBQ_GROUP").unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            group_start,
            idle_threshold: Duration::from_secs(idle_secs),
            listen_addr,
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn queue_keys(&self) -> QueueKeys {
        QueueKeys::new(self.stream.clone(), self.group.clone())
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}")))
}
