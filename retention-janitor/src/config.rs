use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use retention_common::mysql::ConnectionConfig;
use thiserror::Error;

use crate::cleanup::{CleanerSettings, DeletionStrategy};

pub const DEFAULT_BATCH_SIZE: u64 = 1000;
pub const DEFAULT_SLEEP_SECONDS: f64 = 5.0;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "DATABASE_HOST", default = "localhost")]
    pub database_host: String,

    #[envconfig(from = "DATABASE_PORT", default = "3306")]
    pub database_port: u16,

    #[envconfig(from = "DATABASE_USER", default = "airflow")]
    pub database_user: String,

    #[envconfig(from = "DATABASE_PASSWORD")]
    pub database_password: Option<String>,

    #[envconfig(from = "DATABASE_NAME", default = "airflow")]
    pub database_name: String,

    #[envconfig(from = "DATABASE_MAX_OPEN_CONNECTIONS", default = "5")]
    pub database_max_open_connections: u32,

    #[envconfig(from = "DATABASE_MIN_IDLE_CONNECTIONS", default = "1")]
    pub database_min_idle_connections: u32,

    #[envconfig(from = "DATABASE_CONN_MAX_LIFETIME_SECS", default = "300")]
    pub database_conn_max_lifetime_secs: u64,

    #[envconfig(from = "DATABASE_MOCK", default = "false")]
    pub database_mock: bool,

    #[envconfig(from = "RETENTION_DAYS_DAG_RUN")]
    pub retention_days_dag_run: Option<u32>,

    #[envconfig(from = "RETENTION_DAYS_TASK_INSTANCE")]
    pub retention_days_task_instance: Option<u32>,

    #[envconfig(from = "RETENTION_DAYS_XCOM")]
    pub retention_days_xcom: Option<u32>,

    #[envconfig(from = "RETENTION_DAYS_LOG")]
    pub retention_days_log: Option<u32>,

    #[envconfig(from = "RETENTION_DAYS_JOB")]
    pub retention_days_job: Option<u32>,

    #[envconfig(from = "MISSING_RETENTION", default = "skip")]
    pub missing_retention: MissingRetention,

    #[envconfig(from = "BATCH_SIZE", default = "1000")]
    pub batch_size: i64,

    #[envconfig(from = "SLEEP_SECONDS", default = "5.0")]
    pub sleep_seconds: f64,

    #[envconfig(from = "DRY_RUN", default = "false")]
    pub dry_run: bool,

    #[envconfig(from = "USE_KEY_ENUMERATION", default = "false")]
    pub use_key_enumeration: bool,

    #[envconfig(from = "VERBOSE", default = "false")]
    pub verbose: bool,

    #[envconfig(from = "METRICS_TEXTFILE")]
    pub metrics_textfile: Option<String>,

    /// Log destination. Unset logs to stderr.
    #[envconfig(from = "LOG_FILE")]
    pub log_file: Option<String>,
}

/// What to do with a managed table that has no configured retention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingRetention {
    /// Leave the table alone.
    Skip,
    /// Treat it as zero days, expiring everything older than now.
    ZeroDays,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected \"skip\" or \"zero\", got {0:?}")]
pub struct ParseMissingRetentionError(String);

impl FromStr for MissingRetention {
    type Err = ParseMissingRetentionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(MissingRetention::Skip),
            "zero" => Ok(MissingRetention::ZeroDays),
            _ => Err(ParseMissingRetentionError(s.to_owned())),
        }
    }
}

/// Process-wide settings for one run. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub retention_days: HashMap<String, u32>,
    pub missing_retention: MissingRetention,
    pub batch_size: u64,
    pub dry_run: bool,
    pub sleep: Duration,
    pub use_key_enumeration: bool,
    pub verbose: bool,
}

impl RunConfig {
    pub fn strategy(&self) -> DeletionStrategy {
        if self.use_key_enumeration {
            DeletionStrategy::KeyEnumeration
        } else {
            DeletionStrategy::Range
        }
    }

    pub fn cleaner_settings(&self) -> CleanerSettings {
        CleanerSettings {
            batch_size: self.batch_size,
            dry_run: self.dry_run,
            sleep: self.sleep,
            strategy: self.strategy(),
        }
    }
}

impl Config {
    pub fn run_config(&self) -> RunConfig {
        let retention_days = [
            ("dag_run", self.retention_days_dag_run),
            ("task_instance", self.retention_days_task_instance),
            ("xcom", self.retention_days_xcom),
            ("log", self.retention_days_log),
            ("job", self.retention_days_job),
        ]
        .into_iter()
        .filter_map(|(table, days)| days.map(|days| (table.to_owned(), days)))
        .collect();

        let batch_size = u64::try_from(self.batch_size)
            .ok()
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE);

        let sleep_seconds = if self.sleep_seconds > 0.0 && self.sleep_seconds.is_finite() {
            self.sleep_seconds
        } else {
            DEFAULT_SLEEP_SECONDS
        };

        RunConfig {
            retention_days,
            missing_retention: self.missing_retention,
            batch_size,
            dry_run: self.dry_run,
            sleep: Duration::from_secs_f64(sleep_seconds),
            use_key_enumeration: self.use_key_enumeration,
            verbose: self.verbose,
        }
    }

    /// Open the configured log file for appending, creating it if needed.
    pub fn open_log_file(&self) -> io::Result<Option<File>> {
        self.log_file
            .as_deref()
            .map(|path| OpenOptions::new().create(true).append(true).open(path))
            .transpose()
    }

    pub fn database(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.database_host.clone(),
            port: self.database_port,
            user: self.database_user.clone(),
            password: self.database_password.clone(),
            name: self.database_name.clone(),
            max_connections: self.database_max_open_connections,
            min_connections: self.database_min_idle_connections,
            max_lifetime: Duration::from_secs(self.database_conn_max_lifetime_secs),
        }
    }
}
