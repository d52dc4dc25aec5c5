//! Batch deletion of expired rows.
//!
//! A [`Cleaner`] works through planned tables one at a time. For each table
//! it checks that the date column exists, counts the rows older than the
//! job's cutoff and, unless running dry, deletes them in batches of at most
//! `batch_size` rows with a pause between batches. The cutoff is fixed when
//! the job starts, so every statement in a job targets the same snapshot.
//!
//! Two strategies are supported:
//! - [`DeletionStrategy::Range`] issues `DELETE ... WHERE date < ? LIMIT n`.
//! - [`DeletionStrategy::KeyEnumeration`] selects primary keys of expired
//!   rows first and deletes by key. Composite keys are deleted with a
//!   disjunction of per-row conjunctions, flushed every
//!   [`COMPOSITE_FLUSH_ROWS`] rows.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use retention_common::database::{Database, Row};
use retention_common::error::DbError;
use retention_common::identifier::{Identifier, IdentifierError};
use retention_common::statement::{SqlValue, Statement};
use thiserror::Error;

use crate::observer::{CleanupEvent, CleanupObserver, TelemetryObserver};
use crate::pacing::{Clock, Pacer, SleepPacer, SystemClock};
use crate::plan::{PlannedTable, SkipReason, TableJob};
use crate::schema;

/// Upper bound on key rows per composite-key DELETE statement.
pub const COMPOSITE_FLUSH_ROWS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionStrategy {
    Range,
    KeyEnumeration,
}

impl fmt::Display for DeletionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeletionStrategy::Range => f.write_str("range delete"),
            DeletionStrategy::KeyEnumeration => f.write_str("key enumeration"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CleanerSettings {
    /// Rows per batch. Must be positive.
    pub batch_size: u64,
    pub dry_run: bool,
    /// Pause between batches, never after the last one.
    pub sleep: Duration,
    pub strategy: DeletionStrategy,
}

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(#[from] IdentifierError),

    #[error("table is not a managed table")]
    UnmanagedTable,

    #[error("column {0} is not declared for this table")]
    UnmanagedColumn(String),

    #[error("key enumeration selected but no primary key columns are configured")]
    MissingPrimaryKey,

    #[error("failed to check if column exists: {0}")]
    SchemaCheckFailed(#[source] DbError),

    #[error("failed to get expired row count: {0}")]
    CountQueryFailed(#[source] DbError),

    #[error("failed to query primary keys: {0}")]
    KeyQueryFailed(#[source] DbError),

    #[error("key row is missing column {0}")]
    KeyScanFailed(String),

    #[error("failed to delete records after deleting {deleted}: {source}")]
    DeleteFailed {
        deleted: u64,
        #[source]
        source: DbError,
    },
}

/// A failed job, tagged with its table.
#[derive(Debug, Error)]
#[error("failed to clean table {table}: {source}")]
pub struct TableError {
    pub table: String,
    #[source]
    pub source: CleanupError,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableOutcome {
    Skipped(SkipReason),
    ColumnMissing,
    DryRun {
        expired: u64,
    },
    NothingExpired,
    Deleted {
        expired: u64,
        deleted: u64,
        batches: u64,
    },
}

impl TableOutcome {
    pub fn expired(&self) -> u64 {
        match self {
            TableOutcome::DryRun { expired } | TableOutcome::Deleted { expired, .. } => *expired,
            _ => 0,
        }
    }

    pub fn deleted(&self) -> u64 {
        match self {
            TableOutcome::Deleted { deleted, .. } => *deleted,
            _ => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableReport {
    pub table: String,
    pub outcome: TableOutcome,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub tables: Vec<TableReport>,
}

impl RunSummary {
    pub fn total_expired(&self) -> u64 {
        self.tables.iter().map(|report| report.outcome.expired()).sum()
    }

    pub fn total_deleted(&self) -> u64 {
        self.tables.iter().map(|report| report.outcome.deleted()).sum()
    }

    pub fn outcome(&self, table: &str) -> Option<&TableOutcome> {
        self.tables
            .iter()
            .find(|report| report.table == table)
            .map(|report| &report.outcome)
    }
}

/// A validated job with its cutoff pinned.
struct ActiveJob<'a> {
    job: &'a TableJob,
    table: Identifier,
    date_column: Identifier,
    primary_key: Vec<Identifier>,
    cutoff: DateTime<Utc>,
}

struct Progress {
    expired: u64,
    deleted: u64,
    batches: u64,
}

impl Progress {
    fn new(expired: u64) -> Self {
        Self {
            expired,
            deleted: 0,
            batches: 0,
        }
    }

    fn next_limit(&self, batch_size: u64) -> u64 {
        batch_size.min(self.expired.saturating_sub(self.deleted))
    }

    fn is_complete(&self) -> bool {
        self.deleted >= self.expired
    }
}

pub struct Cleaner {
    db: Arc<dyn Database>,
    settings: CleanerSettings,
    observer: Arc<dyn CleanupObserver>,
    pacer: Arc<dyn Pacer>,
    clock: Arc<dyn Clock>,
}

impl Cleaner {
    pub fn new(db: Arc<dyn Database>, settings: CleanerSettings) -> Self {
        Self {
            db,
            settings,
            observer: Arc::new(TelemetryObserver),
            pacer: Arc::new(SleepPacer),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CleanupObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn emit(&self, event: CleanupEvent) {
        self.observer.on_event(&event);
    }

    /// Clean every planned table in order, stopping at the first failure.
    ///
    /// Batches deleted before a failure stay deleted.
    pub async fn clean_all(&self, plan: &[PlannedTable]) -> Result<RunSummary, TableError> {
        let mut summary = RunSummary::default();

        for entry in plan {
            let outcome = match entry {
                PlannedTable::Skip { table, reason } => {
                    self.emit(CleanupEvent::TableSkipped {
                        table: table.clone(),
                        reason: reason.clone(),
                    });
                    TableOutcome::Skipped(reason.clone())
                }
                PlannedTable::Clean(job) => {
                    self.clean_table(job).await.map_err(|source| TableError {
                        table: job.table_name.clone(),
                        source,
                    })?
                }
            };

            summary.tables.push(TableReport {
                table: entry.table_name().to_owned(),
                outcome,
            });
        }

        Ok(summary)
    }

    pub async fn clean_table(&self, job: &TableJob) -> Result<TableOutcome, CleanupError> {
        let active = self.activate(job)?;

        self.emit(CleanupEvent::JobStarted {
            table: job.table_name.clone(),
            cutoff: active.cutoff,
            strategy: self.settings.strategy,
        });

        let outcome = self.run(&active).await?;

        self.emit(CleanupEvent::JobFinished {
            table: job.table_name.clone(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    fn activate<'a>(&self, job: &'a TableJob) -> Result<ActiveJob<'a>, CleanupError> {
        let managed = schema::find(&job.table_name).ok_or(CleanupError::UnmanagedTable)?;

        let table = Identifier::parse(&job.table_name)?;
        let date_column = Identifier::parse(&job.date_column)?;
        let primary_key = job
            .primary_key
            .iter()
            .map(|column| Identifier::parse(column))
            .collect::<Result<Vec<_>, _>>()?;

        if date_column.as_str() != managed.date_column {
            return Err(CleanupError::UnmanagedColumn(date_column.to_string()));
        }
        if let Some(column) = primary_key
            .iter()
            .find(|column| !managed.primary_key.iter().any(|key| *key == column.as_str()))
        {
            return Err(CleanupError::UnmanagedColumn(column.to_string()));
        }

        if self.settings.strategy == DeletionStrategy::KeyEnumeration && primary_key.is_empty() {
            return Err(CleanupError::MissingPrimaryKey);
        }

        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(job.retention_days));

        Ok(ActiveJob {
            job,
            table,
            date_column,
            primary_key,
            cutoff,
        })
    }

    async fn run(&self, active: &ActiveJob<'_>) -> Result<TableOutcome, CleanupError> {
        let column_exists = self
            .db
            .fetch_scalar(&Statement::ColumnExists {
                table: active.table.clone(),
                column: active.date_column.clone(),
            })
            .await
            .map_err(CleanupError::SchemaCheckFailed)?;

        if column_exists == 0 {
            self.emit(CleanupEvent::ColumnMissing {
                table: active.job.table_name.clone(),
                column: active.job.date_column.clone(),
            });
            return Ok(TableOutcome::ColumnMissing);
        }

        let expired = self
            .db
            .fetch_scalar(&Statement::CountExpired {
                table: active.table.clone(),
                date_column: active.date_column.clone(),
                cutoff: active.cutoff,
            })
            .await
            .map_err(CleanupError::CountQueryFailed)?;
        let expired = u64::try_from(expired).unwrap_or(0);

        self.emit(CleanupEvent::ExpiredCounted {
            table: active.job.table_name.clone(),
            expired,
        });

        if self.settings.dry_run {
            self.emit(CleanupEvent::DryRun {
                table: active.job.table_name.clone(),
                expired,
            });
            return Ok(TableOutcome::DryRun { expired });
        }

        if expired == 0 {
            return Ok(TableOutcome::NothingExpired);
        }

        let progress = match self.settings.strategy {
            DeletionStrategy::Range => self.delete_by_range(active, expired).await?,
            DeletionStrategy::KeyEnumeration => self.delete_by_keys(active, expired).await?,
        };

        Ok(TableOutcome::Deleted {
            expired,
            deleted: progress.deleted,
            batches: progress.batches,
        })
    }

    /// Record a finished batch. Returns whether another batch should run,
    /// pausing first if so.
    async fn finish_batch(
        &self,
        active: &ActiveJob<'_>,
        progress: &mut Progress,
        batch_rows: u64,
        started: Instant,
        exhausted: bool,
    ) -> bool {
        progress.deleted += batch_rows;
        progress.batches += 1;

        self.emit(CleanupEvent::BatchCompleted {
            table: active.job.table_name.clone(),
            batch_rows,
            deleted: progress.deleted,
            expired: progress.expired,
            elapsed: started.elapsed(),
        });

        if exhausted || progress.is_complete() {
            return false;
        }

        self.emit(CleanupEvent::Pausing {
            table: active.job.table_name.clone(),
            duration: self.settings.sleep,
        });
        self.pacer.pause(self.settings.sleep).await;
        true
    }

    async fn delete_by_range(
        &self,
        active: &ActiveJob<'_>,
        expired: u64,
    ) -> Result<Progress, CleanupError> {
        let mut progress = Progress::new(expired);

        loop {
            let limit = progress.next_limit(self.settings.batch_size);
            let started = Instant::now();

            let affected = self
                .db
                .execute(&Statement::DeleteExpired {
                    table: active.table.clone(),
                    date_column: active.date_column.clone(),
                    cutoff: active.cutoff,
                    limit,
                })
                .await
                .map_err(|source| CleanupError::DeleteFailed {
                    deleted: progress.deleted,
                    source,
                })?;

            // Fewer rows than asked for: nothing older than the cutoff remains.
            let exhausted = affected < limit;
            if !self
                .finish_batch(active, &mut progress, affected, started, exhausted)
                .await
            {
                break;
            }
        }

        Ok(progress)
    }

    async fn delete_by_keys(
        &self,
        active: &ActiveJob<'_>,
        expired: u64,
    ) -> Result<Progress, CleanupError> {
        let mut progress = Progress::new(expired);

        loop {
            let limit = progress.next_limit(self.settings.batch_size);
            let started = Instant::now();

            let rows = self
                .db
                .fetch_rows(&Statement::SelectExpiredKeys {
                    table: active.table.clone(),
                    date_column: active.date_column.clone(),
                    key_columns: active.primary_key.clone(),
                    cutoff: active.cutoff,
                    limit,
                })
                .await
                .map_err(CleanupError::KeyQueryFailed)?;

            // The live table holds fewer expired rows than were counted.
            if rows.is_empty() {
                break;
            }

            let exhausted = (rows.len() as u64) < limit;
            let batch_rows = match active.primary_key.as_slice() {
                [column] => {
                    self.delete_single_keys(active, column, &rows, progress.deleted)
                        .await?
                }
                columns => {
                    self.delete_composite_keys(active, columns, &rows, progress.deleted)
                        .await?
                }
            };

            if !self
                .finish_batch(active, &mut progress, batch_rows, started, exhausted)
                .await
            {
                break;
            }
        }

        Ok(progress)
    }

    async fn delete_single_keys(
        &self,
        active: &ActiveJob<'_>,
        column: &Identifier,
        rows: &[Row],
        deleted: u64,
    ) -> Result<u64, CleanupError> {
        let values = rows
            .iter()
            .map(|row| {
                row.get(0)
                    .cloned()
                    .ok_or_else(|| CleanupError::KeyScanFailed(column.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.db
            .execute(&Statement::DeleteByKey {
                table: active.table.clone(),
                column: column.clone(),
                values,
            })
            .await
            .map_err(|source| CleanupError::DeleteFailed { deleted, source })
    }

    async fn delete_composite_keys(
        &self,
        active: &ActiveJob<'_>,
        columns: &[Identifier],
        rows: &[Row],
        deleted: u64,
    ) -> Result<u64, CleanupError> {
        let keys = rows
            .iter()
            .map(|row| composite_key(row, columns))
            .collect::<Result<Vec<_>, _>>()?;

        let mut batch_deleted = 0;
        for chunk in keys.chunks(COMPOSITE_FLUSH_ROWS) {
            batch_deleted += self
                .db
                .execute(&Statement::DeleteByCompositeKey {
                    table: active.table.clone(),
                    columns: columns.to_vec(),
                    rows: chunk.to_vec(),
                })
                .await
                .map_err(|source| CleanupError::DeleteFailed {
                    deleted: deleted + batch_deleted,
                    source,
                })?;
        }

        Ok(batch_deleted)
    }
}

fn composite_key(row: &Row, columns: &[Identifier]) -> Result<Vec<SqlValue>, CleanupError> {
    columns
        .iter()
        .map(|column| {
            row.get_named(column.as_str())
                .cloned()
                .ok_or_else(|| CleanupError::KeyScanFailed(column.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use retention_common::error::DbResult;
    use retention_common::mock::MockDatabase;
    use retention_common::statement::StatementKind;

    use super::*;
    use crate::observer::testing::RecordingObserver;
    use crate::pacing::testing::{FixedClock, RecordingPacer, SteppingClock};
    use crate::schema::managed_tables;

    const SLEEP: Duration = Duration::from_millis(1500);

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap()
    }

    struct Harness {
        db: Arc<MockDatabase>,
        pacer: Arc<RecordingPacer>,
        observer: Arc<RecordingObserver>,
        cleaner: Cleaner,
    }

    fn harness(strategy: DeletionStrategy, batch_size: u64, dry_run: bool) -> Harness {
        harness_on(Arc::new(MockDatabase::new()), strategy, batch_size, dry_run)
    }

    fn harness_on(
        db: Arc<MockDatabase>,
        strategy: DeletionStrategy,
        batch_size: u64,
        dry_run: bool,
    ) -> Harness {
        let pacer = Arc::new(RecordingPacer::default());
        let observer = Arc::new(RecordingObserver::default());
        let cleaner = Cleaner::new(
            db.clone(),
            CleanerSettings {
                batch_size,
                dry_run,
                sleep: SLEEP,
                strategy,
            },
        )
        .with_pacer(pacer.clone())
        .with_observer(observer.clone())
        .with_clock(Arc::new(FixedClock(now())));

        Harness {
            db,
            pacer,
            observer,
            cleaner,
        }
    }

    fn job(table: &str, retention_days: u32) -> TableJob {
        let table = schema::find(table).unwrap();
        TableJob {
            table_name: table.name.to_owned(),
            retention_days,
            date_column: table.date_column.to_owned(),
            primary_key: table.primary_key.iter().map(|c| c.to_string()).collect(),
        }
    }

    fn full_plan() -> Vec<PlannedTable> {
        managed_tables()
            .iter()
            .map(|table| PlannedTable::Clean(job(table.name, 30)))
            .collect()
    }

    fn deletes(db: &MockDatabase, table: &str) -> Vec<Statement> {
        db.statements_for(table)
            .into_iter()
            .filter(Statement::is_mutating)
            .collect()
    }

    #[tokio::test]
    async fn test_range_delete_batches_and_pauses() {
        let h = harness(DeletionStrategy::Range, 1000, false);
        h.db.set_expired("log", 2500);

        let outcome = h.cleaner.clean_table(&job("log", 30)).await.unwrap();

        assert_eq!(
            outcome,
            TableOutcome::Deleted {
                expired: 2500,
                deleted: 2500,
                batches: 3
            }
        );
        let limits: Vec<_> = deletes(&h.db, "log")
            .iter()
            .map(|statement| match statement {
                Statement::DeleteExpired { limit, .. } => *limit,
                other => panic!("unexpected statement {other:?}"),
            })
            .collect();
        assert_eq!(limits, [1000, 1000, 500]);
        assert_eq!(h.pacer.pauses(), [SLEEP, SLEEP]);
        assert_eq!(h.db.expired("log"), 0);
    }

    #[tokio::test]
    async fn test_all_statements_share_the_job_cutoff() {
        let h = harness(DeletionStrategy::Range, 100, false);
        let cleaner = h.cleaner.with_clock(Arc::new(SteppingClock::new(
            now(),
            chrono::Duration::hours(1),
        )));
        h.db.set_expired("dag_run", 350).set_expired("job", 10);

        cleaner.clean_table(&job("dag_run", 30)).await.unwrap();
        cleaner.clean_table(&job("job", 30)).await.unwrap();

        let dag_run_cutoff = now() - chrono::Duration::days(30);
        for statement in h.db.statements_for("dag_run") {
            if let Statement::CountExpired { cutoff, .. } | Statement::DeleteExpired { cutoff, .. } =
                statement
            {
                assert_eq!(cutoff, dag_run_cutoff);
            }
        }
        // The second job reads the clock again, once.
        let job_cutoff = dag_run_cutoff + chrono::Duration::hours(1);
        for statement in h.db.statements_for("job") {
            if let Statement::CountExpired { cutoff, .. } | Statement::DeleteExpired { cutoff, .. } =
                statement
            {
                assert_eq!(cutoff, job_cutoff);
            }
        }
    }

    #[tokio::test]
    async fn test_zero_retention_cuts_off_at_now() {
        let h = harness(DeletionStrategy::Range, 1000, true);

        h.cleaner.clean_table(&job("xcom", 0)).await.unwrap();

        assert!(h.observer.events().iter().any(|event| matches!(
            event,
            CleanupEvent::JobStarted { cutoff, .. } if *cutoff == now()
        )));
    }

    #[tokio::test]
    async fn test_key_enumeration_single_column() {
        let h = harness(DeletionStrategy::KeyEnumeration, 1000, false);
        h.db.set_expired("dag_run", 2500);

        let outcome = h.cleaner.clean_table(&job("dag_run", 30)).await.unwrap();

        assert_eq!(outcome.deleted(), 2500);
        let kinds: Vec<_> = h
            .db
            .statements_for("dag_run")
            .iter()
            .map(Statement::kind)
            .collect();
        assert_eq!(
            kinds,
            [
                StatementKind::ColumnCheck,
                StatementKind::Count,
                StatementKind::SelectKeys,
                StatementKind::Delete,
                StatementKind::SelectKeys,
                StatementKind::Delete,
                StatementKind::SelectKeys,
                StatementKind::Delete,
            ]
        );
        let sizes: Vec<_> = deletes(&h.db, "dag_run")
            .iter()
            .map(|statement| match statement {
                Statement::DeleteByKey { values, .. } => values.len(),
                other => panic!("unexpected statement {other:?}"),
            })
            .collect();
        assert_eq!(sizes, [1000, 1000, 500]);
        assert_eq!(h.pacer.pauses().len(), 2);
    }

    #[tokio::test]
    async fn test_later_key_batches_do_not_repeat_keys() {
        let h = harness(DeletionStrategy::KeyEnumeration, 2, false);
        h.db.set_expired("job", 4);

        h.cleaner.clean_table(&job("job", 30)).await.unwrap();

        let deleted: Vec<_> = deletes(&h.db, "job")
            .into_iter()
            .flat_map(|statement| statement.args())
            .collect();
        assert_eq!(
            deleted,
            [0, 1, 2, 3].map(SqlValue::Int).to_vec()
        );
    }

    #[tokio::test]
    async fn test_composite_key_flushes_every_hundred_rows() {
        let h = harness(DeletionStrategy::KeyEnumeration, 250, false);
        h.db.set_expired("xcom", 250);

        let outcome = h.cleaner.clean_table(&job("xcom", 30)).await.unwrap();

        assert_eq!(
            outcome,
            TableOutcome::Deleted {
                expired: 250,
                deleted: 250,
                batches: 1
            }
        );
        let deletes = deletes(&h.db, "xcom");
        let sizes: Vec<_> = deletes
            .iter()
            .map(|statement| match statement {
                Statement::DeleteByCompositeKey { rows, .. } => rows.len(),
                other => panic!("unexpected statement {other:?}"),
            })
            .collect();
        assert_eq!(sizes, [100, 100, 50]);
        assert_eq!(deletes[0].args().len(), 100 * 5);
        assert!(h.pacer.pauses().is_empty());
    }

    #[tokio::test]
    async fn test_composite_key_across_batches() {
        let h = harness(DeletionStrategy::KeyEnumeration, 1000, false);
        h.db.set_expired("task_instance", 2500);

        let outcome = h
            .cleaner
            .clean_table(&job("task_instance", 30))
            .await
            .unwrap();

        assert_eq!(outcome.deleted(), 2500);
        assert_eq!(deletes(&h.db, "task_instance").len(), 10 + 10 + 5);
        assert_eq!(h.pacer.pauses().len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_reports_count_without_mutating() {
        let h = harness(DeletionStrategy::KeyEnumeration, 100, true);
        h.db.set_expired("log", 4321);

        let summary = h.cleaner.clean_all(&full_plan()).await.unwrap();

        assert!(h.db.statements().iter().all(|s| !s.is_mutating()));
        assert!(h
            .db
            .statements()
            .iter()
            .all(|s| s.kind() != StatementKind::SelectKeys));
        assert_eq!(
            summary.outcome("log"),
            Some(&TableOutcome::DryRun { expired: 4321 })
        );
        assert_eq!(h.db.expired("log"), 4321);
        assert!(h.pacer.pauses().is_empty());

        // A real run against the same table starts from the same count.
        let real = harness_on(h.db.clone(), DeletionStrategy::KeyEnumeration, 100, false);
        let outcome = real.cleaner.clean_table(&job("log", 30)).await.unwrap();

        assert_eq!(outcome.expired(), 4321);
        assert_eq!(outcome.deleted(), 4321);
    }

    #[tokio::test]
    async fn test_zero_count_issues_only_count() {
        let h = harness(DeletionStrategy::Range, 1000, false);
        h.db.set_expired("job", 0);

        let outcome = h.cleaner.clean_table(&job("job", 30)).await.unwrap();

        assert_eq!(outcome, TableOutcome::NothingExpired);
        let kinds: Vec<_> = h.db.statements().iter().map(Statement::kind).collect();
        assert_eq!(kinds, [StatementKind::ColumnCheck, StatementKind::Count]);
        assert!(h.pacer.pauses().is_empty());
    }

    #[tokio::test]
    async fn test_missing_column_is_skipped_and_run_continues() {
        let h = harness(DeletionStrategy::Range, 1000, false);
        h.db.drop_date_column("dag_run");

        let summary = h.cleaner.clean_all(&full_plan()).await.unwrap();

        assert_eq!(summary.outcome("dag_run"), Some(&TableOutcome::ColumnMissing));
        assert_eq!(
            h.db.statements_for("dag_run")
                .iter()
                .map(Statement::kind)
                .collect::<Vec<_>>(),
            [StatementKind::ColumnCheck]
        );
        for table in ["task_instance", "xcom", "log", "job"] {
            assert_eq!(summary.outcome(table).map(TableOutcome::deleted), Some(1000));
        }
        assert!(h.observer.events().contains(&CleanupEvent::ColumnMissing {
            table: "dag_run".to_owned(),
            column: "execution_date".to_owned(),
        }));
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_tables() {
        let h = harness(DeletionStrategy::Range, 1000, false);
        h.db.fail_on("xcom", StatementKind::Count);

        let error = h.cleaner.clean_all(&full_plan()).await.unwrap_err();

        assert_eq!(error.table, "xcom");
        assert!(matches!(error.source, CleanupError::CountQueryFailed(_)));
        assert!(error.to_string().starts_with("failed to clean table xcom"));
        // Earlier tables stay cleaned, later ones are never touched.
        assert_eq!(h.db.expired("dag_run"), 0);
        assert_eq!(h.db.expired("task_instance"), 0);
        assert!(h.db.statements_for("log").is_empty());
        assert!(h.db.statements_for("job").is_empty());
    }

    #[tokio::test]
    async fn test_schema_check_failure() {
        let h = harness(DeletionStrategy::Range, 1000, false);
        h.db.fail_on("log", StatementKind::ColumnCheck);

        let error = h.cleaner.clean_table(&job("log", 30)).await.unwrap_err();

        assert!(matches!(error, CleanupError::SchemaCheckFailed(_)));
    }

    #[tokio::test]
    async fn test_delete_failure_reports_progress() {
        let h = harness(DeletionStrategy::Range, 1000, false);
        h.db.fail_on("job", StatementKind::Delete);

        let error = h.cleaner.clean_table(&job("job", 30)).await.unwrap_err();

        assert!(matches!(error, CleanupError::DeleteFailed { deleted: 0, .. }));
    }

    #[tokio::test]
    async fn test_key_query_failure() {
        let h = harness(DeletionStrategy::KeyEnumeration, 1000, false);
        h.db.fail_on("job", StatementKind::SelectKeys);

        let error = h.cleaner.clean_table(&job("job", 30)).await.unwrap_err();

        assert!(matches!(error, CleanupError::KeyQueryFailed(_)));
        assert!(deletes(&h.db, "job").is_empty());
    }

    #[tokio::test]
    async fn test_missing_primary_key_fails_before_any_statement() {
        let h = harness(DeletionStrategy::KeyEnumeration, 1000, false);
        let mut job = job("log", 30);
        job.primary_key.clear();

        let error = h.cleaner.clean_table(&job).await.unwrap_err();

        assert!(matches!(error, CleanupError::MissingPrimaryKey));
        assert!(h.db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_range_delete_needs_no_primary_key() {
        let h = harness(DeletionStrategy::Range, 1000, false);
        let mut job = job("log", 30);
        job.primary_key.clear();

        let outcome = h.cleaner.clean_table(&job).await.unwrap();

        assert_eq!(outcome.deleted(), 1000);
    }

    #[tokio::test]
    async fn test_identifiers_are_validated_before_use() {
        let h = harness(DeletionStrategy::Range, 1000, false);

        let mut unmanaged = job("log", 30);
        unmanaged.table_name = "users".to_owned();
        assert!(matches!(
            h.cleaner.clean_table(&unmanaged).await,
            Err(CleanupError::UnmanagedTable)
        ));

        let mut injected = job("log", 30);
        injected.date_column = "dttm < NOW() OR 1".to_owned();
        assert!(matches!(
            h.cleaner.clean_table(&injected).await,
            Err(CleanupError::InvalidIdentifier(_))
        ));

        assert!(h.db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_columns_must_match_the_catalogue() {
        let h = harness(DeletionStrategy::KeyEnumeration, 1000, false);

        let mut wrong_date = job("job", 30);
        wrong_date.date_column = "latest_heartbeat".to_owned();
        assert!(matches!(
            h.cleaner.clean_table(&wrong_date).await,
            Err(CleanupError::UnmanagedColumn(column)) if column == "latest_heartbeat"
        ));

        let mut wrong_key = job("task_instance", 30);
        wrong_key.primary_key.push("hostname".to_owned());
        assert!(matches!(
            h.cleaner.clean_table(&wrong_key).await,
            Err(CleanupError::UnmanagedColumn(column)) if column == "hostname"
        ));

        assert!(h.db.statements().is_empty());
    }

    /// Serves a fixed key set and fails the `fail_on_delete`-th delete.
    struct ScriptedKeys {
        rows: Vec<Row>,
        fail_on_delete: Option<usize>,
        deletes: Mutex<Vec<Statement>>,
    }

    impl ScriptedKeys {
        fn new(rows: Vec<Row>, fail_on_delete: Option<usize>) -> Self {
            Self {
                rows,
                fail_on_delete,
                deletes: Mutex::new(Vec::new()),
            }
        }

        fn deletes(&self) -> Vec<Statement> {
            self.deletes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Database for ScriptedKeys {
        async fn fetch_scalar(&self, statement: &Statement) -> DbResult<i64> {
            match statement {
                Statement::ColumnExists { .. } => Ok(1),
                _ => Ok(self.rows.len() as i64),
            }
        }

        async fn execute(&self, statement: &Statement) -> DbResult<u64> {
            let mut deletes = self.deletes.lock().unwrap();
            deletes.push(statement.clone());
            if Some(deletes.len()) == self.fail_on_delete {
                return Err(DbError::Mock("delete rejected".to_owned()));
            }
            match statement {
                Statement::DeleteByCompositeKey { rows, .. } => Ok(rows.len() as u64),
                _ => Ok(0),
            }
        }

        async fn fetch_rows(&self, _statement: &Statement) -> DbResult<Vec<Row>> {
            Ok(self.rows.clone())
        }
    }

    fn scripted_cleaner(db: Arc<ScriptedKeys>) -> Cleaner {
        Cleaner::new(
            db,
            CleanerSettings {
                batch_size: 1000,
                dry_run: false,
                sleep: SLEEP,
                strategy: DeletionStrategy::KeyEnumeration,
            },
        )
        .with_pacer(Arc::new(RecordingPacer::default()))
        .with_observer(Arc::new(RecordingObserver::default()))
        .with_clock(Arc::new(FixedClock(now())))
    }

    fn task_instance_key(id: i64) -> Row {
        Row::new()
            .with("dag_id", SqlValue::Text("etl".to_owned()))
            .with("task_id", SqlValue::Text(format!("task-{id}")))
            .with("run_id", SqlValue::Text("scheduled".to_owned()))
            .with("map_index", SqlValue::Int(-1))
    }

    #[tokio::test]
    async fn test_composite_key_row_missing_a_column() {
        let rows = vec![Row::new()
            .with("dag_id", SqlValue::Int(1))
            .with("run_id", SqlValue::Text("scheduled".to_owned()))
            .with("map_index", SqlValue::Int(-1))];
        let db = Arc::new(ScriptedKeys::new(rows, None));

        let error = scripted_cleaner(db.clone())
            .clean_table(&job("task_instance", 30))
            .await
            .unwrap_err();

        assert!(matches!(error, CleanupError::KeyScanFailed(column) if column == "task_id"));
        assert!(db.deletes().is_empty());
    }

    #[tokio::test]
    async fn test_composite_delete_failure_counts_flushed_chunks() {
        let rows = (0..250).map(task_instance_key).collect();
        let db = Arc::new(ScriptedKeys::new(rows, Some(3)));

        let error = scripted_cleaner(db.clone())
            .clean_table(&job("task_instance", 30))
            .await
            .unwrap_err();

        assert!(matches!(error, CleanupError::DeleteFailed { deleted: 200, .. }));
        assert_eq!(db.deletes().len(), 3);
    }

    #[tokio::test]
    async fn test_range_delete_stops_when_rows_run_out() {
        let h = harness(DeletionStrategy::Range, 1000, false);
        h.db.set_expired("log", 2500).vanish_after_count("log", 1200);

        let outcome = h.cleaner.clean_table(&job("log", 30)).await.unwrap();

        assert_eq!(
            outcome,
            TableOutcome::Deleted {
                expired: 2500,
                deleted: 1300,
                batches: 2
            }
        );
        assert_eq!(h.pacer.pauses().len(), 1);
    }

    #[tokio::test]
    async fn test_key_enumeration_stops_on_short_select() {
        let h = harness(DeletionStrategy::KeyEnumeration, 1000, false);
        h.db.set_expired("dag_run", 2500)
            .vanish_after_count("dag_run", 1200);

        let outcome = h.cleaner.clean_table(&job("dag_run", 30)).await.unwrap();

        assert_eq!(
            outcome,
            TableOutcome::Deleted {
                expired: 2500,
                deleted: 1300,
                batches: 2
            }
        );
        assert_eq!(h.pacer.pauses().len(), 1);
    }

    #[tokio::test]
    async fn test_key_enumeration_stops_on_empty_select() {
        let h = harness(DeletionStrategy::KeyEnumeration, 1000, false);
        h.db.set_expired("dag_run", 1000)
            .vanish_after_count("dag_run", 1000);

        let outcome = h.cleaner.clean_table(&job("dag_run", 30)).await.unwrap();

        assert_eq!(
            outcome,
            TableOutcome::Deleted {
                expired: 1000,
                deleted: 0,
                batches: 0
            }
        );
        assert!(deletes(&h.db, "dag_run").is_empty());
    }

    #[tokio::test]
    async fn test_second_run_finds_nothing() {
        let h = harness(DeletionStrategy::KeyEnumeration, 400, false);

        let first = h.cleaner.clean_all(&full_plan()).await.unwrap();
        let second = h.cleaner.clean_all(&full_plan()).await.unwrap();

        assert_eq!(first.total_deleted(), 5000);
        assert!(second
            .tables
            .iter()
            .all(|report| report.outcome == TableOutcome::NothingExpired));
    }

    #[tokio::test]
    async fn test_skipped_tables_are_reported() {
        let h = harness(DeletionStrategy::Range, 1000, false);
        let plan = vec![
            PlannedTable::Skip {
                table: "dag_run".to_owned(),
                reason: SkipReason::NoRetentionConfigured,
            },
            PlannedTable::Clean(job("job", 7)),
        ];

        let summary = h.cleaner.clean_all(&plan).await.unwrap();

        assert_eq!(
            summary.outcome("dag_run"),
            Some(&TableOutcome::Skipped(SkipReason::NoRetentionConfigured))
        );
        assert!(h.db.statements_for("dag_run").is_empty());
        assert_eq!(summary.total_deleted(), 1000);
    }

    #[tokio::test]
    async fn test_progress_events() {
        let h = harness(DeletionStrategy::Range, 1000, false);
        h.db.set_expired("log", 2500);

        h.cleaner.clean_table(&job("log", 30)).await.unwrap();

        let events = h.observer.events();
        let progress: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                CleanupEvent::BatchCompleted {
                    deleted, expired, ..
                } => Some((*deleted, *expired)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, [(1000, 2500), (2000, 2500), (2500, 2500)]);
        let pauses = events
            .iter()
            .filter(|event| matches!(event, CleanupEvent::Pausing { .. }))
            .count();
        assert_eq!(pauses, 2);
        assert!(matches!(
            events.last(),
            Some(CleanupEvent::JobFinished {
                outcome: TableOutcome::Deleted { batches: 3, .. },
                ..
            })
        ));
    }
}
