//! Progress reporting for the cleaner.
//!
//! The cleaner never logs directly; it hands [`CleanupEvent`]s to a
//! [`CleanupObserver`]. [`TelemetryObserver`] turns them into tracing
//! events and metrics.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cleanup::{DeletionStrategy, TableOutcome};
use crate::plan::SkipReason;

#[derive(Clone, Debug, PartialEq)]
pub enum CleanupEvent {
    TableSkipped {
        table: String,
        reason: SkipReason,
    },
    JobStarted {
        table: String,
        cutoff: DateTime<Utc>,
        strategy: DeletionStrategy,
    },
    ColumnMissing {
        table: String,
        column: String,
    },
    ExpiredCounted {
        table: String,
        expired: u64,
    },
    DryRun {
        table: String,
        expired: u64,
    },
    BatchCompleted {
        table: String,
        batch_rows: u64,
        deleted: u64,
        expired: u64,
        elapsed: Duration,
    },
    Pausing {
        table: String,
        duration: Duration,
    },
    JobFinished {
        table: String,
        outcome: TableOutcome,
    },
}

pub trait CleanupObserver: Send + Sync {
    fn on_event(&self, event: &CleanupEvent);
}

pub struct TelemetryObserver;

impl CleanupObserver for TelemetryObserver {
    fn on_event(&self, event: &CleanupEvent) {
        match event {
            CleanupEvent::TableSkipped { table, reason } => {
                tracing::warn!(table = %table, reason = %reason, "skipping table");
            }
            CleanupEvent::JobStarted {
                table,
                cutoff,
                strategy,
            } => {
                tracing::info!(
                    table = %table,
                    cutoff = %cutoff.format("%Y-%m-%d %H:%M:%S"),
                    strategy = %strategy,
                    "preparing to clean rows older than cutoff"
                );
            }
            CleanupEvent::ColumnMissing { table, column } => {
                tracing::warn!(
                    table = %table,
                    column = %column,
                    "date column does not exist, skipping table"
                );
            }
            CleanupEvent::ExpiredCounted { table, expired } => {
                tracing::info!(table = %table, expired, "counted expired rows");
                metrics::gauge!("retention_rows_expired", "table" => table.clone())
                    .set(*expired as f64);
            }
            CleanupEvent::DryRun { table, expired } => {
                tracing::info!(table = %table, expired, "dry run, no rows deleted");
            }
            CleanupEvent::BatchCompleted {
                table,
                batch_rows,
                deleted,
                expired,
                elapsed,
            } => {
                tracing::info!(
                    table = %table,
                    batch_rows,
                    batch_secs = elapsed.as_secs_f64(),
                    "deleted {}/{} rows",
                    deleted,
                    expired
                );
                metrics::counter!("retention_rows_deleted_total", "table" => table.clone())
                    .increment(*batch_rows);
                metrics::counter!("retention_batches_total", "table" => table.clone())
                    .increment(1);
                metrics::histogram!("retention_batch_duration_seconds", "table" => table.clone())
                    .record(elapsed.as_secs_f64());
            }
            CleanupEvent::Pausing { table, duration } => {
                tracing::debug!(
                    table = %table,
                    "sleeping for {:.3} seconds before the next batch",
                    duration.as_secs_f64()
                );
            }
            CleanupEvent::JobFinished { table, outcome } => match outcome {
                TableOutcome::NothingExpired => {
                    tracing::info!(table = %table, "no expired rows to clean");
                }
                TableOutcome::Deleted { deleted, .. } => {
                    tracing::info!(table = %table, deleted, "finished cleaning table");
                }
                _ => {}
            },
        }
    }
}
