//! In-memory [`Database`] used in mock mode and by tests.
//!
//! Each table is modelled as a run of expired rows identified by a
//! monotonically increasing sequence number. Counts, deletes and key selects
//! all act on that run, so cleanup loops behave as they would against a
//! live table without any network access.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::database::{Database, Row};
use crate::error::{DbError, DbResult};
use crate::statement::{SqlValue, Statement, StatementKind};

/// Expired rows reported for a table that was never configured.
pub const DEFAULT_EXPIRED_ROWS: u64 = 1000;

#[derive(Clone, Debug)]
struct MockTable {
    has_date_column: bool,
    expired: u64,
    // Sequence number of the oldest remaining expired row.
    next_row: u64,
    vanish_after_count: u64,
    failures: HashSet<StatementKind>,
}

impl MockTable {
    fn new(expired: u64) -> Self {
        Self {
            has_date_column: true,
            expired,
            next_row: 0,
            vanish_after_count: 0,
            failures: HashSet::new(),
        }
    }

    fn remove(&mut self, rows: u64) -> u64 {
        let removed = rows.min(self.expired);
        self.expired -= removed;
        self.next_row += removed;
        removed
    }
}

#[derive(Debug, Default)]
struct MockState {
    tables: HashMap<String, MockTable>,
    statements: Vec<Statement>,
}

#[derive(Debug, Default)]
pub struct MockDatabase {
    state: Mutex<MockState>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_table<R>(&self, table: &str, f: impl FnOnce(&mut MockTable) -> R) -> R {
        let mut state = self.state();
        let entry = state
            .tables
            .entry(table.to_owned())
            .or_insert_with(|| MockTable::new(DEFAULT_EXPIRED_ROWS));
        f(entry)
    }

    /// Set the number of expired rows currently in `table`.
    pub fn set_expired(&self, table: &str, rows: u64) -> &Self {
        self.with_table(table, |t| {
            t.expired = rows;
            t.next_row = 0;
        });
        self
    }

    /// Remove the date column from `table`.
    pub fn drop_date_column(&self, table: &str) -> &Self {
        self.with_table(table, |t| t.has_date_column = false);
        self
    }

    /// Make `rows` expired rows disappear right after the next count, as if
    /// another writer deleted them.
    pub fn vanish_after_count(&self, table: &str, rows: u64) -> &Self {
        self.with_table(table, |t| t.vanish_after_count = rows);
        self
    }

    /// Fail every statement of `kind` issued against `table`.
    pub fn fail_on(&self, table: &str, kind: StatementKind) -> &Self {
        self.with_table(table, |t| {
            t.failures.insert(kind);
        });
        self
    }

    pub fn expired(&self, table: &str) -> u64 {
        self.with_table(table, |t| t.expired)
    }

    /// Every statement received so far, in order.
    pub fn statements(&self) -> Vec<Statement> {
        self.state().statements.clone()
    }

    pub fn statements_for(&self, table: &str) -> Vec<Statement> {
        self.state()
            .statements
            .iter()
            .filter(|statement| statement.table().as_str() == table)
            .cloned()
            .collect()
    }

    fn record(&self, statement: &Statement) -> DbResult<()> {
        tracing::debug!(sql = %statement.sql(), args = ?statement.args(), "[mock] statement");

        let kind = statement.kind();
        let table = statement.table().as_str().to_owned();
        self.state().statements.push(statement.clone());

        let failing = self.with_table(&table, |t| t.failures.contains(&kind));
        if failing {
            return Err(DbError::Mock(format!("{kind:?} on {table} failed")));
        }
        Ok(())
    }
}

fn synthetic_key(column: &str, position: usize, row: u64) -> SqlValue {
    if position == 0 {
        SqlValue::Int(row as i64)
    } else {
        SqlValue::Text(format!("{column}-{row}"))
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn fetch_scalar(&self, statement: &Statement) -> DbResult<i64> {
        self.record(statement)?;

        let table = statement.table().as_str();
        match statement {
            Statement::ColumnExists { .. } => {
                Ok(self.with_table(table, |t| i64::from(t.has_date_column)))
            }
            Statement::CountExpired { .. } => Ok(self.with_table(table, |t| {
                let counted = t.expired;
                let vanish = std::mem::take(&mut t.vanish_after_count);
                t.remove(vanish);
                counted as i64
            })),
            other => Err(DbError::Mock(format!(
                "{:?} is not a scalar query",
                other.kind()
            ))),
        }
    }

    async fn execute(&self, statement: &Statement) -> DbResult<u64> {
        self.record(statement)?;

        let table = statement.table().as_str();
        match statement {
            Statement::DeleteExpired { limit, .. } => Ok(self.with_table(table, |t| t.remove(*limit))),
            Statement::DeleteByKey { values, .. } => {
                Ok(self.with_table(table, |t| t.remove(values.len() as u64)))
            }
            Statement::DeleteByCompositeKey { rows, .. } => {
                Ok(self.with_table(table, |t| t.remove(rows.len() as u64)))
            }
            other => Err(DbError::Mock(format!(
                "{:?} is not a mutating statement",
                other.kind()
            ))),
        }
    }

    async fn fetch_rows(&self, statement: &Statement) -> DbResult<Vec<Row>> {
        self.record(statement)?;

        match statement {
            Statement::SelectExpiredKeys {
                table,
                key_columns,
                limit,
                ..
            } => Ok(self.with_table(table.as_str(), |t| {
                let selected = (*limit).min(t.expired);
                (t.next_row..t.next_row + selected)
                    .map(|row| {
                        key_columns.iter().enumerate().fold(
                            Row::new(),
                            |acc, (position, column)| {
                                acc.with(column.as_str(), synthetic_key(column.as_str(), position, row))
                            },
                        )
                    })
                    .collect()
            })),
            other => Err(DbError::Mock(format!(
                "{:?} does not return rows",
                other.kind()
            ))),
        }
    }
}
