use async_trait::async_trait;

use crate::error::DbResult;
use crate::statement::{SqlValue, Statement};

/// A row returned by [`Database::fetch_rows`].
///
/// Values can be read by position or by column name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: SqlValue) -> Self {
        self.push(column, value);
        self
    }

    pub fn push(&mut self, column: &str, value: SqlValue) {
        self.columns.push(column.to_owned());
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    pub fn get_named(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|name| name == column)
            .and_then(|index| self.values.get(index))
    }
}

/// The query surface the cleaner needs from a database.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run a statement returning a single integer, such as `COUNT(*)`.
    async fn fetch_scalar(&self, statement: &Statement) -> DbResult<i64>;

    /// Run a mutating statement and return the number of affected rows.
    async fn execute(&self, statement: &Statement) -> DbResult<u64>;

    async fn fetch_rows(&self, statement: &Statement) -> DbResult<Vec<Row>>;

    async fn close(&self) {}
}
