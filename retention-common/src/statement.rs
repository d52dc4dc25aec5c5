//! The statements issued by the cleaner, rendered as parameterised MySQL.

use chrono::{DateTime, Utc};

use crate::identifier::Identifier;

/// A value bound to a statement placeholder or read back from a row.
#[derive(Clone, Debug, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// Coarse statement category, used for logging and by test doubles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatementKind {
    ColumnCheck,
    Count,
    SelectKeys,
    Delete,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    /// Does `column` exist on `table` in the connected database?
    ColumnExists {
        table: Identifier,
        column: Identifier,
    },
    CountExpired {
        table: Identifier,
        date_column: Identifier,
        cutoff: DateTime<Utc>,
    },
    /// Row-limited range delete.
    DeleteExpired {
        table: Identifier,
        date_column: Identifier,
        cutoff: DateTime<Utc>,
        limit: u64,
    },
    /// Select key columns of expired rows, ordered by the first key column.
    SelectExpiredKeys {
        table: Identifier,
        date_column: Identifier,
        key_columns: Vec<Identifier>,
        cutoff: DateTime<Utc>,
        limit: u64,
    },
    DeleteByKey {
        table: Identifier,
        column: Identifier,
        values: Vec<SqlValue>,
    },
    /// Each entry of `rows` holds one value per entry of `columns`.
    DeleteByCompositeKey {
        table: Identifier,
        columns: Vec<Identifier>,
        rows: Vec<Vec<SqlValue>>,
    },
}

impl Statement {
    pub fn table(&self) -> &Identifier {
        match self {
            Statement::ColumnExists { table, .. }
            | Statement::CountExpired { table, .. }
            | Statement::DeleteExpired { table, .. }
            | Statement::SelectExpiredKeys { table, .. }
            | Statement::DeleteByKey { table, .. }
            | Statement::DeleteByCompositeKey { table, .. } => table,
        }
    }

    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::ColumnExists { .. } => StatementKind::ColumnCheck,
            Statement::CountExpired { .. } => StatementKind::Count,
            Statement::SelectExpiredKeys { .. } => StatementKind::SelectKeys,
            Statement::DeleteExpired { .. }
            | Statement::DeleteByKey { .. }
            | Statement::DeleteByCompositeKey { .. } => StatementKind::Delete,
        }
    }

    pub fn is_mutating(&self) -> bool {
        self.kind() == StatementKind::Delete
    }

    pub fn sql(&self) -> String {
        match self {
            Statement::ColumnExists { .. } => "SELECT COUNT(*) FROM information_schema.columns \
                 WHERE table_schema = DATABASE() AND table_name = ? AND column_name = ?"
                .to_owned(),
            Statement::CountExpired {
                table, date_column, ..
            } => format!(
                "SELECT COUNT(*) FROM {} WHERE {} < ?",
                table.quoted(),
                date_column.quoted()
            ),
            Statement::DeleteExpired {
                table,
                date_column,
                limit,
                ..
            } => format!(
                "DELETE FROM {} WHERE {} < ? LIMIT {}",
                table.quoted(),
                date_column.quoted(),
                limit
            ),
            Statement::SelectExpiredKeys {
                table,
                date_column,
                key_columns,
                limit,
                ..
            } => {
                let columns = key_columns
                    .iter()
                    .map(Identifier::quoted)
                    .collect::<Vec<_>>()
                    .join(", ");
                // An empty key list is rejected before a select is built.
                let order_by = key_columns
                    .first()
                    .map(Identifier::quoted)
                    .unwrap_or_default();
                format!(
                    "SELECT {} FROM {} WHERE {} < ? ORDER BY {} LIMIT {}",
                    columns,
                    table.quoted(),
                    date_column.quoted(),
                    order_by,
                    limit
                )
            }
            Statement::DeleteByKey {
                table,
                column,
                values,
            } => format!(
                "DELETE FROM {} WHERE {} IN ({})",
                table.quoted(),
                column.quoted(),
                vec!["?"; values.len()].join(", ")
            ),
            Statement::DeleteByCompositeKey {
                table,
                columns,
                rows,
            } => {
                let conjunction = format!(
                    "({})",
                    columns
                        .iter()
                        .map(|column| format!("{} = ?", column.quoted()))
                        .collect::<Vec<_>>()
                        .join(" AND ")
                );
                format!(
                    "DELETE FROM {} WHERE {}",
                    table.quoted(),
                    vec![conjunction; rows.len()].join(" OR ")
                )
            }
        }
    }

    pub fn args(&self) -> Vec<SqlValue> {
        match self {
            Statement::ColumnExists { table, column } => vec![
                SqlValue::Text(table.as_str().to_owned()),
                SqlValue::Text(column.as_str().to_owned()),
            ],
            Statement::CountExpired { cutoff, .. }
            | Statement::DeleteExpired { cutoff, .. }
            | Statement::SelectExpiredKeys { cutoff, .. } => vec![SqlValue::Timestamp(*cutoff)],
            Statement::DeleteByKey { values, .. } => values.clone(),
            Statement::DeleteByCompositeKey { rows, .. } => rows.iter().flatten().cloned().collect(),
        }
    }
}
