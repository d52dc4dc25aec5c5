use std::fmt;

use crate::config::{MissingRetention, RunConfig};
use crate::schema::{self, ManagedTable};

/// One table's cleanup unit, rebuilt on every run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableJob {
    pub table_name: String,
    pub retention_days: u32,
    pub date_column: String,
    pub primary_key: Vec<String>,
}

impl TableJob {
    fn for_table(table: &ManagedTable, retention_days: u32) -> Self {
        TableJob {
            table_name: table.name.to_owned(),
            retention_days,
            date_column: table.date_column.to_owned(),
            primary_key: table.primary_key.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NoRetentionConfigured,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoRetentionConfigured => f.write_str("no retention period configured"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlannedTable {
    Clean(TableJob),
    Skip { table: String, reason: SkipReason },
}

impl PlannedTable {
    pub fn table_name(&self) -> &str {
        match self {
            PlannedTable::Clean(job) => &job.table_name,
            PlannedTable::Skip { table, .. } => table,
        }
    }
}

/// One entry per managed table, in declaration order.
pub fn plan(config: &RunConfig) -> Vec<PlannedTable> {
    schema::managed_tables()
        .iter()
        .map(
            |table| match (config.retention_days.get(table.name), config.missing_retention) {
                (Some(days), _) => PlannedTable::Clean(TableJob::for_table(table, *days)),
                (None, MissingRetention::ZeroDays) => {
                    PlannedTable::Clean(TableJob::for_table(table, 0))
                }
                (None, MissingRetention::Skip) => PlannedTable::Skip {
                    table: table.name.to_owned(),
                    reason: SkipReason::NoRetentionConfigured,
                },
            },
        )
        .collect()
}
