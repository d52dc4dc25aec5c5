//! The metadata tables this tool is allowed to clean.

#[derive(Debug, PartialEq, Eq)]
pub struct ManagedTable {
    pub name: &'static str,
    /// Rows older than the cutoff in this column are expired.
    pub date_column: &'static str,
    pub primary_key: &'static [&'static str],
}

/// Declaration order is also cleanup order.
const MANAGED_TABLES: &[ManagedTable] = &[
    ManagedTable {
        name: "dag_run",
        date_column: "execution_date",
        primary_key: &["id"],
    },
    ManagedTable {
        name: "task_instance",
        date_column: "start_date",
        primary_key: &["dag_id", "task_id", "run_id", "map_index"],
    },
    ManagedTable {
        name: "xcom",
        date_column: "timestamp",
        primary_key: &["dag_id", "task_id", "run_id", "map_index", "key"],
    },
    ManagedTable {
        name: "log",
        date_column: "dttm",
        primary_key: &["id"],
    },
    ManagedTable {
        name: "job",
        date_column: "end_date",
        primary_key: &["id"],
    },
];

pub fn managed_tables() -> &'static [ManagedTable] {
    MANAGED_TABLES
}

pub fn find(name: &str) -> Option<&'static ManagedTable> {
    MANAGED_TABLES.iter().find(|table| table.name == name)
}
