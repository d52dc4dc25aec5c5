//! sqlx-backed [`Database`] for a live MySQL server.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::mysql::{MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, MySql, Row as _, TypeInfo};
use url::Url;

use crate::database::{Database, Row};
use crate::error::{DbError, DbResult};
use crate::statement::{SqlValue, Statement};

/// Connection settings for [`MySqlDatabase::connect`].
#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub name: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
}

impl ConnectionConfig {
    /// Build the connection URL, percent-encoding the credentials.
    pub fn url(&self) -> DbResult<Url> {
        let mut url = Url::parse(&format!("mysql://{}:{}", self.host, self.port))?;
        url.set_path(&self.name);
        url.set_username(&self.user)
            .map_err(|_| DbError::Credentials("username"))?;
        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|_| DbError::Credentials("password"))?;
        }

        Ok(url)
    }
}

pub struct MySqlDatabase {
    pool: MySqlPool,
}

impl MySqlDatabase {
    pub async fn connect(config: &ConnectionConfig) -> DbResult<Self> {
        let url = config.url()?;
        let pool = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(config.max_lifetime)
            .connect(url.as_str())
            .await?;

        tracing::info!(
            host = %config.host,
            port = config.port,
            database = %config.name,
            "connected to database"
        );

        Ok(Self { pool })
    }
}

fn bind_args<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    args: &'q [SqlValue],
) -> Query<'q, MySql, MySqlArguments> {
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Int(value) => query.bind(*value),
            SqlValue::UInt(value) => query.bind(*value),
            SqlValue::Text(value) => query.bind(value.as_str()),
            SqlValue::Timestamp(value) => query.bind(*value),
        };
    }
    query
}

fn decode_value(row: &MySqlRow, index: usize) -> DbResult<SqlValue> {
    // NULL decodes as `None` for any of these, so the first attempt wins.
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return Ok(value.map_or(SqlValue::Null, SqlValue::Int));
    }
    if let Ok(value) = row.try_get::<Option<u64>, _>(index) {
        return Ok(value.map_or(SqlValue::Null, SqlValue::UInt));
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return Ok(value.map_or(SqlValue::Null, SqlValue::Text));
    }
    if let Ok(value) = row.try_get::<Option<DateTime<Utc>>, _>(index) {
        return Ok(value.map_or(SqlValue::Null, SqlValue::Timestamp));
    }

    let column = &row.columns()[index];
    Err(DbError::UnsupportedColumnType {
        column: column.name().to_owned(),
        type_name: column.type_info().name().to_owned(),
    })
}

fn decode_row(row: &MySqlRow) -> DbResult<Row> {
    let mut decoded = Row::new();
    for column in row.columns() {
        decoded.push(column.name(), decode_value(row, column.ordinal())?);
    }
    Ok(decoded)
}

#[async_trait]
impl Database for MySqlDatabase {
    async fn fetch_scalar(&self, statement: &Statement) -> DbResult<i64> {
        let sql = statement.sql();
        let args = statement.args();
        let row = bind_args(sqlx::query(&sql), &args)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get::<i64, _>(0)?)
    }

    async fn execute(&self, statement: &Statement) -> DbResult<u64> {
        let sql = statement.sql();
        let args = statement.args();
        let result = bind_args(sqlx::query(&sql), &args)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn fetch_rows(&self, statement: &Statement) -> DbResult<Vec<Row>> {
        let sql = statement.sql();
        let args = statement.args();
        let mut cursor = bind_args(sqlx::query(&sql), &args).fetch(&self.pool);

        let mut rows = Vec::new();
        while let Some(row) = cursor.try_next().await? {
            rows.push(decode_row(&row)?);
        }

        Ok(rows)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
