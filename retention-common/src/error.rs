use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("invalid database url: {0}")]
    Url(#[from] url::ParseError),

    #[error("could not set {0} on database url")]
    Credentials(&'static str),

    #[error("unsupported type {type_name} in column {column}")]
    UnsupportedColumnType { column: String, type_name: String },

    #[error("mock failure: {0}")]
    Mock(String),
}

pub type DbResult<T> = Result<T, DbError>;
