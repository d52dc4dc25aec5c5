pub mod database;
pub mod error;
pub mod identifier;
pub mod metrics;
pub mod mock;
pub mod mysql;
pub mod statement;
