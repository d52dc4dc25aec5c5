pub mod cleanup;
pub mod config;
pub mod observer;
pub mod pacing;
pub mod plan;
pub mod schema;
