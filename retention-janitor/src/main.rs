use std::path::Path;
use std::sync::{Arc, Mutex};

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tracing::Level;

use retention_common::database::Database;
use retention_common::metrics;
use retention_common::mock::MockDatabase;
use retention_common::mysql::MySqlDatabase;
use retention_janitor::cleanup::{Cleaner, DeletionStrategy};
use retention_janitor::config::{Config, RunConfig};
use retention_janitor::plan;

fn print_banners(config: &RunConfig) {
    if config.dry_run {
        println!("=== Running in dry run mode ===");
        println!("No rows will be deleted, only the number of expired rows is reported");
    } else {
        println!("=== Running in execution mode ===");
        println!("Expired rows will be deleted, make sure important data has been backed up");
    }

    match config.strategy() {
        DeletionStrategy::KeyEnumeration => {
            println!("\n=== Using primary key enumeration ===");
            println!("Expired keys are selected first, then deleted by key");
        }
        DeletionStrategy::Range => {
            println!("\n=== Using direct range DELETE ===");
            println!("Expired rows are deleted with a row-limited DELETE");
        }
    }

    println!("\n=== Starting to clean expired data ===");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()?;
    let run_config = config.run_config();

    let level = if run_config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let log_file = config.open_log_file().wrap_err_with(|| {
        format!(
            "failed to open log file {}",
            config.log_file.as_deref().unwrap_or_default()
        )
    })?;
    match log_file {
        Some(file) => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .init(),
        None => tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init(),
    }

    let recorder_handle = match config.metrics_textfile {
        Some(_) => Some(metrics::setup_metrics_recorder()?),
        None => None,
    };

    let db: Arc<dyn Database> = if config.database_mock {
        tracing::info!("using mock database, no connection will be made");
        Arc::new(MockDatabase::new())
    } else {
        Arc::new(MySqlDatabase::connect(&config.database()).await?)
    };

    print_banners(&run_config);

    let cleaner = Cleaner::new(db.clone(), run_config.cleaner_settings());
    let result = cleaner.clean_all(&plan::plan(&run_config)).await;
    db.close().await;

    if let (Some(handle), Some(path)) = (&recorder_handle, &config.metrics_textfile) {
        if let Err(e) = metrics::write_textfile(handle, Path::new(path)).await {
            tracing::error!("failed to write metrics textfile {}, {}", path, e);
        }
    }

    let summary = result?;
    tracing::info!(
        tables = summary.tables.len(),
        expired = summary.total_expired(),
        deleted = summary.total_deleted(),
        "cleanup run complete"
    );
    println!("=== Data cleaning completed ===");

    Ok(())
}
