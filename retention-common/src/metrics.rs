//! Prometheus recorder for a one-shot process.
//!
//! There is no scrape endpoint: the rendered exposition is written to a file
//! at exit, for a node exporter textfile collector to pick up.

use std::path::Path;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )?
        .install_recorder()
}

/// Render everything recorded so far and write it to `path`.
pub async fn write_textfile(handle: &PrometheusHandle, path: &Path) -> std::io::Result<()> {
    // Collectors must never observe a partially written file.
    let staging = path.with_extension("prom.tmp");
    tokio::fs::write(&staging, handle.render()).await?;
    tokio::fs::rename(&staging, path).await
}
