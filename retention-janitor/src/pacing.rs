use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Delay between delete batches.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, duration: Duration);
}

pub struct SleepPacer;

#[async_trait]
impl Pacer for SleepPacer {
    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Source of "now" for cutoff computation.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
