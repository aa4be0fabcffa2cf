//! Idle reaper
//!
//! Periodic sweep that stops containers whose deployments have seen no
//! proxied traffic past the idle threshold. Stopping goes through the
//! orchestrator so it holds the per-deployment lease and refreshes the
//! cache snapshot; a stale "running" snapshot would make the resolver skip
//! the wake path.

use crate::cache::LookupCache;
use crate::deploy::Orchestrator;
use crate::store::Database;
use chrono::{NaiveDateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Format SQLite's datetime('now') produces (UTC)
const SQLITE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct IdleReaper {
    store: Arc<Database>,
    cache: Arc<LookupCache>,
    orchestrator: Arc<Orchestrator>,
    threshold: Duration,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl IdleReaper {
    pub fn new(
        store: Arc<Database>,
        cache: Arc<LookupCache>,
        orchestrator: Arc<Orchestrator>,
        threshold: Duration,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            cache,
            orchestrator,
            threshold,
            interval,
            shutdown_rx,
        }
    }

    /// Run the reaper until shutdown
    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.as_secs(),
            "Idle reaper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.sweep().await;
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Idle reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One sweep over all running deployments. A failure on one deployment
    /// never aborts the rest of the sweep.
    pub async fn sweep(&self) {
        let running = match self.store.list_running() {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to list running deployments");
                return;
            }
        };

        let now = Utc::now().naive_utc();

        for record in running {
            if !is_idle(&record.last_active_at, now, self.threshold) {
                continue;
            }

            info!(
                subdomain = %record.subdomain,
                last_active_at = %record.last_active_at,
                "Idle threshold reached; stopping container"
            );

            if let Err(e) = self.orchestrator.stop(&record.id).await {
                error!(deployment = %record.id, error = %e, "Failed to stop idle deployment");
            }
        }

        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired cache entries");
        }
    }
}

/// Closed-boundary idle test: exactly at the threshold counts as idle. An
/// unparsable timestamp is treated as active, never silently reaped.
fn is_idle(last_active_at: &str, now: NaiveDateTime, threshold: Duration) -> bool {
    match NaiveDateTime::parse_from_str(last_active_at, SQLITE_DATETIME_FORMAT) {
        Ok(ts) => {
            let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
            now.signed_duration_since(ts) >= threshold
        }
        Err(_) => false,
    }
}
