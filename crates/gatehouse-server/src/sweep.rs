//! Periodic removal of stale usage logs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::apps::Registry;
use crate::store::model::date_stamp;

/// Spawns the retention sweep. The first pass runs immediately.
pub fn spawn_retention_sweep(
    registry: Arc<Registry>,
    interval: Duration,
    retention_days: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = sweep_once(&registry, Utc::now().date_naive(), retention_days).await;
            if removed > 0 {
                info!(removed, "sweep: removed stale count logs");
            }
        }
    })
}

/// Removes count logs dated before `today - retention_days` from every app
/// with a count table. Returns the total removed; failures are logged per app.
pub async fn sweep_once(registry: &Registry, today: NaiveDate, retention_days: u32) -> usize {
    let cutoff = today
        .checked_sub_days(Days::new(retention_days.into()))
        .unwrap_or(NaiveDate::MIN);
    let threshold = date_stamp(cutoff);

    let mut total = 0;
    for entry in registry.entries() {
        let Some(table) = entry.count.as_deref() else {
            continue;
        };
        match table.remove_older_than(threshold).await {
            Ok(n) => {
                debug!(app_id = entry.app_id(), removed = n, threshold, "sweep: app done");
                total += n;
            }
            Err(e) => warn!(app_id = entry.app_id(), error = %e, "sweep: app failed"),
        }
    }
    total
}
