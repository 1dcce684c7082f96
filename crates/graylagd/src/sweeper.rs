use crate::metrics::counters;
use crate::server::ServerState;
use graylag_common::entry::Entry;
use graylag_common::store::{Store, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Periodically expires stale entries from the enabled stores.
///
/// One instance in a fleet can own maintenance: the per-store disable
/// flags make every other replica skip its sweeps. The sweeper runs until
/// the shutdown signal flips.
pub async fn run(state: Arc<ServerState>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(state.config.maintenance_interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("sweeper stopping");
                return;
            }
            () = tokio::time::sleep(interval) => {}
        }

        let now = chrono::Utc::now().timestamp();
        if !state.config.grey_db_maintenance_disable {
            match sweep(state.grey_db.as_ref(), now, state.config.max_age).await {
                Ok(removed) => {
                    counters::swept_total("grey", removed);
                    info!(removed, "greylist sweep complete");
                }
                Err(error) => warn!(%error, "greylist sweep failed"),
            }
        }
        if !state.config.awl_db_maintenance_disable {
            if let Some(awl_db) = &state.awl_db {
                match sweep(awl_db.as_ref(), now, state.config.max_age).await {
                    Ok(removed) => {
                        counters::swept_total("awl", removed);
                        info!(removed, "auto-whitelist sweep complete");
                    }
                    Err(error) => warn!(%error, "auto-whitelist sweep failed"),
                }
            }
        }
    }
}

/// One expiry pass: collect keys whose entry predates the retention
/// cutoff, delete them, then force the store to disk.
///
/// The serving workers keep writing while this runs; a key someone else
/// removed between the scan and the delete counts as deleted. Values that
/// do not parse are left alone.
pub async fn sweep(store: &dyn Store, now: i64, max_age: i64) -> Result<usize, StoreError> {
    let cutoff = now - max_age;
    let stale = store
        .scan(&move |_key, value| {
            Entry::decode(value).is_ok_and(|entry| entry.last_seen < cutoff)
        })
        .await?;

    for key in &stale {
        store.delete(key).await?;
    }
    store.save().await?;
    Ok(stale.len())
}
