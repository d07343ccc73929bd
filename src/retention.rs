use crate::config::Config;
use crate::db::Store;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Rollup + purge worker. Runs on its own ticker and never blocks the
/// probe pipeline; rollups materialize daily uptime before raw rows are
/// purged.
pub async fn run(store: Arc<Store>, cfg: Config, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(cfg.retention_period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = tick.tick() => sweep(&store, &cfg),
            _ = shutdown.changed() => {
                info!("retention: stopped");
                return;
            }
        }
    }
}

fn sweep(store: &Store, cfg: &Config) {
    match store.rollup_daily() {
        Ok(rows) if rows > 0 => info!("retention: rolled up {rows} day rows"),
        Ok(_) => {}
        Err(e) => warn!("retention: rollup failed: {e}"),
    }
    match store.purge_check_results(cfg.retention_days) {
        Ok(rows) if rows > 0 => info!("retention: purged {rows} check results"),
        Ok(_) => {}
        Err(e) => warn!("retention: check result purge failed: {e}"),
    }
    match store.purge_content_changes(cfg.retention_days) {
        Ok(rows) if rows > 0 => info!("retention: purged {rows} content changes"),
        Ok(_) => {}
        Err(e) => warn!("retention: content change purge failed: {e}"),
    }
    match store.purge_rollups(cfg.request_log_retention_days) {
        Ok(rows) if rows > 0 => info!("retention: purged {rows} rollup rows"),
        Ok(_) => {}
        Err(e) => warn!("retention: rollup purge failed: {e}"),
    }
}
