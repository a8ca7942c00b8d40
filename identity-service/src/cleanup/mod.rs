//! Periodic reaper for expired rows.
//!
//! Containers, flows, codes, and consumed exchangers all expire; nothing in
//! the request path deletes them except a resumed container. The reaper
//! sweeps each table in bounded batches and pauses between tables to keep
//! the load flat.

use chrono::Utc;
use tokio::time::{sleep, Duration};

use crate::models::{CodeKind, FlowKind};
use crate::services::{ServiceError, Store};

const FLOW_KINDS: [FlowKind; 5] = [
    FlowKind::Login,
    FlowKind::Registration,
    FlowKind::Recovery,
    FlowKind::Verification,
    FlowKind::Settings,
];

const CODE_KINDS: [CodeKind; 4] = [
    CodeKind::Login,
    CodeKind::Registration,
    CodeKind::Recovery,
    CodeKind::Verification,
];

#[derive(Debug, Clone)]
pub struct CleanupSettings {
    /// Time between two full sweeps.
    pub interval: Duration,
    /// Rows deleted per statement.
    pub batch_size: i64,
    /// Pause between tables within one sweep.
    pub sleep_between_tables: Duration,
}

/// Run sweeps forever. Spawned once by the host process; a failing sweep is
/// logged and retried on the next tick.
pub async fn run_reaper(store: Store, settings: CleanupSettings) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match sweep(&store, &settings).await {
            Ok(removed) if removed > 0 => {
                tracing::info!(removed, "Cleanup sweep finished");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(error = %err, "Cleanup sweep failed");
            }
        }
    }
}

/// One full sweep over every expiring table.
pub async fn sweep(store: &Store, settings: &CleanupSettings) -> Result<u64, ServiceError> {
    let now = Utc::now();
    let mut removed = store
        .delete_expired_containers(now, settings.batch_size)
        .await?;
    sleep(settings.sleep_between_tables).await;

    for kind in FLOW_KINDS {
        removed += store
            .delete_expired_flows(kind, now, settings.batch_size)
            .await?;
        sleep(settings.sleep_between_tables).await;
    }

    for kind in CODE_KINDS {
        removed += store
            .delete_expired_codes(kind, now, settings.batch_size)
            .await?;
        sleep(settings.sleep_between_tables).await;
    }

    removed += store
        .delete_consumed_exchangers(now, settings.batch_size)
        .await?;
    Ok(removed)
}
