//! Background sweeps.
//!
//! Staleness is expected steady-state behavior of an unreliable fleet of
//! devices, so both loops log and carry on rather than surfacing errors.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use guardian_core::{CommandDispatcher, DeviceRegistry};

/// Expires issued commands that outlived the ack timeout and announces
/// each one, so dashboards show "device did not respond" instead of an
/// eternal pending state.
pub async fn run_expiry_loop(dispatcher: CommandDispatcher, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match dispatcher.expire_stale(Utc::now()).await {
            Ok(expired) => {
                if !expired.is_empty() {
                    info!("expiry sweep: {} command(s) expired", expired.len());
                }
            }
            Err(e) => {
                warn!("expiry sweep error: {}", e);
            }
        }
    }
}

/// Marks devices offline once their last heartbeat exceeds the staleness
/// threshold. Pure timer-driven transition, never request-triggered.
pub async fn run_offline_loop(registry: DeviceRegistry, staleness_secs: i64, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        registry
            .sweep_offline(chrono::Duration::seconds(staleness_secs), Utc::now())
            .await;
    }
}
