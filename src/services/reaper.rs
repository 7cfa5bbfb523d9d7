//! Reaper — periodic removal of stale sessions.
//!
//! SYSTEM CONTEXT
//! ==============
//! Explicit leave is best-effort only: clients crash, tabs close, radios
//! drop. The reaper is the authoritative backstop. It runs server-side on
//! a fixed interval, independent of any client being connected, and every
//! removal frees a slot exactly like an explicit leave — including the
//! FIFO promotion from the wait queue.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;
use uuid::Uuid;

use crate::frame::now_ms;
use crate::services::admission::{self, SlotRelease};
use crate::state::{AppState, KickReason};

/// Spawn the background reaper task. Returns a handle for shutdown.
pub fn spawn_reaper_task(state: AppState) -> JoinHandle<()> {
    let tick_secs = state.config.reaper_tick_secs;
    info!(tick_secs, "reaper configured");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(tick_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let releases = reap_stale(&state, now_ms()).await;
            for release in releases {
                admission::notify_release(&state, release).await;
            }
        }
    })
}

/// Remove sessions idle past the inactivity threshold or older than the
/// absolute session limit. Returns the slot releases so the caller can
/// fan out kick/remove/promotion frames after the lock is gone.
pub async fn reap_stale(state: &AppState, now: i64) -> Vec<SlotRelease> {
    let config = state.config;
    let mut world = state.world.write().await;

    let expired: Vec<(Uuid, KickReason)> = world
        .sessions
        .values()
        .filter_map(|record| {
            // The absolute limit wins when both thresholds are crossed.
            if now - record.session_start >= config.session_timeout_ms {
                Some((record.id, KickReason::Timeout))
            } else if now - record.last_activity >= config.inactivity_timeout_ms {
                Some((record.id, KickReason::Inactivity))
            } else {
                None
            }
        })
        .collect();

    let mut releases = Vec::new();
    for (token, reason) in expired {
        if let Some(release) = admission::release_slot_locked(&mut world, token, reason, now) {
            releases.push(release);
        }
    }
    if !releases.is_empty() {
        info!(count = releases.len(), "reaped stale sessions");
    }
    releases
}

#[cfg(test)]
#[path = "reaper_test.rs"]
mod tests;
