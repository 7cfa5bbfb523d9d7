//! Collision / elimination state machine.
//!
//! DESIGN
//! ======
//! Detection is server-side against the authoritative presence snapshot:
//! when a session moves, its new position is tested point-in-circle
//! against every other active avatar. Two windows bound the work:
//! - Poll window: at most one check per session per 100ms, regardless of
//!   how fast pointer-move updates arrive.
//! - Pair debounce: at most one hit per unordered player pair per 500ms,
//!   so a single sustained overlap registers once.
//! The third qualifying hit removes the session (reason `hits`) inside
//! the same world critical section, so elimination fires exactly once.
//!
//! TRADE-OFFS
//! ==========
//! The check runs against last-known peer positions, so a fast mutual
//! fly-by can land on either mover first; the pair debounce makes the
//! outcome a single hit either way.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;
use uuid::Uuid;

use crate::frame::now_ms;
use crate::geometry::hits_circle;
use crate::services::admission::{self, SlotRelease};
use crate::state::{AppState, KickReason, PresenceRecord};

// =============================================================================
// TRACKER
// =============================================================================

/// Sliding-window state for collision timing: per-session poll throttle
/// and per-pair hit debounce.
#[derive(Clone)]
pub struct CollisionTracker {
    inner: Arc<Mutex<TrackerInner>>,
}

struct TrackerInner {
    /// Last collision check per session token.
    last_poll_ms: HashMap<Uuid, i64>,
    /// Last registered hit per unordered player pair.
    pair_hits_ms: HashMap<(Uuid, Uuid), i64>,
}

impl CollisionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackerInner {
                last_poll_ms: HashMap::new(),
                pair_hits_ms: HashMap::new(),
            })),
        }
    }

    /// Record a poll attempt. Returns false when the session checked less
    /// than `poll_window_ms` ago.
    fn try_poll(&self, session: Uuid, now: i64, poll_window_ms: i64) -> bool {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(last) = inner.last_poll_ms.get(&session) {
            if now - last < poll_window_ms {
                return false;
            }
        }
        inner.last_poll_ms.insert(session, now);
        true
    }

    /// Filter overlapping peers through the pair debounce, recording the
    /// pairs that qualify. Returns the number of qualifying hits.
    fn register_pairs(&self, mover: Uuid, peers: &[Uuid], now: i64, debounce_ms: i64) -> u32 {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        prune_pairs(&mut inner.pair_hits_ms, now, debounce_ms);

        let mut hits = 0;
        for peer in peers {
            let key = pair_key(mover, *peer);
            let debounced = inner.pair_hits_ms.get(&key).is_some_and(|last| now - last < debounce_ms);
            if debounced {
                continue;
            }
            inner.pair_hits_ms.insert(key, now);
            hits += 1;
        }
        hits
    }

    /// Drop all timing state involving a session/player that left.
    pub fn forget(&self, session: Uuid, player: Uuid) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.last_poll_ms.remove(&session);
        inner.pair_hits_ms.retain(|(a, b), _| *a != player && *b != player);
    }
}

impl Default for CollisionTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn pair_key(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b { (a, b) } else { (b, a) }
}

fn prune_pairs(pairs: &mut HashMap<(Uuid, Uuid), i64>, now: i64, window_ms: i64) {
    pairs.retain(|_, last| now - *last < window_ms);
}

// =============================================================================
// MOVEMENT CHECK
// =============================================================================

/// Result of one movement's collision check.
#[derive(Debug, Default)]
pub struct MovementOutcome {
    /// Hits landed on the mover this check.
    pub hits: u32,
    /// The mover's record after the hits, for fanout. `None` when no hit
    /// landed or the session vanished mid-check.
    pub record: Option<PresenceRecord>,
    /// Set when this check reached the hit limit.
    pub elimination: Option<SlotRelease>,
}

/// Run the collision check for a session that just moved.
pub async fn register_movement(state: &AppState, token: Uuid) -> MovementOutcome {
    register_movement_at(state, token, now_ms()).await
}

/// Internal: movement check with explicit timestamp (for testing).
pub(crate) async fn register_movement_at(state: &AppState, token: Uuid, now: i64) -> MovementOutcome {
    let config = state.config;

    if !state.collisions.try_poll(token, now, config.collision_poll_ms) {
        return MovementOutcome::default();
    }

    // Geometry pass under the read lock only.
    let (mover, overlapping) = {
        let world = state.world.read().await;
        let Some(record) = world.sessions.get(&token) else {
            return MovementOutcome::default();
        };
        let position = record.position();
        let overlapping: Vec<Uuid> = world
            .sessions
            .values()
            .filter(|other| other.id != token)
            .filter(|other| hits_circle(position, other.position(), config.hit_radius))
            .map(|other| other.player_id)
            .collect();
        (record.player_id, overlapping)
    };

    if overlapping.is_empty() {
        return MovementOutcome::default();
    }

    let hits = state
        .collisions
        .register_pairs(mover, &overlapping, now, config.collision_debounce_ms);
    if hits == 0 {
        return MovementOutcome::default();
    }

    // Apply the hits under the write lock; eliminate in the same section.
    let mut world = state.world.write().await;
    let Some(record) = world.sessions.get_mut(&token) else {
        return MovementOutcome::default();
    };

    record.collision_count = (record.collision_count + i32::try_from(hits).unwrap_or(i32::MAX)).min(config.max_hits);
    record.rev += 1;
    let snapshot = record.clone();
    world.dirty_sessions.insert(token);

    let elimination = if snapshot.collision_count >= config.max_hits {
        info!(player_id = %mover, hits = snapshot.collision_count, "session eliminated");
        admission::release_slot_locked(&mut world, token, KickReason::Hits, now)
    } else {
        None
    };
    drop(world);

    if elimination.is_some() {
        state.collisions.forget(token, mover);
    }

    MovementOutcome { hits, record: Some(snapshot), elimination }
}

#[cfg(test)]
#[path = "collision_test.rs"]
mod tests;
