//! Session admission — capacity-bound join, FIFO wait queue, slot release.
//!
//! ARCHITECTURE
//! ============
//! The world holds a fixed number of painting slots. `join` performs the
//! capacity check and the presence insert under the world write lock, so
//! no interleaving of concurrent joins can ever admit more than
//! `capacity` sessions. Overflow candidates queue FIFO; every event that
//! frees a slot (leave, reap, elimination) promotes the earliest live
//! queue entry in the same critical section.
//!
//! ERROR HANDLING
//! ==============
//! A full world is not an error: it is the `Queued` admission outcome.
//! `Rejected` only fires when the wait queue itself is at capacity.

use rand::Rng;
use tracing::info;
use uuid::Uuid;

use crate::frame::now_ms;
use crate::geometry::WORLD_SIZE;
use crate::services::{feed, highscore};
use crate::state::{AppState, KickReason, PresenceRecord, QueueEntry, Stroke, Tool, WorldState};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("connection already holds a session")]
    AlreadyJoined,
    #[error("player {0} already has an active session")]
    DuplicatePlayer(Uuid),
}

impl crate::frame::ErrorCode for AdmissionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyJoined => "E_ALREADY_JOINED",
            Self::DuplicatePlayer(_) => "E_ADMISSION_CONFLICT",
        }
    }

    fn retryable(&self) -> bool {
        // A duplicate player id is a race with a stale session; the caller
        // may retry with a fresh identity.
        matches!(self, Self::DuplicatePlayer(_))
    }
}

/// What a candidate receives on joining.
#[derive(Debug)]
pub enum Admission {
    /// A slot was free: the new record plus a world snapshot.
    Active(Box<Admitted>),
    /// World full; waiting at the given 1-based position.
    Queued { position: usize },
    /// World and queue both full.
    Rejected,
}

/// Snapshot handed to a newly admitted session.
#[derive(Debug)]
pub struct Admitted {
    pub record: PresenceRecord,
    /// All other active players at admission time.
    pub players: Vec<PresenceRecord>,
    /// The committed stroke log in render order.
    pub strokes: Vec<Stroke>,
}

#[derive(Debug)]
pub struct JoinRequest {
    /// Stable identity across reconnects within a session; generated
    /// fresh when absent.
    pub player_id: Option<Uuid>,
    pub emoji: String,
    pub color: Option<String>,
}

/// A session removed from the world, with the final record snapshot
/// (`is_active = false`) for highscores and the kick notification.
#[derive(Debug)]
pub struct RemovedSession {
    pub record: PresenceRecord,
    pub client_id: Option<Uuid>,
    pub reason: KickReason,
}

/// A queued candidate admitted into a freed slot.
#[derive(Debug)]
pub struct Promotion {
    /// Connection to notify with `session:admitted`.
    pub client_id: Uuid,
    pub admitted: Admitted,
    /// Refreshed 1-based positions for everyone still waiting.
    pub queue_updates: Vec<(Uuid, usize)>,
}

/// Combined effect of freeing one slot.
#[derive(Debug)]
pub struct SlotRelease {
    pub removed: RemovedSession,
    pub promotion: Option<Promotion>,
}

// =============================================================================
// JOIN
// =============================================================================

/// Admit, queue, or reject a candidate.
///
/// # Errors
///
/// Returns `AlreadyJoined` if this connection holds a session, or
/// `DuplicatePlayer` if the supplied player id is already active.
pub async fn join(state: &AppState, client_id: Uuid, req: JoinRequest) -> Result<Admission, AdmissionError> {
    let config = state.config;
    let now = now_ms();
    let mut world = state.world.write().await;

    if world.session_clients.values().any(|c| *c == client_id) {
        return Err(AdmissionError::AlreadyJoined);
    }

    // A queued connection re-sending join just learns its position.
    if let Some(idx) = world.queue.iter().position(|e| e.client_id == client_id) {
        return Ok(Admission::Queued { position: idx + 1 });
    }

    let player_id = req.player_id.unwrap_or_else(Uuid::new_v4);
    if world.players.contains_key(&player_id) {
        return Err(AdmissionError::DuplicatePlayer(player_id));
    }

    if world.active_count() < config.capacity {
        let admitted = admit_locked(&mut world, client_id, player_id, &req.emoji, req.color.as_deref(), now);
        info!(%client_id, player_id = %admitted.record.player_id, active = world.active_count(), "session admitted");
        return Ok(Admission::Active(Box::new(admitted)));
    }

    if world.queue.len() >= config.queue_capacity {
        info!(%client_id, "join rejected: world and queue full");
        return Ok(Admission::Rejected);
    }

    let position = world.next_queue_position;
    world.next_queue_position += 1;
    world.queue.push_back(QueueEntry {
        player_id,
        client_id,
        position,
        joined_at: now,
        emoji: req.emoji,
        color: req.color,
    });
    let queue_len = world.queue.len();
    info!(%client_id, %player_id, position = queue_len, "candidate queued");
    Ok(Admission::Queued { position: queue_len })
}

// =============================================================================
// LEAVE / RELEASE
// =============================================================================

/// Remove a session by token. Idempotent: an unknown or already removed
/// token returns `None`. Frees the slot and promotes from the queue.
pub async fn leave(state: &AppState, token: Uuid, reason: KickReason) -> Option<SlotRelease> {
    let now = now_ms();
    let mut world = state.world.write().await;
    release_slot_locked(&mut world, token, reason, now)
}

/// Drop a disconnected client's queue entries. Returns refreshed queue
/// positions for the remaining waiters, or `None` if nothing changed.
pub async fn abandon_queue(state: &AppState, client_id: Uuid) -> Option<Vec<(Uuid, usize)>> {
    let mut world = state.world.write().await;
    let before = world.queue.len();
    world.queue.retain(|e| e.client_id != client_id);
    if world.queue.len() == before {
        return None;
    }
    Some(queue_updates_locked(&world))
}

/// Core slot-release path, shared by leave, the reaper, and elimination.
/// Must run under the world write lock so removal and promotion are one
/// atomic step.
pub(crate) fn release_slot_locked(
    world: &mut WorldState,
    token: Uuid,
    reason: KickReason,
    now: i64,
) -> Option<SlotRelease> {
    let mut record = world.sessions.remove(&token)?;
    world.players.remove(&record.player_id);
    let client_id = world.session_clients.remove(&token);
    world.dirty_sessions.remove(&token);

    record.is_active = false;
    record.last_activity = now;
    record.rev += 1;
    world.closed_sessions.push(record.clone());

    info!(player_id = %record.player_id, reason = reason.as_str(), active = world.active_count(), "session removed");

    let promotion = promote_next_locked(world, now);
    Some(SlotRelease { removed: RemovedSession { record, client_id, reason }, promotion })
}

/// Promote the earliest queue entry whose connection is still alive.
pub(crate) fn promote_next_locked(world: &mut WorldState, now: i64) -> Option<Promotion> {
    loop {
        let entry = world.queue.pop_front()?;
        // Entries whose socket has gone are skipped, not promoted.
        if !world.clients.contains_key(&entry.client_id) {
            continue;
        }
        // The player may have rejoined under a new connection meanwhile.
        if world.players.contains_key(&entry.player_id) {
            continue;
        }
        let admitted = admit_locked(
            world,
            entry.client_id,
            entry.player_id,
            &entry.emoji,
            entry.color.as_deref(),
            now,
        );
        info!(client_id = %entry.client_id, player_id = %entry.player_id, "queued candidate promoted");
        return Some(Promotion {
            client_id: entry.client_id,
            admitted,
            queue_updates: queue_updates_locked(world),
        });
    }
}

// =============================================================================
// NOTIFICATION
// =============================================================================

/// Fan out everything one slot release implies: the kick to the removed
/// client, the presence removal to the world, the highscore row, and any
/// promotion. Callers invoke this after the world lock is released.
pub async fn notify_release(state: &AppState, release: SlotRelease) {
    let SlotRelease { removed, promotion } = release;

    state.collisions.forget(removed.record.id, removed.record.player_id);
    highscore::record_fire_and_forget(&state.pool, &removed.record);

    if let Some(client_id) = removed.client_id {
        feed::send_to(state, client_id, &feed::kicked_frame(removed.reason)).await;
    }
    let remove = feed::presence_remove_frame(removed.record.player_id, removed.reason);
    feed::broadcast(state, &remove, None).await;

    if let Some(promotion) = promotion {
        notify_promotion(state, promotion).await;
    }
}

/// Deliver a promotion: `session:admitted` to the winner, its presence to
/// everyone else, refreshed positions to the rest of the queue.
pub async fn notify_promotion(state: &AppState, promotion: Promotion) {
    let admitted_frame = feed::admitted_frame(&promotion.admitted);
    feed::send_to(state, promotion.client_id, &admitted_frame).await;

    let upsert = feed::presence_upsert_frame(&promotion.admitted.record);
    feed::broadcast(state, &upsert, Some(promotion.client_id)).await;

    for (client_id, position) in promotion.queue_updates {
        feed::send_to(state, client_id, &feed::queue_position_frame(position)).await;
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Insert a fresh presence record and snapshot the world for its client.
fn admit_locked(
    world: &mut WorldState,
    client_id: Uuid,
    player_id: Uuid,
    emoji: &str,
    color: Option<&str>,
    now: i64,
) -> Admitted {
    let token = Uuid::new_v4();
    let (x, y) = random_spawn();
    let record = PresenceRecord {
        id: token,
        player_id,
        x,
        y,
        color: color.map_or_else(assign_color, str::to_owned),
        tool: Tool::Brush,
        size: 8.0,
        emoji: emoji.to_owned(),
        collision_count: 0,
        stroke_count: 0,
        is_active: true,
        session_start: now,
        last_activity: now,
        rev: 1,
    };

    let players: Vec<PresenceRecord> = world.sessions.values().cloned().collect();
    let mut strokes: Vec<Stroke> = world.strokes.values().cloned().collect();
    strokes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    world.players.insert(player_id, token);
    world.session_clients.insert(token, client_id);
    world.dirty_sessions.insert(token);
    world.sessions.insert(token, record.clone());

    Admitted { record, players, strokes }
}

fn queue_updates_locked(world: &WorldState) -> Vec<(Uuid, usize)> {
    world
        .queue
        .iter()
        .enumerate()
        .map(|(idx, e)| (e.client_id, idx + 1))
        .collect()
}

/// Spawn away from the world edge so a fresh avatar is never half outside.
fn random_spawn() -> (f64, f64) {
    let mut rng = rand::rng();
    let margin = WORLD_SIZE * 0.05;
    (
        rng.random_range(margin..WORLD_SIZE - margin),
        rng.random_range(margin..WORLD_SIZE - margin),
    )
}

/// Presence palette for candidates that did not pick a color.
const PALETTE: [&str; 8] = [
    "#E53935", "#FB8C00", "#FDD835", "#43A047", "#1E88E5", "#8E24AA", "#00ACC1", "#F06292",
];

fn assign_color() -> String {
    let mut rng = rand::rng();
    PALETTE[rng.random_range(0..PALETTE.len())].to_owned()
}

#[cfg(test)]
#[path = "admission_test.rs"]
mod tests;
