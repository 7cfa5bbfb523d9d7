//! Client synchronization layer — the local projection of the world.
//!
//! SYSTEM CONTEXT
//! ==============
//! This model stores what one client believes the world looks like:
//! peer presence, the committed stroke log, in-progress optimistic
//! drafts, and its own admission phase. It is pure state — it consumes
//! feed and reply frames and answers render queries; it never touches a
//! socket. Re-render is a function of (strokes, players, viewport).
//!
//! DESIGN
//! ======
//! - Delivery is at-least-once and unordered across records, ordered per
//!   record. Strokes dedupe by id; presence upserts are guarded by the
//!   record's `rev`, which also suppresses stale echoes of own writes.
//! - Optimistic drafts are keyed by the client-generated stroke id; the
//!   committed echo (reply or feed insert) with the same id replaces the
//!   draft. Draft vs committed is an explicit distinction here, not a
//!   flag on the stroke.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::frame::{Data, Frame, Status};
use crate::geometry::{Point, Viewport, stroke_visible};
use crate::state::{KickReason, Stroke, Tool};

// =============================================================================
// TYPES
// =============================================================================

/// A peer as seen through the feed. Exactly the public presence fields;
/// the session token never appears here.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RemotePlayer {
    pub player_id: Uuid,
    pub x: f64,
    pub y: f64,
    pub color: String,
    pub tool: Tool,
    pub size: f64,
    pub emoji: String,
    pub collision_count: i32,
    pub rev: i64,
}

/// Admission lifecycle of this client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Unjoined,
    /// Waiting for a slot at the given 1-based position.
    Queued { position: usize },
    Active { session_id: Uuid, player_id: Uuid },
    /// Terminal. Rejoining starts over with a fresh identity.
    Kicked(KickReason),
}

/// The local projection: admission phase, peers, strokes, drafts.
#[derive(Debug, Default)]
pub struct ClientView {
    pub phase: SessionPhase,
    /// Live peers (and own last-confirmed record) keyed by player id.
    pub players: HashMap<Uuid, RemotePlayer>,
    strokes: HashMap<Uuid, Stroke>,
    drafts: HashMap<Uuid, Stroke>,
    /// Outbound `session:join` frame id awaiting its reply.
    pending_join: Option<Uuid>,
}

impl ClientView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything and return to `Unjoined` (rejoin with a fresh
    /// identity).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record an outbound join so its reply can be correlated.
    pub fn note_join_request(&mut self, frame_id: Uuid) {
        self.pending_join = Some(frame_id);
    }

    #[must_use]
    pub fn own_player_id(&self) -> Option<Uuid> {
        match self.phase {
            SessionPhase::Active { player_id, .. } => Some(player_id),
            _ => None,
        }
    }

    #[must_use]
    pub fn stroke_count(&self) -> usize {
        self.strokes.len()
    }
}

// =============================================================================
// FRAME MERGE
// =============================================================================

impl ClientView {
    /// Merge one inbound frame. Unknown syscalls and malformed payloads
    /// are ignored — the projection only ever moves forward.
    pub fn apply(&mut self, frame: &Frame) {
        match (frame.syscall.as_str(), frame.status) {
            ("session:join", Status::Done) => {
                if self.pending_join.is_some() && frame.parent_id == self.pending_join {
                    self.pending_join = None;
                    self.apply_join_reply(&frame.data);
                }
            }
            ("session:join", Status::Error) => {
                if self.pending_join.is_some() && frame.parent_id == self.pending_join {
                    self.pending_join = None;
                }
            }
            ("session:admitted", Status::Request) => self.apply_admitted(&frame.data),
            ("session:kicked", Status::Request) => {
                let reason = parse_reason(&frame.data).unwrap_or(KickReason::Disconnected);
                self.kick(reason);
            }
            ("queue:position", Status::Request) => {
                let position = frame
                    .data
                    .get("position")
                    .and_then(Value::as_u64)
                    .and_then(|p| usize::try_from(p).ok());
                if let Some(position) = position {
                    if matches!(self.phase, SessionPhase::Queued { .. } | SessionPhase::Unjoined) {
                        self.phase = SessionPhase::Queued { position };
                    }
                }
            }
            ("presence:upsert", Status::Request) | ("presence:update", Status::Done) => {
                self.upsert_player(&frame.data);
            }
            ("presence:remove", Status::Request) => {
                let Some(player_id) = parse_uuid(&frame.data, "player_id") else {
                    return;
                };
                self.players.remove(&player_id);
                // Our own removal can race ahead of session:kicked.
                if self.own_player_id() == Some(player_id) {
                    let reason = parse_reason(&frame.data).unwrap_or(KickReason::Disconnected);
                    self.kick(reason);
                }
            }
            ("stroke:insert", Status::Request) | ("stroke:append", Status::Done) => {
                if let Some(stroke) = stroke_from_data(&frame.data) {
                    self.insert_committed(stroke);
                }
            }
            ("stroke:delete", Status::Request | Status::Done) => {
                if let Some(id) = parse_uuid(&frame.data, "id") {
                    self.strokes.remove(&id);
                    self.drafts.remove(&id);
                }
            }
            _ => {}
        }
    }

    fn apply_join_reply(&mut self, data: &Data) {
        if data.get("queued").and_then(Value::as_bool) == Some(true) {
            let position = data
                .get("position")
                .and_then(Value::as_u64)
                .and_then(|p| usize::try_from(p).ok())
                .unwrap_or(1);
            self.phase = SessionPhase::Queued { position };
            return;
        }
        if data.get("rejected").and_then(Value::as_bool) == Some(true) {
            self.kick(KickReason::Full);
            return;
        }
        self.apply_admitted(data);
    }

    fn apply_admitted(&mut self, data: &Data) {
        let Some(session_id) = parse_uuid(data, "session_id") else {
            return;
        };
        let Some(player_id) = parse_uuid(data, "player_id") else {
            return;
        };
        self.phase = SessionPhase::Active { session_id, player_id };

        if let Some(own) = data.get("player").and_then(|v| player_from_value(v.clone())) {
            self.players.insert(own.player_id, own);
        }
        if let Some(players) = data.get("players").and_then(Value::as_array) {
            for value in players {
                if let Some(player) = player_from_value(value.clone()) {
                    self.players.insert(player.player_id, player);
                }
            }
        }
        if let Some(strokes) = data.get("strokes").and_then(Value::as_array) {
            for value in strokes {
                if let Ok(stroke) = serde_json::from_value::<Stroke>(value.clone()) {
                    self.insert_committed(stroke);
                }
            }
        }
    }

    fn upsert_player(&mut self, data: &Data) {
        let Some(incoming) = player_from_value(Value::Object(to_map(data))) else {
            return;
        };
        // Per-record ordering guard: at-least-once delivery may replay or
        // reorder a record's updates; only strictly newer revs apply. The
        // same guard drops stale echoes of our own writes.
        if let Some(existing) = self.players.get(&incoming.player_id) {
            if existing.rev >= incoming.rev {
                return;
            }
        }
        self.players.insert(incoming.player_id, incoming);
    }

    fn insert_committed(&mut self, stroke: Stroke) {
        self.drafts.remove(&stroke.id);
        // Idempotent merge: an already-known id is a no-op.
        self.strokes.entry(stroke.id).or_insert(stroke);
    }

    fn kick(&mut self, reason: KickReason) {
        self.phase = SessionPhase::Kicked(reason);
        self.players.clear();
        self.drafts.clear();
    }
}

// =============================================================================
// OPTIMISTIC DRAFTS
// =============================================================================

impl ClientView {
    /// Start an in-progress stroke rendered immediately from the local
    /// point buffer, before the server confirms it.
    pub fn begin_draft(&mut self, id: Uuid, first: Point, color: String, size: f64, tool: Tool) {
        let player_id = self.own_player_id().unwrap_or(Uuid::nil());
        self.drafts.insert(
            id,
            Stroke {
                id,
                player_id,
                points: vec![first],
                color,
                size,
                tool,
                world_x: first.x,
                world_y: first.y,
                created_at: 0,
            },
        );
    }

    /// Extend an in-progress stroke.
    pub fn extend_draft(&mut self, id: Uuid, point: Point) {
        if let Some(draft) = self.drafts.get_mut(&id) {
            draft.points.push(point);
        }
    }

    /// Abandon an unconfirmed stroke (e.g. the append errored).
    pub fn drop_draft(&mut self, id: Uuid) {
        self.drafts.remove(&id);
    }

    #[must_use]
    pub fn has_draft(&self, id: Uuid) -> bool {
        self.drafts.contains_key(&id)
    }
}

// =============================================================================
// RENDER QUERIES
// =============================================================================

impl ClientView {
    /// Strokes in composite order: committed by (`created_at`, `id`), then
    /// in-progress drafts on top.
    #[must_use]
    pub fn render_strokes(&self) -> Vec<&Stroke> {
        let mut committed: Vec<&Stroke> = self.strokes.values().collect();
        committed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut drafts: Vec<&Stroke> = self.drafts.values().collect();
        drafts.sort_by(|a, b| a.id.cmp(&b.id));

        committed.extend(drafts);
        committed
    }

    /// Render order restricted to strokes intersecting the viewport
    /// (expanded by each stroke's radius).
    #[must_use]
    pub fn visible_strokes(&self, viewport: Viewport) -> Vec<&Stroke> {
        self.render_strokes()
            .into_iter()
            .filter(|s| stroke_visible(&s.points, s.size, viewport))
            .collect()
    }
}

// =============================================================================
// PARSE HELPERS
// =============================================================================

fn to_map(data: &Data) -> serde_json::Map<String, Value> {
    data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn parse_uuid(data: &Data, key: &str) -> Option<Uuid> {
    data.get(key).and_then(Value::as_str).and_then(|s| s.parse().ok())
}

fn parse_reason(data: &Data) -> Option<KickReason> {
    data.get("reason")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn player_from_value(value: Value) -> Option<RemotePlayer> {
    serde_json::from_value(value).ok()
}

fn stroke_from_data(data: &Data) -> Option<Stroke> {
    serde_json::from_value(Value::Object(to_map(data))).ok()
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
