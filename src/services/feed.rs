//! Change-feed fanout and event construction.
//!
//! DESIGN
//! ======
//! Every connected client holds a bounded frame channel; feed events are
//! `try_send` best-effort so one slow client never stalls the world. The
//! constructors here are the single source of truth for feed payload
//! shapes — the sync layer parses exactly what these emit.
//!
//! Delivery is at-least-once with per-record ordering only: a record's
//! updates are serialized by the world lock and stamped with its `rev`;
//! nothing orders events across different records.

use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services::admission::Admitted;
use crate::state::{AppState, KickReason, PresenceRecord, Stroke};

// =============================================================================
// FANOUT
// =============================================================================

/// Broadcast a frame to every connected client, optionally excluding one.
pub async fn broadcast(state: &AppState, frame: &Frame, exclude: Option<Uuid>) {
    let world = state.world.read().await;
    for (client_id, tx) in &world.clients {
        if exclude == Some(*client_id) {
            continue;
        }
        // Best-effort: if a client's channel is full, skip it.
        let _ = tx.try_send(frame.clone());
    }
}

/// Send a frame to one specific client. Best-effort.
pub async fn send_to(state: &AppState, client_id: Uuid, frame: &Frame) {
    let world = state.world.read().await;
    if let Some(tx) = world.clients.get(&client_id) {
        let _ = tx.try_send(frame.clone());
    }
}

// =============================================================================
// EVENT CONSTRUCTORS
// =============================================================================

/// Public projection of a presence record. Never includes the session token.
#[must_use]
pub fn presence_to_data(record: &PresenceRecord) -> Data {
    let mut data = Data::new();
    data.insert("player_id".into(), serde_json::json!(record.player_id));
    data.insert("x".into(), serde_json::json!(record.x));
    data.insert("y".into(), serde_json::json!(record.y));
    data.insert("color".into(), serde_json::json!(record.color));
    data.insert("tool".into(), serde_json::json!(record.tool));
    data.insert("size".into(), serde_json::json!(record.size));
    data.insert("emoji".into(), serde_json::json!(record.emoji));
    data.insert("collision_count".into(), serde_json::json!(record.collision_count));
    data.insert("rev".into(), serde_json::json!(record.rev));
    data
}

#[must_use]
pub fn stroke_to_data(stroke: &Stroke) -> Data {
    let mut data = Data::new();
    data.insert("id".into(), serde_json::json!(stroke.id));
    data.insert("player_id".into(), serde_json::json!(stroke.player_id));
    data.insert("points".into(), serde_json::json!(stroke.points));
    data.insert("color".into(), serde_json::json!(stroke.color));
    data.insert("size".into(), serde_json::json!(stroke.size));
    data.insert("tool".into(), serde_json::json!(stroke.tool));
    data.insert("world_x".into(), serde_json::json!(stroke.world_x));
    data.insert("world_y".into(), serde_json::json!(stroke.world_y));
    data.insert("created_at".into(), serde_json::json!(stroke.created_at));
    data
}

#[must_use]
pub fn presence_upsert_frame(record: &PresenceRecord) -> Frame {
    Frame::request("presence:upsert", presence_to_data(record))
}

#[must_use]
pub fn presence_remove_frame(player_id: Uuid, reason: KickReason) -> Frame {
    let mut data = Data::new();
    data.insert("player_id".into(), serde_json::json!(player_id));
    data.insert("reason".into(), serde_json::json!(reason));
    Frame::request("presence:remove", data)
}

#[must_use]
pub fn stroke_insert_frame(stroke: &Stroke) -> Frame {
    Frame::request("stroke:insert", stroke_to_data(stroke))
}

#[must_use]
pub fn stroke_delete_frame(stroke_id: Uuid) -> Frame {
    let mut data = Data::new();
    data.insert("id".into(), serde_json::json!(stroke_id));
    Frame::request("stroke:delete", data)
}

#[must_use]
pub fn kicked_frame(reason: KickReason) -> Frame {
    let mut data = Data::new();
    data.insert("reason".into(), serde_json::json!(reason));
    Frame::request("session:kicked", data)
}

#[must_use]
pub fn queue_position_frame(position: usize) -> Frame {
    let mut data = Data::new();
    data.insert("position".into(), serde_json::json!(position));
    Frame::request("queue:position", data)
}

/// Admission payload for the admitted client. This is the one payload
/// that carries the session token (`session_id`): it is only ever sent
/// point-to-point to the owning connection, never broadcast.
#[must_use]
pub fn admitted_to_data(admitted: &Admitted) -> Data {
    let players: Vec<serde_json::Value> = admitted
        .players
        .iter()
        .map(|p| serde_json::json!(presence_to_data(p)))
        .collect();
    let strokes: Vec<serde_json::Value> = admitted
        .strokes
        .iter()
        .map(|s| serde_json::json!(stroke_to_data(s)))
        .collect();

    let mut data = Data::new();
    data.insert("session_id".into(), serde_json::json!(admitted.record.id));
    data.insert("player_id".into(), serde_json::json!(admitted.record.player_id));
    data.insert("player".into(), serde_json::json!(presence_to_data(&admitted.record)));
    data.insert("players".into(), serde_json::Value::Array(players));
    data.insert("strokes".into(), serde_json::Value::Array(strokes));
    data
}

#[must_use]
pub fn admitted_frame(admitted: &Admitted) -> Frame {
    Frame::request("session:admitted", admitted_to_data(admitted))
}

// =============================================================================
// TESTS
// =============================================================================
