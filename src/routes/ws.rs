//! WebSocket handler — bidirectional frame relay.
//!
//! DESIGN
//! ======
//! On upgrade, generates a client ID and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Feed frames from the world → forward to this client
//!
//! Handler functions are pure business logic — they validate, mutate
//! world state, and return an `Outcome`. The dispatch layer owns reply
//! and fanout. Admission side effects (kicks, promotions, removal
//! events) are the one exception: they target arbitrary other clients,
//! so handlers deliver them through `admission::notify_release` directly.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `session:connected` with `client_id`
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch applies Outcome (reply / fan / both)
//! 4. Close → best-effort leave → reaper remains the backstop

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services::admission::{self, Admission, JoinRequest};
use crate::services::presence::PresenceUpdate;
use crate::services::stroke::{StrokeDraft, StrokeError};
use crate::services::{collision, feed, presence, stroke};
use crate::state::{AppState, KickReason};

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what — handlers never send request/reply frames
/// directly.
enum Outcome {
    /// Send done+data to sender only.
    Reply(Data),
    /// Send empty done to sender only.
    Done,
    /// Reply to sender, fan a canonical feed frame to all peers.
    ReplyAndFan { reply: Data, fan: Frame },
    /// Fan a canonical feed frame to peers EXCLUDING sender; no reply.
    /// Used for presence moves (high frequency, fire-and-forget).
    FanExcludeSender(Frame),
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    // Sessions are anonymous: no ticket, no cookie. The capability is
    // handed out at admission time.
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4();

    // Per-connection channel for receiving feed frames from the world.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(256);
    state.world.write().await.clients.insert(client_id, client_tx);

    let welcome = Frame::request("session:connected", Data::new()).with_data("client_id", client_id.to_string());
    if send_frame(&mut socket, &welcome).await.is_err() {
        state.world.write().await.clients.remove(&client_id);
        return;
    }

    info!(%client_id, "ws: client connected");

    // The session token this connection holds, once admitted.
    let mut current_session: Option<Uuid> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let sender_frames = process_inbound_text(&state, &mut current_session, client_id, &text).await;
                        for frame in sender_frames {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    disconnect_cleanup(&state, client_id, current_session).await;
    info!(%client_id, "ws: client disconnected");
}

/// Best-effort cleanup when the socket goes away without an explicit
/// leave. The reaper covers the case where even this never runs.
async fn disconnect_cleanup(state: &AppState, client_id: Uuid, current_session: Option<Uuid>) {
    state.world.write().await.clients.remove(&client_id);

    if let Some(token) = current_session {
        if let Some(release) = admission::leave(state, token, KickReason::Disconnected).await {
            admission::notify_release(state, release).await;
        }
    }

    if let Some(updates) = admission::abandon_queue(state, client_id).await {
        for (waiter, position) in updates {
            feed::send_to(state, waiter, &feed::queue_position_frame(position)).await;
        }
    }
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the
/// sender. Split from the socket loop so tests can exercise dispatch
/// end-to-end over plain channels.
async fn process_inbound_text(
    state: &AppState,
    current_session: &mut Option<Uuid>,
    client_id: Uuid,
    text: &str,
) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the connection as `from`.
    req.from = Some(client_id.to_string());

    let prefix = req.prefix();
    let is_presence = prefix == "presence";
    if !is_presence {
        info!(%client_id, id = %req.id, syscall = %req.syscall, status = ?req.status, "ws: recv frame");
    }

    let result = match prefix {
        "session" => handle_session(state, current_session, client_id, &req).await,
        "presence" => handle_presence(state, current_session, &req).await,
        "stroke" => handle_stroke(state, current_session, &req).await,
        _ => Err(req.error(format!("unknown prefix: {prefix}"))),
    };

    // Apply outcome — the dispatch layer owns reply and fanout.
    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::ReplyAndFan { reply, fan }) => {
            feed::broadcast(state, &fan, Some(client_id)).await;
            vec![req.done_with(reply)]
        }
        Ok(Outcome::FanExcludeSender(fan)) => {
            feed::broadcast(state, &fan, Some(client_id)).await;
            vec![]
        }
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// SESSION HANDLERS
// =============================================================================

async fn handle_session(
    state: &AppState,
    current_session: &mut Option<Uuid>,
    client_id: Uuid,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);

    match op {
        "join" => {
            if current_session.is_some() {
                return Err(req.error("already joined"));
            }
            let join_req = JoinRequest {
                player_id: req
                    .data
                    .get("player_id")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok()),
                emoji: req
                    .data
                    .get("emoji")
                    .and_then(|v| v.as_str())
                    .unwrap_or("🙂")
                    .to_owned(),
                color: req.data.get("color").and_then(|v| v.as_str()).map(str::to_owned),
            };

            match admission::join(state, client_id, join_req).await {
                Ok(Admission::Active(admitted)) => {
                    *current_session = Some(admitted.record.id);
                    let fan = feed::presence_upsert_frame(&admitted.record);
                    Ok(Outcome::ReplyAndFan { reply: feed::admitted_to_data(&admitted), fan })
                }
                Ok(Admission::Queued { position }) => {
                    let mut reply = Data::new();
                    reply.insert("queued".into(), serde_json::json!(true));
                    reply.insert("position".into(), serde_json::json!(position));
                    Ok(Outcome::Reply(reply))
                }
                Ok(Admission::Rejected) => {
                    let mut reply = Data::new();
                    reply.insert("rejected".into(), serde_json::json!(true));
                    reply.insert("reason".into(), serde_json::json!(KickReason::Full));
                    Ok(Outcome::Reply(reply))
                }
                Err(e) => Err(req.error_from(&e)),
            }
        }
        "leave" => {
            let Some(token) = current_session.take() else {
                // Idempotent: leaving twice is a no-op.
                return Ok(Outcome::Done);
            };
            if let Some(release) = admission::leave(state, token, KickReason::Disconnected).await {
                admission::notify_release(state, release).await;
            }
            Ok(Outcome::Done)
        }
        _ => Err(req.error(format!("unknown session op: {op}"))),
    }
}

// =============================================================================
// PRESENCE HANDLER
// =============================================================================

async fn handle_presence(
    state: &AppState,
    current_session: &mut Option<Uuid>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);
    if op != "update" {
        return Err(req.error(format!("unknown presence op: {op}")));
    }

    let Some(token) = *current_session else {
        // Silently ignore presence updates before joining.
        return Ok(Outcome::Done);
    };

    let update = PresenceUpdate::from_data(&req.data);
    let Some(record) = presence::publish(state, token, update).await else {
        // Stale token: the session was reaped or eliminated. Treat this
        // connection as logged out; the write is dropped silently.
        *current_session = None;
        return Ok(Outcome::Done);
    };

    let moved = collision::register_movement(state, token).await;
    if let Some(release) = moved.elimination {
        *current_session = None;
        admission::notify_release(state, release).await;
        return Ok(Outcome::Done);
    }
    if moved.hits > 0 {
        if let Some(hit_record) = moved.record {
            let fan = feed::presence_upsert_frame(&hit_record);
            // The mover learns its new collision count from the reply.
            return Ok(Outcome::ReplyAndFan { reply: feed::presence_to_data(&hit_record), fan });
        }
    }

    Ok(Outcome::FanExcludeSender(feed::presence_upsert_frame(&record)))
}

// =============================================================================
// STROKE HANDLERS
// =============================================================================

async fn handle_stroke(
    state: &AppState,
    current_session: &mut Option<Uuid>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(token) = *current_session else {
        return Err(req.error("must join the world first"));
    };

    let op = req.syscall.split_once(':').map_or("", |(_, op)| op);

    match op {
        "append" => {
            let Some(draft) = StrokeDraft::from_data(&req.data) else {
                return Err(req.error("id, points, color, size, tool required"));
            };

            match stroke::append(state, token, draft).await {
                Ok(committed) => {
                    let fan = feed::stroke_insert_frame(&committed);
                    // The author's reply carries the committed stroke under
                    // its client-generated id, replacing the local draft.
                    Ok(Outcome::ReplyAndFan { reply: feed::stroke_to_data(&committed), fan })
                }
                Err(e) => {
                    if matches!(e, StrokeError::SessionRevoked) {
                        *current_session = None;
                    }
                    Err(req.error_from(&e))
                }
            }
        }
        "delete" => {
            let Some(stroke_id) = req
                .data
                .get("id")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
            else {
                return Err(req.error("id required"));
            };

            match stroke::delete(state, token, stroke_id).await {
                Ok(()) => {
                    let mut reply = Data::new();
                    reply.insert("id".into(), serde_json::json!(stroke_id));
                    Ok(Outcome::ReplyAndFan { reply, fan: feed::stroke_delete_frame(stroke_id) })
                }
                Err(e) => {
                    if matches!(e, StrokeError::SessionRevoked) {
                        *current_session = None;
                    }
                    Err(req.error_from(&e))
                }
            }
        }
        _ => Err(req.error(format!("unknown stroke op: {op}"))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    let is_presence = frame.syscall.starts_with("presence:");
    if !is_presence {
        if frame.status == crate::frame::Status::Error {
            let code = frame
                .data
                .get("code")
                .and_then(|v| v.as_str())
                .unwrap_or("-");
            let message = frame
                .data
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("-");
            warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
        } else {
            info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
        }
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
