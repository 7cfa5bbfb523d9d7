use super::*;
use crate::frame::Status;
use crate::state::WorldConfig;
use crate::state::test_helpers;
use serde_json::json;

// =============================================================================
// HARNESS
// =============================================================================

/// A simulated connection: its feed channel plus the per-connection
/// session slot the dispatch loop would own.
struct TestClient {
    client_id: Uuid,
    rx: mpsc::Receiver<Frame>,
    session: Option<Uuid>,
}

async fn connect(state: &AppState) -> TestClient {
    let client_id = Uuid::new_v4();
    let rx = test_helpers::connect_client(state, client_id).await;
    TestClient { client_id, rx, session: None }
}

fn data_of(value: serde_json::Value) -> Data {
    serde_json::from_value(value).expect("test payload should be a flat object")
}

async fn send(state: &AppState, client: &mut TestClient, frame: &Frame) -> Vec<Frame> {
    let text = serde_json::to_string(frame).expect("serialize test frame");
    process_inbound_text(state, &mut client.session, client.client_id, &text).await
}

async fn join(state: &AppState, client: &mut TestClient, emoji: &str) -> Vec<Frame> {
    let req = Frame::request("session:join", data_of(json!({ "emoji": emoji })));
    send(state, client, &req).await
}

async fn place(state: &AppState, token: Uuid, x: f64, y: f64) {
    let mut world = state.world.write().await;
    let record = world.sessions.get_mut(&token).unwrap();
    record.x = x;
    record.y = y;
}

fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Frame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

// =============================================================================
// SESSION
// =============================================================================

#[tokio::test]
async fn join_replies_with_token_and_snapshot() {
    let state = test_helpers::test_app_state();
    let mut peer = connect(&state).await;
    join(&state, &mut peer, "🐙").await;

    let mut client = connect(&state).await;
    let replies = join(&state, &mut client, "🦀").await;

    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.status, Status::Done);
    assert!(reply.data.contains_key("session_id"));
    assert!(reply.data.contains_key("player_id"));
    let players = reply.data.get("players").and_then(|v| v.as_array()).unwrap();
    assert_eq!(players.len(), 1);
    assert!(client.session.is_some());

    // The peer learns about the newcomer through the feed.
    let fanned = drain(&mut peer.rx);
    assert!(fanned.iter().any(|f| f.syscall == "presence:upsert"));
}

#[tokio::test]
async fn join_twice_is_an_error() {
    let state = test_helpers::test_app_state();
    let mut client = connect(&state).await;
    join(&state, &mut client, "🦀").await;

    let replies = join(&state, &mut client, "🦀").await;
    assert_eq!(replies[0].status, Status::Error);
}

#[tokio::test]
async fn join_when_full_replies_queued() {
    let config = WorldConfig { capacity: 1, ..WorldConfig::default() };
    let state = test_helpers::test_app_state_with_config(config);
    let mut owner = connect(&state).await;
    join(&state, &mut owner, "🦀").await;

    let mut waiter = connect(&state).await;
    let replies = join(&state, &mut waiter, "🐙").await;
    let reply = &replies[0];
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data.get("queued").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(reply.data.get("position").and_then(serde_json::Value::as_i64), Some(1));
    assert!(waiter.session.is_none());
}

#[tokio::test]
async fn join_rejected_when_queue_is_full() {
    let config = WorldConfig { capacity: 1, queue_capacity: 1, ..WorldConfig::default() };
    let state = test_helpers::test_app_state_with_config(config);
    let mut owner = connect(&state).await;
    join(&state, &mut owner, "🦀").await;
    let mut waiter = connect(&state).await;
    join(&state, &mut waiter, "🐙").await;

    let mut late = connect(&state).await;
    let replies = join(&state, &mut late, "🦊").await;
    let reply = &replies[0];
    assert_eq!(reply.data.get("rejected").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(reply.data.get("reason").and_then(|v| v.as_str()), Some("full"));
}

#[tokio::test]
async fn leave_kicks_self_and_promotes_the_waiter() {
    let config = WorldConfig { capacity: 1, ..WorldConfig::default() };
    let state = test_helpers::test_app_state_with_config(config);
    let mut owner = connect(&state).await;
    join(&state, &mut owner, "🦀").await;
    let mut waiter = connect(&state).await;
    join(&state, &mut waiter, "🐙").await;

    let leave = Frame::request("session:leave", Data::new());
    let replies = send(&state, &mut owner, &leave).await;
    assert_eq!(replies[0].status, Status::Done);
    assert!(owner.session.is_none());

    let owner_frames = drain(&mut owner.rx);
    assert!(owner_frames.iter().any(|f| f.syscall == "session:kicked"));

    let waiter_frames = drain(&mut waiter.rx);
    let admitted = waiter_frames
        .iter()
        .find(|f| f.syscall == "session:admitted")
        .expect("waiter should be admitted");
    assert!(admitted.data.contains_key("session_id"));
    assert!(waiter_frames.iter().any(|f| f.syscall == "presence:remove"));
}

#[tokio::test]
async fn leave_without_session_is_a_quiet_done() {
    let state = test_helpers::test_app_state();
    let mut client = connect(&state).await;
    let leave = Frame::request("session:leave", Data::new());
    let replies = send(&state, &mut client, &leave).await;
    assert_eq!(replies[0].status, Status::Done);
}

// =============================================================================
// PRESENCE
// =============================================================================

#[tokio::test]
async fn presence_update_fans_to_peers_not_sender() {
    let state = test_helpers::test_app_state();
    let mut mover = connect(&state).await;
    join(&state, &mut mover, "🦀").await;
    let mut peer = connect(&state).await;
    join(&state, &mut peer, "🐙").await;
    // Pin positions far apart so the move below cannot collide.
    place(&state, mover.session.unwrap(), 1000.0, 1000.0).await;
    place(&state, peer.session.unwrap(), 9000.0, 9000.0).await;
    drain(&mut mover.rx);
    drain(&mut peer.rx);

    let update = Frame::request("presence:update", data_of(json!({ "x": 1100.0, "y": 1000.0 })));
    let replies = send(&state, &mut mover, &update).await;
    assert!(replies.is_empty());

    let peer_frames = drain(&mut peer.rx);
    let upsert = peer_frames
        .iter()
        .find(|f| f.syscall == "presence:upsert")
        .expect("peer should see the move");
    assert_eq!(upsert.data.get("x").and_then(|v| v.as_f64()), Some(1100.0));
    assert!(drain(&mut mover.rx).is_empty());
}

#[tokio::test]
async fn presence_update_before_join_is_silently_done() {
    let state = test_helpers::test_app_state();
    let mut client = connect(&state).await;

    let update = Frame::request("presence:update", data_of(json!({ "x": 1.0 })));
    let replies = send(&state, &mut client, &update).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status, Status::Done);
}

#[tokio::test]
async fn presence_update_after_reap_logs_the_client_out() {
    let state = test_helpers::test_app_state();
    let mut client = connect(&state).await;
    join(&state, &mut client, "🦀").await;
    let token = client.session.unwrap();

    // The session vanishes server-side (reaper, elimination, ...).
    admission::leave(&state, token, KickReason::Inactivity).await.unwrap();

    let update = Frame::request("presence:update", data_of(json!({ "x": 1.0 })));
    let replies = send(&state, &mut client, &update).await;
    assert_eq!(replies[0].status, Status::Done);
    assert!(client.session.is_none());
}

// =============================================================================
// STROKES
// =============================================================================

#[tokio::test]
async fn stroke_append_round_trips_to_subscribers() {
    let state = test_helpers::test_app_state();
    let mut author = connect(&state).await;
    join(&state, &mut author, "🦀").await;
    let mut peer = connect(&state).await;
    join(&state, &mut peer, "🐙").await;
    place(&state, author.session.unwrap(), 1000.0, 1000.0).await;
    place(&state, peer.session.unwrap(), 9000.0, 9000.0).await;
    drain(&mut peer.rx);

    let stroke_id = Uuid::new_v4();
    let append = Frame::request(
        "stroke:append",
        data_of(json!({
            "id": stroke_id,
            "points": [{"x": 10.0, "y": 20.0}, {"x": 11.0, "y": 21.0}, {"x": 12.0, "y": 22.0}],
            "color": "#1E88E5",
            "size": 8.0,
            "tool": "brush",
        })),
    );
    let replies = send(&state, &mut author, &append).await;
    let reply = &replies[0];
    assert_eq!(reply.status, Status::Done);
    assert_eq!(reply.data.get("id").and_then(|v| v.as_str()), Some(stroke_id.to_string().as_str()));

    let peer_frames = drain(&mut peer.rx);
    let insert = peer_frames
        .iter()
        .find(|f| f.syscall == "stroke:insert")
        .expect("peer should receive the stroke");
    assert_eq!(insert.data.get("id").and_then(|v| v.as_str()), Some(stroke_id.to_string().as_str()));
    let points = insert.data.get("points").and_then(|v| v.as_array()).unwrap();
    assert_eq!(points.len(), 3);
    assert_eq!(insert.data.get("color").and_then(|v| v.as_str()), Some("#1E88E5"));
    assert_eq!(insert.data.get("size").and_then(|v| v.as_f64()), Some(8.0));
    assert_eq!(insert.data.get("tool").and_then(|v| v.as_str()), Some("brush"));
    assert!(insert.data.get("created_at").and_then(|v| v.as_i64()).unwrap() > 0);
}

#[tokio::test]
async fn stroke_append_requires_a_session() {
    let state = test_helpers::test_app_state();
    let mut client = connect(&state).await;

    let append = Frame::request("stroke:append", Data::new());
    let replies = send(&state, &mut client, &append).await;
    assert_eq!(replies[0].status, Status::Error);
}

#[tokio::test]
async fn stroke_append_with_malformed_payload_errors() {
    let state = test_helpers::test_app_state();
    let mut client = connect(&state).await;
    join(&state, &mut client, "🦀").await;

    let append = Frame::request("stroke:append", data_of(json!({ "id": "not-a-uuid" })));
    let replies = send(&state, &mut client, &append).await;
    assert_eq!(replies[0].status, Status::Error);
}

#[tokio::test]
async fn stroke_delete_fans_out() {
    let state = test_helpers::test_app_state();
    let mut author = connect(&state).await;
    join(&state, &mut author, "🦀").await;
    let mut peer = connect(&state).await;
    join(&state, &mut peer, "🐙").await;
    place(&state, author.session.unwrap(), 1000.0, 1000.0).await;
    place(&state, peer.session.unwrap(), 9000.0, 9000.0).await;

    let stroke_id = Uuid::new_v4();
    let append = Frame::request(
        "stroke:append",
        data_of(json!({
            "id": stroke_id,
            "points": [{"x": 10.0, "y": 20.0}],
            "color": "#000000",
            "size": 4.0,
            "tool": "brush",
        })),
    );
    send(&state, &mut author, &append).await;
    drain(&mut peer.rx);

    let delete = Frame::request("stroke:delete", data_of(json!({ "id": stroke_id })));
    let replies = send(&state, &mut author, &delete).await;
    assert_eq!(replies[0].status, Status::Done);

    let peer_frames = drain(&mut peer.rx);
    assert!(peer_frames.iter().any(|f| f.syscall == "stroke:delete"));
}

// =============================================================================
// DISPATCH EDGES
// =============================================================================

#[tokio::test]
async fn invalid_json_yields_gateway_error() {
    let state = test_helpers::test_app_state();
    let client_id = Uuid::new_v4();
    let mut session = None;
    let frames = process_inbound_text(&state, &mut session, client_id, "{not json").await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].syscall, "gateway:error");
}

#[tokio::test]
async fn unknown_prefix_yields_error_frame() {
    let state = test_helpers::test_app_state();
    let mut client = connect(&state).await;
    let req = Frame::request("teleport:now", Data::new());
    let replies = send(&state, &mut client, &req).await;
    assert_eq!(replies[0].status, Status::Error);
}
