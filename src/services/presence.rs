//! Presence service — owner-only record mutation.
//!
//! DESIGN
//! ======
//! A presence update mutates the caller's own record only, bumps its
//! `rev`, refreshes `last_activity`, and marks it dirty for write-behind
//! persistence. The session token is the capability: a stale or unknown
//! token is a silent no-op, so a reaped client's late writes change
//! nothing and emit nothing.

use serde_json::Value;
use uuid::Uuid;

use crate::frame::{Data, now_ms};
use crate::geometry::Point;
use crate::state::{AppState, PresenceRecord, Tool};

// =============================================================================
// UPDATE
// =============================================================================

/// Partial presence mutation. Absent fields leave the record untouched.
#[derive(Debug, Default, Clone)]
pub struct PresenceUpdate {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub color: Option<String>,
    pub tool: Option<Tool>,
    pub size: Option<f64>,
    pub emoji: Option<String>,
}

impl PresenceUpdate {
    /// Parse from a flat frame payload. Unknown keys and malformed values
    /// are ignored field-by-field.
    #[must_use]
    pub fn from_data(data: &Data) -> Self {
        Self {
            x: data.get("x").and_then(Value::as_f64),
            y: data.get("y").and_then(Value::as_f64),
            color: data.get("color").and_then(Value::as_str).map(str::to_owned),
            tool: data
                .get("tool")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            size: data.get("size").and_then(Value::as_f64).filter(|s| *s > 0.0),
            emoji: data.get("emoji").and_then(Value::as_str).map(str::to_owned),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_none()
            && self.y.is_none()
            && self.color.is_none()
            && self.tool.is_none()
            && self.size.is_none()
            && self.emoji.is_none()
    }
}

/// Apply an update to the caller's own record. Returns the updated record
/// for fanout, or `None` when the token no longer maps to an active
/// session (the write is silently rejected).
pub async fn publish(state: &AppState, token: Uuid, update: PresenceUpdate) -> Option<PresenceRecord> {
    let now = now_ms();
    let mut world = state.world.write().await;
    let record = world.sessions.get_mut(&token)?;

    if let Some(x) = update.x {
        record.x = x;
    }
    if let Some(y) = update.y {
        record.y = y;
    }
    // Movement is clamped into the world square, never rejected.
    let clamped = Point::new(record.x, record.y).clamp_to_world();
    record.x = clamped.x;
    record.y = clamped.y;

    if let Some(color) = update.color {
        record.color = color;
    }
    if let Some(tool) = update.tool {
        record.tool = tool;
    }
    if let Some(size) = update.size {
        record.size = size;
    }
    if let Some(emoji) = update.emoji {
        record.emoji = emoji;
    }

    record.last_activity = now;
    record.rev += 1;
    let snapshot = record.clone();
    world.dirty_sessions.insert(token);
    Some(snapshot)
}

// =============================================================================
// TESTS
// =============================================================================
