//! Stroke log — append-only drawing strokes.
//!
//! DESIGN
//! ======
//! Strokes are immutable once appended. The server assigns the ordering
//! timestamp; the id stays client-generated so the author can reconcile
//! its optimistic draft with the committed echo. Deletion is a separate
//! explicit event, restricted to the author (undo).
//!
//! Persistence is write-behind through the bounded stroke worker; the
//! worker queue preserves insert-before-delete order for the same id.

use serde_json::Value;
use uuid::Uuid;

use crate::frame::{Data, now_ms};
use crate::geometry::Point;
use crate::services::persistence::{self, StrokeCmd};
use crate::state::{AppState, Stroke, Tool};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StrokeError {
    #[error("session token is no longer valid")]
    SessionRevoked,
    #[error("stroke must contain at least one point")]
    EmptyStroke,
    #[error("tool {0:?} does not draw")]
    NotADrawingTool(Tool),
    #[error("brush size must be positive, got {0}")]
    InvalidSize(f64),
    #[error("stroke already exists: {0}")]
    DuplicateId(Uuid),
    #[error("stroke not found: {0}")]
    NotFound(Uuid),
    #[error("stroke {0} belongs to another player")]
    NotAuthor(Uuid),
}

impl crate::frame::ErrorCode for StrokeError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::SessionRevoked => "E_SESSION_REVOKED",
            Self::EmptyStroke => "E_EMPTY_STROKE",
            Self::NotADrawingTool(_) => "E_NOT_A_DRAWING_TOOL",
            Self::InvalidSize(_) => "E_INVALID_SIZE",
            Self::DuplicateId(_) => "E_DUPLICATE_STROKE",
            Self::NotFound(_) => "E_STROKE_NOT_FOUND",
            Self::NotAuthor(_) => "E_NOT_AUTHOR",
        }
    }

    fn retryable(&self) -> bool {
        // A duplicate id means a retry raced its own success; the caller
        // may retry with a fresh id.
        matches!(self, Self::DuplicateId(_))
    }
}

/// Client-supplied stroke awaiting commit.
#[derive(Debug, Clone)]
pub struct StrokeDraft {
    /// Client-generated, globally unique.
    pub id: Uuid,
    pub points: Vec<Point>,
    pub color: String,
    pub size: f64,
    pub tool: Tool,
}

impl StrokeDraft {
    /// Parse from a flat frame payload. Returns `None` when required
    /// fields are missing or malformed.
    #[must_use]
    pub fn from_data(data: &Data) -> Option<Self> {
        let id = data.get("id").and_then(Value::as_str).and_then(|s| s.parse().ok())?;
        let points: Vec<Point> = data
            .get("points")
            .and_then(|v| serde_json::from_value(v.clone()).ok())?;
        let color = data.get("color").and_then(Value::as_str)?.to_owned();
        let size = data.get("size").and_then(Value::as_f64)?;
        let tool = data
            .get("tool")
            .and_then(|v| serde_json::from_value(v.clone()).ok())?;
        Some(Self { id, points, color, size, tool })
    }
}

// =============================================================================
// APPEND
// =============================================================================

/// Commit a draft into the stroke log and assign its ordering timestamp.
///
/// # Errors
///
/// Rejects revoked tokens, empty point lists, non-positive sizes, the
/// `hand` tool, and duplicate ids. On error nothing is inserted and
/// nothing is queued for persistence.
pub async fn append(state: &AppState, token: Uuid, draft: StrokeDraft) -> Result<Stroke, StrokeError> {
    if draft.points.is_empty() {
        return Err(StrokeError::EmptyStroke);
    }
    if !draft.tool.is_drawing() {
        return Err(StrokeError::NotADrawingTool(draft.tool));
    }
    if draft.size <= 0.0 {
        return Err(StrokeError::InvalidSize(draft.size));
    }

    let now = now_ms();
    let stroke = {
        let mut world = state.world.write().await;
        if world.strokes.contains_key(&draft.id) {
            return Err(StrokeError::DuplicateId(draft.id));
        }
        let session = world.sessions.get_mut(&token).ok_or(StrokeError::SessionRevoked)?;
        let player_id = session.player_id;
        session.stroke_count += 1;
        session.last_activity = now;
        session.rev += 1;

        let points: Vec<Point> = draft.points.iter().map(|p| p.clamp_to_world()).collect();
        let anchor = points[0];
        let stroke = Stroke {
            id: draft.id,
            player_id,
            points,
            color: draft.color,
            size: draft.size,
            tool: draft.tool,
            world_x: anchor.x,
            world_y: anchor.y,
            created_at: now,
        };
        world.strokes.insert(stroke.id, stroke.clone());
        world.dirty_sessions.insert(token);
        stroke
    };

    persistence::enqueue_stroke_cmd(state, StrokeCmd::Insert(Box::new(stroke.clone())));
    Ok(stroke)
}

// =============================================================================
// DELETE
// =============================================================================

/// Remove a stroke by id. Author-only (undo).
///
/// # Errors
///
/// Rejects revoked tokens, unknown ids, and non-author callers.
pub async fn delete(state: &AppState, token: Uuid, stroke_id: Uuid) -> Result<(), StrokeError> {
    let now = now_ms();
    {
        let mut world = state.world.write().await;
        let session = world.sessions.get_mut(&token).ok_or(StrokeError::SessionRevoked)?;
        let player_id = session.player_id;
        session.last_activity = now;

        let stroke = world.strokes.get(&stroke_id).ok_or(StrokeError::NotFound(stroke_id))?;
        if stroke.player_id != player_id {
            return Err(StrokeError::NotAuthor(stroke_id));
        }
        world.strokes.remove(&stroke_id);
    }

    persistence::enqueue_stroke_cmd(state, StrokeCmd::Delete(stroke_id));
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
