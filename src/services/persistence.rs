//! Persistence service — write-behind flush to Postgres.
//!
//! DESIGN
//! ======
//! The world is authoritative in memory; Postgres mirrors it. Dirty
//! presence records are flushed on a fixed interval, and strokes travel
//! through a bounded queue + batched async writer so websocket handling
//! never blocks on database I/O. The command queue preserves order, so a
//! stroke's insert always lands before its delete.
//!
//! ERROR HANDLING
//! ==============
//! Dirty flags and closed-session rows are cleared only after successful
//! writes. This prioritizes durability over duplicate flush attempts:
//! repeated upserts are acceptable, silent data loss is not.

use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::geometry::Point;
use crate::state::{AppState, PresenceRecord, Stroke, Tool, env_parse};

const DEFAULT_SESSION_FLUSH_INTERVAL_MS: u64 = 500;
const DEFAULT_STROKE_PERSIST_QUEUE_CAPACITY: usize = 8192;
const DEFAULT_STROKE_PERSIST_BATCH_SIZE: usize = 64;
const DEFAULT_STROKE_PERSIST_FLUSH_MS: u64 = 50;
const DEFAULT_STROKE_PERSIST_RETRIES: usize = 3;
const DEFAULT_STROKE_PERSIST_RETRY_BASE_MS: u64 = 50;

// =============================================================================
// STROKE WORKER
// =============================================================================

/// One unit of stroke persistence work.
#[derive(Debug, Clone)]
pub enum StrokeCmd {
    Insert(Box<Stroke>),
    Delete(Uuid),
}

/// Tuning knobs for the stroke persistence worker, loaded from environment
/// variables.
#[derive(Clone, Copy)]
pub(crate) struct StrokePersistConfig {
    pub(crate) queue_capacity: usize,
    pub(crate) batch_size: usize,
    pub(crate) flush_ms: u64,
    pub(crate) retries: usize,
    pub(crate) retry_base_ms: u64,
}

impl StrokePersistConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            queue_capacity: env_parse("STROKE_PERSIST_QUEUE_CAPACITY", DEFAULT_STROKE_PERSIST_QUEUE_CAPACITY),
            batch_size: env_parse("STROKE_PERSIST_BATCH_SIZE", DEFAULT_STROKE_PERSIST_BATCH_SIZE),
            flush_ms: env_parse("STROKE_PERSIST_FLUSH_MS", DEFAULT_STROKE_PERSIST_FLUSH_MS),
            retries: env_parse("STROKE_PERSIST_RETRIES", DEFAULT_STROKE_PERSIST_RETRIES),
            retry_base_ms: env_parse("STROKE_PERSIST_RETRY_BASE_MS", DEFAULT_STROKE_PERSIST_RETRY_BASE_MS),
        }
    }
}

/// Spawn the bounded stroke persistence worker and return its queue sender.
#[must_use]
pub fn spawn_stroke_persist_worker(pool: PgPool) -> mpsc::Sender<StrokeCmd> {
    let config = StrokePersistConfig::from_env();
    let (tx, mut rx) = mpsc::channel::<StrokeCmd>(config.queue_capacity);

    info!(
        queue_capacity = config.queue_capacity,
        batch_size = config.batch_size,
        flush_ms = config.flush_ms,
        "stroke persistence worker configured"
    );

    tokio::spawn(async move {
        let mut batch: Vec<StrokeCmd> = Vec::with_capacity(config.batch_size);
        let mut ticker = tokio::time::interval(Duration::from_millis(config.flush_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe_cmd = rx.recv() => {
                    if let Some(cmd) = maybe_cmd {
                        batch.push(cmd);
                        if batch.len() >= config.batch_size {
                            flush_stroke_batch_with_retry(&pool, &mut batch, config).await;
                        }
                    } else {
                        flush_stroke_batch_with_retry(&pool, &mut batch, config).await;
                        break;
                    }
                }
                _ = ticker.tick() => {
                    flush_stroke_batch_with_retry(&pool, &mut batch, config).await;
                }
            }
        }
    });

    tx
}

/// Best-effort, non-blocking enqueue for stroke persistence.
pub fn enqueue_stroke_cmd(state: &AppState, cmd: StrokeCmd) {
    let Some(tx) = &state.stroke_persist_tx else {
        return;
    };

    match tx.try_send(cmd) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("stroke persist queue full; dropping command");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!("stroke persist queue closed; dropping command");
        }
    }
}

async fn flush_stroke_batch_with_retry(pool: &PgPool, batch: &mut Vec<StrokeCmd>, config: StrokePersistConfig) {
    if batch.is_empty() {
        return;
    }

    let drained = std::mem::take(batch);
    for attempt in 1..=config.retries {
        match persist_stroke_batch(pool, &drained).await {
            Ok(()) => return,
            Err(e) if attempt < config.retries => {
                warn!(
                    error = %e,
                    attempt,
                    total = config.retries,
                    count = drained.len(),
                    "stroke batch persist failed; retrying"
                );
                tokio::time::sleep(Duration::from_millis((attempt as u64) * config.retry_base_ms)).await;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    count = drained.len(),
                    "stroke batch persist failed after retries; dropping commands"
                );
                return;
            }
        }
    }
}

/// Persist a batch of stroke commands in one transaction, in order.
pub async fn persist_stroke_batch(pool: &PgPool, cmds: &[StrokeCmd]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for cmd in cmds {
        match cmd {
            StrokeCmd::Insert(stroke) => {
                let points = serde_json::to_value(&stroke.points).unwrap_or_default();
                sqlx::query(
                    "INSERT INTO strokes (id, player_id, points, color, size, tool, world_x, world_y, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                     ON CONFLICT (id) DO NOTHING",
                )
                .bind(stroke.id)
                .bind(stroke.player_id)
                .bind(&points)
                .bind(&stroke.color)
                .bind(stroke.size)
                .bind(stroke.tool.as_str())
                .bind(stroke.world_x)
                .bind(stroke.world_y)
                .bind(stroke.created_at)
                .execute(tx.as_mut())
                .await?;
            }
            StrokeCmd::Delete(id) => {
                sqlx::query("DELETE FROM strokes WHERE id = $1")
                    .bind(id)
                    .execute(tx.as_mut())
                    .await?;
            }
        }
    }
    tx.commit().await?;
    Ok(())
}

// =============================================================================
// SESSION FLUSH
// =============================================================================

/// Spawn the background session flush task. Returns a handle for shutdown.
pub fn spawn_persistence_task(state: AppState) -> JoinHandle<()> {
    let flush_interval_ms = env_parse("SESSION_FLUSH_INTERVAL_MS", DEFAULT_SESSION_FLUSH_INTERVAL_MS);
    info!(flush_interval_ms, "session persistence flush configured");
    tokio::spawn(async move {
        loop {
            flush_all_dirty(&state).await;
            tokio::time::sleep(Duration::from_millis(flush_interval_ms)).await;
        }
    })
}

async fn flush_all_dirty(state: &AppState) {
    // PHASE: SNAPSHOT DIRTY AND CLOSED SESSIONS
    // WHY: collect immutable clones under lock, then perform I/O lock-free.
    let (dirty, closed) = {
        let mut world = state.world.write().await;
        let dirty: Vec<PresenceRecord> = world
            .dirty_sessions
            .iter()
            .filter_map(|token| world.sessions.get(token).cloned())
            .collect();
        let closed = std::mem::take(&mut world.closed_sessions);
        (dirty, closed)
    };

    if !dirty.is_empty() {
        let flushed_revs: Vec<(Uuid, i64)> = dirty.iter().map(|r| (r.id, r.rev)).collect();
        match upsert_sessions(&state.pool, &dirty).await {
            Ok(()) => clear_flushed_dirty(state, &flushed_revs).await,
            Err(e) => {
                error!(error = %e, count = dirty.len(), "session flush failed");
            }
        }
    }

    if !closed.is_empty() {
        if let Err(e) = upsert_sessions(&state.pool, &closed).await {
            // EDGE: put closed rows back so the final is_active=false write
            // is retried on the next cycle.
            error!(error = %e, count = closed.len(), "closed-session flush failed; retrying next cycle");
            let mut world = state.world.write().await;
            world.closed_sessions.extend(closed);
        }
    }
}

async fn clear_flushed_dirty(state: &AppState, flushed_revs: &[(Uuid, i64)]) {
    let mut world = state.world.write().await;
    for (token, flushed_rev) in flushed_revs {
        // EDGE: keep dirty flag if the record mutated again after snapshot.
        let can_clear = match world.sessions.get(token) {
            Some(current) => current.rev == *flushed_rev,
            None => true,
        };
        if can_clear {
            world.dirty_sessions.remove(token);
        }
    }
}

/// Batch upsert presence rows to Postgres.
pub async fn upsert_sessions(pool: &PgPool, records: &[PresenceRecord]) -> Result<(), sqlx::Error> {
    for record in records {
        sqlx::query(
            "INSERT INTO player_sessions (id, player_id, position_x, position_y, current_color, current_tool, \
                                          current_size, selected_emoji, collision_count, is_active, session_start, last_activity) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (id) DO UPDATE SET \
                 position_x = EXCLUDED.position_x, position_y = EXCLUDED.position_y, \
                 current_color = EXCLUDED.current_color, current_tool = EXCLUDED.current_tool, \
                 current_size = EXCLUDED.current_size, selected_emoji = EXCLUDED.selected_emoji, \
                 collision_count = EXCLUDED.collision_count, is_active = EXCLUDED.is_active, \
                 last_activity = EXCLUDED.last_activity",
        )
        .bind(record.id)
        .bind(record.player_id)
        .bind(record.x)
        .bind(record.y)
        .bind(&record.color)
        .bind(record.tool.as_str())
        .bind(record.size)
        .bind(&record.emoji)
        .bind(record.collision_count)
        .bind(record.is_active)
        .bind(record.session_start)
        .bind(record.last_activity)
        .execute(pool)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) async fn flush_all_dirty_for_tests(state: &AppState) {
    flush_all_dirty(state).await;
}

// =============================================================================
// HYDRATION
// =============================================================================

/// Load the stroke log from Postgres at boot and retire rows a previous
/// process left active (their sockets are gone).
///
/// # Errors
///
/// Returns a database error if either statement fails.
pub async fn hydrate(state: &AppState) -> Result<(), sqlx::Error> {
    let orphaned = sqlx::query("UPDATE player_sessions SET is_active = FALSE WHERE is_active = TRUE")
        .execute(&state.pool)
        .await?
        .rows_affected();
    if orphaned > 0 {
        info!(orphaned, "retired sessions left active by a previous process");
    }

    let rows = sqlx::query_as::<_, (Uuid, Uuid, serde_json::Value, String, f64, String, f64, f64, i64)>(
        "SELECT id, player_id, points, color, size, tool, world_x, world_y, created_at FROM strokes",
    )
    .fetch_all(&state.pool)
    .await?;

    let mut world = state.world.write().await;
    for (id, player_id, points, color, size, tool, world_x, world_y, created_at) in rows {
        let Ok(points) = serde_json::from_value::<Vec<Point>>(points) else {
            warn!(%id, "skipping stroke with malformed points");
            continue;
        };
        let tool: Tool = serde_json::from_value(serde_json::Value::String(tool)).unwrap_or(Tool::Brush);
        world
            .strokes
            .insert(id, Stroke { id, player_id, points, color, size, tool, world_x, world_y, created_at });
    }
    info!(count = world.strokes.len(), "hydrated stroke log from database");
    Ok(())
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
