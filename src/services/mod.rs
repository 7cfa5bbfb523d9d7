//! Service layer: world mutations and background tasks.
//!
//! Handlers in `routes::ws` validate and dispatch; the functions here own
//! the world-state mutations. Fanout frames are built in `feed` and sent
//! by whoever holds no world lock.

pub mod admission;
pub mod collision;
pub mod feed;
pub mod highscore;
pub mod persistence;
pub mod presence;
pub mod reaper;
pub mod stroke;
