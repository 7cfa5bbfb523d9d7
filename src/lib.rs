//! inkbrawl — a capacity-limited multiplayer painting arena.
//!
//! One shared 10k × 10k world, anonymous sessions, realtime presence and
//! stroke fanout over websockets, server-side collision elimination, and
//! write-behind Postgres persistence. The `sync` module is the client-side
//! projection consumed by frontends.

pub mod db;
pub mod frame;
pub mod geometry;
pub mod routes;
pub mod services;
pub mod state;
pub mod sync;
