//! Royale Server - authoritative match server for a multiplayer battle royale
//!
//! Procedurally generated maps, a fixed-rate match simulation with
//! per-player delta sync over binary WebSocket frames, and a lifecycle
//! manager that places find-game requests into running matches.

pub mod app;
pub mod config;
pub mod defs;
pub mod game;
pub mod geom;
pub mod http;
pub mod matchmaking;
pub mod util;
pub mod ws;
